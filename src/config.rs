//! Configuration system for the Veil compositing manager
//!
//! Loads configuration from a TOML file at `~/.config/veil/config.toml`.
//! Auto-generates a default config file on first run if missing. Out-of-range
//! values are clamped rather than rejected; unparseable exclusion patterns
//! are reported once and skipped.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::compositor::backend::WinIdent;
use crate::compositor::window::WinType;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub fade: FadeConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    /// Per-wintype overrides keyed by wintype name ("dock", "tooltip", ...).
    #[serde(default)]
    pub wintypes: HashMap<String, WintypeConfig>,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load(path_override: Option<&Path>) -> Result<Self> {
        let config_path = match path_override {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            if path_override.is_some() {
                anyhow::bail!("config file {:?} does not exist", config_path);
            }
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            let mut config = Self::default();
            config.sanitize();
            return Ok(config);
        }

        let content = fs::read_to_string(&config_path)
            .context("Failed to read config file")?;

        let mut config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;
        config.sanitize();

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("veil");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Clamp every value into its legal range and compile the exclusion
    /// pattern lists. Must run before the config is handed to the engine.
    pub fn sanitize(&mut self) {
        self.shadow.radius = self.shadow.radius.clamp(0.0, 64.0);
        self.shadow.opacity = self.shadow.opacity.clamp(0.0, 1.0);
        self.fade.in_step = self.fade.in_step.clamp(0.0, 1.0);
        self.fade.out_step = self.fade.out_step.clamp(0.0, 1.0);
        self.fade.delta_ms = self.fade.delta_ms.max(1);
        self.focus.active_opacity = self.focus.active_opacity.clamp(0.0, 1.0);
        self.focus.inactive_opacity = self.focus.inactive_opacity.clamp(0.0, 1.0);
        self.focus.frame_opacity = self.focus.frame_opacity.clamp(0.0, 1.0);
        self.focus.inactive_dim = self.focus.inactive_dim.clamp(0.0, 1.0);
        for wt in self.wintypes.values_mut() {
            if let Some(o) = wt.opacity.as_mut() {
                *o = o.clamp(0.0, 1.0);
            }
        }
        for name in self.wintypes.keys() {
            if !WinType::ALL.iter().any(|t| t.name() == name) {
                warn!("Unknown wintype {:?} in config, ignoring", name);
            }
        }

        self.shadow.rules = RuleList::compile("shadow-exclude", &self.shadow.exclude);
        self.fade.rules = RuleList::compile("fade-exclude", &self.fade.exclude);
        self.focus.rules = RuleList::compile("focus-exclude", &self.focus.exclude);
    }

    fn wintype(&self, t: WinType) -> Option<&WintypeConfig> {
        self.wintypes.get(t.name())
    }

    /// Whether windows of this type get a drop shadow (absent an exclusion
    /// rule). Desktop and drag-and-drop windows default to none.
    pub fn wintype_shadow(&self, t: WinType) -> bool {
        self.wintype(t)
            .and_then(|c| c.shadow)
            .unwrap_or(!matches!(t, WinType::Desktop | WinType::Dnd))
    }

    pub fn wintype_fade(&self, t: WinType) -> bool {
        self.wintype(t).and_then(|c| c.fade).unwrap_or(true)
    }

    /// Whether windows of this type are always treated as focused.
    pub fn wintype_focus(&self, t: WinType) -> bool {
        self.wintype(t).and_then(|c| c.focus).unwrap_or(false)
    }

    pub fn wintype_opacity(&self, t: WinType) -> Option<f64> {
        self.wintype(t).and_then(|c| c.opacity)
    }
}

/// Drop shadow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    pub enabled: bool,
    /// Gaussian blur radius in pixels
    pub radius: f64,
    /// Shadow opacity (0.0-1.0)
    pub opacity: f64,
    /// Shadow offset from the window, in pixels
    pub offset_x: i32,
    pub offset_y: i32,
    /// Regex patterns for windows that never get a shadow
    pub exclude: Vec<String>,
    #[serde(skip)]
    pub rules: RuleList,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius: 12.0,
            opacity: 0.75,
            offset_x: -15,
            offset_y: -15,
            exclude: Vec::new(),
            rules: RuleList::default(),
        }
    }
}

/// Fade animation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FadeConfig {
    /// Opacity change per tick while fading in (0 disables fade-in)
    pub in_step: f64,
    /// Opacity change per tick while fading out (0 disables fade-out)
    pub out_step: f64,
    /// Milliseconds between fade ticks
    pub delta_ms: u64,
    /// Regex patterns for windows that never fade
    pub exclude: Vec<String>,
    #[serde(skip)]
    pub rules: RuleList,
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            in_step: 0.028,
            out_step: 0.03,
            delta_ms: 10,
            exclude: Vec::new(),
            rules: RuleList::default(),
        }
    }
}

/// Focus-dependent rendering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusConfig {
    /// Opacity of focused windows (0.0-1.0)
    pub active_opacity: f64,
    /// Opacity of unfocused windows (0.0-1.0)
    pub inactive_opacity: f64,
    /// Opacity of window frames/titlebars (0.0-1.0)
    pub frame_opacity: f64,
    /// Dim level applied over unfocused windows (0 disables)
    pub inactive_dim: f64,
    /// Treat managed (non-override-redirect) windows as focused
    pub mark_wmwin_focused: bool,
    /// Treat override-redirect windows (menus, tooltips) as focused
    pub mark_ovredir_focused: bool,
    /// Regex patterns for windows exempt from focus-dependent treatment
    pub exclude: Vec<String>,
    #[serde(skip)]
    pub rules: RuleList,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            active_opacity: 1.0,
            inactive_opacity: 1.0,
            frame_opacity: 1.0,
            inactive_dim: 0.0,
            mark_wmwin_focused: false,
            mark_ovredir_focused: false,
            exclude: Vec::new(),
            rules: RuleList::default(),
        }
    }
}

/// Per-wintype overrides; unset fields fall back to the global defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WintypeConfig {
    pub shadow: Option<bool>,
    pub fade: Option<bool>,
    pub focus: Option<bool>,
    pub opacity: Option<f64>,
}

/// A compiled exclusion pattern list. The engine only ever asks for the
/// boolean verdict; the matching itself happens here.
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    patterns: Vec<Regex>,
}

impl RuleList {
    /// Compile patterns, warning once per bad pattern and skipping it.
    pub fn compile(name: &str, sources: &[String]) -> Self {
        let mut patterns = Vec::with_capacity(sources.len());
        for src in sources {
            match Regex::new(src) {
                Ok(re) => patterns.push(re),
                Err(e) => warn!("Invalid {} pattern {:?}: {}", name, src, e),
            }
        }
        Self { patterns }
    }

    /// Whether any pattern matches the window's class, name, or role.
    pub fn matches(&self, ident: &WinIdent) -> bool {
        self.patterns.iter().any(|re| {
            re.is_match(&ident.class) || re.is_match(&ident.name) || re.is_match(&ident.role)
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_ranges() {
        let mut c = Config::default();
        c.shadow.opacity = 1.9;
        c.shadow.radius = 500.0;
        c.fade.in_step = -0.5;
        c.focus.inactive_opacity = -2.0;
        c.focus.inactive_dim = 3.0;
        c.fade.delta_ms = 0;
        c.sanitize();
        assert_eq!(c.shadow.opacity, 1.0);
        assert_eq!(c.shadow.radius, 64.0);
        assert_eq!(c.fade.in_step, 0.0);
        assert_eq!(c.focus.inactive_opacity, 0.0);
        assert_eq!(c.focus.inactive_dim, 1.0);
        assert_eq!(c.fade.delta_ms, 1);
    }

    #[test]
    fn test_bad_pattern_is_skipped_not_fatal() {
        let rules = RuleList::compile(
            "test",
            &["[unclosed".to_string(), "^Firefox$".to_string()],
        );
        let ident = WinIdent {
            class: "Firefox".into(),
            name: String::new(),
            role: String::new(),
        };
        assert!(rules.matches(&ident));
    }

    #[test]
    fn test_rules_match_any_field() {
        let rules = RuleList::compile("test", &["scratchpad".to_string()]);
        let by_name = WinIdent {
            class: "Term".into(),
            name: "scratchpad session".into(),
            role: String::new(),
        };
        let by_role = WinIdent {
            class: "Term".into(),
            name: String::new(),
            role: "scratchpad".into(),
        };
        let neither = WinIdent {
            class: "Term".into(),
            name: "editor".into(),
            role: "main".into(),
        };
        assert!(rules.matches(&by_name));
        assert!(rules.matches(&by_role));
        assert!(!rules.matches(&neither));
    }

    #[test]
    fn test_wintype_defaults() {
        let c = Config::default();
        assert!(c.wintype_shadow(WinType::Normal));
        assert!(!c.wintype_shadow(WinType::Desktop));
        assert!(!c.wintype_shadow(WinType::Dnd));
        assert!(c.wintype_fade(WinType::Tooltip));
        assert!(!c.wintype_focus(WinType::Normal));
        assert_eq!(c.wintype_opacity(WinType::Menu), None);
    }

    #[test]
    fn test_wintype_overrides() {
        let mut c = Config::default();
        c.wintypes.insert(
            "dock".to_string(),
            WintypeConfig {
                shadow: Some(false),
                fade: Some(false),
                focus: Some(true),
                opacity: Some(1.4),
            },
        );
        c.sanitize();
        assert!(!c.wintype_shadow(WinType::Dock));
        assert!(!c.wintype_fade(WinType::Dock));
        assert!(c.wintype_focus(WinType::Dock));
        assert_eq!(c.wintype_opacity(WinType::Dock), Some(1.0));
    }

    #[test]
    fn test_partial_file_parses_with_defaults() {
        let mut c: Config = toml::from_str(
            r#"
            [shadow]
            enabled = false
            radius = 8.0
            opacity = 0.5
            offset_x = -7
            offset_y = -7
            exclude = []
            "#,
        )
        .unwrap();
        c.sanitize();
        assert!(!c.shadow.enabled);
        assert_eq!(c.shadow.radius, 8.0);
        // Untouched sections keep their defaults.
        assert_eq!(c.fade.delta_ms, 10);
        assert_eq!(c.focus.active_opacity, 1.0);
    }
}
