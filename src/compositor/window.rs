//! Window Registry
//!
//! The canonical, stacking-ordered set of tracked windows. A window owns
//! every server-side rendering resource created for it (picture, damage
//! object, shadow picture, cached regions); those exist exactly while the
//! window is mapped (or mid-fade-out) and are released exactly once via
//! [`release_resources`] from every path that retires the window.

use std::collections::HashMap;

use tracing::debug;

use super::backend::{Backend, DamageId, FrameExtents, PictureId, RegionId, WinId};
use super::region::Rect;

/// How a window's pixels combine with what is below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinMode {
    /// Opaque; composited with source op and occludes everything below.
    Solid,
    /// Uniform translucency from an opacity below 1.0.
    Trans,
    /// Per-pixel alpha from a 32-bit visual.
    Argb,
}

/// EWMH window type taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WinType {
    Unknown,
    Desktop,
    Dock,
    Toolbar,
    Menu,
    Utility,
    Splash,
    Dialog,
    Normal,
    DropdownMenu,
    PopupMenu,
    Tooltip,
    Notification,
    Combo,
    Dnd,
}

impl WinType {
    pub const ALL: [WinType; 15] = [
        WinType::Unknown,
        WinType::Desktop,
        WinType::Dock,
        WinType::Toolbar,
        WinType::Menu,
        WinType::Utility,
        WinType::Splash,
        WinType::Dialog,
        WinType::Normal,
        WinType::DropdownMenu,
        WinType::PopupMenu,
        WinType::Tooltip,
        WinType::Notification,
        WinType::Combo,
        WinType::Dnd,
    ];

    /// Stable name, used as the per-wintype key in the config file.
    pub fn name(&self) -> &'static str {
        match self {
            WinType::Unknown => "unknown",
            WinType::Desktop => "desktop",
            WinType::Dock => "dock",
            WinType::Toolbar => "toolbar",
            WinType::Menu => "menu",
            WinType::Utility => "utility",
            WinType::Splash => "splash",
            WinType::Dialog => "dialog",
            WinType::Normal => "normal",
            WinType::DropdownMenu => "dropdown_menu",
            WinType::PopupMenu => "popup_menu",
            WinType::Tooltip => "tooltip",
            WinType::Notification => "notification",
            WinType::Combo => "combo",
            WinType::Dnd => "dnd",
        }
    }
}

/// Classify blending from the visual and the effective opacity.
pub fn determine_mode(argb: bool, opacity: f64) -> WinMode {
    if argb {
        WinMode::Argb
    } else if opacity < 1.0 - 1e-6 {
        WinMode::Trans
    } else {
        WinMode::Solid
    }
}

/// Deferred configure payload; only the latest queued one is kept.
#[derive(Debug, Clone, Copy)]
pub struct Configure {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
    /// Sibling this window is stacked directly above; `None` for bottom.
    pub above: Option<WinId>,
}

/// Uploaded shadow mask with its placement relative to the window.
#[derive(Debug)]
pub struct ShadowPicture {
    pub pict: PictureId,
    pub dx: i32,
    pub dy: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub struct Win {
    pub id: WinId,
    /// Client window for decorated frames (WM_STATE descent), else `id`.
    pub client_win: WinId,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
    pub override_redirect: bool,
    /// Mapped per the server; stays true through a fade-out so the window
    /// keeps painting until the fade finishes.
    pub viewable: bool,
    pub mode: WinMode,
    pub wintype: WinType,
    pub argb: bool,

    // Rendering resources, present iff mapped (or mid-fade-out).
    pub picture: Option<PictureId>,
    pub damage: Option<DamageId>,
    pub shadow: Option<ShadowPicture>,
    pub border_size: Option<RegionId>,

    /// Effective opacity; while a fade runs this is the fade's current.
    pub opacity: f64,
    /// Cached `_NET_WM_WINDOW_OPACITY` value.
    pub opacity_prop: Option<f64>,
    pub frame: FrameExtents,
    pub focused: bool,
    pub dim: bool,
    pub shadow_wanted: bool,
    pub fade_excluded: bool,
    pub focus_excluded: bool,

    /// Produced damage at least once since map; unpainted before that.
    pub damaged: bool,
    /// Contributed to the pending repaint region since the last paint pass.
    pub pending_damage: bool,
    pub destroyed: bool,
    pub need_configure: Option<Configure>,

    // Paint-pass scratch; recomputed fresh each pass, never persisted.
    pub border_clip: Option<RegionId>,
    pub shadow_clip: Option<RegionId>,
}

impl Win {
    pub fn new(id: WinId, x: i32, y: i32, width: u32, height: u32, border_width: u32) -> Self {
        Self {
            id,
            client_win: id,
            x,
            y,
            width,
            height,
            border_width,
            override_redirect: false,
            viewable: false,
            mode: WinMode::Solid,
            wintype: WinType::Unknown,
            argb: false,
            picture: None,
            damage: None,
            shadow: None,
            border_size: None,
            opacity: 1.0,
            opacity_prop: None,
            frame: FrameExtents::default(),
            focused: false,
            dim: false,
            shadow_wanted: false,
            fade_excluded: false,
            focus_excluded: false,
            damaged: false,
            pending_damage: false,
            destroyed: false,
            need_configure: None,
            border_clip: None,
            shadow_clip: None,
        }
    }

    /// On-screen rectangle including the server-side border.
    pub fn geometry_rect(&self) -> Rect {
        Rect::new(
            self.x,
            self.y,
            self.width + 2 * self.border_width,
            self.height + 2 * self.border_width,
        )
    }

    /// Where the shadow mask lands for the given offset and kernel radius.
    pub fn shadow_rect(&self, dx: i32, dy: i32, radius: u32) -> Rect {
        let g = self.geometry_rect();
        Rect::new(
            g.x + dx - radius as i32,
            g.y + dy - radius as i32,
            g.width + 2 * radius,
            g.height + 2 * radius,
        )
    }

    /// Everything this window can touch on screen: geometry plus shadow.
    pub fn extents_rect(&self, dx: i32, dy: i32, radius: u32) -> Rect {
        let g = self.geometry_rect();
        if self.shadow_wanted {
            g.union(&self.shadow_rect(dx, dy, radius))
        } else {
            g
        }
    }

    pub fn solid_opaque(&self) -> bool {
        matches!(self.mode, WinMode::Solid) && self.opacity >= 1.0 - 1e-6
    }
}

/// Free every server-side resource the window owns. Safe to call from any
/// teardown path; each handle is `take`n so a second call is a no-op.
pub fn release_resources<B: Backend>(backend: &mut B, w: &mut Win) {
    if let Some(p) = w.picture.take() {
        backend.free_picture(p);
    }
    if let Some(d) = w.damage.take() {
        backend.destroy_damage(d);
    }
    if let Some(s) = w.shadow.take() {
        backend.free_picture(s.pict);
    }
    for r in [
        w.border_size.take(),
        w.border_clip.take(),
        w.shadow_clip.take(),
    ]
    .into_iter()
    .flatten()
    {
        backend.destroy_region(r);
    }
}

/// Tracked windows plus their bottom-to-top stacking order.
#[derive(Debug, Default)]
pub struct Registry {
    wins: HashMap<WinId, Win>,
    stacking: Vec<WinId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: WinId) -> bool {
        self.wins.contains_key(&id)
    }

    pub fn get(&self, id: WinId) -> Option<&Win> {
        self.wins.get(&id)
    }

    pub fn get_mut(&mut self, id: WinId) -> Option<&mut Win> {
        self.wins.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<WinId> {
        self.wins.keys().copied().collect()
    }

    /// New windows are created on top of the stack.
    pub fn add(&mut self, win: Win) {
        debug_assert!(!self.wins.contains_key(&win.id), "window {} tracked twice", win.id);
        self.stacking.push(win.id);
        self.wins.insert(win.id, win);
    }

    /// Unlink and return the window; its resources must already be freed.
    pub fn remove(&mut self, id: WinId) -> Option<Win> {
        self.stacking.retain(|&w| w != id);
        self.wins.remove(&id)
    }

    /// Relink `id` directly above `above`, or to the bottom for `None`.
    pub fn restack(&mut self, id: WinId, above: Option<WinId>) {
        if !self.wins.contains_key(&id) {
            return;
        }
        self.stacking.retain(|&w| w != id);
        match above {
            None => self.stacking.insert(0, id),
            Some(sib) => match self.stacking.iter().position(|&w| w == sib) {
                Some(i) => self.stacking.insert(i + 1, id),
                None => {
                    // Sibling untracked (e.g. our own helper window); the
                    // safest guess is the top.
                    debug!("restack of {id} above unknown sibling {sib}");
                    self.stacking.push(id);
                }
            },
        }
    }

    /// CirculateNotify: move straight to the top or bottom.
    pub fn circulate(&mut self, id: WinId, to_top: bool) {
        if !self.wins.contains_key(&id) {
            return;
        }
        self.stacking.retain(|&w| w != id);
        if to_top {
            self.stacking.push(id);
        } else {
            self.stacking.insert(0, id);
        }
    }

    #[cfg(test)]
    pub fn bottom_to_top(&self) -> impl Iterator<Item = WinId> + '_ {
        self.stacking.iter().copied()
    }

    pub fn top_to_bottom(&self) -> impl Iterator<Item = WinId> + '_ {
        self.stacking.iter().rev().copied()
    }

    /// Toplevel whose resolved client window is `client`.
    pub fn find_by_client(&self, client: WinId) -> Option<WinId> {
        self.wins
            .values()
            .find(|w| w.client_win == client)
            .map(|w| w.id)
    }
}
