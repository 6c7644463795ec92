//! Compositing Engine
//!
//! Drives the whole window lifecycle off the X event stream: tracking,
//! map/unmap/destroy with deferred teardown while fades run, damage
//! accumulation and the batched repaint, focus- and property-driven
//! opacity changes. The engine is generic over [`backend::Backend`] so the
//! state machine runs against the recording mock in tests.

pub mod backend;
pub mod damage;
pub mod fade;
pub mod region;
pub mod shadow;
pub mod window;
pub mod xrender;

use std::time::{Duration, Instant};

use tracing::{debug, warn};
use x11rb::protocol::Event;
use x11rb::protocol::xproto::Place;

use crate::config::Config;
use backend::{Backend, PropertyKind, WinId};
use damage::{DamageScheduler, paint_all};
use fade::{FadeCallback, FadeEngine, FadeOutcome};
use region::Rect;
use shadow::GaussianKernel;
use window::{Configure, Registry, Win, WinType, determine_mode, release_resources};

pub struct Compositor<B: Backend> {
    backend: B,
    config: Config,
    reg: Registry,
    fades: FadeEngine,
    scheduler: DamageScheduler,
    kernel: GaussianKernel,
    root_width: u32,
    root_height: u32,
    /// When the next fade step is due; `None` while nothing animates.
    next_fade: Option<Instant>,
    /// Root Expose rectangles accumulated until the count-0 event.
    expose_rects: Vec<Rect>,
}

impl<B: Backend> Compositor<B> {
    pub fn new(backend: B, config: Config) -> Self {
        let (root_width, root_height) = backend.root_size();
        let kernel = GaussianKernel::new(config.shadow.radius);
        let fades = FadeEngine::new(Duration::from_millis(config.fade.delta_ms));
        Self {
            backend,
            config,
            reg: Registry::new(),
            fades,
            scheduler: DamageScheduler::new(),
            kernel,
            root_width,
            root_height,
            next_fade: None,
            expose_rects: Vec::new(),
        }
    }

    fn shadow_params(&self) -> (i32, i32, u32) {
        (
            self.config.shadow.offset_x,
            self.config.shadow.offset_y,
            self.kernel.radius(),
        )
    }

    /// Opacity the window should settle at, from highest to lowest
    /// precedence: client property, wintype override, focus state.
    fn target_opacity(config: &Config, w: &Win) -> f64 {
        w.opacity_prop
            .or_else(|| config.wintype_opacity(w.wintype))
            .unwrap_or(if w.focused || w.focus_excluded {
                config.focus.active_opacity
            } else {
                config.focus.inactive_opacity
            })
    }

    fn damage_rect(&mut self, rect: Rect) {
        if rect.width == 0 || rect.height == 0 {
            return;
        }
        if let Err(e) = self.scheduler.add_rect(&mut self.backend, rect) {
            warn!("failed to queue damage: {e:#}");
        }
    }

    pub fn full_screen_damage(&mut self) {
        self.damage_rect(Rect::new(0, 0, self.root_width, self.root_height));
    }

    // --- lifecycle ------------------------------------------------------

    /// Start tracking a toplevel. Maps it right away when the server
    /// already shows it (startup scan, reparent back to root).
    pub fn add_window(&mut self, id: WinId) {
        if id == self.backend.root_window() || self.reg.contains(id) {
            return;
        }
        let attrs = match self.backend.window_attributes(id) {
            Ok(a) => a,
            Err(e) => {
                debug!("cannot track window {id:#x}: {e:#}");
                return;
            }
        };
        if attrs.input_only {
            return;
        }
        let mut w = Win::new(id, attrs.x, attrs.y, attrs.width, attrs.height, attrs.border_width);
        w.override_redirect = attrs.override_redirect;
        w.argb = attrs.argb;
        self.reg.add(w);
        debug!("tracking window {id:#x}");
        if attrs.viewable {
            self.map_window(id);
        }
    }

    /// Window became viewable: resolve everything that needs the server
    /// (client window, type, idents, properties), allocate the rendering
    /// resources and kick off the fade-in.
    pub fn map_window(&mut self, id: WinId) {
        if !self.reg.contains(id) {
            return;
        }
        let attrs = match self.backend.window_attributes(id) {
            Ok(a) => a,
            Err(e) => {
                debug!("map of vanished window {id:#x}: {e:#}");
                return;
            }
        };
        let client = self.backend.resolve_client_window(id);
        let mut wintype = self.backend.window_type(id);
        if wintype == WinType::Unknown && client != id {
            wintype = self.backend.window_type(client);
        }
        if wintype == WinType::Unknown {
            wintype = WinType::Normal;
        }
        let ident = self.backend.window_ident(client);
        let frame = self.backend.frame_extents(client);
        let opacity_prop = self
            .backend
            .window_opacity_prop(id)
            .or_else(|| self.backend.window_opacity_prop(client));
        self.backend.select_window_events(id);
        if client != id {
            self.backend.select_window_events(client);
        }
        let picture = match self.backend.bind_window_picture(id) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("failed to bind picture for window {id:#x}: {e:#}");
                None
            }
        };
        let dmg = match self.backend.create_damage(id) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("failed to create damage for window {id:#x}: {e:#}");
                None
            }
        };

        let cfg = &self.config;
        let shadow_wanted =
            cfg.shadow.enabled && cfg.wintype_shadow(wintype) && !cfg.shadow.rules.matches(&ident);
        let fade_excluded = !cfg.wintype_fade(wintype) || cfg.fade.rules.matches(&ident);
        let focus_excluded = cfg.focus.rules.matches(&ident);
        let forced_focus = cfg.wintype_focus(wintype)
            || (cfg.focus.mark_ovredir_focused && attrs.override_redirect)
            || (cfg.focus.mark_wmwin_focused && !attrs.override_redirect);
        let in_step = cfg.fade.in_step;
        let dim_level = cfg.focus.inactive_dim;
        let (dx, dy, radius) = self.shadow_params();

        let Some(w) = self.reg.get_mut(id) else { return };
        // A remap during a fade-out can leave stale resources behind.
        let stale_pict = w.picture.take();
        let stale_damage = w.damage.take();
        let stale_shadow = w.shadow.take();

        w.viewable = true;
        w.x = attrs.x;
        w.y = attrs.y;
        w.width = attrs.width;
        w.height = attrs.height;
        w.border_width = attrs.border_width;
        w.override_redirect = attrs.override_redirect;
        w.argb = attrs.argb;
        w.client_win = client;
        w.wintype = wintype;
        w.frame = frame;
        w.opacity_prop = opacity_prop;
        w.shadow_wanted = shadow_wanted;
        w.fade_excluded = fade_excluded;
        w.focus_excluded = focus_excluded;
        w.focused = w.focused || forced_focus;
        w.dim = dim_level > 0.0 && !w.focused && !focus_excluded;
        w.damaged = false;
        w.picture = picture;
        w.damage = dmg;

        let target = Self::target_opacity(&self.config, w);
        let fade_in = in_step > 0.0 && !fade_excluded;
        w.opacity = if fade_in { 0.0 } else { target };
        w.mode = determine_mode(w.argb, w.opacity);
        let rect = w.extents_rect(dx, dy, radius);

        if let Some(p) = stale_pict {
            self.backend.free_picture(p);
        }
        if let Some(d) = stale_damage {
            self.backend.destroy_damage(d);
        }
        if let Some(s) = stale_shadow {
            self.backend.free_picture(s.pict);
        }

        if fade_in {
            self.fades
                .set_fade(id, Some(0.0), target, in_step, FadeCallback::None, false, true);
        } else {
            self.fades.cancel(id);
        }
        self.damage_rect(rect);
    }

    /// Window left the screen. With fading enabled the resources stay
    /// alive until the fade-out completes; otherwise teardown is immediate.
    pub fn unmap_window(&mut self, id: WinId) {
        let out_step = self.config.fade.out_step;
        let Some(w) = self.reg.get_mut(id) else { return };
        if !w.viewable {
            return;
        }
        let fade_out = out_step > 0.0 && !w.fade_excluded;
        let cur = w.opacity;
        if fade_out {
            let start = if self.fades.is_fading(id) { None } else { Some(cur) };
            if let FadeOutcome::Immediate { .. } = self.fades.set_fade(
                id,
                start,
                0.0,
                out_step,
                FadeCallback::FinishUnmap,
                true,
                true,
            ) {
                self.finish_unmap(id);
            }
        } else {
            self.finish_unmap(id);
        }
    }

    fn finish_unmap(&mut self, id: WinId) {
        let (dx, dy, radius) = self.shadow_params();
        let Some(w) = self.reg.get_mut(id) else { return };
        if !w.viewable && w.picture.is_none() {
            return;
        }
        w.viewable = false;
        w.damaged = false;
        let rect = w.extents_rect(dx, dy, radius);
        release_resources(&mut self.backend, w);
        self.damage_rect(rect);
    }

    /// The server destroyed the window. The registry entry survives until
    /// any running or newly started fade-out finishes, then everything is
    /// released exactly once.
    pub fn destroy_window(&mut self, id: WinId) {
        let out_step = self.config.fade.out_step;
        let Some(w) = self.reg.get_mut(id) else { return };
        w.destroyed = true;
        let fade_out =
            self.fades.is_fading(id) || (w.viewable && out_step > 0.0 && !w.fade_excluded);
        if fade_out {
            let start = if self.fades.is_fading(id) { None } else { Some(w.opacity) };
            if let FadeOutcome::Immediate { .. } = self.fades.set_fade(
                id,
                start,
                0.0,
                out_step,
                FadeCallback::FinishDestroy,
                true,
                true,
            ) {
                self.finish_destroy(id);
            }
        } else {
            self.finish_destroy(id);
        }
    }

    fn finish_destroy(&mut self, id: WinId) {
        self.finish_unmap(id);
        self.fades.cancel(id);
        if self.reg.remove(id).is_some() {
            debug!("window {id:#x} retired");
        }
    }

    /// Geometry/stacking change. While the window has unpainted damage the
    /// change is parked (latest wins) and applied right after the next
    /// paint pass, so paint never runs against half-updated geometry.
    pub fn configure_window(&mut self, id: WinId, conf: Configure) {
        let Some(w) = self.reg.get_mut(id) else { return };
        if w.pending_damage {
            w.need_configure = Some(conf);
            return;
        }
        self.apply_configure(id, conf);
    }

    fn apply_configure(&mut self, id: WinId, conf: Configure) {
        let (dx, dy, radius) = self.shadow_params();
        let mut freed_picts = Vec::new();
        let mut freed_regions = Vec::new();
        let (old_rect, new_rect);
        {
            let Some(w) = self.reg.get_mut(id) else { return };
            old_rect = w.viewable.then(|| w.extents_rect(dx, dy, radius));
            let resized = w.width != conf.width
                || w.height != conf.height
                || w.border_width != conf.border_width;
            if resized {
                // The backing pixmap is replaced on resize; re-bind lazily.
                if let Some(p) = w.picture.take() {
                    freed_picts.push(p);
                }
                if let Some(s) = w.shadow.take() {
                    freed_picts.push(s.pict);
                }
            }
            if let Some(r) = w.border_size.take() {
                freed_regions.push(r);
            }
            w.x = conf.x;
            w.y = conf.y;
            w.width = conf.width;
            w.height = conf.height;
            w.border_width = conf.border_width;
            new_rect = w.viewable.then(|| w.extents_rect(dx, dy, radius));
        }
        for p in freed_picts {
            self.backend.free_picture(p);
        }
        for r in freed_regions {
            self.backend.destroy_region(r);
        }
        self.reg.restack(id, conf.above);
        if let Some(r) = old_rect {
            self.damage_rect(r);
        }
        if let Some(r) = new_rect {
            self.damage_rect(r);
        }
    }

    pub fn circulate_window(&mut self, id: WinId, to_top: bool) {
        let (dx, dy, radius) = self.shadow_params();
        if !self.reg.contains(id) {
            return;
        }
        self.reg.circulate(id, to_top);
        if let Some(rect) = self.reg.get(id).map(|w| w.extents_rect(dx, dy, radius)) {
            self.damage_rect(rect);
        }
    }

    // --- damage ---------------------------------------------------------

    /// DamageNotify. The first report after a map invalidates the whole
    /// extents (the content was never painted); afterwards only the
    /// accumulated damage region is fetched.
    pub fn damage_window(&mut self, id: WinId) {
        let (sdx, sdy, radius) = self.shadow_params();
        let dmg;
        let rect_or_origin;
        {
            let Some(w) = self.reg.get_mut(id) else { return };
            if !w.viewable {
                return;
            }
            w.pending_damage = true;
            let first = !w.damaged;
            w.damaged = true;
            dmg = w.damage;
            rect_or_origin = if first {
                Ok(w.extents_rect(sdx, sdy, radius))
            } else {
                Err((w.x + w.border_width as i32, w.y + w.border_width as i32))
            };
        }
        match rect_or_origin {
            Ok(rect) => {
                if let Some(d) = dmg {
                    self.backend.clear_damage(d);
                }
                self.damage_rect(rect);
            }
            Err(origin) => {
                let Some(d) = dmg else { return };
                match self.backend.drain_damage(d, origin) {
                    Ok(parts) => {
                        if let Err(e) = self.scheduler.add(&mut self.backend, parts) {
                            warn!("failed to queue damage: {e:#}");
                        }
                    }
                    Err(e) => warn!("failed to fetch damage for window {id:#x}: {e:#}"),
                }
            }
        }
    }

    /// Root Expose; rectangles batch up until the final (count 0) event.
    pub fn root_exposed(&mut self, rect: Rect, count: u16) {
        if rect.width > 0 && rect.height > 0 {
            self.expose_rects.push(rect);
        }
        if count != 0 {
            return;
        }
        let rects = std::mem::take(&mut self.expose_rects);
        if rects.is_empty() {
            return;
        }
        match self.backend.create_region(&rects) {
            Ok(r) => {
                if let Err(e) = self.scheduler.add(&mut self.backend, r) {
                    warn!("failed to queue expose damage: {e:#}");
                }
            }
            Err(e) => warn!("failed to build expose region: {e:#}"),
        }
    }

    // --- focus and properties -------------------------------------------

    pub fn focus_changed(&mut self, id: WinId, focused: bool) {
        let dim_level = self.config.focus.inactive_dim;
        let (dx, dy, radius) = self.shadow_params();
        let rect;
        {
            let Some(w) = self.reg.get_mut(id) else { return };
            let f = focused || self.config.wintype_focus(w.wintype);
            if w.focused == f {
                return;
            }
            w.focused = f;
            w.dim = dim_level > 0.0 && !f && !w.focus_excluded;
            rect = w.extents_rect(dx, dy, radius);
        }
        self.update_opacity(id, true);
        // Dim state changed even when the opacity did not.
        self.damage_rect(rect);
    }

    fn property_changed(&mut self, win: WinId, atom: u32) {
        match self.backend.classify_property(atom) {
            PropertyKind::WindowOpacity => {
                let target = if self.reg.contains(win) {
                    Some(win)
                } else {
                    self.reg.find_by_client(win)
                };
                let Some(id) = target else { return };
                let prop = self.backend.window_opacity_prop(win);
                if let Some(w) = self.reg.get_mut(id) {
                    w.opacity_prop = prop;
                }
                self.update_opacity(id, true);
            }
            PropertyKind::RootBackground => {
                if win == self.backend.root_window() {
                    self.backend.root_background_changed();
                    self.full_screen_damage();
                }
            }
            PropertyKind::FrameExtents => {
                let target = if self.reg.contains(win) {
                    Some(win)
                } else {
                    self.reg.find_by_client(win)
                };
                let Some(id) = target else { return };
                let fe = self.backend.frame_extents(win);
                let (dx, dy, radius) = self.shadow_params();
                let Some(w) = self.reg.get_mut(id) else { return };
                if w.frame != fe {
                    w.frame = fe;
                    let rect = w.extents_rect(dx, dy, radius);
                    self.damage_rect(rect);
                }
            }
            PropertyKind::Other => {}
        }
    }

    /// Steer the window toward its target opacity, fading when allowed.
    fn update_opacity(&mut self, id: WinId, fade: bool) {
        // Never displace a fade that still owes an unmap/destroy teardown.
        if matches!(
            self.fades.pending_callback(id),
            Some(FadeCallback::FinishUnmap | FadeCallback::FinishDestroy)
        ) {
            return;
        }
        let in_step = self.config.fade.in_step;
        let out_step = self.config.fade.out_step;
        let (dx, dy, radius) = self.shadow_params();

        let (target, cur, excluded);
        {
            let Some(w) = self.reg.get_mut(id) else { return };
            if w.destroyed || !w.viewable {
                return;
            }
            target = Self::target_opacity(&self.config, w);
            cur = w.opacity;
            excluded = w.fade_excluded;
        }
        if (target - cur).abs() < 1e-6 && !self.fades.is_fading(id) {
            return;
        }

        let step = if target > cur { in_step } else { out_step };
        let outcome = if fade && !excluded && step > 0.0 {
            let start = if self.fades.is_fading(id) { None } else { Some(cur) };
            self.fades
                .set_fade(id, start, target, step, FadeCallback::None, false, true)
        } else {
            self.fades.cancel(id);
            FadeOutcome::Immediate { opacity: target, run_callback: false }
        };

        if let FadeOutcome::Immediate { opacity, .. } = outcome {
            let Some(w) = self.reg.get_mut(id) else { return };
            w.opacity = opacity;
            w.mode = determine_mode(w.argb, w.opacity);
            let shadow = w.shadow.take();
            let rect = w.extents_rect(dx, dy, radius);
            if let Some(s) = shadow {
                self.backend.free_picture(s.pict);
            }
            self.damage_rect(rect);
        }
    }

    pub fn shape_changed(&mut self, id: WinId) {
        let (dx, dy, radius) = self.shadow_params();
        let border_size;
        let rect;
        {
            let Some(w) = self.reg.get_mut(id) else { return };
            border_size = w.border_size.take();
            rect = w.extents_rect(dx, dy, radius);
        }
        if let Some(r) = border_size {
            self.backend.destroy_region(r);
        }
        self.damage_rect(rect);
    }

    // --- clock and paint ------------------------------------------------

    /// Advance fades when due, then repaint whatever is dirty.
    pub fn tick(&mut self, now: Instant) {
        if self.fades.timeout().is_some() {
            let due = self.next_fade.is_none_or(|t| now >= t);
            if due {
                self.run_fade_steps();
                self.next_fade = self.fades.timeout().map(|d| now + d);
            }
        } else {
            self.next_fade = None;
        }
        self.paint();
    }

    /// Event-loop wait bound: time to the next fade step, unbounded when
    /// nothing animates.
    pub fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        self.fades.timeout().map(|_| match self.next_fade {
            Some(t) => t.saturating_duration_since(now),
            None => Duration::ZERO,
        })
    }

    fn run_fade_steps(&mut self) {
        let (dx, dy, radius) = self.shadow_params();
        for st in self.fades.run_fades() {
            if let Some(w) = self.reg.get_mut(st.win) {
                w.opacity = st.opacity;
                w.mode = determine_mode(w.argb, w.opacity);
                // The shadow mask bakes in the opacity; rebuilt on paint.
                let shadow = w.shadow.take();
                let rect = w.extents_rect(dx, dy, radius);
                if let Some(s) = shadow {
                    self.backend.free_picture(s.pict);
                }
                self.damage_rect(rect);
            }
            match st.done {
                Some(FadeCallback::FinishUnmap) => self.finish_unmap(st.win),
                Some(FadeCallback::FinishDestroy) => self.finish_destroy(st.win),
                _ => {}
            }
        }
    }

    /// Composite one frame from the accumulated damage, then release the
    /// per-window damage flags and apply any configures parked behind them.
    pub fn paint(&mut self) {
        let Some(region) = self.scheduler.take() else { return };
        if let Err(e) = paint_all(
            &mut self.backend,
            &mut self.reg,
            &self.config,
            &self.kernel,
            region,
        ) {
            warn!("paint pass failed: {e:#}");
        }

        let mut deferred = Vec::new();
        for id in self.reg.ids() {
            if let Some(w) = self.reg.get_mut(id) {
                w.pending_damage = false;
                if let Some(conf) = w.need_configure.take() {
                    deferred.push((id, conf));
                }
            }
        }
        for (id, conf) in deferred {
            self.apply_configure(id, conf);
        }
        self.backend.flush();
    }

    pub fn flush(&mut self) {
        self.backend.flush();
    }

    // --- event dispatch -------------------------------------------------

    pub fn handle_event(&mut self, event: &Event) {
        match event {
            Event::CreateNotify(e) => {
                if e.parent == self.backend.root_window() {
                    self.add_window(e.window);
                }
            }
            Event::ConfigureNotify(e) => {
                if e.window == self.backend.root_window() {
                    let (w, h) = (e.width as u32, e.height as u32);
                    if (w, h) != (self.root_width, self.root_height) {
                        self.root_width = w;
                        self.root_height = h;
                        self.backend.root_resized(w, h);
                        self.full_screen_damage();
                    }
                } else {
                    self.configure_window(
                        e.window,
                        Configure {
                            x: e.x as i32,
                            y: e.y as i32,
                            width: e.width as u32,
                            height: e.height as u32,
                            border_width: e.border_width as u32,
                            above: (e.above_sibling != x11rb::NONE).then_some(e.above_sibling),
                        },
                    );
                }
            }
            Event::MapNotify(e) => self.map_window(e.window),
            Event::UnmapNotify(e) => self.unmap_window(e.window),
            Event::DestroyNotify(e) => self.destroy_window(e.window),
            Event::ReparentNotify(e) => {
                // Reparented away it is no longer a toplevel; back under
                // the root it becomes one again.
                if e.parent == self.backend.root_window() {
                    self.add_window(e.window);
                } else {
                    self.destroy_window(e.window);
                }
            }
            Event::CirculateNotify(e) => {
                self.circulate_window(e.window, e.place == Place::ON_TOP);
            }
            Event::Expose(e) => {
                if e.window == self.backend.root_window() {
                    self.root_exposed(
                        Rect::new(e.x as i32, e.y as i32, e.width as u32, e.height as u32),
                        e.count,
                    );
                }
            }
            Event::PropertyNotify(e) => self.property_changed(e.window, e.atom),
            Event::FocusIn(e) => self.focus_changed(e.event, true),
            Event::FocusOut(e) => self.focus_changed(e.event, false),
            Event::DamageNotify(e) => self.damage_window(e.drawable),
            Event::ShapeNotify(e) => self.shape_changed(e.affected_window),
            Event::Error(err) => {
                if !self.backend.absorb_error(err.sequence) {
                    warn!(
                        "X error {:?}: request {}.{} on resource {:#x}",
                        err.error_kind, err.major_opcode, err.minor_opcode, err.bad_value
                    );
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::backend::mock::{MockBackend, MockWindow, PaintOp};
    use super::*;

    fn config(in_step: f64, out_step: f64) -> Config {
        let mut c = Config::default();
        c.fade.in_step = in_step;
        c.fade.out_step = out_step;
        c.sanitize();
        c
    }

    fn compositor(cfg: Config) -> Compositor<MockBackend> {
        Compositor::new(MockBackend::new(800, 600), cfg)
    }

    fn track_and_map(c: &mut Compositor<MockBackend>, id: u32, rect: Rect) {
        c.backend.add_window(id, MockWindow::new(rect));
        c.add_window(id);
        c.map_window(id);
    }

    #[test]
    fn test_resources_exist_exactly_while_mapped() {
        let mut c = compositor(config(0.0, 0.0));
        c.backend.add_window(10, MockWindow::new(Rect::new(0, 0, 100, 100)));
        c.add_window(10);
        assert_eq!(c.backend.live_pictures(), 0);
        assert_eq!(c.backend.live_damages(), 0);

        c.map_window(10);
        assert_eq!(c.backend.live_pictures(), 1);
        assert_eq!(c.backend.live_damages(), 1);

        c.unmap_window(10);
        assert_eq!(c.backend.live_pictures(), 0);
        assert_eq!(c.backend.live_damages(), 0);
        assert_eq!(c.backend.invalid_releases, 0);
        // Still tracked, just without resources.
        assert!(c.reg.contains(10));
    }

    #[test]
    fn test_fade_in_steps_produce_damage_each_tick() {
        let mut c = compositor(config(0.1, 0.0));
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        assert_eq!(c.fades.active(), 1);
        assert_eq!(c.reg.get(10).unwrap().opacity, 0.0);
        c.paint();

        for i in 1..=10 {
            c.run_fade_steps();
            assert!(c.scheduler.is_pending(), "tick {i} queued no damage");
            let got = c.reg.get(10).unwrap().opacity;
            assert!((got - 0.1 * i as f64).abs() < 1e-6, "tick {i}: opacity {got}");
            c.paint();
        }
        assert_eq!(c.fades.active(), 0);
        assert_eq!(c.reg.get(10).unwrap().opacity, 1.0);
    }

    #[test]
    fn test_destroy_during_fade_out_releases_once() {
        let mut c = compositor(config(0.0, 0.5));
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        assert_eq!(c.backend.live_pictures(), 1);

        c.unmap_window(10);
        assert_eq!(c.fades.active(), 1, "unmap should fade out");
        assert!(c.reg.get(10).unwrap().viewable, "still painted mid-fade");

        c.destroy_window(10);
        assert!(c.reg.contains(10), "entry survives until the fade ends");
        assert_eq!(
            c.fades.pending_callback(10),
            Some(FadeCallback::FinishDestroy)
        );

        let mut ticks = 0;
        while c.reg.contains(10) {
            c.run_fade_steps();
            c.paint();
            ticks += 1;
            assert!(ticks < 10, "destroy fade did not finish");
        }
        assert_eq!(ticks, 2);
        assert_eq!(c.backend.live_pictures(), 0);
        assert_eq!(c.backend.live_damages(), 0);
        assert_eq!(c.backend.invalid_releases, 0);
    }

    #[test]
    fn test_configure_defers_behind_pending_damage() {
        let mut c = compositor(config(0.0, 0.0));
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        c.damage_window(10);

        c.configure_window(
            10,
            Configure { x: 50, y: 60, width: 120, height: 130, border_width: 0, above: None },
        );
        let w = c.reg.get(10).unwrap();
        assert_eq!((w.x, w.y), (0, 0), "configure must wait for the paint");
        assert!(w.need_configure.is_some());

        c.paint();
        let w = c.reg.get(10).unwrap();
        assert!(w.need_configure.is_none(), "applied exactly once");
        assert!(!w.pending_damage);
        assert_eq!((w.x, w.y, w.width, w.height), (50, 60, 120, 130));
        // The resize dropped the picture for lazy re-binding.
        assert!(w.picture.is_none());

        // Without pending damage a configure applies immediately.
        c.configure_window(
            10,
            Configure { x: 5, y: 6, width: 120, height: 130, border_width: 0, above: None },
        );
        let w = c.reg.get(10).unwrap();
        assert_eq!((w.x, w.y), (5, 6));
    }

    #[test]
    fn test_latest_queued_configure_wins() {
        let mut c = compositor(config(0.0, 0.0));
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        c.damage_window(10);
        for x in [10, 20, 30] {
            c.configure_window(
                10,
                Configure { x, y: 0, width: 100, height: 100, border_width: 0, above: None },
            );
        }
        c.paint();
        assert_eq!(c.reg.get(10).unwrap().x, 30);
    }

    #[test]
    fn test_shadow_clipped_by_translucent_window_above() {
        // B (translucent, shadowed) below A (translucent, shadow-excluded
        // dnd). A's body must not get B's shadow painted over it, while
        // B's own body still shows through A.
        let mut c = compositor(config(0.0, 0.0));

        let mut b = MockWindow::new(Rect::new(20, 20, 100, 100));
        b.opacity_prop = Some(0.5);
        c.backend.add_window(10, b);

        let mut a = MockWindow::new(Rect::new(60, 60, 100, 100));
        a.opacity_prop = Some(0.5);
        a.wintype = WinType::Dnd;
        c.backend.add_window(11, a);

        c.add_window(10);
        c.map_window(10);
        c.add_window(11);
        c.map_window(11);
        c.damage_window(10);
        c.damage_window(11);
        c.paint();

        let shadows = c.backend.shadow_ops();
        assert_eq!(shadows.len(), 1, "only the lower window casts a shadow");
        let PaintOp::Shadow { clip, .. } = shadows[0] else { unreachable!() };
        let clip = clip.as_ref().unwrap();
        assert!(
            !clip.contains(&(100, 100)),
            "shadow leaked under the translucent window above"
        );
        assert!(
            clip.contains(&(10, 10)),
            "shadow missing where nothing covers it"
        );

        let b_pict = c.reg.get(10).unwrap().picture.unwrap();
        let body_clip = c
            .backend
            .ops
            .iter()
            .find_map(|op| match op {
                PaintOp::Window { pict, clip, .. } if *pict == b_pict => clip.as_ref(),
                _ => None,
            })
            .expect("translucent body was painted");
        assert!(
            body_clip.contains(&(100, 100)),
            "body must stay visible through the window above"
        );
    }

    #[test]
    fn test_paint_without_damage_is_a_no_op() {
        let mut c = compositor(config(0.0, 0.0));
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        c.damage_window(10);
        c.paint();

        let requests = c.backend.request_count;
        c.paint();
        assert_eq!(c.backend.request_count, requests);
    }

    #[test]
    fn test_focus_change_drives_opacity_and_dim() {
        let mut cfg = config(0.0, 0.0);
        cfg.focus.inactive_opacity = 0.8;
        cfg.focus.inactive_dim = 0.2;
        cfg.sanitize();
        let mut c = compositor(cfg);
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));

        let w = c.reg.get(10).unwrap();
        assert_eq!(w.opacity, 0.8);
        assert!(w.dim);

        c.focus_changed(10, true);
        let w = c.reg.get(10).unwrap();
        assert_eq!(w.opacity, 1.0);
        assert!(!w.dim);

        c.focus_changed(10, false);
        assert_eq!(c.reg.get(10).unwrap().opacity, 0.8);
    }

    #[test]
    fn test_client_opacity_property_overrides_focus() {
        let mut cfg = config(0.0, 0.0);
        cfg.focus.inactive_opacity = 0.8;
        cfg.sanitize();
        let mut c = compositor(cfg);
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        assert_eq!(c.reg.get(10).unwrap().opacity, 0.8);

        let atom = c.backend.opacity_atom;
        c.backend.windows.get_mut(&10).unwrap().opacity_prop = Some(0.3);
        c.property_changed(10, atom);
        assert_eq!(c.reg.get(10).unwrap().opacity, 0.3);

        c.backend.windows.get_mut(&10).unwrap().opacity_prop = None;
        c.property_changed(10, atom);
        assert_eq!(c.reg.get(10).unwrap().opacity, 0.8);
    }

    #[test]
    fn test_unmap_fade_callback_not_displaced_by_focus() {
        let mut c = compositor(config(0.1, 0.1));
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        // Finish the fade-in first.
        while c.fades.active() > 0 {
            c.run_fade_steps();
        }
        c.unmap_window(10);
        assert_eq!(c.fades.pending_callback(10), Some(FadeCallback::FinishUnmap));

        c.focus_changed(10, true);
        assert_eq!(
            c.fades.pending_callback(10),
            Some(FadeCallback::FinishUnmap),
            "teardown fade must survive a focus change"
        );

        while c.fades.active() > 0 {
            c.run_fade_steps();
        }
        assert_eq!(c.backend.live_pictures(), 0);
        assert_eq!(c.backend.invalid_releases, 0);
    }

    #[test]
    fn test_input_only_windows_are_ignored() {
        let mut c = compositor(config(0.0, 0.0));
        let mut w = MockWindow::new(Rect::new(0, 0, 10, 10));
        w.attrs.input_only = true;
        c.backend.add_window(10, w);
        c.add_window(10);
        assert!(!c.reg.contains(10));
    }

    #[test]
    fn test_tick_paints_pending_damage_without_active_fades() {
        let mut c = compositor(config(0.0, 0.0));
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        c.full_screen_damage();
        // Nothing animates, so the event loop would block unboundedly;
        // the pending region must still be consumed by the next tick.
        assert!(c.poll_timeout(Instant::now()).is_none());
        c.tick(Instant::now());
        assert!(
            c.backend
                .ops
                .iter()
                .any(|op| matches!(op, PaintOp::Root { .. })),
            "pending damage was not painted"
        );
    }

    #[test]
    fn test_opaque_window_occludes_root_paint() {
        let mut c = compositor(config(0.0, 0.0));
        track_and_map(&mut c, 10, Rect::new(0, 0, 100, 100));
        c.damage_window(10);
        c.paint();

        let root_clip = c
            .backend
            .ops
            .iter()
            .find_map(|op| match op {
                PaintOp::Root { clip } => clip.as_ref(),
                _ => None,
            })
            .expect("root was painted");
        assert!(
            !root_clip.contains(&(50, 50)),
            "root painted under an opaque window"
        );
    }
}
