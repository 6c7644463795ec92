//! XRender Backend
//!
//! Owns the X connection and implements the full [`Backend`] surface:
//! extension negotiation, overlay-free MANUAL redirection, XFixes region
//! algebra, Damage objects, window/shadow pictures and the double-buffered
//! root paint target. Requests that legitimately race client teardown are
//! issued unchecked with their sequence numbers recorded, so the matching
//! protocol errors can be absorbed in the event loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::composite::{self, ConnectionExt as CompositeExt};
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::render::{self, ConnectionExt as RenderExt, PictOp, Pictformat, Picture};
use x11rb::protocol::shape::{self, ConnectionExt as ShapeExt};
use x11rb::protocol::xfixes::{self, ConnectionExt as XFixesExt};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ChangeWindowAttributesAux, ConnectionExt, CreateGCAux, CreateWindowAux,
    EventMask, ImageFormat, MapState, Pixmap, Rectangle, Visualid, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;

use super::backend::{
    Backend, DamageId, FrameExtents, PictureId, PropertyKind, RegionId, WinAttrs, WinId, WinIdent,
};
use super::region::{IgnoreList, Rect};
use super::shadow::ShadowImage;
use super::window::{WinMode, WinType};

/// Interned atoms, resolved once at startup.
struct Atoms {
    wm_state: Atom,
    wm_window_role: Atom,
    net_wm_name: Atom,
    utf8_string: Atom,
    net_wm_window_opacity: Atom,
    net_wm_window_type: Atom,
    net_frame_extents: Atom,
    xrootpmap_id: Atom,
    esetroot_pmap_id: Atom,
    xsetroot_id: Atom,
    /// `(_NET_WM_WINDOW_TYPE_* atom, wintype)` pairs for classification.
    wintypes: Vec<(Atom, WinType)>,
}

impl Atoms {
    fn new(conn: &RustConnection) -> Result<Self> {
        // Helper to intern a single atom
        let intern = |name: &str| -> Result<Atom> {
            Ok(conn.intern_atom(false, name.as_bytes())?.reply()?.atom)
        };

        let wintypes = vec![
            (intern("_NET_WM_WINDOW_TYPE_DESKTOP")?, WinType::Desktop),
            (intern("_NET_WM_WINDOW_TYPE_DOCK")?, WinType::Dock),
            (intern("_NET_WM_WINDOW_TYPE_TOOLBAR")?, WinType::Toolbar),
            (intern("_NET_WM_WINDOW_TYPE_MENU")?, WinType::Menu),
            (intern("_NET_WM_WINDOW_TYPE_UTILITY")?, WinType::Utility),
            (intern("_NET_WM_WINDOW_TYPE_SPLASH")?, WinType::Splash),
            (intern("_NET_WM_WINDOW_TYPE_DIALOG")?, WinType::Dialog),
            (intern("_NET_WM_WINDOW_TYPE_NORMAL")?, WinType::Normal),
            (
                intern("_NET_WM_WINDOW_TYPE_DROPDOWN_MENU")?,
                WinType::DropdownMenu,
            ),
            (intern("_NET_WM_WINDOW_TYPE_POPUP_MENU")?, WinType::PopupMenu),
            (intern("_NET_WM_WINDOW_TYPE_TOOLTIP")?, WinType::Tooltip),
            (
                intern("_NET_WM_WINDOW_TYPE_NOTIFICATION")?,
                WinType::Notification,
            ),
            (intern("_NET_WM_WINDOW_TYPE_COMBO")?, WinType::Combo),
            (intern("_NET_WM_WINDOW_TYPE_DND")?, WinType::Dnd),
        ];

        Ok(Self {
            wm_state: intern("WM_STATE")?,
            wm_window_role: intern("WM_WINDOW_ROLE")?,
            net_wm_name: intern("_NET_WM_NAME")?,
            utf8_string: intern("UTF8_STRING")?,
            net_wm_window_opacity: intern("_NET_WM_WINDOW_OPACITY")?,
            net_wm_window_type: intern("_NET_WM_WINDOW_TYPE")?,
            net_frame_extents: intern("_NET_FRAME_EXTENTS")?,
            xrootpmap_id: intern("_XROOTPMAP_ID")?,
            esetroot_pmap_id: intern("ESETROOT_PMAP_ID")?,
            xsetroot_id: intern("_XSETROOT_ID")?,
            wintypes,
        })
    }
}

pub struct XRenderBackend {
    conn: Arc<RustConnection>,
    root: Window,
    root_width: u32,
    root_height: u32,
    root_depth: u8,
    root_visual: Visualid,
    atoms: Atoms,
    /// Visual -> render pict format, from RenderQueryPictFormats.
    visual_formats: HashMap<Visualid, Pictformat>,
    /// Formats carrying an alpha channel.
    alpha_formats: HashSet<Pictformat>,
    format_a8: Pictformat,
    /// Unbuffered picture over the real root, IncludeInferiors.
    root_picture: Picture,
    /// Off-screen paint target, recreated after a root resize.
    root_buffer: Option<(Pixmap, Picture)>,
    /// Tiled background, built lazily from the root pixmap properties.
    root_tile: Option<Picture>,
    /// 1x1 repeating A8 masks keyed by quantized opacity.
    alpha_picts: HashMap<u32, Picture>,
    /// Solid black source for shadow compositing.
    black_picture: Picture,
    ignores: IgnoreList,
}

impl XRenderBackend {
    pub fn new(conn: Arc<RustConnection>, screen_num: usize) -> Result<Self> {
        let screen = conn.setup().roots[screen_num].clone();
        let root = screen.root;

        // Extension negotiation. Versions must be announced before use.
        conn.extension_information(composite::X11_EXTENSION_NAME)?
            .context("Composite extension not available")?;
        let composite_version = conn.composite_query_version(0, 4)?.reply()?;
        info!(
            "Composite extension {}.{}",
            composite_version.major_version, composite_version.minor_version
        );
        if (composite_version.major_version, composite_version.minor_version) < (0, 2) {
            bail!("Composite >= 0.2 required for NameWindowPixmap");
        }

        conn.extension_information(damage::X11_EXTENSION_NAME)?
            .context("Damage extension not available")?;
        let damage_version = conn.damage_query_version(1, 1)?.reply()?;
        info!(
            "Damage extension {}.{}",
            damage_version.major_version, damage_version.minor_version
        );

        conn.extension_information(xfixes::X11_EXTENSION_NAME)?
            .context("XFixes extension not available")?;
        let xfixes_version = conn.xfixes_query_version(5, 0)?.reply()?;
        info!(
            "XFixes extension {}.{}",
            xfixes_version.major_version, xfixes_version.minor_version
        );

        conn.extension_information(render::X11_EXTENSION_NAME)?
            .context("Render extension not available")?;
        conn.render_query_version(0, 11)?.reply()?;

        conn.extension_information(shape::X11_EXTENSION_NAME)?
            .context("Shape extension not available")?;
        conn.shape_query_version()?.reply()?;

        Self::acquire_cm_selection(&conn, screen_num, root)?;

        // MANUAL redirection; fails if another compositor holds it.
        conn.composite_redirect_subwindows(root, composite::Redirect::MANUAL)?
            .check()
            .context("Failed to redirect subwindows (another compositing manager running?)")?;
        info!("Redirected all subwindows of root {:#x}", root);

        let atoms = Atoms::new(&conn)?;

        // Pict format tables.
        let formats = conn.render_query_pict_formats()?.reply()?;
        let mut visual_formats = HashMap::new();
        for s in &formats.screens {
            for d in &s.depths {
                for v in &d.visuals {
                    visual_formats.insert(v.visual, v.format);
                }
            }
        }
        let mut alpha_formats = HashSet::new();
        let mut format_a8 = 0;
        let mut format_argb32 = 0;
        for f in &formats.formats {
            if f.type_ != render::PictType::DIRECT {
                continue;
            }
            if f.direct.alpha_mask != 0 {
                alpha_formats.insert(f.id);
            }
            if f.depth == 8 && f.direct.alpha_mask == 0xff {
                format_a8 = f.id;
            }
            if f.depth == 32
                && f.direct.alpha_mask == 0xff
                && f.direct.alpha_shift == 24
                && f.direct.red_shift == 16
            {
                format_argb32 = f.id;
            }
        }
        if format_a8 == 0 || format_argb32 == 0 {
            bail!("server lacks A8 or ARGB32 render formats");
        }

        let root_format = *visual_formats
            .get(&screen.root_visual)
            .context("no render format for the root visual")?;

        let root_picture = conn.generate_id()?;
        conn.render_create_picture(
            root_picture,
            root,
            root_format,
            &render::CreatePictureAux::new()
                .subwindowmode(x11rb::protocol::xproto::SubwindowMode::INCLUDE_INFERIORS),
        )?;

        // 1x1 repeating solid black, the shadow source.
        let black_pixmap = conn.generate_id()?;
        conn.create_pixmap(32, black_pixmap, root, 1, 1)?;
        let black_picture = conn.generate_id()?;
        conn.render_create_picture(
            black_picture,
            black_pixmap,
            format_argb32,
            &render::CreatePictureAux::new().repeat(render::Repeat::NORMAL),
        )?;
        conn.render_fill_rectangles(
            PictOp::SRC,
            black_picture,
            render::Color { red: 0, green: 0, blue: 0, alpha: 0xffff },
            &[Rectangle { x: 0, y: 0, width: 1, height: 1 }],
        )?;
        conn.free_pixmap(black_pixmap)?;

        // Events this process needs from the root.
        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::STRUCTURE_NOTIFY
                    | EventMask::SUBSTRUCTURE_NOTIFY
                    | EventMask::EXPOSURE
                    | EventMask::PROPERTY_CHANGE,
            ),
        )?
        .check()
        .context("Failed to select events on the root window")?;

        conn.flush()?;

        Ok(Self {
            conn,
            root,
            root_width: screen.width_in_pixels as u32,
            root_height: screen.height_in_pixels as u32,
            root_depth: screen.root_depth,
            root_visual: screen.root_visual,
            atoms,
            visual_formats,
            alpha_formats,
            format_a8,
            root_picture,
            root_buffer: None,
            root_tile: None,
            alpha_picts: HashMap::new(),
            black_picture,
            ignores: IgnoreList::new(),
        })
    }

    /// Claim `_NET_WM_CM_Sn` so other compositors know the screen is taken.
    fn acquire_cm_selection(conn: &RustConnection, screen_num: usize, root: Window) -> Result<()> {
        let name = format!("_NET_WM_CM_S{screen_num}");
        let cm_atom = conn.intern_atom(false, name.as_bytes())?.reply()?.atom;

        let owner = conn.get_selection_owner(cm_atom)?.reply()?.owner;
        if owner != x11rb::NONE {
            bail!("another compositing manager owns {name} (window {owner:#x})");
        }

        let owner_win = conn.generate_id()?;
        conn.create_window(
            0,
            owner_win,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new().override_redirect(1),
        )?;
        conn.set_selection_owner(owner_win, cm_atom, x11rb::CURRENT_TIME)?
            .check()
            .context("failed to acquire the compositor selection")?;
        debug!("Acquired {name} with window {:#x}", owner_win);
        Ok(())
    }

    fn get_prop_u32s(&self, win: Window, prop: Atom, ty: AtomEnum, len: u32) -> Option<Vec<u32>> {
        let reply = self
            .conn
            .get_property(false, win, prop, ty, 0, len)
            .ok()?
            .reply()
            .ok()?;
        let vals: Vec<u32> = reply.value32()?.collect();
        if vals.is_empty() { None } else { Some(vals) }
    }

    fn get_prop_string(&self, win: Window, prop: Atom, ty: Atom) -> Option<String> {
        let reply = self
            .conn
            .get_property(false, win, prop, ty, 0, 1024)
            .ok()?
            .reply()
            .ok()?;
        if reply.format == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&reply.value).into_owned())
    }

    fn has_wm_state(&self, win: Window) -> bool {
        self.conn
            .get_property(false, win, self.atoms.wm_state, AtomEnum::ANY, 0, 0)
            .ok()
            .and_then(|c| c.reply().ok())
            .is_some_and(|r| r.type_ != x11rb::NONE)
    }

    /// Depth-first search for the first descendant advertising WM_STATE.
    fn client_search(&self, win: Window, depth: u32) -> Option<Window> {
        if self.has_wm_state(win) {
            return Some(win);
        }
        if depth >= 8 {
            return None;
        }
        let tree = self.conn.query_tree(win).ok()?.reply().ok()?;
        tree.children
            .iter()
            .find_map(|&child| self.client_search(child, depth + 1))
    }

    fn wintype_prop(&self, win: Window) -> Option<WinType> {
        let atoms = self.get_prop_u32s(win, self.atoms.net_wm_window_type, AtomEnum::ATOM, 8)?;
        for a in atoms {
            if let Some(&(_, t)) = self.atoms.wintypes.iter().find(|&&(atom, _)| atom == a) {
                return Some(t);
            }
        }
        None
    }

    fn wintype_search(&self, win: Window, depth: u32) -> Option<WinType> {
        if let Some(t) = self.wintype_prop(win) {
            return Some(t);
        }
        if depth >= 8 {
            return None;
        }
        let tree = self.conn.query_tree(win).ok()?.reply().ok()?;
        tree.children
            .iter()
            .find_map(|&child| self.wintype_search(child, depth + 1))
    }

    /// 1x1 repeating A8 picture holding `opacity`, cached per mille.
    fn alpha_picture(&mut self, opacity: f64) -> Result<Picture> {
        let key = (opacity.clamp(0.0, 1.0) * 1000.0).round() as u32;
        if let Some(&p) = self.alpha_picts.get(&key) {
            return Ok(p);
        }
        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(8, pixmap, self.root, 1, 1)?;
        let pict = self.conn.generate_id()?;
        self.conn.render_create_picture(
            pict,
            pixmap,
            self.format_a8,
            &render::CreatePictureAux::new().repeat(render::Repeat::NORMAL),
        )?;
        let alpha = (key as f64 / 1000.0 * 0xffff as f64) as u16;
        self.conn.render_fill_rectangles(
            PictOp::SRC,
            pict,
            render::Color { red: 0, green: 0, blue: 0, alpha },
            &[Rectangle { x: 0, y: 0, width: 1, height: 1 }],
        )?;
        self.conn.free_pixmap(pixmap)?;
        self.alpha_picts.insert(key, pict);
        Ok(pict)
    }

    /// The repeating picture the root is painted from. Prefers the pixmap
    /// advertised by the desktop's wallpaper setter; falls back to gray.
    fn root_tile(&mut self) -> Result<Picture> {
        if let Some(t) = self.root_tile {
            return Ok(t);
        }
        let mut external: Option<Pixmap> = None;
        for prop in [
            self.atoms.xrootpmap_id,
            self.atoms.esetroot_pmap_id,
            self.atoms.xsetroot_id,
        ] {
            if let Some(v) = self.get_prop_u32s(self.root, prop, AtomEnum::ANY, 1) {
                if v[0] != 0 {
                    external = Some(v[0]);
                    break;
                }
            }
        }

        let pixmap = match external {
            Some(p) => p,
            None => {
                let p = self.conn.generate_id()?;
                self.conn
                    .create_pixmap(self.root_depth, p, self.root, 1, 1)?;
                p
            }
        };

        let format = *self
            .visual_formats
            .get(&self.root_visual)
            .context("no render format for the root visual")?;
        let tile = self.conn.generate_id()?;
        // The wallpaper pixmap may be gone by the time this arrives.
        record_racy(&mut self.ignores, self.conn.render_create_picture(
            tile,
            pixmap,
            format,
            &render::CreatePictureAux::new().repeat(render::Repeat::NORMAL),
        ));

        if external.is_none() {
            self.conn.render_fill_rectangles(
                PictOp::SRC,
                tile,
                render::Color {
                    red: 0x8080,
                    green: 0x8080,
                    blue: 0x8080,
                    alpha: 0xffff,
                },
                &[Rectangle { x: 0, y: 0, width: 1, height: 1 }],
            )?;
            self.conn.free_pixmap(pixmap)?;
        }

        self.root_tile = Some(tile);
        Ok(tile)
    }

    fn buffer_picture(&mut self) -> Result<Picture> {
        if let Some((_, pict)) = self.root_buffer {
            return Ok(pict);
        }
        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(
            self.root_depth,
            pixmap,
            self.root,
            self.root_width.min(u16::MAX as u32) as u16,
            self.root_height.min(u16::MAX as u32) as u16,
        )?;
        let format = *self
            .visual_formats
            .get(&self.root_visual)
            .context("no render format for the root visual")?;
        let pict = self.conn.generate_id()?;
        self.conn
            .render_create_picture(pict, pixmap, format, &render::CreatePictureAux::new())?;
        self.root_buffer = Some((pixmap, pict));
        Ok(pict)
    }

    fn free_root_buffer(&mut self) {
        if let Some((pixmap, pict)) = self.root_buffer.take() {
            let _ = self.conn.render_free_picture(pict);
            let _ = self.conn.free_pixmap(pixmap);
        }
    }
}

/// Track a request whose target may legitimately be destroyed before the
/// server processes it; the resulting error is absorbed, not reported.
fn record_racy<C: RequestConnection>(
    ignores: &mut IgnoreList,
    cookie: Result<x11rb::cookie::VoidCookie<'_, C>, x11rb::errors::ConnectionError>,
) {
    match cookie {
        Ok(c) => ignores.record(c.sequence_number()),
        Err(e) => warn!("request send failed: {e}"),
    }
}

fn to_x_rect(r: &Rect) -> Rectangle {
    Rectangle {
        x: r.x.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        y: r.y.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        width: r.width.min(u16::MAX as u32) as u16,
        height: r.height.min(u16::MAX as u32) as u16,
    }
}

impl Backend for XRenderBackend {
    fn root_window(&self) -> WinId {
        self.root
    }

    fn root_size(&self) -> (u32, u32) {
        (self.root_width, self.root_height)
    }

    fn window_attributes(&mut self, win: WinId) -> Result<WinAttrs> {
        let attrs_cookie = self.conn.get_window_attributes(win)?;
        let geom_cookie = self.conn.get_geometry(win)?;
        let attrs = attrs_cookie.reply()?;
        let geom = geom_cookie.reply()?;
        let format = self.visual_formats.get(&attrs.visual);
        let argb = format.is_some_and(|f| self.alpha_formats.contains(f));
        Ok(WinAttrs {
            x: geom.x as i32,
            y: geom.y as i32,
            width: geom.width as u32,
            height: geom.height as u32,
            border_width: geom.border_width as u32,
            override_redirect: attrs.override_redirect,
            viewable: attrs.map_state == MapState::VIEWABLE,
            argb,
            input_only: attrs.class == WindowClass::INPUT_ONLY,
        })
    }

    fn resolve_client_window(&mut self, win: WinId) -> WinId {
        self.client_search(win, 0).unwrap_or(win)
    }

    fn window_opacity_prop(&mut self, win: WinId) -> Option<f64> {
        let v = self.get_prop_u32s(win, self.atoms.net_wm_window_opacity, AtomEnum::CARDINAL, 1)?;
        Some(v[0] as f64 / u32::MAX as f64)
    }

    fn window_type(&mut self, win: WinId) -> WinType {
        self.wintype_search(win, 0).unwrap_or(WinType::Unknown)
    }

    fn window_ident(&mut self, win: WinId) -> WinIdent {
        let class = self
            .get_prop_string(win, AtomEnum::WM_CLASS.into(), AtomEnum::STRING.into())
            .and_then(|raw| {
                // WM_CLASS is "instance\0class\0"; the rules match the class.
                raw.split('\0').filter(|s| !s.is_empty()).nth(1).map(str::to_owned)
            })
            .unwrap_or_default();
        let name = self
            .get_prop_string(win, self.atoms.net_wm_name, self.atoms.utf8_string)
            .or_else(|| {
                self.get_prop_string(win, AtomEnum::WM_NAME.into(), AtomEnum::STRING.into())
            })
            .unwrap_or_default();
        let role = self
            .get_prop_string(win, self.atoms.wm_window_role, AtomEnum::STRING.into())
            .unwrap_or_default();
        WinIdent { class, name, role }
    }

    fn frame_extents(&mut self, win: WinId) -> FrameExtents {
        match self.get_prop_u32s(win, self.atoms.net_frame_extents, AtomEnum::CARDINAL, 4) {
            Some(v) if v.len() == 4 => FrameExtents {
                left: v[0],
                right: v[1],
                top: v[2],
                bottom: v[3],
            },
            _ => FrameExtents::default(),
        }
    }

    fn classify_property(&self, atom: u32) -> PropertyKind {
        if atom == self.atoms.net_wm_window_opacity {
            PropertyKind::WindowOpacity
        } else if atom == self.atoms.xrootpmap_id
            || atom == self.atoms.esetroot_pmap_id
            || atom == self.atoms.xsetroot_id
        {
            PropertyKind::RootBackground
        } else if atom == self.atoms.net_frame_extents {
            PropertyKind::FrameExtents
        } else {
            PropertyKind::Other
        }
    }

    fn select_window_events(&mut self, win: WinId) {
        record_racy(&mut self.ignores, self.conn.change_window_attributes(
            win,
            &ChangeWindowAttributesAux::new()
                .event_mask(EventMask::PROPERTY_CHANGE | EventMask::FOCUS_CHANGE),
        ));
        record_racy(&mut self.ignores, self.conn.shape_select_input(win, true));
    }

    fn create_region(&mut self, rects: &[Rect]) -> Result<RegionId> {
        let region = self.conn.generate_id()?;
        let xrects: Vec<Rectangle> = rects.iter().map(to_x_rect).collect();
        self.conn.xfixes_create_region(region, &xrects)?;
        Ok(region)
    }

    fn copy_region(&mut self, src: RegionId) -> Result<RegionId> {
        let region = self.conn.generate_id()?;
        self.conn.xfixes_create_region(region, &[])?;
        self.conn.xfixes_copy_region(src, region)?;
        Ok(region)
    }

    fn union_region(&mut self, dst: RegionId, src: RegionId) -> Result<()> {
        self.conn.xfixes_union_region(dst, src, dst)?;
        Ok(())
    }

    fn subtract_region(&mut self, dst: RegionId, sub: RegionId) -> Result<()> {
        self.conn.xfixes_subtract_region(dst, sub, dst)?;
        Ok(())
    }

    fn destroy_region(&mut self, region: RegionId) {
        record_racy(&mut self.ignores, self.conn.xfixes_destroy_region(region));
    }

    fn border_size_region(
        &mut self,
        win: WinId,
        x: i32,
        y: i32,
        border_width: u32,
    ) -> Result<RegionId> {
        let region = self.conn.generate_id()?;
        // The window can be destroyed between the event and this request.
        record_racy(&mut self.ignores, self.conn.xfixes_create_region_from_window(
            region,
            win,
            shape::SK::BOUNDING,
        ));
        record_racy(&mut self.ignores, self.conn.xfixes_translate_region(
            region,
            (x + border_width as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            (y + border_width as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        ));
        Ok(region)
    }

    fn create_damage(&mut self, win: WinId) -> Result<DamageId> {
        let dmg = self.conn.generate_id()?;
        let cookie = self
            .conn
            .damage_create(dmg, win, damage::ReportLevel::NON_EMPTY)?;
        self.ignores.record(cookie.sequence_number());
        Ok(dmg)
    }

    fn destroy_damage(&mut self, dmg: DamageId) {
        record_racy(&mut self.ignores, self.conn.damage_destroy(dmg));
    }

    fn drain_damage(&mut self, dmg: DamageId, origin: (i32, i32)) -> Result<RegionId> {
        let parts = self.conn.generate_id()?;
        self.conn.xfixes_create_region(parts, &[])?;
        record_racy(&mut self.ignores, self.conn.damage_subtract(dmg, x11rb::NONE, parts));
        record_racy(&mut self.ignores, self.conn.xfixes_translate_region(
            parts,
            origin.0.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            origin.1.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        ));
        Ok(parts)
    }

    fn clear_damage(&mut self, dmg: DamageId) {
        record_racy(&mut self.ignores, self.conn.damage_subtract(dmg, x11rb::NONE, x11rb::NONE));
    }

    fn bind_window_picture(&mut self, win: WinId) -> Result<PictureId> {
        let attrs = self.conn.get_window_attributes(win)?.reply()?;
        let format = *self
            .visual_formats
            .get(&attrs.visual)
            .with_context(|| format!("no render format for visual {}", attrs.visual))?;

        let pixmap = self.conn.generate_id()?;
        record_racy(&mut self.ignores, self.conn.composite_name_window_pixmap(win, pixmap));
        let pict = self.conn.generate_id()?;
        record_racy(&mut self.ignores, self.conn.render_create_picture(
            pict,
            pixmap,
            format,
            &render::CreatePictureAux::new()
                .subwindowmode(x11rb::protocol::xproto::SubwindowMode::INCLUDE_INFERIORS),
        ));
        // The picture keeps the pixmap alive.
        record_racy(&mut self.ignores, self.conn.free_pixmap(pixmap));
        Ok(pict)
    }

    fn free_picture(&mut self, pict: PictureId) {
        record_racy(&mut self.ignores, self.conn.render_free_picture(pict));
    }

    fn upload_shadow(&mut self, image: &ShadowImage) -> Result<PictureId> {
        let w = image.width;
        let h = image.height;
        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(
            8,
            pixmap,
            self.root,
            w.min(u16::MAX as u32) as u16,
            h.min(u16::MAX as u32) as u16,
        )?;
        let gc = self.conn.generate_id()?;
        self.conn.create_gc(gc, pixmap, &CreateGCAux::new())?;

        // ZPixmap depth-8 rows are padded to 32 bits. Upload in bands that
        // fit in the server's maximum request size.
        let stride = ((w as usize) + 3) & !3;
        let max_bytes = self.conn.maximum_request_bytes();
        let rows_per_band = ((max_bytes.saturating_sub(64)) / stride.max(1)).max(1);

        let mut y = 0usize;
        while y < h as usize {
            let rows = rows_per_band.min(h as usize - y);
            let mut band = vec![0u8; rows * stride];
            for r in 0..rows {
                let src = (y + r) * w as usize;
                band[r * stride..r * stride + w as usize]
                    .copy_from_slice(&image.data[src..src + w as usize]);
            }
            self.conn.put_image(
                ImageFormat::Z_PIXMAP,
                pixmap,
                gc,
                w.min(u16::MAX as u32) as u16,
                rows as u16,
                0,
                y as i16,
                0,
                8,
                &band,
            )?;
            y += rows;
        }

        let pict = self.conn.generate_id()?;
        self.conn
            .render_create_picture(pict, pixmap, self.format_a8, &render::CreatePictureAux::new())?;
        self.conn.free_gc(gc)?;
        self.conn.free_pixmap(pixmap)?;
        Ok(pict)
    }

    fn begin_paint(&mut self) -> Result<()> {
        self.buffer_picture()?;
        Ok(())
    }

    fn set_clip(&mut self, region: Option<RegionId>) -> Result<()> {
        let target = self.buffer_picture()?;
        self.conn
            .xfixes_set_picture_clip_region(target, region.unwrap_or(x11rb::NONE), 0, 0)?;
        Ok(())
    }

    fn paint_root(&mut self) -> Result<()> {
        let tile = self.root_tile()?;
        let target = self.buffer_picture()?;
        self.conn.render_composite(
            PictOp::SRC,
            tile,
            x11rb::NONE,
            target,
            0,
            0,
            0,
            0,
            0,
            0,
            self.root_width.min(u16::MAX as u32) as u16,
            self.root_height.min(u16::MAX as u32) as u16,
        )?;
        Ok(())
    }

    fn composite_window(
        &mut self,
        pict: PictureId,
        mode: WinMode,
        opacity: f64,
        dst: Rect,
        src_off: (i32, i32),
    ) -> Result<()> {
        let translucent = opacity < 1.0 - 1e-6;
        let op = if mode == WinMode::Solid && !translucent {
            PictOp::SRC
        } else {
            PictOp::OVER
        };
        let mask = if translucent {
            self.alpha_picture(opacity)?
        } else {
            x11rb::NONE
        };
        let target = self.buffer_picture()?;
        let d = to_x_rect(&dst);
        self.conn.render_composite(
            op,
            pict,
            mask,
            target,
            src_off.0.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            src_off.1.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            0,
            0,
            d.x,
            d.y,
            d.width,
            d.height,
        )?;
        Ok(())
    }

    fn composite_shadow(&mut self, pict: PictureId, dst: Rect) -> Result<()> {
        let target = self.buffer_picture()?;
        let d = to_x_rect(&dst);
        self.conn.render_composite(
            PictOp::OVER,
            self.black_picture,
            pict,
            target,
            0,
            0,
            0,
            0,
            d.x,
            d.y,
            d.width,
            d.height,
        )?;
        Ok(())
    }

    fn dim_window(&mut self, dst: Rect, level: f64) -> Result<()> {
        let target = self.buffer_picture()?;
        let alpha = (level.clamp(0.0, 1.0) * 0xffff as f64) as u16;
        self.conn.render_fill_rectangles(
            PictOp::OVER,
            target,
            render::Color { red: 0, green: 0, blue: 0, alpha },
            &[to_x_rect(&dst)],
        )?;
        Ok(())
    }

    fn end_paint(&mut self) -> Result<()> {
        let target = self.buffer_picture()?;
        self.conn
            .xfixes_set_picture_clip_region(target, x11rb::NONE, 0, 0)?;
        self.conn.render_composite(
            PictOp::SRC,
            target,
            x11rb::NONE,
            self.root_picture,
            0,
            0,
            0,
            0,
            0,
            0,
            self.root_width.min(u16::MAX as u32) as u16,
            self.root_height.min(u16::MAX as u32) as u16,
        )?;
        Ok(())
    }

    fn root_resized(&mut self, width: u32, height: u32) {
        info!("Root resized to {width}x{height}");
        self.root_width = width;
        self.root_height = height;
        self.free_root_buffer();
    }

    fn root_background_changed(&mut self) {
        if let Some(tile) = self.root_tile.take() {
            let _ = self.conn.render_free_picture(tile);
        }
    }

    fn absorb_error(&mut self, sequence: u16) -> bool {
        self.ignores.should_ignore(sequence)
    }

    fn flush(&mut self) {
        if let Err(e) = self.conn.flush() {
            warn!("flush failed: {e}");
        }
    }
}
