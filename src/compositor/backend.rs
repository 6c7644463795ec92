//! Backend capability surface
//!
//! The repaint engine never talks to the X server directly; everything it
//! needs (attribute queries, region algebra, damage objects, pictures and
//! the paint target) goes through this trait. The production
//! implementation is [`super::xrender::XRenderBackend`]; tests drive the
//! engine against a recording mock with pixel-set region algebra.

use anyhow::Result;

use super::region::Rect;
use super::shadow::ShadowImage;
use super::window::{WinMode, WinType};

pub type WinId = u32;
pub type RegionId = u32;
pub type PictureId = u32;
pub type DamageId = u32;

/// Attributes resolved when a window is tracked or mapped.
#[derive(Debug, Clone, Copy)]
pub struct WinAttrs {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
    pub override_redirect: bool,
    /// Currently viewable (mapped and all ancestors mapped).
    pub viewable: bool,
    /// The window's visual carries an alpha channel.
    pub argb: bool,
    pub input_only: bool,
}

/// Strings the exclusion rule lists match against.
#[derive(Debug, Clone, Default)]
pub struct WinIdent {
    pub class: String,
    pub name: String,
    pub role: String,
}

/// `_NET_FRAME_EXTENTS` of a decorated client, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameExtents {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl FrameExtents {
    pub fn is_zero(&self) -> bool {
        self.left == 0 && self.right == 0 && self.top == 0 && self.bottom == 0
    }
}

/// Coarse classification of a changed property, so the engine does not need
/// to know atom values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    WindowOpacity,
    RootBackground,
    FrameExtents,
    Other,
}

pub trait Backend {
    // --- server queries -------------------------------------------------

    fn root_window(&self) -> WinId;
    fn root_size(&self) -> (u32, u32);
    fn window_attributes(&mut self, win: WinId) -> Result<WinAttrs>;
    /// First descendant advertising WM_STATE, else the window itself.
    fn resolve_client_window(&mut self, win: WinId) -> WinId;
    /// `_NET_WM_WINDOW_OPACITY`, scaled to 0..1.
    fn window_opacity_prop(&mut self, win: WinId) -> Option<f64>;
    /// EWMH window type, recursing into children when unset.
    fn window_type(&mut self, win: WinId) -> WinType;
    fn window_ident(&mut self, win: WinId) -> WinIdent;
    fn frame_extents(&mut self, win: WinId) -> FrameExtents;
    fn classify_property(&self, atom: u32) -> PropertyKind;
    /// Subscribe to property/focus/shape events after map.
    fn select_window_events(&mut self, win: WinId);

    // --- region algebra -------------------------------------------------

    fn create_region(&mut self, rects: &[Rect]) -> Result<RegionId>;
    fn copy_region(&mut self, src: RegionId) -> Result<RegionId>;
    fn union_region(&mut self, dst: RegionId, src: RegionId) -> Result<()>;
    fn subtract_region(&mut self, dst: RegionId, sub: RegionId) -> Result<()>;
    /// Racy by design: the region may already be gone server-side.
    fn destroy_region(&mut self, region: RegionId);
    /// Bounding-shape region of a window, translated to screen coordinates.
    fn border_size_region(&mut self, win: WinId, x: i32, y: i32, border_width: u32)
    -> Result<RegionId>;

    // --- damage objects -------------------------------------------------

    /// Create a damage object; returns it with the request sequence number
    /// it was created at.
    fn create_damage(&mut self, win: WinId) -> Result<DamageId>;
    fn destroy_damage(&mut self, damage: DamageId);
    /// Subtract all accumulated damage into a fresh region translated to
    /// screen coordinates; `origin` is the window's content top-left.
    fn drain_damage(&mut self, damage: DamageId, origin: (i32, i32)) -> Result<RegionId>;
    /// Acknowledge damage without materializing a region.
    fn clear_damage(&mut self, damage: DamageId);

    // --- pictures -------------------------------------------------------

    /// Bind the window's current backing pixmap as a composition source.
    /// Must be re-bound after any resize of the backing pixmap.
    fn bind_window_picture(&mut self, win: WinId) -> Result<PictureId>;
    fn free_picture(&mut self, pict: PictureId);
    fn upload_shadow(&mut self, image: &ShadowImage) -> Result<PictureId>;

    // --- paint target ---------------------------------------------------

    fn begin_paint(&mut self) -> Result<()>;
    fn set_clip(&mut self, region: Option<RegionId>) -> Result<()>;
    fn paint_root(&mut self) -> Result<()>;
    /// Composite a window picture at `opacity` into the target. `src_off`
    /// selects a sub-rectangle of the source (used for frame strips).
    fn composite_window(
        &mut self,
        pict: PictureId,
        mode: WinMode,
        opacity: f64,
        dst: Rect,
        src_off: (i32, i32),
    ) -> Result<()>;
    fn composite_shadow(&mut self, pict: PictureId, dst: Rect) -> Result<()>;
    fn dim_window(&mut self, dst: Rect, level: f64) -> Result<()>;
    fn end_paint(&mut self) -> Result<()>;

    // --- process plumbing ----------------------------------------------

    fn root_resized(&mut self, width: u32, height: u32);
    /// The root background pixmap changed; drop any cached tile.
    fn root_background_changed(&mut self);
    /// True when an incoming protocol error belongs to a self-issued,
    /// expected-to-race request (consults the ignore list).
    fn absorb_error(&mut self, sequence: u16) -> bool;
    fn flush(&mut self);
}

/// Recording mock with pixel-set region algebra, precise enough to check
/// clip correctness in the paint-pass tests.
#[cfg(test)]
pub(crate) mod mock {
    use std::collections::{HashMap, HashSet};

    use anyhow::{Result, anyhow};

    use super::*;

    type PixelSet = HashSet<(i32, i32)>;

    fn pixels_of(rects: &[Rect]) -> PixelSet {
        let mut px = PixelSet::new();
        for r in rects {
            for y in r.y..r.y + r.height as i32 {
                for x in r.x..r.x + r.width as i32 {
                    px.insert((x, y));
                }
            }
        }
        px
    }

    #[derive(Debug, Clone)]
    pub struct MockWindow {
        pub attrs: WinAttrs,
        pub ident: WinIdent,
        pub wintype: WinType,
        pub opacity_prop: Option<f64>,
        pub frame: FrameExtents,
    }

    impl MockWindow {
        pub fn new(rect: Rect) -> Self {
            Self {
                attrs: WinAttrs {
                    x: rect.x,
                    y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    border_width: 0,
                    override_redirect: false,
                    viewable: false,
                    argb: false,
                    input_only: false,
                },
                ident: WinIdent::default(),
                wintype: WinType::Normal,
                opacity_prop: None,
                frame: FrameExtents::default(),
            }
        }
    }

    /// One recorded paint-target operation, with the clip as it was at the
    /// time of the call.
    #[derive(Debug, Clone)]
    pub enum PaintOp {
        Root { clip: Option<PixelSet> },
        Window { pict: PictureId, opacity: f64, dst: Rect, clip: Option<PixelSet> },
        Shadow { pict: PictureId, dst: Rect, clip: Option<PixelSet> },
        Dim { dst: Rect, clip: Option<PixelSet> },
    }

    #[derive(Debug, Default)]
    pub struct MockBackend {
        pub windows: HashMap<WinId, MockWindow>,
        root_size: (u32, u32),
        next_id: u32,
        regions: HashMap<RegionId, PixelSet>,
        pictures: HashSet<PictureId>,
        damages: HashMap<DamageId, WinId>,
        clip: Option<RegionId>,
        /// Atom value tests use for `_NET_WM_WINDOW_OPACITY`.
        pub opacity_atom: u32,
        pub ops: Vec<PaintOp>,
        pub request_count: usize,
        pub pictures_freed: usize,
        pub damages_destroyed: usize,
        pub regions_destroyed: usize,
        /// Frees or destroys of handles that were not alive.
        pub invalid_releases: usize,
    }

    impl MockBackend {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                root_size: (width, height),
                next_id: 100,
                opacity_atom: 999,
                ..Default::default()
            }
        }

        pub fn add_window(&mut self, id: WinId, win: MockWindow) {
            self.windows.insert(id, win);
        }

        pub fn live_pictures(&self) -> usize {
            self.pictures.len()
        }

        pub fn live_damages(&self) -> usize {
            self.damages.len()
        }

        pub fn live_regions(&self) -> usize {
            self.regions.len()
        }

        pub fn shadow_ops(&self) -> Vec<&PaintOp> {
            self.ops
                .iter()
                .filter(|op| matches!(op, PaintOp::Shadow { .. }))
                .collect()
        }

        fn alloc(&mut self) -> u32 {
            self.next_id += 1;
            self.next_id
        }

        fn snapshot_clip(&self) -> Option<PixelSet> {
            self.clip.map(|r| self.regions.get(&r).cloned().unwrap_or_default())
        }
    }

    impl Backend for MockBackend {
        fn root_window(&self) -> WinId {
            1
        }

        fn root_size(&self) -> (u32, u32) {
            self.root_size
        }

        fn window_attributes(&mut self, win: WinId) -> Result<WinAttrs> {
            self.request_count += 1;
            self.windows
                .get(&win)
                .map(|w| w.attrs)
                .ok_or_else(|| anyhow!("no such window {win}"))
        }

        fn resolve_client_window(&mut self, win: WinId) -> WinId {
            self.request_count += 1;
            win
        }

        fn window_opacity_prop(&mut self, win: WinId) -> Option<f64> {
            self.request_count += 1;
            self.windows.get(&win).and_then(|w| w.opacity_prop)
        }

        fn window_type(&mut self, win: WinId) -> WinType {
            self.request_count += 1;
            self.windows.get(&win).map(|w| w.wintype).unwrap_or(WinType::Unknown)
        }

        fn window_ident(&mut self, win: WinId) -> WinIdent {
            self.request_count += 1;
            self.windows.get(&win).map(|w| w.ident.clone()).unwrap_or_default()
        }

        fn frame_extents(&mut self, win: WinId) -> FrameExtents {
            self.request_count += 1;
            self.windows.get(&win).map(|w| w.frame).unwrap_or_default()
        }

        fn classify_property(&self, atom: u32) -> PropertyKind {
            if atom == self.opacity_atom {
                PropertyKind::WindowOpacity
            } else {
                PropertyKind::Other
            }
        }

        fn select_window_events(&mut self, _win: WinId) {
            self.request_count += 1;
        }

        fn create_region(&mut self, rects: &[Rect]) -> Result<RegionId> {
            self.request_count += 1;
            let id = self.alloc();
            self.regions.insert(id, pixels_of(rects));
            Ok(id)
        }

        fn copy_region(&mut self, src: RegionId) -> Result<RegionId> {
            self.request_count += 1;
            let px = self
                .regions
                .get(&src)
                .cloned()
                .ok_or_else(|| anyhow!("copy of dead region {src}"))?;
            let id = self.alloc();
            self.regions.insert(id, px);
            Ok(id)
        }

        fn union_region(&mut self, dst: RegionId, src: RegionId) -> Result<()> {
            self.request_count += 1;
            let add = self
                .regions
                .get(&src)
                .cloned()
                .ok_or_else(|| anyhow!("union of dead region {src}"))?;
            let d = self
                .regions
                .get_mut(&dst)
                .ok_or_else(|| anyhow!("union into dead region {dst}"))?;
            d.extend(add);
            Ok(())
        }

        fn subtract_region(&mut self, dst: RegionId, sub: RegionId) -> Result<()> {
            self.request_count += 1;
            let del = self
                .regions
                .get(&sub)
                .cloned()
                .ok_or_else(|| anyhow!("subtract of dead region {sub}"))?;
            let d = self
                .regions
                .get_mut(&dst)
                .ok_or_else(|| anyhow!("subtract from dead region {dst}"))?;
            d.retain(|p| !del.contains(p));
            Ok(())
        }

        fn destroy_region(&mut self, region: RegionId) {
            self.request_count += 1;
            if self.regions.remove(&region).is_none() {
                self.invalid_releases += 1;
            } else {
                self.regions_destroyed += 1;
            }
        }

        fn border_size_region(
            &mut self,
            win: WinId,
            x: i32,
            y: i32,
            border_width: u32,
        ) -> Result<RegionId> {
            self.request_count += 1;
            let w = self
                .windows
                .get(&win)
                .ok_or_else(|| anyhow!("no such window {win}"))?;
            let rect = Rect::new(
                x + border_width as i32,
                y + border_width as i32,
                w.attrs.width,
                w.attrs.height,
            );
            let id = self.alloc();
            self.regions.insert(id, pixels_of(&[rect]));
            Ok(id)
        }

        fn create_damage(&mut self, win: WinId) -> Result<DamageId> {
            self.request_count += 1;
            let id = self.alloc();
            self.damages.insert(id, win);
            Ok(id)
        }

        fn destroy_damage(&mut self, damage: DamageId) {
            self.request_count += 1;
            if self.damages.remove(&damage).is_none() {
                self.invalid_releases += 1;
            } else {
                self.damages_destroyed += 1;
            }
        }

        fn drain_damage(&mut self, damage: DamageId, origin: (i32, i32)) -> Result<RegionId> {
            self.request_count += 1;
            let win = *self
                .damages
                .get(&damage)
                .ok_or_else(|| anyhow!("drain of dead damage {damage}"))?;
            let w = &self.windows[&win];
            let rect = Rect::new(origin.0, origin.1, w.attrs.width, w.attrs.height);
            let id = self.alloc();
            self.regions.insert(id, pixels_of(&[rect]));
            Ok(id)
        }

        fn clear_damage(&mut self, _damage: DamageId) {
            self.request_count += 1;
        }

        fn bind_window_picture(&mut self, win: WinId) -> Result<PictureId> {
            self.request_count += 1;
            if !self.windows.contains_key(&win) {
                return Err(anyhow!("no such window {win}"));
            }
            let id = self.alloc();
            self.pictures.insert(id);
            Ok(id)
        }

        fn free_picture(&mut self, pict: PictureId) {
            self.request_count += 1;
            if !self.pictures.remove(&pict) {
                self.invalid_releases += 1;
            } else {
                self.pictures_freed += 1;
            }
        }

        fn upload_shadow(&mut self, _image: &ShadowImage) -> Result<PictureId> {
            self.request_count += 1;
            let id = self.alloc();
            self.pictures.insert(id);
            Ok(id)
        }

        fn begin_paint(&mut self) -> Result<()> {
            self.request_count += 1;
            Ok(())
        }

        fn set_clip(&mut self, region: Option<RegionId>) -> Result<()> {
            self.request_count += 1;
            self.clip = region;
            Ok(())
        }

        fn paint_root(&mut self) -> Result<()> {
            self.request_count += 1;
            let clip = self.snapshot_clip();
            self.ops.push(PaintOp::Root { clip });
            Ok(())
        }

        fn composite_window(
            &mut self,
            pict: PictureId,
            _mode: WinMode,
            opacity: f64,
            dst: Rect,
            _src_off: (i32, i32),
        ) -> Result<()> {
            self.request_count += 1;
            let clip = self.snapshot_clip();
            self.ops.push(PaintOp::Window { pict, opacity, dst, clip });
            Ok(())
        }

        fn composite_shadow(&mut self, pict: PictureId, dst: Rect) -> Result<()> {
            self.request_count += 1;
            let clip = self.snapshot_clip();
            self.ops.push(PaintOp::Shadow { pict, dst, clip });
            Ok(())
        }

        fn dim_window(&mut self, dst: Rect, _level: f64) -> Result<()> {
            self.request_count += 1;
            let clip = self.snapshot_clip();
            self.ops.push(PaintOp::Dim { dst, clip });
            Ok(())
        }

        fn end_paint(&mut self) -> Result<()> {
            self.request_count += 1;
            self.clip = None;
            Ok(())
        }

        fn root_resized(&mut self, width: u32, height: u32) {
            self.root_size = (width, height);
        }

        fn root_background_changed(&mut self) {
            self.request_count += 1;
        }

        fn absorb_error(&mut self, _sequence: u16) -> bool {
            false
        }

        fn flush(&mut self) {}
    }
}
