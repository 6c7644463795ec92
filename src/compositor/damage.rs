//! Damage & Repaint Scheduler
//!
//! Accumulates dirty regions into one pending server-side region and drives
//! the two-phase paint pass over the stacking order: top-to-bottom to paint
//! opaque windows and compute per-window clips, then bottom-to-top to paint
//! shadows, translucent bodies, and dimming through those clips.

use anyhow::Result;
use tracing::warn;

use super::backend::{Backend, RegionId};
use crate::config::Config;
use super::region::Rect;
use super::shadow::{GaussianKernel, make_shadow};
use super::window::{Registry, ShadowPicture, Win, WinMode};

/// The process-wide pending repaint region. Consumed (reset to empty) by
/// each completed paint pass, which is what makes back-to-back passes with
/// no new damage a no-op.
#[derive(Debug, Default)]
pub struct DamageScheduler {
    pending: Option<RegionId>,
}

impl DamageScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Union `region` into the pending region, consuming the handle.
    pub fn add<B: Backend>(&mut self, backend: &mut B, region: RegionId) -> Result<()> {
        match self.pending {
            Some(p) => {
                backend.union_region(p, region)?;
                backend.destroy_region(region);
            }
            None => self.pending = Some(region),
        }
        Ok(())
    }

    pub fn add_rect<B: Backend>(&mut self, backend: &mut B, rect: Rect) -> Result<()> {
        let region = backend.create_region(&[rect])?;
        self.add(backend, region)
    }

    /// Hand the accumulated region to a paint pass; the caller owns it now.
    pub fn take(&mut self) -> Option<RegionId> {
        self.pending.take()
    }
}

/// Whether the window must go through the alpha (phase-2) paint path.
fn needs_alpha_paint(w: &Win, config: &Config) -> bool {
    !w.solid_opaque()
        || (config.focus.frame_opacity < 1.0 - 1e-6 && !w.frame.is_zero())
}

/// Composite one full paint pass into the backend's target. Consumes and
/// destroys `region`.
pub fn paint_all<B: Backend>(
    backend: &mut B,
    reg: &mut Registry,
    config: &Config,
    kernel: &GaussianKernel,
    region: RegionId,
) -> Result<()> {
    let radius = kernel.radius();
    let (sdx, sdy) = (config.shadow.offset_x, config.shadow.offset_y);

    backend.begin_paint()?;

    // Phase 1, top to bottom: opaque bodies now, clip snapshots for later.
    // `trans_above` accumulates the border regions of translucent windows
    // already visited, so a lower window's shadow can be clipped out of
    // them (a shadow must not darken content seen through translucency).
    let order: Vec<_> = reg.top_to_bottom().collect();
    let mut painted = Vec::with_capacity(order.len());
    let mut trans_above: Option<RegionId> = None;

    for id in order {
        let Some(w) = reg.get_mut(id) else { continue };
        if !w.viewable || !w.damaged {
            continue;
        }

        if w.picture.is_none() {
            match backend.bind_window_picture(id) {
                Ok(p) => w.picture = Some(p),
                Err(e) => {
                    // Window dropped from compositing, not fatal.
                    warn!("failed to bind picture for window {id}: {e:#}");
                    continue;
                }
            }
        }
        if w.border_size.is_none() {
            match backend.border_size_region(id, w.x, w.y, w.border_width) {
                Ok(r) => w.border_size = Some(r),
                Err(e) => {
                    warn!("failed to fetch border region for window {id}: {e:#}");
                    continue;
                }
            }
        }
        let (Some(pict), Some(border)) = (w.picture, w.border_size) else {
            continue;
        };

        let alpha = needs_alpha_paint(w, config);
        if !alpha {
            let g = w.geometry_rect();
            backend.set_clip(Some(region))?;
            backend.composite_window(pict, WinMode::Solid, 1.0, g, (0, 0))?;
            if w.dim && config.focus.inactive_dim > 0.0 {
                backend.dim_window(g, config.focus.inactive_dim)?;
            }
            backend.subtract_region(region, border)?;
        }

        // Snapshot after the opaque subtract: nothing below this window is
        // ever painted where an opaque window already landed.
        w.border_clip = Some(backend.copy_region(region)?);
        if w.shadow_wanted {
            let sc = backend.copy_region(region)?;
            if let Some(t) = trans_above {
                backend.subtract_region(sc, t)?;
            }
            w.shadow_clip = Some(sc);
        }

        if alpha {
            let t = match trans_above {
                Some(t) => t,
                None => {
                    let t = backend.create_region(&[])?;
                    trans_above = Some(t);
                    t
                }
            };
            backend.union_region(t, border)?;
        }

        painted.push(id);
    }

    if let Some(t) = trans_above.take() {
        backend.destroy_region(t);
    }

    // Whatever survives the opaque subtracts shows the root background.
    backend.set_clip(Some(region))?;
    backend.paint_root()?;

    // Phase 2, bottom to top: shadows, translucent bodies, dimming.
    for &id in painted.iter().rev() {
        let Some(w) = reg.get_mut(id) else { continue };

        if let Some(sc) = w.shadow_clip.take() {
            if w.shadow.is_none() {
                let g = w.geometry_rect();
                let img = make_shadow(kernel, config.shadow.opacity * w.opacity, g.width, g.height);
                match backend.upload_shadow(&img) {
                    Ok(pict) => {
                        w.shadow = Some(ShadowPicture {
                            pict,
                            dx: sdx - radius as i32,
                            dy: sdy - radius as i32,
                            width: img.width,
                            height: img.height,
                        });
                    }
                    Err(e) => warn!("failed to upload shadow for window {id}: {e:#}"),
                }
            }
            if let Some(s) = &w.shadow {
                let dst = Rect::new(w.x + s.dx, w.y + s.dy, s.width, s.height);
                backend.set_clip(Some(sc))?;
                backend.composite_shadow(s.pict, dst)?;
            }
            backend.destroy_region(sc);
        }

        let Some(bc) = w.border_clip.take() else { continue };
        if needs_alpha_paint(w, config) {
            backend.set_clip(Some(bc))?;
            paint_body(backend, w, config)?;
            if w.dim && config.focus.inactive_dim > 0.0 {
                backend.dim_window(w.geometry_rect(), config.focus.inactive_dim)?;
            }
        }
        backend.destroy_region(bc);
    }

    backend.set_clip(None)?;
    backend.end_paint()?;
    backend.destroy_region(region);
    Ok(())
}

/// Paint a translucent window body, splitting the frame into strips at
/// `frame_opacity` when the client reports frame extents.
fn paint_body<B: Backend>(backend: &mut B, w: &Win, config: &Config) -> Result<()> {
    let Some(pict) = w.picture else { return Ok(()) };
    let g = w.geometry_rect();
    let fo = config.focus.frame_opacity;

    if fo >= 1.0 - 1e-6 || w.frame.is_zero() || matches!(w.mode, WinMode::Argb) {
        return backend.composite_window(pict, w.mode, w.opacity, g, (0, 0));
    }

    let top = w.frame.top.min(g.height);
    let bottom = w.frame.bottom.min(g.height - top);
    let left = w.frame.left.min(g.width);
    let right = w.frame.right.min(g.width - left);
    let mid_h = g.height - top - bottom;
    let frame_alpha = (fo * w.opacity).clamp(0.0, 1.0);

    let strips = [
        Rect::new(g.x, g.y, g.width, top),
        Rect::new(g.x, g.y + (g.height - bottom) as i32, g.width, bottom),
        Rect::new(g.x, g.y + top as i32, left, mid_h),
        Rect::new(g.x + (g.width - right) as i32, g.y + top as i32, right, mid_h),
    ];
    for s in strips {
        if s.width > 0 && s.height > 0 {
            backend.composite_window(pict, WinMode::Trans, frame_alpha, s, (s.x - g.x, s.y - g.y))?;
        }
    }

    let inner = Rect::new(
        g.x + left as i32,
        g.y + top as i32,
        g.width - left - right,
        mid_h,
    );
    if inner.width > 0 && inner.height > 0 {
        backend.composite_window(
            pict,
            WinMode::Trans,
            w.opacity,
            inner,
            (inner.x - g.x, inner.y - g.y),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::backend::mock::MockBackend;

    #[test]
    fn test_scheduler_unions_and_consumes() {
        let mut b = MockBackend::new(100, 100);
        let mut s = DamageScheduler::new();
        assert!(!s.is_pending());

        s.add_rect(&mut b, Rect::new(0, 0, 10, 10)).unwrap();
        s.add_rect(&mut b, Rect::new(20, 20, 10, 10)).unwrap();
        assert!(s.is_pending());
        // The second region was merged in and destroyed.
        assert_eq!(b.live_regions(), 1);

        let r = s.take().unwrap();
        assert!(!s.is_pending());
        b.destroy_region(r);
        assert_eq!(b.live_regions(), 0);
        assert_eq!(b.invalid_releases, 0);
    }

    #[test]
    fn test_take_on_empty_is_none() {
        let mut s = DamageScheduler::new();
        assert!(s.take().is_none());
    }
}
