//! Fade/Animation Engine
//!
//! A single process-wide set of in-flight opacity transitions, at most one
//! per window. The engine is tick-pure: `run_fades` advances every fade by
//! one step and reports what happened; the caller owns damage marking and
//! callback dispatch, so the engine itself never touches window resources.

use std::time::Duration;

use super::backend::WinId;

/// Tolerance for "reached the target" so that e.g. ten 0.1 steps from 0.0
/// complete in exactly ten ticks despite accumulated rounding.
const STEP_EPSILON: f64 = 1e-6;

/// What to do when a fade reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeCallback {
    /// Plain opacity transition; nothing to finish.
    None,
    /// Release the window's rendering resources (deferred unmap).
    FinishUnmap,
    /// Release resources and retire the window (deferred destroy).
    FinishDestroy,
}

#[derive(Debug)]
struct Fade {
    win: WinId,
    cur: f64,
    finish: f64,
    step: f64,
    callback: FadeCallback,
}

/// One advance of one window's fade.
#[derive(Debug)]
pub struct FadeStep {
    pub win: WinId,
    pub opacity: f64,
    /// Set when the fade completed on this tick.
    pub done: Option<FadeCallback>,
}

/// Result of `set_fade`, telling the caller how to apply the request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FadeOutcome {
    /// A fade is now running; the window's effective opacity is `opacity`.
    Started { opacity: f64 },
    /// No transition was needed; apply `opacity` now and, if requested,
    /// run the completion callback synchronously.
    Immediate { opacity: f64, run_callback: bool },
    /// An equivalent fade was already running and `override` was false.
    Unchanged,
}

#[derive(Debug)]
pub struct FadeEngine {
    fades: Vec<Fade>,
    delta: Duration,
}

impl FadeEngine {
    pub fn new(delta: Duration) -> Self {
        Self { fades: Vec::new(), delta }
    }

    pub fn is_fading(&self, win: WinId) -> bool {
        self.fades.iter().any(|f| f.win == win)
    }

    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.fades.len()
    }

    /// Completion action of the in-flight fade on `win`, if any.
    pub fn pending_callback(&self, win: WinId) -> Option<FadeCallback> {
        self.fades.iter().find(|f| f.win == win).map(|f| f.callback)
    }

    /// Next event-loop wait bound: one fade interval while anything is
    /// animating, unbounded otherwise.
    pub fn timeout(&self) -> Option<Duration> {
        (!self.fades.is_empty()).then_some(self.delta)
    }

    /// Request an opacity transition for `win`.
    ///
    /// `start == None` resumes from an in-flight fade's current value
    /// (falling back to `finish`, i.e. an immediate apply). Starting a fade
    /// replaces any existing one on the same window; the superseded fade's
    /// callback is dropped, not invoked. With `override_existing == false`
    /// a running fade toward the same target is left untouched.
    pub fn set_fade(
        &mut self,
        win: WinId,
        start: Option<f64>,
        finish: f64,
        step: f64,
        callback: FadeCallback,
        exec_callback_if_no_change: bool,
        override_existing: bool,
    ) -> FadeOutcome {
        let existing = self.fades.iter().position(|f| f.win == win);
        if !override_existing {
            if let Some(i) = existing {
                if (self.fades[i].finish - finish).abs() < STEP_EPSILON {
                    return FadeOutcome::Unchanged;
                }
            }
        }

        let cur = start
            .or(existing.map(|i| self.fades[i].cur))
            .unwrap_or(finish);
        if let Some(i) = existing {
            self.fades.remove(i);
        }

        if step <= 0.0 || (cur - finish).abs() < STEP_EPSILON {
            return FadeOutcome::Immediate {
                opacity: finish,
                run_callback: exec_callback_if_no_change,
            };
        }

        self.fades.push(Fade { win, cur, finish, step, callback });
        FadeOutcome::Started { opacity: cur }
    }

    /// Drop the fade for `win` without running its callback.
    pub fn cancel(&mut self, win: WinId) {
        self.fades.retain(|f| f.win != win);
    }

    /// Advance every active fade by one step, clamped at its target.
    /// Completed fades are removed and reported with their callback; the
    /// caller dispatches those exactly once.
    pub fn run_fades(&mut self) -> Vec<FadeStep> {
        let mut steps = Vec::with_capacity(self.fades.len());
        self.fades.retain_mut(|f| {
            let dir = if f.finish >= f.cur { 1.0 } else { -1.0 };
            f.cur += dir * f.step;
            let done = (f.finish - f.cur) * dir <= STEP_EPSILON;
            if done {
                f.cur = f.finish;
            }
            steps.push(FadeStep {
                win: f.win,
                opacity: f.cur,
                done: done.then_some(f.callback),
            });
            !done
        });
        steps
    }
}
