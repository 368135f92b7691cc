//! Debounce/throttle state machine for refresh requests.
//!
//! This module decides *when* a refresh should run under bursts of
//! invalidations. It owns no timers: every input carries the current
//! `Instant`, and every output is a list of [`ThrottleAction`]s that the
//! caller executes (fire the callback, arm a timer, cancel a timer).
//!
//! Modes, selected by which options are set (zero counts as unset):
//! - neither: passthrough, every trigger fires immediately
//! - `debounce_ms` only: fire after `debounce_ms` of silence
//! - `throttle_ms` only: at most one fire per window, leading/trailing edges
//! - both: debounce first, then the throttle window gates the result

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Rate-limiting options for invalidation-triggered refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleOptions {
    /// Wait this long after the last trigger before firing.
    pub debounce_ms: Option<u64>,
    /// Fire at most once per this many milliseconds.
    pub throttle_ms: Option<u64>,
    /// Fire on the first trigger of a window (throttle only).
    pub leading: bool,
    /// Fire once at the end of a window that saw triggers (throttle only).
    pub trailing: bool,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            debounce_ms: None,
            throttle_ms: None,
            leading: true,
            trailing: true,
        }
    }
}

impl ThrottleOptions {
    /// Debounce-only options.
    pub fn debounce(ms: u64) -> Self {
        Self {
            debounce_ms: Some(ms),
            ..Self::default()
        }
    }

    /// Throttle-only options with both edges enabled.
    pub fn throttle(ms: u64) -> Self {
        Self {
            throttle_ms: Some(ms),
            ..Self::default()
        }
    }

    /// Set the debounce delay.
    pub fn with_debounce(mut self, ms: u64) -> Self {
        self.debounce_ms = Some(ms);
        self
    }

    /// Set the leading edge flag.
    pub fn with_leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// Set the trailing edge flag.
    pub fn with_trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    /// Resolve the options into a concrete mode.
    pub fn mode(&self) -> ThrottleMode {
        let debounce = positive_ms(self.debounce_ms);
        match positive_ms(self.throttle_ms) {
            Some(interval) => ThrottleMode::Throttle {
                interval,
                leading: self.leading,
                trailing: self.trailing,
                debounce,
            },
            None => match debounce {
                Some(delay) => ThrottleMode::Debounce { delay },
                None => ThrottleMode::Passthrough,
            },
        }
    }

    /// True for throttle mode with both edges disabled: nothing ever fires.
    pub fn never_fires(&self) -> bool {
        matches!(
            self.mode(),
            ThrottleMode::Throttle {
                leading: false,
                trailing: false,
                ..
            }
        )
    }
}

fn positive_ms(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|&ms| ms > 0).map(Duration::from_millis)
}

/// Resolved rate-limiting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleMode {
    /// Every trigger fires immediately.
    Passthrough,
    /// Fire after `delay` of silence.
    Debounce {
        /// Quiet period.
        delay: Duration,
    },
    /// At most one fire per `interval`.
    Throttle {
        /// Window length.
        interval: Duration,
        /// Fire on the first trigger of a window.
        leading: bool,
        /// Fire once at the end of a busy window.
        trailing: bool,
        /// Optional debounce applied before the window check.
        debounce: Option<Duration>,
    },
}

/// Which timer an action or token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// The debounce quiet-period timer.
    Debounce,
    /// The end-of-window trailing timer.
    Trailing,
}

/// Identifies one arming of a timer.
///
/// Re-arming a timer bumps the generation, so an elapsed notification for
/// an older arming is recognised as stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    /// Timer this token belongs to.
    pub kind: TimerKind,
    /// Arming generation.
    pub generation: u64,
}

/// Instructions for the timer driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// Invoke the refresh callback now.
    Fire,
    /// Arm (or re-arm, replacing the previous one) a timer of `token.kind`.
    Arm {
        /// Token to pass back to [`ThrottleController::timer_elapsed`].
        token: TimerToken,
        /// Delay before the timer elapses.
        delay: Duration,
    },
    /// Cancel the timer of this kind, if armed.
    Cancel(TimerKind),
}

/// Debounce/throttle state machine - NO timers, just decisions.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    mode: ThrottleMode,
    /// When the callback last fired (throttle window start).
    last_fire: Option<Instant>,
    /// Generation of the armed debounce timer.
    debounce: Option<u64>,
    /// Generation of the armed trailing timer.
    trailing: Option<u64>,
    /// A trailing fire is owed at the end of the current window.
    pending_trailing: bool,
    generation: u64,
}

impl ThrottleController {
    /// Create a controller for the given options.
    pub fn new(options: &ThrottleOptions) -> Self {
        Self::with_mode(options.mode())
    }

    /// Create a controller for an already resolved mode.
    pub fn with_mode(mode: ThrottleMode) -> Self {
        Self {
            mode,
            last_fire: None,
            debounce: None,
            trailing: None,
            pending_trailing: false,
            generation: 0,
        }
    }

    /// The resolved mode.
    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    /// Record a refresh request.
    pub fn trigger(&mut self, now: Instant) -> Vec<ThrottleAction> {
        match self.mode {
            ThrottleMode::Passthrough => vec![ThrottleAction::Fire],
            ThrottleMode::Debounce { delay } => vec![self.arm_debounce(delay)],
            ThrottleMode::Throttle {
                debounce: Some(delay),
                ..
            } => vec![self.arm_debounce(delay)],
            ThrottleMode::Throttle { debounce: None, .. } => self.throttled_trigger(now),
        }
    }

    /// A previously armed timer elapsed.
    pub fn timer_elapsed(&mut self, token: TimerToken, now: Instant) -> Vec<ThrottleAction> {
        match token.kind {
            TimerKind::Debounce => {
                if self.debounce != Some(token.generation) {
                    return vec![];
                }
                self.debounce = None;
                match self.mode {
                    ThrottleMode::Throttle { .. } => self.throttled_trigger(now),
                    _ => vec![ThrottleAction::Fire],
                }
            }
            TimerKind::Trailing => {
                if self.trailing != Some(token.generation) {
                    return vec![];
                }
                self.trailing = None;
                if self.pending_trailing {
                    self.execute(now)
                } else {
                    vec![]
                }
            }
        }
    }

    /// Drop all armed timers and owed fires.
    pub fn dispose(&mut self) -> Vec<ThrottleAction> {
        self.debounce = None;
        self.trailing = None;
        self.pending_trailing = false;
        vec![
            ThrottleAction::Cancel(TimerKind::Debounce),
            ThrottleAction::Cancel(TimerKind::Trailing),
        ]
    }

    /// True if a timer is armed or a trailing fire is owed.
    pub fn has_pending(&self) -> bool {
        self.debounce.is_some() || self.trailing.is_some() || self.pending_trailing
    }

    fn throttled_trigger(&mut self, now: Instant) -> Vec<ThrottleAction> {
        let ThrottleMode::Throttle {
            interval,
            leading,
            trailing,
            ..
        } = self.mode
        else {
            return vec![ThrottleAction::Fire];
        };

        let remaining = match self.last_fire {
            Some(at) => interval.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        };

        if remaining.is_zero() {
            if leading {
                self.execute(now)
            } else if trailing {
                vec![self.schedule_trailing(interval)]
            } else {
                vec![]
            }
        } else {
            let mut actions = Vec::new();
            if trailing && self.trailing.is_none() {
                actions.push(self.schedule_trailing(remaining));
            }
            self.pending_trailing = trailing;
            actions
        }
    }

    fn execute(&mut self, now: Instant) -> Vec<ThrottleAction> {
        self.last_fire = Some(now);
        self.pending_trailing = false;
        vec![ThrottleAction::Fire]
    }

    fn schedule_trailing(&mut self, delay: Duration) -> ThrottleAction {
        self.pending_trailing = true;
        let token = self.next_token(TimerKind::Trailing);
        self.trailing = Some(token.generation);
        ThrottleAction::Arm { token, delay }
    }

    fn arm_debounce(&mut self, delay: Duration) -> ThrottleAction {
        let token = self.next_token(TimerKind::Debounce);
        self.debounce = Some(token.generation);
        ThrottleAction::Arm { token, delay }
    }

    fn next_token(&mut self, kind: TimerKind) -> TimerToken {
        self.generation = self.generation.wrapping_add(1);
        TimerToken {
            kind,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Pull the single Arm action out of a step, panicking otherwise.
    fn armed(actions: &[ThrottleAction]) -> (TimerToken, Duration) {
        match actions {
            [ThrottleAction::Arm { token, delay }] => (*token, *delay),
            other => panic!("expected one Arm action, got {:?}", other),
        }
    }

    fn fires(actions: &[ThrottleAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, ThrottleAction::Fire))
            .count()
    }

    // ===========================================
    // Mode Selection Tests
    // ===========================================

    #[test]
    fn no_options_is_passthrough() {
        assert_eq!(ThrottleOptions::default().mode(), ThrottleMode::Passthrough);
    }

    #[test]
    fn zero_values_count_as_unset() {
        let opts = ThrottleOptions {
            debounce_ms: Some(0),
            throttle_ms: Some(0),
            ..ThrottleOptions::default()
        };
        assert_eq!(opts.mode(), ThrottleMode::Passthrough);
    }

    #[test]
    fn debounce_only_mode() {
        assert_eq!(
            ThrottleOptions::debounce(50).mode(),
            ThrottleMode::Debounce { delay: ms(50) }
        );
    }

    #[test]
    fn combined_mode_keeps_debounce() {
        let opts = ThrottleOptions::throttle(200).with_debounce(50);
        assert_eq!(
            opts.mode(),
            ThrottleMode::Throttle {
                interval: ms(200),
                leading: true,
                trailing: true,
                debounce: Some(ms(50)),
            }
        );
    }

    #[test]
    fn both_edges_disabled_never_fires() {
        let opts = ThrottleOptions::throttle(100)
            .with_leading(false)
            .with_trailing(false);
        assert!(opts.never_fires());
        assert!(!ThrottleOptions::throttle(100).never_fires());

        let t0 = Instant::now();
        let mut ctl = ThrottleController::new(&opts);
        assert!(ctl.trigger(t0).is_empty());
        assert!(ctl.trigger(t0 + ms(500)).is_empty());
        assert!(!ctl.has_pending());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: ThrottleOptions = serde_json::from_str(r#"{ "throttle_ms": 100 }"#).unwrap();
        assert_eq!(opts.throttle_ms, Some(100));
        assert!(opts.leading);
        assert!(opts.trailing);
    }

    // ===========================================
    // Passthrough / Debounce Tests
    // ===========================================

    #[test]
    fn passthrough_fires_every_time() {
        let t0 = Instant::now();
        let mut ctl = ThrottleController::new(&ThrottleOptions::default());
        for i in 0..5 {
            assert_eq!(ctl.trigger(t0 + ms(i)), vec![ThrottleAction::Fire]);
        }
        assert!(!ctl.has_pending());
    }

    #[test]
    fn debounce_fires_once_after_silence() {
        let t0 = Instant::now();
        let mut ctl = ThrottleController::new(&ThrottleOptions::debounce(50));

        let (first, _) = armed(&ctl.trigger(t0));
        let (second, _) = armed(&ctl.trigger(t0 + ms(10)));
        let (third, delay) = armed(&ctl.trigger(t0 + ms(20)));
        assert_eq!(delay, ms(50));
        assert!(ctl.has_pending());

        // Stale timers are ignored
        assert!(ctl.timer_elapsed(first, t0 + ms(50)).is_empty());
        assert!(ctl.timer_elapsed(second, t0 + ms(60)).is_empty());

        assert_eq!(
            ctl.timer_elapsed(third, t0 + ms(70)),
            vec![ThrottleAction::Fire]
        );
        assert!(!ctl.has_pending());
    }

    // ===========================================
    // Throttle Tests
    // ===========================================

    #[test]
    fn throttle_leading_fires_immediately() {
        let t0 = Instant::now();
        let mut ctl = ThrottleController::new(&ThrottleOptions::throttle(100));
        assert_eq!(ctl.trigger(t0), vec![ThrottleAction::Fire]);
    }

    #[test]
    fn throttle_trailing_fires_once_at_window_end() {
        let t0 = Instant::now();
        let mut ctl = ThrottleController::new(&ThrottleOptions::throttle(100));

        assert_eq!(fires(&ctl.trigger(t0)), 1);

        let (token, delay) = armed(&ctl.trigger(t0 + ms(10)));
        assert_eq!(delay, ms(90));
        // More triggers inside the window do not arm more timers
        assert!(ctl.trigger(t0 + ms(20)).is_empty());
        assert!(ctl.trigger(t0 + ms(30)).is_empty());
        assert!(ctl.has_pending());

        assert_eq!(
            ctl.timer_elapsed(token, t0 + ms(100)),
            vec![ThrottleAction::Fire]
        );
        assert!(!ctl.has_pending());
    }

    #[test]
    fn throttle_without_trailing_drops_window_triggers() {
        let t0 = Instant::now();
        let opts = ThrottleOptions::throttle(100).with_trailing(false);
        let mut ctl = ThrottleController::new(&opts);

        assert_eq!(fires(&ctl.trigger(t0)), 1);
        assert!(ctl.trigger(t0 + ms(50)).is_empty());
        assert!(!ctl.has_pending());
        // Next window fires again
        assert_eq!(fires(&ctl.trigger(t0 + ms(150))), 1);
    }

    #[test]
    fn throttle_without_leading_defers_to_window_end() {
        let t0 = Instant::now();
        let opts = ThrottleOptions::throttle(100).with_leading(false);
        let mut ctl = ThrottleController::new(&opts);

        let (token, delay) = armed(&ctl.trigger(t0));
        assert_eq!(delay, ms(100));
        assert_eq!(
            ctl.timer_elapsed(token, t0 + ms(100)),
            vec![ThrottleAction::Fire]
        );
    }

    #[test]
    fn combined_mode_debounces_then_throttles() {
        let t0 = Instant::now();
        let opts = ThrottleOptions::throttle(200).with_debounce(50);
        let mut ctl = ThrottleController::new(&opts);

        // First trigger fires after the 50ms debounce
        let (d1, delay) = armed(&ctl.trigger(t0));
        assert_eq!(delay, ms(50));
        assert_eq!(
            ctl.timer_elapsed(d1, t0 + ms(50)),
            vec![ThrottleAction::Fire]
        );

        // Burst inside the throttle window collapses into one debounce
        armed(&ctl.trigger(t0 + ms(60)));
        armed(&ctl.trigger(t0 + ms(70)));
        let (d2, _) = armed(&ctl.trigger(t0 + ms(80)));

        // Debounce elapses at 130; window ends at 250 (50 + 200)
        let (trailing, delay) = armed(&ctl.timer_elapsed(d2, t0 + ms(130)));
        assert_eq!(trailing.kind, TimerKind::Trailing);
        assert_eq!(delay, ms(120));

        assert_eq!(
            ctl.timer_elapsed(trailing, t0 + ms(250)),
            vec![ThrottleAction::Fire]
        );
        assert!(!ctl.has_pending());
    }

    #[test]
    fn dispose_cancels_everything() {
        let t0 = Instant::now();
        let mut ctl = ThrottleController::new(&ThrottleOptions::throttle(100));
        ctl.trigger(t0);
        let (token, _) = armed(&ctl.trigger(t0 + ms(10)));
        assert!(ctl.has_pending());

        let actions = ctl.dispose();
        assert!(actions.contains(&ThrottleAction::Cancel(TimerKind::Debounce)));
        assert!(actions.contains(&ThrottleAction::Cancel(TimerKind::Trailing)));
        assert!(!ctl.has_pending());

        // A timer that raced with dispose is ignored
        assert!(ctl.timer_elapsed(token, t0 + ms(100)).is_empty());
    }
}
