//! Timer driver for the throttle/debounce state machine.
//!
//! [`ThrottledHandler`] feeds triggers into a
//! [`ThrottleController`](sync_core::ThrottleController) and interprets its
//! actions with tokio sleep tasks. The callback runs outside every lock, so
//! it may re-enter the handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use sync_core::{ThrottleAction, ThrottleController, ThrottleOptions, TimerKind, TimerToken};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{lock, SyncError};

/// Rate-limited trigger for a callback.
///
/// Clones share state. Timers need a tokio runtime; passthrough mode and
/// leading-edge fires do not.
#[derive(Clone)]
pub struct ThrottledHandler {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<DriverState>,
    callback: Box<dyn Fn() + Send + Sync>,
}

struct DriverState {
    controller: ThrottleController,
    timers: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    disposed: bool,
}

impl ThrottledHandler {
    /// Create a handler invoking `callback` according to `options`.
    pub fn new(options: &ThrottleOptions, callback: impl Fn() + Send + Sync + 'static) -> Self {
        if options.never_fires() {
            tracing::warn!("throttle has leading and trailing disabled; it will never fire");
        }
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DriverState {
                    controller: ThrottleController::new(options),
                    timers: HashMap::new(),
                    disposed: false,
                }),
                callback: Box::new(callback),
            }),
        }
    }

    /// Request an invocation. Fire-and-forget.
    ///
    /// Fails with [`SyncError::NoRuntime`] if a timer must be armed outside
    /// a tokio runtime; the controller is reset in that case.
    pub fn trigger(&self) -> Result<(), SyncError> {
        let fire = {
            let mut state = lock(&self.shared.state);
            if state.disposed {
                return Ok(());
            }
            let actions = state.controller.trigger(now());
            match execute(&self.shared, &mut state, actions) {
                Ok(fire) => fire,
                Err(err) => {
                    reset(&mut state);
                    return Err(err);
                }
            }
        };
        if fire {
            (self.shared.callback)();
        }
        Ok(())
    }

    /// Cancel all timers and ignore every later trigger. Idempotent.
    pub fn dispose(&self) {
        let mut state = lock(&self.shared.state);
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.controller.dispose();
        for (_, (_, timer)) in state.timers.drain() {
            timer.abort();
        }
    }

    /// True if a timer is armed or a trailing invocation is owed.
    pub fn has_pending(&self) -> bool {
        let state = lock(&self.shared.state);
        !state.disposed && state.controller.has_pending()
    }

    /// True once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        lock(&self.shared.state).disposed
    }
}

impl fmt::Debug for ThrottledHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("ThrottledHandler")
            .field("mode", &state.controller.mode())
            .field("armed", &state.timers.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// Run timer actions under the lock; report whether to fire.
fn execute(
    shared: &Arc<Shared>,
    state: &mut DriverState,
    actions: Vec<ThrottleAction>,
) -> Result<bool, SyncError> {
    let mut fire = false;
    for action in actions {
        match action {
            ThrottleAction::Fire => fire = true,
            ThrottleAction::Arm { token, delay } => {
                let timer = spawn_timer(Arc::downgrade(shared), token, delay)?;
                if let Some((_, previous)) = state.timers.insert(token.kind, (token.generation, timer))
                {
                    previous.abort();
                }
            }
            ThrottleAction::Cancel(kind) => {
                if let Some((_, timer)) = state.timers.remove(&kind) {
                    timer.abort();
                }
            }
        }
    }
    Ok(fire)
}

/// Return the controller to idle and abort every armed timer.
fn reset(state: &mut DriverState) {
    for action in state.controller.dispose() {
        if let ThrottleAction::Cancel(kind) = action {
            if let Some((_, timer)) = state.timers.remove(&kind) {
                timer.abort();
            }
        }
    }
}

fn spawn_timer(
    shared: Weak<Shared>,
    token: TimerToken,
    delay: Duration,
) -> Result<JoinHandle<()>, SyncError> {
    let handle = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
    Ok(handle.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(shared) = shared.upgrade() {
            timer_elapsed(&shared, token);
        }
    }))
}

fn timer_elapsed(shared: &Arc<Shared>, token: TimerToken) {
    let fire = {
        let mut state = lock(&shared.state);
        if state.disposed {
            return;
        }
        if matches!(state.timers.get(&token.kind), Some((generation, _)) if *generation == token.generation)
        {
            state.timers.remove(&token.kind);
        }
        let actions = state.controller.timer_elapsed(token, now());
        match execute(shared, &mut state, actions) {
            Ok(fire) => fire,
            Err(err) => {
                tracing::warn!(error = %err, "throttle timer could not re-arm");
                false
            }
        }
    };
    if fire {
        (shared.callback)();
    }
}

/// Current time on tokio's clock, so paused test time is honoured.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
