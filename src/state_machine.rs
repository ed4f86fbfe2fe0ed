//! Service lifecycle state machine (spec §4.9).
//!
//! States transition only along edges in a fixed table; each edge carries
//! `on_exit`/`on_enter`/`validate` handlers. A failed `validate` aborts the
//! transition before any handler runs. A failed `on_enter` rolls the state
//! back to the source state (the target state is never considered "current"
//! unless `on_enter` succeeds). A bounded ring of the last transitions is
//! kept for the control surface's status query.

use crate::error::{Result, TunnelError};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Uninitialized,
    Initializing,
    Ready,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Uninitialized => "uninitialized",
            State::Initializing => "initializing",
            State::Ready => "ready",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Error => "error",
        };
        f.write_str(s)
    }
}

impl State {
    /// The fixed transition table (spec §4.9): every edge a caller may
    /// request. Anything not listed here is rejected before any handler
    /// runs.
    fn allowed_next(self) -> &'static [State] {
        use State::*;
        match self {
            Uninitialized => &[Initializing],
            Initializing => &[Ready, Error],
            Ready => &[Starting, Stopped],
            Starting => &[Running, Error],
            Running => &[Stopping, Error],
            Stopping => &[Stopped, Error],
            Stopped => &[Initializing],
            Error => &[Initializing, Stopped],
        }
    }

    pub fn can_transition_to(self, target: State) -> bool {
        self.allowed_next().contains(&target)
    }
}

type AsyncHook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;
type ValidateHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// The three handlers attached to one transition edge.
#[derive(Clone, Default)]
pub struct Handlers {
    pub validate: Option<ValidateHook>,
    pub on_exit: Option<AsyncHook>,
    pub on_enter: Option<AsyncHook>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionRecord {
    pub from: State,
    pub to: State,
    pub ok: bool,
    pub at: chrono::DateTime<chrono::Utc>,
}

struct Inner {
    current: State,
    handlers: std::collections::HashMap<(State, State), Handlers>,
    log: VecDeque<TransitionRecord>,
}

const LOG_CAPACITY: usize = 64;

/// The service's lifecycle state machine, shared behind an `Arc` so the
/// control surface and the main run loop observe the same current state.
pub struct StateMachine {
    inner: RwLock<Inner>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                current: State::Uninitialized,
                handlers: std::collections::HashMap::new(),
                log: VecDeque::with_capacity(LOG_CAPACITY),
            }),
        }
    }

    pub async fn current(&self) -> State {
        self.inner.read().await.current
    }

    pub async fn register(&self, from: State, to: State, handlers: Handlers) {
        let mut inner = self.inner.write().await;
        inner.handlers.insert((from, to), handlers);
    }

    pub async fn history(&self) -> Vec<TransitionRecord> {
        self.inner.read().await.log.iter().copied().collect()
    }

    /// Attempt the transition `current -> target`. On success `current`
    /// becomes `target`; on a rejected or failed transition `current` is
    /// left unchanged (after `on_enter` failure, exactly as it was before
    /// `on_exit` ran).
    pub async fn transition(&self, target: State) -> Result<()> {
        let (from, handlers) = {
            let inner = self.inner.read().await;
            let from = inner.current;
            if !from.can_transition_to(target) {
                drop(inner);
                self.record(from, target, false).await;
                return Err(TunnelError::InvalidTransition {
                    from: from.to_string(),
                    to: target.to_string(),
                    reason: "no such edge in the transition table".to_string(),
                });
            }
            (from, inner.handlers.get(&(from, target)).cloned())
        };

        if let Some(validate) = handlers.as_ref().and_then(|h| h.validate.clone()) {
            if let Err(e) = validate() {
                self.record(from, target, false).await;
                return Err(TunnelError::InvalidTransition {
                    from: from.to_string(),
                    to: target.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        if let Some(on_exit) = handlers.as_ref().and_then(|h| h.on_exit.clone()) {
            if let Err(e) = on_exit().await {
                error!(%from, %target, error = %e, "on_exit handler failed, aborting transition");
                self.record(from, target, false).await;
                return Err(TunnelError::HandlerFailed(e.to_string()));
            }
        }

        if let Some(on_enter) = handlers.as_ref().and_then(|h| h.on_enter.clone()) {
            if let Err(e) = on_enter().await {
                warn!(%from, %target, error = %e, "on_enter failed, rolling back");
                self.record(from, target, false).await;
                // current never left `from` in storage; nothing to roll back
                // beyond reporting the failure.
                return Err(TunnelError::HandlerFailed(e.to_string()));
            }
        }

        {
            let mut inner = self.inner.write().await;
            inner.current = target;
        }
        self.record(from, target, true).await;
        info!(%from, %target, "state transition complete");
        Ok(())
    }

    async fn record(&self, from: State, to: State, ok: bool) {
        let mut inner = self.inner.write().await;
        if inner.log.len() == LOG_CAPACITY {
            inner.log.pop_front();
        }
        inner.log.push_back(TransitionRecord {
            from,
            to,
            ok,
            at: chrono::Utc::now(),
        });
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn valid_transition_updates_current_state() {
        let sm = StateMachine::new();
        sm.transition(State::Initializing).await.unwrap();
        assert_eq!(sm.current().await, State::Initializing);
    }

    #[tokio::test]
    async fn transition_outside_table_is_rejected() {
        let sm = StateMachine::new();
        let err = sm.transition(State::Running).await.unwrap_err();
        assert!(matches!(err, TunnelError::InvalidTransition { .. }));
        assert_eq!(sm.current().await, State::Uninitialized);
    }

    #[tokio::test]
    async fn failed_on_enter_leaves_current_state_unchanged() {
        let sm = StateMachine::new();
        let handlers = Handlers {
            validate: None,
            on_exit: None,
            on_enter: Some(Arc::new(|| {
                Box::pin(async { Err(TunnelError::HandlerFailed("boom".to_string())) })
            })),
        };
        sm.register(State::Uninitialized, State::Initializing, handlers)
            .await;

        let err = sm.transition(State::Initializing).await.unwrap_err();
        assert!(matches!(err, TunnelError::HandlerFailed(_)));
        assert_eq!(sm.current().await, State::Uninitialized);
    }

    #[tokio::test]
    async fn failed_validate_skips_on_exit_and_on_enter() {
        let sm = StateMachine::new();
        let exit_called = Arc::new(AtomicBool::new(false));
        let exit_called2 = exit_called.clone();
        let handlers = Handlers {
            validate: Some(Arc::new(|| {
                Err(TunnelError::HandlerFailed("precondition unmet".to_string()))
            })),
            on_exit: Some(Arc::new(move || {
                let flag = exit_called2.clone();
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })),
            on_enter: None,
        };
        sm.register(State::Uninitialized, State::Initializing, handlers)
            .await;

        let result = sm.transition(State::Initializing).await;
        assert!(result.is_err());
        assert!(!exit_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn history_records_both_successes_and_failures() {
        let sm = StateMachine::new();
        sm.transition(State::Initializing).await.unwrap();
        let _ = sm.transition(State::Running).await;
        let history = sm.history().await;
        assert_eq!(history.len(), 2);
        assert!(history[0].ok);
        assert!(!history[1].ok);
    }

    #[tokio::test]
    async fn error_state_can_recover_back_to_initializing() {
        let sm = StateMachine::new();
        sm.transition(State::Initializing).await.unwrap();
        sm.transition(State::Error).await.unwrap();
        sm.transition(State::Initializing).await.unwrap();
        assert_eq!(sm.current().await, State::Initializing);
    }
}
