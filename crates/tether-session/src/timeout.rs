use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;

use tether_core::{Termination, TimerError};

/// Default window a session may sit detached before it expires.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-fire channel carrying how a session ended.
///
/// Exactly one delivery per session. A second fire is a programmer error:
/// it trips a debug assertion and is otherwise dropped with an error log.
#[derive(Clone)]
pub struct TerminationSignal {
    tx: Arc<Mutex<Option<oneshot::Sender<Termination>>>>,
}

impl TerminationSignal {
    pub fn channel() -> (Self, oneshot::Receiver<Termination>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn fire(&self, value: Termination) {
        match self.tx.lock().take() {
            // A dropped receiver just means nobody is watching any more.
            Some(tx) => {
                let _ = tx.send(value);
            }
            None => {
                debug_assert!(false, "termination signal fired twice: {value:?}");
                tracing::error!(?value, "termination signal fired twice");
            }
        }
    }

    pub fn fired(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// One-shot session-expiry clock.
///
/// idle → armed via `start()`, armed → idle via `reset()`/`stop()`, and
/// armed → expired when the clock runs out, firing the termination signal
/// with [`Termination::Expired`]. Expiry is terminal: restarting an expired
/// timer would race with the session teardown already in progress, so
/// `start` and `reset` fail after it.
pub struct SessionTimeoutTimer {
    length: Duration,
    signal: TerminationSignal,
    inner: Arc<Mutex<TimeoutInner>>,
}

struct TimeoutInner {
    armed: Option<CancellationToken>,
    expired: bool,
}

impl SessionTimeoutTimer {
    pub fn new(length: Duration, signal: TerminationSignal) -> Self {
        Self {
            length,
            signal,
            inner: Arc::new(Mutex::new(TimeoutInner {
                armed: None,
                expired: false,
            })),
        }
    }

    /// Arm the expiry clock. No-op while already armed.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut inner = self.inner.lock();
        if inner.expired {
            return Err(TimerError::Expired);
        }
        if inner.armed.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        inner.armed = Some(token.clone());
        drop(inner);

        let shared = Arc::clone(&self.inner);
        let signal = self.signal.clone();
        let length = self.length;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = time::sleep(length) => {
                    let expire = {
                        let mut inner = shared.lock();
                        if token.is_cancelled() || inner.expired {
                            false
                        } else {
                            inner.armed = None;
                            inner.expired = true;
                            true
                        }
                    };
                    if expire {
                        signal.fire(Termination::Expired);
                    }
                }
            }
        });
        Ok(())
    }

    /// Disarm a pending expiry so a later `start()` re-arms from scratch.
    pub fn reset(&self) -> Result<(), TimerError> {
        let mut inner = self.inner.lock();
        if inner.expired {
            return Err(TimerError::Expired);
        }
        if let Some(token) = inner.armed.take() {
            token.cancel();
        }
        Ok(())
    }

    /// Disarm a pending expiry. Idempotent; leaves an expired timer expired.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.expired {
            return;
        }
        if let Some(token) = inner.armed.take() {
            token.cancel();
        }
    }

    pub fn expired(&self) -> bool {
        self.inner.lock().expired
    }

    pub fn armed(&self) -> bool {
        self.inner.lock().armed.is_some()
    }
}
