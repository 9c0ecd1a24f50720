use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use tether_core::TimerError;

/// Default quiet period before a heartbeat frame is sent.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(25);

/// Recurring heartbeat clock, suppressible by recent writes.
///
/// `schedule()` pushes the next fire to one full period from now; callers
/// invoke it after every outbound frame, so a heartbeat only fires once the
/// connection has been quiet for the whole period. After a fire the clock
/// re-arms itself unless the callback already moved the deadline.
pub struct HeartbeatTimer {
    period: Duration,
    deadline: watch::Sender<Option<Instant>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl HeartbeatTimer {
    pub fn new(period: Duration, on_beat: impl Fn() + Send + Sync + 'static) -> Self {
        let (deadline, deadlines) = watch::channel(None);
        let cancel = CancellationToken::new();
        tokio::spawn(run(
            deadlines,
            deadline.clone(),
            cancel.clone(),
            period,
            Box::new(on_beat),
        ));
        Self {
            period,
            deadline,
            cancel,
            stopped: AtomicBool::new(false),
        }
    }

    /// Arm the next fire for one period from now, or reset a pending one.
    pub fn schedule(&self) -> Result<(), TimerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TimerError::Stopped);
        }
        self.deadline.send_replace(Some(Instant::now() + self.period));
        Ok(())
    }

    /// Permanently stop sending heartbeats. Idempotent; `schedule` fails
    /// afterwards.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut deadlines: watch::Receiver<Option<Instant>>,
    arm: watch::Sender<Option<Instant>>,
    cancel: CancellationToken,
    period: Duration,
    on_beat: Box<dyn Fn() + Send + Sync>,
) {
    loop {
        let target = *deadlines.borrow_and_update();
        match target {
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = deadlines.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = deadlines.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = time::sleep_until(deadline) => {
                        on_beat();
                        // The callback normally causes a write that
                        // reschedules us; only self-arm when it didn't.
                        if !deadlines.has_changed().unwrap_or(true) {
                            arm.send_replace(Some(Instant::now() + period));
                        }
                    }
                }
            }
        }
    }
}
