// Numan Thabit 2025
// retry.rs - per-call timeout stages: hole punch first, then give up
use std::{net::SocketAddr, time::Duration};

use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle, time};

use crate::wire::MessageId;

/// Progress of an outstanding call through the timeout protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Request sent, first timer armed.
    Sent,
    /// First timer fired, a hole punch was requested, second timer armed.
    HolePunchAttempted,
}

/// What the event loop must do when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Ask the rendezvous peer to punch towards `target`, then wait again.
    HolePunch { target: SocketAddr },
    /// Resolve the call as failed.
    Fail,
}

/// Expiry notice posted back to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub message_id: MessageId,
    /// Identifies which arming of the timer fired; stale fires are ignored.
    pub generation: u64,
    /// Set on the first stage only.
    pub punch_target: Option<SocketAddr>,
}

impl TimerFired {
    /// First-stage timers carry the target address, second-stage timers do not.
    pub fn action(&self) -> TimeoutAction {
        match self.punch_target {
            Some(target) => TimeoutAction::HolePunch { target },
            None => TimeoutAction::Fail,
        }
    }
}

impl Stage {
    /// Stage entered after handling `action`, or `None` once the call is finished.
    pub fn advance(self, action: TimeoutAction) -> Option<Stage> {
        match (self, action) {
            (Stage::Sent, TimeoutAction::HolePunch { .. }) => Some(Stage::HolePunchAttempted),
            _ => None,
        }
    }
}

/// A single armed timer. Aborted when cancelled or dropped.
#[derive(Debug)]
pub struct TimerHandle {
    generation: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stops the timer. A fire already queued is filtered by its generation.
    pub fn cancel(self) {}
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Arms timers that post [`TimerFired`] into the event loop after `wait_timeout`.
#[derive(Debug)]
pub struct RetryTimers {
    wait_timeout: Duration,
    fired: UnboundedSender<TimerFired>,
    next_generation: u64,
}

impl RetryTimers {
    pub fn new(wait_timeout: Duration, fired: UnboundedSender<TimerFired>) -> Self {
        Self {
            wait_timeout,
            fired,
            next_generation: 0,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Must be called from within a Tokio runtime.
    pub fn arm(&mut self, message_id: MessageId, punch_target: Option<SocketAddr>) -> TimerHandle {
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;
        let fired = self.fired.clone();
        let delay = self.wait_timeout;
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            // The loop may already be gone during shutdown.
            let _ = fired.send(TimerFired {
                message_id,
                generation,
                punch_target,
            });
        });
        TimerHandle { generation, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MESSAGE_ID_LEN;
    use tokio::sync::mpsc;

    fn target() -> SocketAddr {
        "198.51.100.4:18467".parse().unwrap()
    }

    #[test]
    fn stages_follow_punch_then_fail() {
        let first = TimerFired {
            message_id: MessageId([1; MESSAGE_ID_LEN]),
            generation: 1,
            punch_target: Some(target()),
        };
        let second = TimerFired {
            punch_target: None,
            generation: 2,
            ..first
        };
        assert_eq!(first.action(), TimeoutAction::HolePunch { target: target() });
        assert_eq!(second.action(), TimeoutAction::Fail);
        assert_eq!(
            Stage::Sent.advance(first.action()),
            Some(Stage::HolePunchAttempted)
        );
        assert_eq!(Stage::HolePunchAttempted.advance(second.action()), None);
        assert_eq!(Stage::HolePunchAttempted.advance(first.action()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_wait_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = RetryTimers::new(Duration::from_secs(5), tx);
        let id = MessageId([3; MESSAGE_ID_LEN]);
        let handle = timers.arm(id, Some(target()));

        time::sleep(Duration::from_millis(4_900)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.expect("timer fired");
        assert_eq!(fired.message_id, id);
        assert_eq!(fired.generation, handle.generation());
        assert_eq!(fired.punch_target, Some(target()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_stays_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = RetryTimers::new(Duration::from_secs(5), tx);
        let first = timers.arm(MessageId([4; MESSAGE_ID_LEN]), None);
        let second = timers.arm(MessageId([4; MESSAGE_ID_LEN]), None);
        assert_ne!(first.generation(), second.generation());
        first.cancel();
        drop(second);

        time::sleep(Duration::from_secs(11)).await;
        assert!(rx.try_recv().is_err());
    }
}
