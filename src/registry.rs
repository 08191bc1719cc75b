// Numan Thabit 2025
// registry.rs - outstanding request tracking keyed by message id
use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use ahash::AHashMap;
use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    retry::{Stage, TimerHandle},
    wire::MessageId,
};

/// Outcome delivered to the caller of an outbound RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    /// `true` when a response arrived.
    pub success: bool,
    /// Response values; `None` on failure.
    pub data: Option<Vec<String>>,
}

impl CallResult {
    pub fn success(data: Vec<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            data: None,
        }
    }
}

/// Future resolving to the [`CallResult`] of an outstanding call.
///
/// Resolves to a failure if the event loop goes away before the call is settled.
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<CallResult>,
}

impl Future for PendingResult {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| CallResult::failure()))
    }
}

/// Registry errors. These indicate misuse rather than network conditions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("message id {0} already outstanding")]
    Duplicate(MessageId),
    #[error("message id {0} is not outstanding")]
    Unknown(MessageId),
}

/// Book-keeping for one in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    result: oneshot::Sender<CallResult>,
    timer: TimerHandle,
    target: SocketAddr,
    stage: Stage,
    issued_at: Instant,
}

impl PendingCall {
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn timer_generation(&self) -> u64 {
        self.timer.generation()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.issued_at)
    }
}

/// Details of a settled call, returned for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub target: SocketAddr,
    pub stage: Stage,
    pub elapsed: Duration,
}

/// Owns every [`PendingCall`]. Lives on the event loop; not shared.
#[derive(Debug, Default)]
pub struct Registry {
    entries: AHashMap<MessageId, PendingCall>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new entry guarded by `timer`.
    pub fn register(
        &mut self,
        message_id: MessageId,
        target: SocketAddr,
        timer: TimerHandle,
    ) -> Result<PendingResult, RegistryError> {
        if self.entries.contains_key(&message_id) {
            timer.cancel();
            return Err(RegistryError::Duplicate(message_id));
        }
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            message_id,
            PendingCall {
                result: tx,
                timer,
                target,
                stage: Stage::Sent,
                issued_at: Instant::now(),
            },
        );
        Ok(PendingResult { rx })
    }

    pub fn lookup(&self, message_id: &MessageId) -> Option<&PendingCall> {
        self.entries.get(message_id)
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Returns `true` when `generation` belongs to the entry's active timer.
    pub fn is_current_timer(&self, message_id: &MessageId, generation: u64) -> bool {
        self.entries
            .get(message_id)
            .map(|call| call.timer.generation() == generation)
            .unwrap_or(false)
    }

    /// Swaps the active timer, cancelling the previous one, and records the new stage.
    pub fn replace_timer(
        &mut self,
        message_id: &MessageId,
        timer: TimerHandle,
        stage: Stage,
    ) -> Result<(), RegistryError> {
        match self.entries.get_mut(message_id) {
            Some(call) => {
                let previous = std::mem::replace(&mut call.timer, timer);
                previous.cancel();
                call.stage = stage;
                Ok(())
            }
            None => {
                timer.cancel();
                Err(RegistryError::Unknown(*message_id))
            }
        }
    }

    /// Completes the call with `data`. Returns `None` for unknown ids.
    pub fn resolve_success(&mut self, message_id: &MessageId, data: Vec<String>) -> Option<Settled> {
        self.settle(message_id, CallResult::success(data))
    }

    /// Fails the call. Returns `None` for unknown ids.
    pub fn resolve_failure(&mut self, message_id: &MessageId) -> Option<Settled> {
        self.settle(message_id, CallResult::failure())
    }

    /// Fails every outstanding call, returning how many were settled.
    pub fn drain(&mut self) -> usize {
        let ids: Vec<MessageId> = self.entries.keys().copied().collect();
        ids.iter()
            .filter(|id| self.resolve_failure(id).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn settle(&mut self, message_id: &MessageId, outcome: CallResult) -> Option<Settled> {
        let call = self.entries.remove(message_id)?;
        call.timer.cancel();
        let settled = Settled {
            target: call.target,
            stage: call.stage,
            elapsed: call.issued_at.elapsed(),
        };
        // The caller may have stopped waiting.
        let _ = call.result.send(outcome);
        Some(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryTimers;
    use crate::wire::MESSAGE_ID_LEN;
    use tokio::sync::mpsc;

    fn target() -> SocketAddr {
        "203.0.113.9:18467".parse().unwrap()
    }

    fn timers() -> (RetryTimers, mpsc::UnboundedReceiver<crate::retry::TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RetryTimers::new(Duration::from_secs(5), tx), rx)
    }

    #[tokio::test]
    async fn success_delivers_exact_data_once() {
        let (mut timers, _rx) = timers();
        let mut registry = Registry::new();
        let id = MessageId([1; MESSAGE_ID_LEN]);
        let pending = registry
            .register(id, target(), timers.arm(id, Some(target())))
            .unwrap();

        let data = vec!["a".to_string(), "b".to_string()];
        let settled = registry.resolve_success(&id, data.clone()).unwrap();
        assert_eq!(settled.target, target());
        assert_eq!(settled.stage, Stage::Sent);
        assert!(registry.resolve_failure(&id).is_none());
        assert!(registry.is_empty());
        assert_eq!(pending.await, CallResult::success(data));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (mut timers, _rx) = timers();
        let mut registry = Registry::new();
        let id = MessageId([2; MESSAGE_ID_LEN]);
        let _pending = registry
            .register(id, target(), timers.arm(id, Some(target())))
            .unwrap();
        let err = registry
            .register(id, target(), timers.arm(id, Some(target())))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(id));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_timer_cancels_previous_generation() {
        let (mut timers, mut rx) = timers();
        let mut registry = Registry::new();
        let id = MessageId([3; MESSAGE_ID_LEN]);
        let _pending = registry
            .register(id, target(), timers.arm(id, Some(target())))
            .unwrap();
        let first_generation = registry.lookup(&id).unwrap().timer_generation();

        registry
            .replace_timer(&id, timers.arm(id, None), Stage::HolePunchAttempted)
            .unwrap();
        assert!(!registry.is_current_timer(&id, first_generation));
        assert_eq!(registry.lookup(&id).unwrap().stage(), Stage::HolePunchAttempted);

        let fired = rx.recv().await.expect("second timer fires");
        assert!(registry.is_current_timer(&id, fired.generation));
        assert_eq!(fired.punch_target, None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn replace_on_unknown_id_fails() {
        let (mut timers, _rx) = timers();
        let mut registry = Registry::new();
        let id = MessageId([4; MESSAGE_ID_LEN]);
        assert_eq!(
            registry.replace_timer(&id, timers.arm(id, None), Stage::HolePunchAttempted),
            Err(RegistryError::Unknown(id))
        );
        assert!(!registry.is_current_timer(&id, 1));
    }

    #[tokio::test]
    async fn drain_fails_everything() {
        let (mut timers, _rx) = timers();
        let mut registry = Registry::new();
        let mut results = Vec::new();
        for n in 0..3u8 {
            let id = MessageId([n; MESSAGE_ID_LEN]);
            results.push(
                registry
                    .register(id, target(), timers.arm(id, Some(target())))
                    .unwrap(),
            );
        }
        assert_eq!(registry.drain(), 3);
        assert!(registry.is_empty());
        for pending in results {
            assert_eq!(pending.await, CallResult::failure());
        }
    }

    #[tokio::test]
    async fn dropped_registry_fails_pending_result() {
        let (mut timers, _rx) = timers();
        let id = MessageId([5; MESSAGE_ID_LEN]);
        let pending = {
            let mut registry = Registry::new();
            registry
                .register(id, target(), timers.arm(id, Some(target())))
                .unwrap()
        };
        assert_eq!(pending.await, CallResult::failure());
    }
}
