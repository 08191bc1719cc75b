//! Tokio runtime scaffolding for driving an [`RpcProtocol`].
//!
//! One task owns the protocol and serialises everything that touches it: calls
//! queued through an [`RpcHandle`], inbound datagrams, retry timers and handler
//! completions. `spawn_rpc` is the entry point for launching that task.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Receiver, Sender},
        oneshot,
    },
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    api::{Datagram, RoutingTable, Transport, VendorStore},
    registry::CallResult,
    rpc::{CallOutcome, Disposition, RpcError, RpcProtocol},
};

/// Configuration parameters for the event loop task.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Capacity of the command channel used between the handle and the task.
    pub command_buffer: usize,
    /// Capacity of the event channel surfaced to the caller.
    pub event_buffer: usize,
    /// Grace period allowed for the task to stop during [`RpcHandle::shutdown`].
    pub shutdown_grace: Duration,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the command channel capacity.
    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity.max(1);
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Sets the grace period used when shutting down the task.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn normalize(&mut self) {
        if self.command_buffer == 0 {
            self.command_buffer = 1;
        }
        if self.event_buffer == 0 {
            self.event_buffer = 1;
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_buffer: 512,
            event_buffer: 1024,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Reason why the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStopReason {
    /// Explicit [`RpcHandle::shutdown`].
    Shutdown,
    /// Every handle was dropped.
    CommandChannelClosed,
    /// The inbound datagram source went away.
    InboundClosed,
}

/// Events emitted by a running event loop.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A datagram was accepted.
    Inbound {
        source: SocketAddr,
        disposition: Disposition,
    },
    /// A datagram was dropped. Already logged.
    Dropped { source: SocketAddr, error: RpcError },
    /// The task finished; `failed_calls` outstanding calls were failed.
    Stopped {
        reason: RpcStopReason,
        failed_calls: usize,
    },
}

/// Errors returned by [`RpcHandle`].
#[derive(Debug, Error)]
pub enum RpcHandleError {
    #[error("rpc runtime channel closed")]
    ChannelClosed,
    #[error("rpc runtime command channel is full")]
    CommandQueueFull,
    #[error("rpc runtime stopped unexpectedly")]
    ActorStopped,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("rpc runtime join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("rpc runtime shutdown timed out")]
    ShutdownTimeout,
}

enum RpcCommand {
    Call {
        command: String,
        target: SocketAddr,
        arguments: Vec<String>,
        reply: oneshot::Sender<Result<CallOutcome, RpcError>>,
    },
    Pending(oneshot::Sender<usize>),
    Shutdown,
}

/// Handle used to interact with a spawned event loop.
#[derive(Debug, Clone)]
pub struct RpcHandle {
    commands: Sender<RpcCommand>,
    join: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    config: Arc<RuntimeConfig>,
}

impl RpcHandle {
    /// Returns the runtime configuration associated with the task.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Calls `command` on `target` and waits for the call to settle.
    ///
    /// Timeouts are reported as a failed [`CallResult`], not as an error. One-way
    /// commands settle immediately with no data.
    pub async fn call(
        &self,
        command: &str,
        target: SocketAddr,
        arguments: Vec<String>,
    ) -> Result<CallResult, RpcHandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .try_send(RpcCommand::Call {
                command: command.to_owned(),
                target,
                arguments,
                reply: tx,
            })
            .map_err(|err| match err {
                TrySendError::Closed(_) => RpcHandleError::ChannelClosed,
                TrySendError::Full(_) => RpcHandleError::CommandQueueFull,
            })?;
        let outcome = rx.await.map_err(|_| RpcHandleError::ActorStopped)??;
        Ok(outcome.wait().await)
    }

    /// Number of outstanding calls.
    pub async fn pending_calls(&self) -> Result<usize, RpcHandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RpcCommand::Pending(tx))
            .await
            .map_err(|_| RpcHandleError::ChannelClosed)?;
        rx.await.map_err(|_| RpcHandleError::ActorStopped)
    }

    /// Signals the task to terminate and waits for it within the grace period.
    ///
    /// Outstanding calls resolve as failures.
    pub async fn shutdown(self) -> Result<(), RpcHandleError> {
        let RpcHandle {
            commands,
            join,
            config,
        } = self;

        commands
            .send(RpcCommand::Shutdown)
            .await
            .map_err(|_| RpcHandleError::ChannelClosed)?;

        let join = match join.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // Another clone already waited for the task.
        let Some(join) = join else {
            return Ok(());
        };

        if config.shutdown_grace.is_zero() {
            join.await?;
            return Ok(());
        }

        match time::timeout(config.shutdown_grace, join).await {
            Ok(result) => result.map_err(RpcHandleError::Join),
            Err(_) => Err(RpcHandleError::ShutdownTimeout),
        }
    }
}

/// Spawns the event loop for `protocol`, fed by `inbound` datagrams.
pub fn spawn_rpc<T, R, V>(
    protocol: RpcProtocol<T, R, V>,
    inbound: Receiver<Datagram>,
    mut config: RuntimeConfig,
) -> (RpcHandle, Receiver<RuntimeEvent>)
where
    T: Transport + Send + 'static,
    R: RoutingTable + Send + 'static,
    V: VendorStore + Send + 'static,
{
    config.normalize();
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
    let config = Arc::new(config);

    let join = tokio::spawn(run_rpc(protocol, command_rx, inbound, event_tx));
    let handle = RpcHandle {
        commands: command_tx,
        join: Arc::new(std::sync::Mutex::new(Some(join))),
        config,
    };
    (handle, event_rx)
}

async fn run_rpc<T, R, V>(
    mut protocol: RpcProtocol<T, R, V>,
    mut commands: Receiver<RpcCommand>,
    mut inbound: Receiver<Datagram>,
    events: Sender<RuntimeEvent>,
) where
    T: Transport + Send + 'static,
    R: RoutingTable + Send + 'static,
    V: VendorStore + Send + 'static,
{
    let reason = loop {
        let control = tokio::select! {
            biased;
            maybe_cmd = commands.recv() => match maybe_cmd {
                Some(cmd) => handle_command(&mut protocol, cmd),
                None => LoopControl::Break(RpcStopReason::CommandChannelClosed),
            },
            event = protocol.next_event() => {
                protocol.handle_event(event);
                LoopControl::Continue
            }
            maybe_datagram = inbound.recv() => match maybe_datagram {
                Some(datagram) => {
                    let event = match protocol.receive_datagram(&datagram) {
                        Ok(disposition) => RuntimeEvent::Inbound {
                            source: datagram.source,
                            disposition,
                        },
                        Err(error) => RuntimeEvent::Dropped {
                            source: datagram.source,
                            error,
                        },
                    };
                    push_event(&events, event);
                    LoopControl::Continue
                }
                None => LoopControl::Break(RpcStopReason::InboundClosed),
            },
        };

        if let LoopControl::Break(reason) = control {
            break reason;
        }
    };

    let failed_calls = protocol.shutdown();
    debug!(?reason, failed_calls, "rpc runtime stopped");
    push_event(
        &events,
        RuntimeEvent::Stopped {
            reason,
            failed_calls,
        },
    );
}

enum LoopControl {
    Continue,
    Break(RpcStopReason),
}

/// Events are advisory: a full or closed channel never stalls the loop.
fn push_event(events: &Sender<RuntimeEvent>, event: RuntimeEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(?event, "runtime event channel full; dropping event");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

fn handle_command<T, R, V>(protocol: &mut RpcProtocol<T, R, V>, command: RpcCommand) -> LoopControl
where
    T: Transport,
    R: RoutingTable,
    V: VendorStore,
{
    match command {
        RpcCommand::Call {
            command,
            target,
            arguments,
            reply,
        } => {
            let outcome = protocol.call(&command, target, arguments);
            // The caller may have given up waiting.
            let _ = reply.send(outcome);
            LoopControl::Continue
        }
        RpcCommand::Pending(reply) => {
            let _ = reply.send(protocol.pending_calls());
            LoopControl::Continue
        }
        RpcCommand::Shutdown => LoopControl::Break(RpcStopReason::Shutdown),
    }
}
