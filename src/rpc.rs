// Numan Thabit 2025
// rpc.rs - caller and callee sides of the datagram RPC protocol
//
// `RpcProtocol` owns everything that must be mutated in order: the pending-call
// registry, the retry timers and the transport's send half. It is driven by a
// single task (see `runtime`) feeding it datagrams and the events returned by
// `next_event`.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use tracing::{debug, error, warn};

use crate::{
    api::{Datagram, RoutingTable, Transport, VendorStore},
    config::RpcConfig,
    identity::{IdentityError, IdentityValidator, LocalIdentity, PeerIdentity},
    metrics::Metrics,
    registry::{CallResult, PendingResult, Registry, RegistryError},
    retry::{RetryTimers, TimeoutAction, TimerFired},
    wire::{validate_command, Envelope, MessageId, WireError, PROBE_DATAGRAM},
};

/// Command name of the built-in NAT traversal handler.
pub const HOLE_PUNCH: &str = "hole_punch";

/// Relay flag value understood by [`HOLE_PUNCH`].
const RELAY_TRUE: &str = "True";

/// Settled ids remembered so a late reply is not mistaken for a request.
const RECENT_CAPACITY: usize = 1024;

/// Boxed future returned by a registered handler.
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<Vec<String>, HandlerError>> + Send + 'static>>;

type Handler = Arc<dyn Fn(PeerIdentity, Vec<String>) -> HandlerFuture + Send + Sync>;

/// Error returned by a local handler. The request is left unanswered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Errors surfaced by [`RpcProtocol`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// Bytes did not decode, or an outbound envelope could not be encoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// The envelope belongs to the other network.
    #[error("network mismatch: local testnet={local}, envelope testnet={remote}")]
    NetworkMismatch { local: bool, remote: bool },
    /// A first-contact sender failed identity validation.
    #[error("untrusted sender: {0}")]
    Identity(#[from] IdentityError),
    /// No handler is registered under the (lowercase) command.
    #[error("no handler registered for command '{0}'")]
    UnknownCommand(String),
    /// The command name belongs to a built-in handler.
    #[error("command '{0}' is reserved")]
    ReservedCommand(String),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("transport send failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Table of local procedures callable by remote peers, keyed by lowercase name.
#[derive(Clone, Default)]
pub struct Handlers {
    table: AHashMap<String, Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async handler. Replaces any handler already under `name`.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(PeerIdentity, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<String>, HandlerError>> + Send + 'static,
    {
        let name = handler_name(name)?;
        let handler: Handler =
            Arc::new(move |sender: PeerIdentity, args: Vec<String>| -> HandlerFuture {
                Box::pin(handler(sender, args))
            });
        self.table.insert(name, handler);
        Ok(())
    }

    /// Registers a handler that completes without awaiting.
    pub fn register_sync<F>(&mut self, name: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(PeerIdentity, Vec<String>) -> Result<Vec<String>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, move |sender, args| {
            std::future::ready(handler(sender, args))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn get(&self, name: &str) -> Option<Handler> {
        self.table.get(name).cloned()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Handlers").field("names", &names).finish()
    }
}

fn handler_name(name: &str) -> Result<String, RpcError> {
    validate_command(name)?;
    let name = name.to_ascii_lowercase();
    if name == HOLE_PUNCH {
        return Err(RpcError::ReservedCommand(name));
    }
    Ok(name)
}

/// Result of issuing an outbound call.
#[derive(Debug)]
pub enum CallOutcome {
    /// A response (or the retry cycle running out) settles the call.
    Pending(PendingResult),
    /// Fire-and-forget command; nothing is tracked.
    OneWay,
}

impl CallOutcome {
    /// Waits for the call to settle. One-way calls succeed immediately with no data.
    pub async fn wait(self) -> CallResult {
        match self {
            CallOutcome::Pending(pending) => pending.await,
            CallOutcome::OneWay => CallResult {
                success: true,
                data: None,
            },
        }
    }
}

/// How an inbound datagram was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Hole-punch probe, discarded.
    Probe,
    /// Settled an outstanding call.
    Response { message_id: MessageId },
    /// Reply for a call that already settled; discarded.
    LateResponse { message_id: MessageId },
    /// Request handed to a local handler; the reply follows as a [`HandlerReply`].
    Request {
        message_id: MessageId,
        command: String,
    },
    /// Built-in hole punch served. `relayed` is set when forwarded to `target`.
    HolePunch { target: SocketAddr, relayed: bool },
}

/// Completion of a spawned handler, posted back to the owning loop.
#[derive(Debug)]
pub struct HandlerReply {
    pub message_id: MessageId,
    /// Uppercase command echoed in the response.
    pub command: String,
    /// Source address of the request datagram.
    pub reply_to: SocketAddr,
    pub elapsed: Duration,
    pub result: Result<Vec<String>, HandlerError>,
}

/// Internal work for the owning loop.
#[derive(Debug)]
pub enum ProtocolEvent {
    Timer(TimerFired),
    Reply(HandlerReply),
}

#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<MessageId>,
    seen: AHashSet<MessageId>,
}

impl RecentIds {
    fn insert(&mut self, message_id: MessageId) {
        if !self.seen.insert(message_id) {
            return;
        }
        self.order.push_back(message_id);
        if self.order.len() > RECENT_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    fn contains(&self, message_id: &MessageId) -> bool {
        self.seen.contains(message_id)
    }
}

/// The RPC dispatcher for one local node.
pub struct RpcProtocol<T, R, V> {
    local: PeerIdentity,
    config: RpcConfig,
    transport: T,
    router: R,
    vendors: V,
    handlers: Handlers,
    validator: IdentityValidator,
    registry: Registry,
    timers: RetryTimers,
    timer_rx: UnboundedReceiver<TimerFired>,
    reply_tx: UnboundedSender<HandlerReply>,
    reply_rx: UnboundedReceiver<HandlerReply>,
    recent: RecentIds,
    metrics: Arc<Metrics>,
}

impl<T, R, V> RpcProtocol<T, R, V>
where
    T: Transport,
    R: RoutingTable,
    V: VendorStore,
{
    /// Creates a dispatcher advertising `identity` at `advertised`.
    pub fn new(
        identity: &LocalIdentity,
        advertised: SocketAddr,
        config: RpcConfig,
        transport: T,
        router: R,
        vendors: V,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            local: identity.peer(advertised, false),
            validator: IdentityValidator::new(config.pow_threshold),
            timers: RetryTimers::new(config.wait_timeout, timer_tx),
            config,
            transport,
            router,
            vendors,
            handlers: Handlers::new(),
            registry: Registry::new(),
            timer_rx,
            reply_tx,
            reply_rx,
            recent: RecentIds::default(),
            metrics,
        }
    }

    /// Advertises vendor capability in outbound envelopes.
    pub fn with_vendor(mut self, vendor: bool) -> Self {
        self.local.vendor = vendor;
        self
    }

    pub fn with_handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn handlers_mut(&mut self) -> &mut Handlers {
        &mut self.handlers
    }

    /// Sender fields carried by every outbound envelope.
    pub fn local_peer(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    pub fn vendors(&self) -> &V {
        &self.vendors
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Sends `command` to `target`.
    ///
    /// [`HOLE_PUNCH`] is one-way. Every other command is tracked until a response
    /// arrives or the two-stage timeout runs out. A transport failure counts as a
    /// lost datagram: the call is still tracked and the retry cycle runs.
    pub fn call(
        &mut self,
        command: &str,
        target: SocketAddr,
        arguments: Vec<String>,
    ) -> Result<CallOutcome, RpcError> {
        let command = command.to_ascii_uppercase();
        validate_command(&command)?;

        let mut message_id = MessageId::random();
        while self.registry.contains(&message_id) || self.recent.contains(&message_id) {
            message_id = MessageId::random();
        }

        let envelope = self.envelope(message_id, command, arguments);
        let payload = envelope.encode()?;
        if self.config.noisy {
            debug!(
                %message_id,
                command = %envelope.command,
                peer = %target,
                "calling remote function"
            );
        }
        if self.send_or_drop(payload, target) {
            self.metrics
                .calls_sent
                .with_label_values(&[envelope.command.as_str()])
                .inc();
        }

        if envelope.command.eq_ignore_ascii_case(HOLE_PUNCH) {
            return Ok(CallOutcome::OneWay);
        }

        let timer = self.timers.arm(message_id, Some(target));
        let pending = self.registry.register(message_id, target, timer)?;
        self.refresh_pending_gauge();
        Ok(CallOutcome::Pending(pending))
    }

    /// Handles one inbound datagram. Errors are logged here; the caller only
    /// needs them for reporting.
    pub fn receive_datagram(&mut self, datagram: &Datagram) -> Result<Disposition, RpcError> {
        let outcome = self.dispatch(datagram);
        if let Err(err) = &outcome {
            self.log_drop(datagram.source, err);
        }
        outcome
    }

    /// Waits for the next timer expiry or handler completion.
    ///
    /// Cancel safe. Never completes while nothing is armed or running.
    pub async fn next_event(&mut self) -> ProtocolEvent {
        tokio::select! {
            biased;
            Some(reply) = self.reply_rx.recv() => ProtocolEvent::Reply(reply),
            Some(fired) = self.timer_rx.recv() => ProtocolEvent::Timer(fired),
            else => std::future::pending().await,
        }
    }

    pub fn handle_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Timer(fired) => {
                self.on_timer(fired);
            }
            ProtocolEvent::Reply(reply) => {
                // Failures are logged inside.
                let _ = self.on_handler_reply(reply);
            }
        }
    }

    /// Advances the retry state machine. Returns `None` for stale or unknown timers.
    pub fn on_timer(&mut self, fired: TimerFired) -> Option<TimeoutAction> {
        let message_id = fired.message_id;
        if !self.registry.is_current_timer(&message_id, fired.generation) {
            debug!(%message_id, generation = fired.generation, "ignoring stale timer");
            return None;
        }
        let stage = self.registry.lookup(&message_id)?.stage();
        let action = fired.action();

        match stage.advance(action) {
            Some(next) => {
                if let TimeoutAction::HolePunch { target } = action {
                    warn!(%message_id, peer = %target, "no reply, trying hole punching");
                    self.request_hole_punch(target);
                }
                let timer = self.timers.arm(message_id, None);
                if let Err(err) = self.registry.replace_timer(&message_id, timer, next) {
                    debug!(%message_id, error = %err, "call settled during escalation");
                }
            }
            None => {
                warn!(
                    %message_id,
                    wait_secs = self.timers.wait_timeout().as_secs(),
                    "no reply after hole punching; failing call"
                );
                if let Some(settled) = self.registry.resolve_failure(&message_id) {
                    debug!(%message_id, peer = %settled.target, elapsed = ?settled.elapsed, "call failed");
                    self.metrics.call_timeouts.inc();
                    self.recent.insert(message_id);
                    self.refresh_pending_gauge();
                }
            }
        }
        Some(action)
    }

    /// Sends the response for a completed handler, or logs its failure.
    pub fn on_handler_reply(&mut self, reply: HandlerReply) -> Result<(), RpcError> {
        self.metrics
            .handler_latency_seconds
            .observe(reply.elapsed.as_secs_f64());
        let HandlerReply {
            message_id,
            command,
            reply_to,
            result,
            ..
        } = reply;

        let values = match result {
            Ok(values) => values,
            Err(err) => {
                self.metrics.handler_failures.inc();
                error!(%message_id, %command, peer = %reply_to, error = %err, "handler failed; not replying");
                return Err(err.into());
            }
        };

        if self.config.noisy {
            debug!(%message_id, peer = %reply_to, "sending response");
        }
        let envelope = self.envelope(message_id, command, values);
        let sent = envelope
            .encode()
            .map_err(RpcError::from)
            .and_then(|payload| self.send(payload, reply_to));
        match sent {
            Ok(()) => {
                self.metrics
                    .requests_served
                    .with_label_values(&[envelope.command.as_str()])
                    .inc();
                Ok(())
            }
            Err(err) => {
                error!(%message_id, peer = %reply_to, error = %err, "failed to send response");
                Err(err)
            }
        }
    }

    /// Fails every outstanding call. Returns how many were settled.
    pub fn shutdown(&mut self) -> usize {
        let failed = self.registry.drain();
        self.refresh_pending_gauge();
        failed
    }

    fn dispatch(&mut self, datagram: &Datagram) -> Result<Disposition, RpcError> {
        if Envelope::is_probe(&datagram.payload) {
            return Ok(Disposition::Probe);
        }
        let envelope = Envelope::decode(&datagram.payload)?;
        if envelope.testnet != self.config.testnet {
            return Err(RpcError::NetworkMismatch {
                local: self.config.testnet,
                remote: envelope.testnet,
            });
        }

        let Envelope {
            message_id,
            sender,
            command,
            arguments,
            ..
        } = envelope;

        if self.router.is_new_node(&sender) {
            self.validator.validate_peer(&sender)?;
        }
        if sender.vendor {
            self.vendors.save_vendor(
                &sender.guid,
                sender.address.ip(),
                sender.address.port(),
                &sender.signed_public_key,
            );
        }

        if self.registry.contains(&message_id) {
            return Ok(self.accept_response(message_id, arguments, &sender));
        }
        if self.recent.contains(&message_id) {
            self.metrics.late_responses.inc();
            debug!(%message_id, peer = %sender, "late response ignored");
            return Ok(Disposition::LateResponse { message_id });
        }
        self.accept_request(message_id, command, arguments, sender, datagram.source)
    }

    fn accept_response(
        &mut self,
        message_id: MessageId,
        data: Vec<String>,
        sender: &PeerIdentity,
    ) -> Disposition {
        if self.config.noisy {
            debug!(%message_id, peer = %sender, "received response");
        }
        if let Some(settled) = self.registry.resolve_success(&message_id, data) {
            self.metrics.responses_matched.inc();
            self.metrics
                .call_latency_seconds
                .observe(settled.elapsed.as_secs_f64());
            self.recent.insert(message_id);
            self.refresh_pending_gauge();
        }
        Disposition::Response { message_id }
    }

    fn accept_request(
        &mut self,
        message_id: MessageId,
        command: String,
        arguments: Vec<String>,
        sender: PeerIdentity,
        reply_to: SocketAddr,
    ) -> Result<Disposition, RpcError> {
        let name = command.to_ascii_lowercase();
        if self.config.noisy {
            debug!(%message_id, peer = %sender, command = %command.to_ascii_uppercase(), "received request");
        }
        if name == HOLE_PUNCH {
            return self.serve_hole_punch(&sender, &arguments);
        }

        let handler = self
            .handlers
            .get(&name)
            .ok_or_else(|| RpcError::UnknownCommand(name.clone()))?;
        let future = handler(sender, arguments);
        let replies = self.reply_tx.clone();
        let command = command.to_ascii_uppercase();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = future.await;
            // The receiver lives as long as the protocol.
            let _ = replies.send(HandlerReply {
                message_id,
                command,
                reply_to,
                elapsed: started.elapsed(),
                result,
            });
        });
        Ok(Disposition::Request {
            message_id,
            command: name,
        })
    }

    /// Arguments `(ip, port, relay = "False")`. Never replies.
    fn serve_hole_punch(
        &mut self,
        sender: &PeerIdentity,
        arguments: &[String],
    ) -> Result<Disposition, RpcError> {
        let (target, relay) = parse_hole_punch(arguments)?;
        if relay {
            let introduce = vec![
                sender.address.ip().to_string(),
                sender.address.port().to_string(),
            ];
            self.call(HOLE_PUNCH, target, introduce)?;
            self.metrics.hole_punches_relayed.inc();
        } else {
            if self.config.noisy {
                debug!(peer = %target, "punching through NAT");
            }
            if self.send_or_drop(Bytes::from_static(PROBE_DATAGRAM), target) {
                self.metrics.probes_sent.inc();
            }
        }
        Ok(Disposition::HolePunch {
            target,
            relayed: relay,
        })
    }

    fn request_hole_punch(&mut self, target: SocketAddr) {
        let arguments = vec![
            target.ip().to_string(),
            target.port().to_string(),
            RELAY_TRUE.to_owned(),
        ];
        let rendezvous = self.config.rendezvous;
        match self.call(HOLE_PUNCH, rendezvous, arguments) {
            Ok(_) => self.metrics.hole_punches_sent.inc(),
            Err(err) => warn!(peer = %rendezvous, error = %err, "hole punch request failed"),
        }
    }

    fn envelope(&self, message_id: MessageId, command: String, arguments: Vec<String>) -> Envelope {
        Envelope {
            message_id,
            sender: self.local.clone(),
            command,
            arguments,
            testnet: self.config.testnet,
        }
    }

    fn send(&mut self, payload: impl Into<Bytes>, addr: SocketAddr) -> Result<(), RpcError> {
        self.transport
            .send(payload.into(), addr)
            .map_err(|err| RpcError::Transport(Box::new(err)))
    }

    /// Sends without failing the caller; a transport error is logged as loss.
    fn send_or_drop(&mut self, payload: impl Into<Bytes>, addr: SocketAddr) -> bool {
        match self.send(payload, addr) {
            Ok(()) => true,
            Err(err) => {
                warn!(peer = %addr, error = %err, "send failed; treating datagram as lost");
                false
            }
        }
    }

    fn refresh_pending_gauge(&self) {
        self.metrics.pending_calls.set(self.registry.len() as i64);
    }

    fn log_drop(&self, source: SocketAddr, err: &RpcError) {
        match err {
            RpcError::Wire(_) => {
                self.metrics.malformed_drops.inc();
                warn!(peer = %source, error = %err, "received unknown message, ignoring");
            }
            RpcError::NetworkMismatch { .. } => {
                self.metrics.network_mismatches.inc();
                warn!(peer = %source, error = %err, "received message with incorrect network parameters");
            }
            RpcError::Identity(_) => {
                self.metrics.identity_rejections.inc();
                warn!(peer = %source, error = %err, "received message from sender with invalid GUID, ignoring");
            }
            RpcError::UnknownCommand(_) => {
                self.metrics.unknown_commands.inc();
                error!(peer = %source, error = %err, "no callable handler; ignoring request");
            }
            _ => warn!(peer = %source, error = %err, "dropping inbound message"),
        }
    }
}

impl<T, R, V> fmt::Debug for RpcProtocol<T, R, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcProtocol")
            .field("local", &self.local)
            .field("testnet", &self.config.testnet)
            .field("pending", &self.registry.len())
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

fn parse_hole_punch(arguments: &[String]) -> Result<(SocketAddr, bool), HandlerError> {
    let (ip, port, relay) = match arguments {
        [ip, port] => (ip, port, false),
        [ip, port, relay] => (ip, port, relay.as_str() == RELAY_TRUE),
        _ => {
            return Err(HandlerError::InvalidArguments(format!(
                "hole_punch takes 2 or 3 arguments, got {}",
                arguments.len()
            )))
        }
    };
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| HandlerError::InvalidArguments(format!("bad ip '{ip}'")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| HandlerError::InvalidArguments(format!("bad port '{port}'")))?;
    Ok((SocketAddr::new(ip, port), relay))
}
