// udprpc: request/response RPC over datagrams with self-certifying peers.
// Numan Thabit 2025

pub mod config;

pub mod identity;

pub mod wire;

pub mod registry;

pub mod retry;

pub mod api;

pub mod rpc;

pub mod runtime;

pub mod io;

pub mod metrics;

pub use config::{
    Config, ConfigError, NetworkName, NetworkParams, Networks, RpcConfig, RpcSettings,
};

pub use identity::{
    key_digest, pow_value, Guid, IdentityError, IdentityValidator, LocalIdentity, PeerIdentity,
    DEFAULT_POW_THRESHOLD, GUID_LEN, SIGNED_KEY_LEN,
};

pub use wire::{
    validate_command, Envelope, MessageId, Tlv, TlvBuilder, TlvCursor, TlvType, WireError,
    MESSAGE_ID_LEN, PROBE_DATAGRAM, TLV_ALIGN, WIRE_VERSION,
};

pub use registry::{CallResult, PendingResult, Registry, RegistryError};

pub use retry::{RetryTimers, Stage, TimeoutAction, TimerFired, TimerHandle};

pub use api::{
    Datagram, MemoryVendorStore, RoutingTable, Transport, TransportResult, VendorRecord,
    VendorStore,
};

pub use rpc::{
    CallOutcome, Disposition, HandlerError, HandlerFuture, HandlerReply, Handlers, ProtocolEvent,
    RpcError, RpcProtocol, HOLE_PUNCH,
};

pub use runtime::{
    spawn_rpc, RpcHandle, RpcHandleError, RpcStopReason, RuntimeConfig, RuntimeEvent,
};

pub use io::{UdpError, UdpTransport};

pub use metrics::{Metrics, MetricsError};
