// Collaborator interfaces consumed by the RPC layer.
// Numan Thabit 2025
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use ahash::AHashMap;
use bytes::Bytes;

use crate::identity::{Guid, PeerIdentity};

/// Result alias used within transport operations.
pub type TransportResult<T, E> = Result<T, E>;

/// Outbound half of a datagram transport.
///
/// Inbound traffic reaches the RPC layer as [`Datagram`]s over a channel, so the
/// trait only covers sending.
pub trait Transport {
    /// Error type returned by the transport.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Queues `payload` for delivery to `addr`. Delivery is best effort.
    fn send(&mut self, payload: Bytes, addr: SocketAddr) -> TransportResult<(), Self::Error>;
}

/// A datagram received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Payload bytes.
    pub payload: Bytes,
    /// Address the datagram arrived from. Replies are sent here.
    pub source: SocketAddr,
}

impl Datagram {
    /// Convenience constructor.
    pub fn new(payload: impl Into<Bytes>, source: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            source,
        }
    }
}

/// Membership view used to decide whether a sender must prove its identity.
pub trait RoutingTable {
    /// Returns `true` when the peer has not been seen before.
    fn is_new_node(&self, peer: &PeerIdentity) -> bool;
}

/// Sink for peers that advertise vendor capability.
pub trait VendorStore {
    /// Records (or refreshes) a vendor peer.
    fn save_vendor(&mut self, guid: &Guid, ip: IpAddr, port: u16, signed_public_key: &[u8]);
}

/// Stored vendor contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorRecord {
    pub address: SocketAddr,
    pub signed_public_key: Bytes,
}

/// Vendor store kept in process memory, keyed by GUID.
#[derive(Debug, Default, Clone)]
pub struct MemoryVendorStore {
    vendors: AHashMap<Guid, VendorRecord>,
}

impl MemoryVendorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guid: &Guid) -> Option<&VendorRecord> {
        self.vendors.get(guid)
    }

    pub fn len(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }
}

impl VendorStore for MemoryVendorStore {
    fn save_vendor(&mut self, guid: &Guid, ip: IpAddr, port: u16, signed_public_key: &[u8]) {
        self.vendors.insert(
            *guid,
            VendorRecord {
                address: SocketAddr::new(ip, port),
                signed_public_key: Bytes::copy_from_slice(signed_public_key),
            },
        );
    }
}

impl fmt::Display for VendorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vendor@{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::GUID_LEN;

    #[test]
    fn memory_store_keeps_latest_contact() {
        let mut store = MemoryVendorStore::new();
        let guid = Guid([9; GUID_LEN]);
        store.save_vendor(&guid, "10.0.0.1".parse().unwrap(), 1000, b"old");
        store.save_vendor(&guid, "10.0.0.2".parse().unwrap(), 2000, b"new");
        assert_eq!(store.len(), 1);
        let record = store.get(&guid).expect("vendor saved");
        assert_eq!(record.address, "10.0.0.2:2000".parse().unwrap());
        assert_eq!(record.signed_public_key, Bytes::from_static(b"new"));
        assert_eq!(record.to_string(), "vendor@10.0.0.2:2000");
    }
}
