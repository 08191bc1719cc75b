// Wire format: RPC envelope carried as a version byte plus TLV records.
// Numan Thabit 2025

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;

use crate::identity::{Guid, PeerIdentity, GUID_LEN};

/// Envelope format version.
pub const WIRE_VERSION: u8 = 1;

/// Alignment for TLV records (bytes).
pub const TLV_ALIGN: usize = 4;

/// Length of a message identifier.
pub const MESSAGE_ID_LEN: usize = 20;

/// Datagram sent to open a NAT binding. Never decoded as an envelope.
pub const PROBE_DATAGRAM: &[u8] = b" ";

/// Longest accepted command token.
pub const MAX_COMMAND_LEN: usize = 64;

const TLV_HEADER_LEN: usize = 3; // type (u8) + length (u16)

/// Wire-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than required.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Unsupported envelope version.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    /// TLV length exceeds encoding range.
    #[error("tlv value length {len} exceeds u16 range for type {type_id}")]
    InvalidTlvLength { type_id: u8, len: usize },

    /// TLV padding would overflow or extend past buffer.
    #[error("tlv for type {type_id} exceeds buffer")]
    TlvOutOfBounds { type_id: u8 },

    /// Duplicate TLV encountered when a unique one was expected.
    #[error("duplicate tlv type {type_id}")]
    DuplicateTlv { type_id: u8 },

    /// Encountered malformed TLV (e.g., non-zero length for END).
    #[error("malformed tlv type {type_id}: {reason}")]
    MalformedTlv { type_id: u8, reason: &'static str },

    /// Missing required END TLV terminator.
    #[error("missing END tlv terminator")]
    MissingEndTlv,

    /// Bytes remained after the END terminator.
    #[error("{0} trailing bytes after END tlv")]
    TrailingBytes(usize),

    /// A required envelope field was absent.
    #[error("missing required field {0}")]
    MissingField(&'static str),

    /// A fixed-size field had the wrong length.
    #[error("field {field} must be {expected} bytes, got {actual}")]
    InvalidFieldLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A text field was not UTF-8.
    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(&'static str),

    /// Sender address could not be parsed.
    #[error("invalid sender ip {0:?}")]
    InvalidAddress(String),

    /// Command token is empty, too long, or contains characters outside `[A-Za-z0-9_]`.
    #[error("invalid command token {0:?}")]
    InvalidCommand(String),
}

/// Correlation key shared by a request and its response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl MessageId {
    /// Draws a fresh random identifier.
    pub fn random() -> Self {
        let mut raw = [0u8; MESSAGE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(raw)
    }

    /// Builds an identifier from exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; MESSAGE_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    /// Returns the raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// Logical RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Correlation key.
    pub message_id: MessageId,
    /// Identity the sender claims.
    pub sender: PeerIdentity,
    /// Uppercase command token, e.g. `FIND_NODE`.
    pub command: String,
    /// Call arguments or response values, order preserved.
    pub arguments: Vec<String>,
    /// Network the sender runs on.
    pub testnet: bool,
}

impl Envelope {
    /// Serialises the envelope.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        validate_command(&self.command)?;

        let ip = self.sender.address.ip().to_string();
        let capacity = 1
            + self.sender.signed_public_key.len()
            + self.arguments.iter().map(|arg| arg.len() + 8).sum::<usize>()
            + 128;
        let mut builder = TlvBuilder::with_capacity(capacity);
        builder
            .push(TlvType::MessageId, self.message_id.as_bytes())?
            .push(TlvType::SenderGuid, self.sender.guid.as_bytes())?
            .push(TlvType::SenderIp, ip.as_bytes())?
            .push(TlvType::SenderPort, &self.sender.address.port().to_be_bytes())?
            .push(TlvType::SenderKey, &self.sender.signed_public_key)?
            .push(TlvType::SenderVendor, &[u8::from(self.sender.vendor)])?
            .push(TlvType::Command, self.command.as_bytes())?;
        for argument in &self.arguments {
            builder.push(TlvType::Argument, argument.as_bytes())?;
        }
        builder.push(TlvType::Testnet, &[u8::from(self.testnet)])?;
        let tlvs = builder.finish()?;

        let mut out = Vec::with_capacity(1 + tlvs.len());
        out.push(WIRE_VERSION);
        out.extend_from_slice(&tlvs);
        Ok(out)
    }

    /// Parses an envelope, rejecting anything malformed or incomplete.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (&version, tlv_bytes) = bytes.split_first().ok_or(WireError::BufferTooShort {
            expected: 1,
            actual: 0,
        })?;
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let mut fields = RawFields::default();
        let mut cursor = TlvCursor::new(tlv_bytes);
        let mut terminated = false;
        for item in cursor.by_ref() {
            let tlv = item?;
            match tlv.kind() {
                Some(TlvType::End) => {
                    terminated = true;
                    break;
                }
                Some(TlvType::Argument) => fields.arguments.push(tlv.value),
                Some(kind) => fields.set_unique(kind, tlv)?,
                // Unknown records from newer peers are skipped.
                None => {}
            }
        }
        if !terminated {
            return Err(WireError::MissingEndTlv);
        }
        let trailing = tlv_bytes.len() - cursor.consumed_len();
        if trailing != 0 {
            return Err(WireError::TrailingBytes(trailing));
        }

        fields.into_envelope()
    }

    /// Returns `true` for the bare hole-punch probe.
    pub fn is_probe(bytes: &[u8]) -> bool {
        bytes == PROBE_DATAGRAM
    }
}

/// Checks that a command token is non-empty, bounded, and limited to `[A-Za-z0-9_]`.
pub fn validate_command(command: &str) -> Result<(), WireError> {
    let well_formed = !command.is_empty()
        && command.len() <= MAX_COMMAND_LEN
        && command
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if well_formed {
        Ok(())
    } else {
        Err(WireError::InvalidCommand(command.to_owned()))
    }
}

#[derive(Default)]
struct RawFields<'a> {
    message_id: Option<&'a [u8]>,
    guid: Option<&'a [u8]>,
    ip: Option<&'a [u8]>,
    port: Option<&'a [u8]>,
    key: Option<&'a [u8]>,
    vendor: Option<&'a [u8]>,
    command: Option<&'a [u8]>,
    testnet: Option<&'a [u8]>,
    arguments: Vec<&'a [u8]>,
}

impl<'a> RawFields<'a> {
    fn set_unique(&mut self, kind: TlvType, tlv: Tlv<'a>) -> Result<(), WireError> {
        let slot = match kind {
            TlvType::MessageId => &mut self.message_id,
            TlvType::SenderGuid => &mut self.guid,
            TlvType::SenderIp => &mut self.ip,
            TlvType::SenderPort => &mut self.port,
            TlvType::SenderKey => &mut self.key,
            TlvType::SenderVendor => &mut self.vendor,
            TlvType::Command => &mut self.command,
            TlvType::Testnet => &mut self.testnet,
            TlvType::End | TlvType::Argument => return Ok(()),
        };
        if slot.replace(tlv.value).is_some() {
            return Err(WireError::DuplicateTlv {
                type_id: tlv.type_id,
            });
        }
        Ok(())
    }

    fn into_envelope(self) -> Result<Envelope, WireError> {
        let message_id = self.message_id.ok_or(WireError::MissingField("message_id"))?;
        let message_id = MessageId::from_slice(message_id).ok_or(WireError::InvalidFieldLength {
            field: "message_id",
            expected: MESSAGE_ID_LEN,
            actual: message_id.len(),
        })?;

        let guid = self.guid.ok_or(WireError::MissingField("sender.guid"))?;
        let guid = Guid::from_slice(guid).ok_or(WireError::InvalidFieldLength {
            field: "sender.guid",
            expected: GUID_LEN,
            actual: guid.len(),
        })?;

        let ip = utf8(self.ip.ok_or(WireError::MissingField("sender.ip"))?, "sender.ip")?;
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| WireError::InvalidAddress(ip.to_owned()))?;

        let port = self.port.ok_or(WireError::MissingField("sender.port"))?;
        let port: [u8; 2] = port.try_into().map_err(|_| WireError::InvalidFieldLength {
            field: "sender.port",
            expected: 2,
            actual: port.len(),
        })?;

        let key = self.key.ok_or(WireError::MissingField("sender.signed_public_key"))?;

        let command = utf8(self.command.ok_or(WireError::MissingField("command"))?, "command")?;
        validate_command(command)?;

        let arguments = self
            .arguments
            .into_iter()
            .map(|arg| utf8(arg, "arguments").map(str::to_owned))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Envelope {
            message_id,
            sender: PeerIdentity {
                guid,
                address: SocketAddr::new(ip, u16::from_be_bytes(port)),
                signed_public_key: Bytes::copy_from_slice(key),
                vendor: flag(self.vendor, TlvType::SenderVendor)?,
            },
            command: command.to_owned(),
            arguments,
            testnet: flag(self.testnet, TlvType::Testnet)?,
        })
    }
}

fn utf8<'a>(value: &'a [u8], field: &'static str) -> Result<&'a str, WireError> {
    std::str::from_utf8(value).map_err(|_| WireError::InvalidUtf8(field))
}

fn flag(value: Option<&[u8]>, kind: TlvType) -> Result<bool, WireError> {
    match value {
        None | Some([0]) => Ok(false),
        Some([1]) => Ok(true),
        Some(_) => Err(WireError::MalformedTlv {
            type_id: kind as u8,
            reason: "flag must be a single 0 or 1 byte",
        }),
    }
}

/// TLV type identifiers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    End = 0,
    MessageId = 1,
    SenderGuid = 2,
    SenderIp = 3,
    SenderPort = 4,
    SenderKey = 5,
    SenderVendor = 6,
    Command = 7,
    Argument = 8,
    Testnet = 9,
}

impl TlvType {
    fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(TlvType::End),
            1 => Some(TlvType::MessageId),
            2 => Some(TlvType::SenderGuid),
            3 => Some(TlvType::SenderIp),
            4 => Some(TlvType::SenderPort),
            5 => Some(TlvType::SenderKey),
            6 => Some(TlvType::SenderVendor),
            7 => Some(TlvType::Command),
            8 => Some(TlvType::Argument),
            9 => Some(TlvType::Testnet),
            _ => None,
        }
    }
}

/// Parsed TLV view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// Raw type identifier.
    pub type_id: u8,
    /// Value bytes.
    pub value: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Returns the enum variant when known.
    pub fn kind(&self) -> Option<TlvType> {
        TlvType::from_raw(self.type_id)
    }
}

/// Cursor over TLV records. Stops after END or the first error.
pub struct TlvCursor<'a> {
    buf: &'a [u8],
    offset: usize,
    finished: bool,
}

impl<'a> TlvCursor<'a> {
    /// Creates a TLV cursor from the provided buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            finished: false,
        }
    }

    /// Returns total bytes consumed so far.
    pub fn consumed_len(&self) -> usize {
        self.offset
    }

    fn fail(&mut self, err: WireError) -> Option<Result<Tlv<'a>, WireError>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for TlvCursor<'a> {
    type Item = Result<Tlv<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let buf = self.buf;
        let rest = &buf[self.offset..];
        if rest.is_empty() {
            self.finished = true;
            return None;
        }
        if rest.len() < TLV_HEADER_LEN {
            return self.fail(WireError::MissingEndTlv);
        }

        let type_id = rest[0];
        let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        let Some(total_len) = align_tlv_len(len) else {
            return self.fail(WireError::InvalidTlvLength { type_id, len });
        };
        if total_len > rest.len() {
            return self.fail(WireError::TlvOutOfBounds { type_id });
        }
        if type_id == TlvType::End as u8 && len != 0 {
            return self.fail(WireError::MalformedTlv {
                type_id,
                reason: "END must have zero length",
            });
        }

        let value = &rest[TLV_HEADER_LEN..TLV_HEADER_LEN + len];
        self.offset += total_len;
        if type_id == TlvType::End as u8 {
            self.finished = true;
        }
        Some(Ok(Tlv { type_id, value }))
    }
}

fn align_tlv_len(value_len: usize) -> Option<usize> {
    let base = TLV_HEADER_LEN.checked_add(value_len)?;
    let remainder = base % TLV_ALIGN;
    if remainder == 0 {
        Some(base)
    } else {
        base.checked_add(TLV_ALIGN - remainder)
    }
}

/// Builder for TLV-encoded sections.
#[derive(Debug, Default, Clone)]
pub struct TlvBuilder {
    buf: Vec<u8>,
    finished: bool,
}

impl TlvBuilder {
    /// Creates a new TLV builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            finished: false,
        }
    }

    /// Adds a TLV with the provided value bytes.
    pub fn push(&mut self, kind: TlvType, value: &[u8]) -> Result<&mut Self, WireError> {
        self.push_raw(kind as u8, value)
    }

    /// Adds a TLV with a raw type identifier.
    pub fn push_raw(&mut self, type_id: u8, value: &[u8]) -> Result<&mut Self, WireError> {
        if self.finished {
            return Err(WireError::MalformedTlv {
                type_id,
                reason: "TLV builder finished",
            });
        }
        if type_id == TlvType::End as u8 && !value.is_empty() {
            return Err(WireError::MalformedTlv {
                type_id,
                reason: "END TLV must have empty value",
            });
        }
        let too_long = WireError::InvalidTlvLength {
            type_id,
            len: value.len(),
        };
        let declared = u16::try_from(value.len()).map_err(|_| too_long.clone())?;
        let padded = align_tlv_len(value.len()).ok_or(too_long)?;

        self.buf.push(type_id);
        self.buf.extend_from_slice(&declared.to_be_bytes());
        self.buf.extend_from_slice(value);
        self.buf
            .resize(self.buf.len() + padded - TLV_HEADER_LEN - value.len(), 0);
        if type_id == TlvType::End as u8 {
            self.finished = true;
        }
        Ok(self)
    }

    /// Ensures an END TLV terminator is present and returns the encoded bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, WireError> {
        if !self.finished {
            self.push(TlvType::End, &[])?;
        }
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sender() -> PeerIdentity {
        PeerIdentity {
            guid: Guid([0x42; GUID_LEN]),
            address: "192.0.2.7:18467".parse().unwrap(),
            signed_public_key: Bytes::from_static(&[0xAB; 96]),
            vendor: true,
        }
    }

    fn envelope(arguments: Vec<String>) -> Envelope {
        Envelope {
            message_id: MessageId([7; MESSAGE_ID_LEN]),
            sender: sender(),
            command: "FIND_NODE".into(),
            arguments,
            testnet: false,
        }
    }

    fn raw_envelope(build: impl FnOnce(&mut TlvBuilder)) -> Vec<u8> {
        let mut builder = TlvBuilder::new();
        build(&mut builder);
        let mut out = vec![WIRE_VERSION];
        out.extend_from_slice(&builder.finish().unwrap());
        out
    }

    fn required(builder: &mut TlvBuilder) {
        builder
            .push(TlvType::MessageId, &[1; MESSAGE_ID_LEN])
            .unwrap()
            .push(TlvType::SenderGuid, &[2; GUID_LEN])
            .unwrap()
            .push(TlvType::SenderIp, b"::1")
            .unwrap()
            .push(TlvType::SenderPort, &[0x1F, 0x90])
            .unwrap()
            .push(TlvType::SenderKey, &[3; 96])
            .unwrap()
            .push(TlvType::Command, b"PING")
            .unwrap();
    }

    #[test]
    fn decodes_minimal_envelope_with_default_flags() {
        let bytes = raw_envelope(required);
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.sender.address, "[::1]:8080".parse().unwrap());
        assert_eq!(decoded.command, "PING");
        assert!(decoded.arguments.is_empty());
        assert!(!decoded.testnet);
        assert!(!decoded.sender.vendor);
    }

    #[test]
    fn argument_order_survives_encoding() {
        let args: Vec<String> = ["b", "", "a", "ünï", "42"].iter().map(|s| s.to_string()).collect();
        let original = envelope(args.clone());
        let decoded = Envelope::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.arguments, args);
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_records_are_skipped() {
        let bytes = raw_envelope(|b| {
            required(b);
            b.push_raw(200, b"future").unwrap();
        });
        assert!(Envelope::decode(&bytes).is_ok());
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let bytes = raw_envelope(|b| {
            required(b);
            b.push(TlvType::Command, b"PING").unwrap();
        });
        assert_eq!(
            Envelope::decode(&bytes),
            Err(WireError::DuplicateTlv {
                type_id: TlvType::Command as u8
            })
        );
    }

    #[test]
    fn missing_field_is_rejected() {
        let bytes = raw_envelope(|b| {
            b.push(TlvType::MessageId, &[1; MESSAGE_ID_LEN]).unwrap();
        });
        assert_eq!(
            Envelope::decode(&bytes),
            Err(WireError::MissingField("sender.guid"))
        );
    }

    #[test]
    fn short_message_id_is_rejected() {
        let bytes = raw_envelope(|b| {
            b.push(TlvType::MessageId, &[1; 8]).unwrap();
        });
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(WireError::InvalidFieldLength {
                field: "message_id",
                actual: 8,
                ..
            })
        ));
    }

    #[test]
    fn rejects_bad_version_truncation_and_trailing_bytes() {
        let mut bytes = envelope(vec!["x".into()]).encode().unwrap();

        let mut wrong_version = bytes.clone();
        wrong_version[0] = 9;
        assert_eq!(
            Envelope::decode(&wrong_version),
            Err(WireError::UnsupportedVersion(9))
        );

        let truncated = &bytes[..bytes.len() - TLV_ALIGN];
        assert_eq!(Envelope::decode(truncated), Err(WireError::MissingEndTlv));

        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(Envelope::decode(&bytes), Err(WireError::TrailingBytes(4)));

        assert!(matches!(
            Envelope::decode(&[]),
            Err(WireError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn rejects_garbage_ip_and_command() {
        let bad_ip = raw_envelope(|b| {
            b.push(TlvType::MessageId, &[1; MESSAGE_ID_LEN])
                .unwrap()
                .push(TlvType::SenderGuid, &[2; GUID_LEN])
                .unwrap()
                .push(TlvType::SenderIp, b"not-an-ip")
                .unwrap();
        });
        assert_eq!(
            Envelope::decode(&bad_ip),
            Err(WireError::InvalidAddress("not-an-ip".into()))
        );

        let mut bad_command = envelope(Vec::new());
        bad_command.command = "find node".into();
        assert!(matches!(
            bad_command.encode(),
            Err(WireError::InvalidCommand(_))
        ));
    }

    #[test]
    fn probe_is_recognised() {
        assert!(Envelope::is_probe(PROBE_DATAGRAM));
        assert!(!Envelope::is_probe(b"  "));
        assert!(Envelope::decode(PROBE_DATAGRAM).is_err());
    }

    #[test]
    fn oversized_argument_is_rejected() {
        let huge = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            envelope(vec![huge]).encode(),
            Err(WireError::InvalidTlvLength { .. })
        ));
    }

    #[test]
    fn message_ids_are_random() {
        assert_ne!(MessageId::random(), MessageId::random());
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = Envelope::decode(&bytes);
        }

        #[test]
        fn arguments_keep_order(args in prop::collection::vec(".{0,24}", 0..12)) {
            let original = envelope(args.clone());
            let decoded = Envelope::decode(&original.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded.arguments, args);
        }
    }
}
