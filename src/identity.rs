// Self-certifying peer identities and the GUID proof-of-work gate.
// Numan Thabit 2025

use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use ed25519_dalek::{
    Signature, Signer, SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use thiserror::Error;

/// Length of a peer GUID in bytes.
pub const GUID_LEN: usize = 20;

/// Minimum length of a signed public key (`signature || public key`).
pub const SIGNED_KEY_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;

/// Proof-of-work threshold carried by the network: the first six hex digits of the
/// second digest half must be strictly below this value.
pub const DEFAULT_POW_THRESHOLD: u32 = 50;

/// Largest threshold expressible in six hex digits, plus one.
pub const MAX_POW_THRESHOLD: u32 = 0x0100_0000;

const GUID_HEX_LEN: usize = GUID_LEN * 2;
const POW_FIELD_START: usize = 64;
const POW_DIGITS: usize = 6;

/// 20-byte self-certifying peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(pub [u8; GUID_LEN]);

impl Guid {
    /// Builds a GUID from a slice, returning `None` unless it is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; GUID_LEN] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    /// Returns the raw GUID bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; GUID_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.to_hex())
    }
}

/// Identity of a remote peer as claimed by the sender fields of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Claimed GUID.
    pub guid: Guid,
    /// Address the peer advertises for itself.
    pub address: SocketAddr,
    /// `signature || public key`, signed by the key it carries.
    pub signed_public_key: Bytes,
    /// Whether the peer offers vendor services.
    pub vendor: bool,
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.guid, self.address)
    }
}

/// Reasons an identity is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Too few bytes to hold a signature and a verification key.
    #[error("signed public key too short: expected at least {expected} bytes, got {actual}")]
    KeyTooShort { expected: usize, actual: usize },
    /// The trailing 32 bytes are not a valid Ed25519 point.
    #[error("malformed verification key")]
    MalformedKey,
    /// The signature does not cover the key under itself.
    #[error("signature over public key did not verify")]
    BadSignature,
    /// The digest does not carry enough work.
    #[error("proof of work {value:#08x} does not meet threshold {threshold}")]
    InsufficientWork { value: u32, threshold: u32 },
    /// The GUID is not derived from the key digest.
    #[error("guid {claimed} does not match key digest prefix {expected}")]
    GuidMismatch { claimed: String, expected: String },
    /// The digest string was not 128 hex characters.
    #[error("malformed key digest")]
    MalformedDigest,
}

/// Checks claimed identities against their signed public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityValidator {
    pow_threshold: u32,
}

impl IdentityValidator {
    /// Creates a validator requiring proof of work strictly below `pow_threshold`.
    pub const fn new(pow_threshold: u32) -> Self {
        Self { pow_threshold }
    }

    /// Returns the configured proof-of-work threshold.
    pub const fn pow_threshold(&self) -> u32 {
        self.pow_threshold
    }

    /// Validates a claimed identity.
    pub fn validate(&self, guid: &Guid, signed_public_key: &[u8]) -> Result<(), IdentityError> {
        verify_self_signed(signed_public_key)?;
        let digest = key_digest(signed_public_key);
        self.check_digest(guid, &digest)
    }

    /// Convenience wrapper over [`IdentityValidator::validate`].
    pub fn validate_peer(&self, peer: &PeerIdentity) -> Result<(), IdentityError> {
        self.validate(&peer.guid, &peer.signed_public_key)
    }

    /// Applies the proof-of-work and GUID derivation rules to a hex digest.
    pub fn check_digest(&self, guid: &Guid, digest_hex: &str) -> Result<(), IdentityError> {
        let value = pow_value(digest_hex).ok_or(IdentityError::MalformedDigest)?;
        if value >= self.pow_threshold {
            return Err(IdentityError::InsufficientWork {
                value,
                threshold: self.pow_threshold,
            });
        }

        let expected = digest_hex
            .get(..GUID_HEX_LEN)
            .ok_or(IdentityError::MalformedDigest)?;
        let claimed = guid.to_hex();
        if claimed != expected {
            return Err(IdentityError::GuidMismatch {
                claimed,
                expected: expected.to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for IdentityValidator {
    fn default() -> Self {
        Self::new(DEFAULT_POW_THRESHOLD)
    }
}

/// Lowercase hex SHA-512 digest of a signed public key.
pub fn key_digest(signed_public_key: &[u8]) -> String {
    hex::encode(Sha512::digest(signed_public_key))
}

/// Integer value of the first six hex digits of the second digest half.
pub fn pow_value(digest_hex: &str) -> Option<u32> {
    if digest_hex.len() != 128 || !digest_hex.is_ascii() {
        return None;
    }
    let field = digest_hex.get(POW_FIELD_START..POW_FIELD_START + POW_DIGITS)?;
    u32::from_str_radix(field, 16).ok()
}

fn verify_self_signed(signed_public_key: &[u8]) -> Result<(), IdentityError> {
    if signed_public_key.len() < SIGNED_KEY_LEN {
        return Err(IdentityError::KeyTooShort {
            expected: SIGNED_KEY_LEN,
            actual: signed_public_key.len(),
        });
    }

    let key_start = signed_public_key.len() - PUBLIC_KEY_LENGTH;
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = signed_public_key[key_start..]
        .try_into()
        .map_err(|_| IdentityError::MalformedKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| IdentityError::MalformedKey)?;

    let (signature, message) = signed_public_key.split_at(SIGNATURE_LENGTH);
    let signature = Signature::from_slice(signature).map_err(|_| IdentityError::BadSignature)?;
    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| IdentityError::BadSignature)
}

/// The local node's signing identity.
#[derive(Clone)]
pub struct LocalIdentity {
    signing_key: SigningKey,
    signed_public_key: Bytes,
    guid: Guid,
}

impl LocalIdentity {
    /// Derives the signed public key and GUID for `signing_key`.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let public = signing_key.verifying_key().to_bytes();
        let signature = signing_key.sign(&public);

        let mut signed = Vec::with_capacity(SIGNED_KEY_LEN);
        signed.extend_from_slice(&signature.to_bytes());
        signed.extend_from_slice(&public);

        let digest = Sha512::digest(&signed);
        let mut guid = [0u8; GUID_LEN];
        guid.copy_from_slice(&digest[..GUID_LEN]);

        Self {
            signing_key,
            signed_public_key: Bytes::from(signed),
            guid: Guid(guid),
        }
    }

    /// Restores an identity from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    /// Searches random keys until one satisfies the proof-of-work gate.
    ///
    /// At the network threshold this takes a few hundred thousand attempts.
    pub fn mine(pow_threshold: u32) -> Self {
        let mut rng = OsRng;
        loop {
            let candidate = Self::from_signing_key(SigningKey::generate(&mut rng));
            if candidate.meets_work(pow_threshold) {
                return candidate;
            }
        }
    }

    /// Returns `true` when the key digest carries enough work for `pow_threshold`.
    pub fn meets_work(&self, pow_threshold: u32) -> bool {
        pow_value(&key_digest(&self.signed_public_key))
            .map(|value| value < pow_threshold)
            .unwrap_or(false)
    }

    /// Returns the GUID derived from the signed key.
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Returns `signature || public key`.
    pub fn signed_public_key(&self) -> &Bytes {
        &self.signed_public_key
    }

    /// Returns the Ed25519 verification key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Builds the sender fields advertised in outbound envelopes.
    pub fn peer(&self, address: SocketAddr, vendor: bool) -> PeerIdentity {
        PeerIdentity {
            guid: self.guid,
            address,
            signed_public_key: self.signed_public_key.clone(),
            vendor,
        }
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}
