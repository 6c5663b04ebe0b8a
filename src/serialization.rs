//! CBOR serialization for wire messages and on-disk state.
//!
//! Per §6.2 / §6.6: RPC payloads, persisted accounts, and chunk-info entries
//! all use CBOR (compact, deterministic, cross-language) rather than JSON.

use crate::id::Pmid;
use crate::identity::validate_signed_request;
use ciborium::{from_reader, into_writer};
use serde::{Deserialize, Serialize};
use std::io;

/// Serialization error type.
#[derive(Debug)]
pub enum SerializationError {
    /// CBOR encoding error.
    Cbor(ciborium::ser::Error<io::Error>),
    /// CBOR decoding error, or any other IO-adjacent failure.
    Io(io::Error),
}

impl From<ciborium::ser::Error<io::Error>> for SerializationError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        SerializationError::Cbor(err)
    }
}

impl From<ciborium::de::Error<io::Error>> for SerializationError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        SerializationError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("CBOR deserialization error: {:?}", err),
        ))
    }
}

impl From<io::Error> for SerializationError {
    fn from(err: io::Error) -> Self {
        SerializationError::Io(err)
    }
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializationError::Cbor(e) => write!(f, "CBOR error: {:?}", e),
            SerializationError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for SerializationError {}

/// Trait for types that can be serialized to/from CBOR bytes.
pub trait CborSerializable: Serialize + for<'de> Deserialize<'de> {
    fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        let mut bytes = Vec::new();
        into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        from_reader(bytes).map_err(Into::into)
    }

    /// Serialize to canonical CBOR bytes for deterministic hashing (e.g.
    /// signing a `StoreContract`'s inner contract, §3.4).
    fn to_canonical_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        // TODO: switch to ciborium::value::CanonicalValue once map-key
        // ordering lands there; all of this crate's CBOR payloads are
        // currently struct-shaped (field order is serde's declaration
        // order), so standard encoding is already deterministic for them.
        self.to_bytes()
    }
}

/// Wraps every RPC request/response payload of §6.1 with the shared
/// identity envelope (`public_key`, `public_key_signature`,
/// `request_signature`, `pmid_of_signer`) so each payload type only carries
/// its own semantic fields. `VaultService`'s methods take already-verified
/// payloads (its own doc comment calls it "the receiving end... already
/// deserialized and identity-checked"); a transport layer unwraps one of
/// these, calls [`RequestEnvelope::verify`], and only then dispatches into
/// `VaultService`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope<T> {
    pub public_key: Vec<u8>,
    pub public_key_signature: Vec<u8>,
    pub request_signature: Vec<u8>,
    pub pmid_of_signer: Pmid,
    pub payload: T,
}

impl<T> RequestEnvelope<T> {
    pub fn new(
        signer: &crate::identity::SelfCertifiedKey,
        payload: T,
        signing_key: &[u8],
    ) -> Self {
        use sha2::{Digest, Sha512};
        let mut hasher = Sha512::new();
        hasher.update(&signer.public_key);
        hasher.update(&signer.pk_signature);
        hasher.update(signing_key);
        let digest = hasher.finalize();
        Self {
            public_key: signer.public_key.clone(),
            public_key_signature: signer.pk_signature.clone(),
            request_signature: signer.sign(&digest),
            pmid_of_signer: signer.pmid,
            payload,
        }
    }

    /// Checks the envelope's identity and request signature over
    /// `signing_key` (typically the chunk name or account name the
    /// payload concerns), per §6.1's `validate_signed_request`.
    pub fn verify(&self, signing_key: &[u8]) -> bool {
        validate_signed_request(
            &self.public_key,
            &self.public_key_signature,
            &self.request_signature,
            signing_key,
            &self.pmid_of_signer,
        )
    }
}

impl<T: Serialize + for<'de> Deserialize<'de>> CborSerializable for RequestEnvelope<T> {}
