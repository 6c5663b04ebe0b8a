//! Pure validation of identity, signed sizes, and store contracts (§4.1).
//!
//! A PMID is only ever trustworthy if it is the SHA-512 of a public key
//! together with a signature the key holder made over its own public key.
//! Everything in this module is a pure function of its inputs: no I/O, no
//! shared state, no async.

use crate::id::Pmid;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha512};
use thiserror::Error;

/// A PMID that always validates, used by requests that carry no signer
/// identity (anonymous reads such as `GetChunk`). 64 bytes of `0xff`.
pub const ANONYMOUS_PMID: [u8; 64] = [0xff; 64];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("node id does not match SHA-512(public_key || pk_signature)")]
    IdentityMismatch,
    #[error("public key signature does not verify")]
    SignatureInvalid,
    #[error("signed size does not verify")]
    SizeSignatureInvalid,
    #[error("store contract result was not Ack")]
    ContractNotAcked,
    #[error("store contract holder and client pmid must differ")]
    SelfContract,
}

/// A self-certified Ed25519 keypair: `pk_signature = Sign(sk, pk)`, so the
/// PMID `SHA-512(pk || pk_signature)` is verifiable by anyone holding only
/// the public parts.
pub struct SelfCertifiedKey {
    pkcs8: Vec<u8>,
    pub public_key: Vec<u8>,
    pub pk_signature: Vec<u8>,
    pub pmid: Pmid,
}

impl SelfCertifiedKey {
    /// Generate a fresh identity keypair (used by `vaultd init`).
    pub fn generate() -> Result<Self, ring::error::Unspecified> {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)?;
        Self::from_pkcs8(pkcs8.as_ref().to_vec())
    }

    pub fn from_pkcs8(pkcs8: Vec<u8>) -> Result<Self, ring::error::Unspecified> {
        let keypair = Ed25519KeyPair::from_pkcs8(&pkcs8)?;
        let public_key = keypair.public_key().as_ref().to_vec();
        let pk_signature = keypair.sign(&public_key).as_ref().to_vec();
        let pmid = pmid_of(&public_key, &pk_signature);
        Ok(Self {
            pkcs8,
            public_key,
            pk_signature,
            pmid,
        })
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let keypair = Ed25519KeyPair::from_pkcs8(&self.pkcs8)
            .expect("pkcs8 bytes were validated at construction");
        keypair.sign(message).as_ref().to_vec()
    }

    pub fn pkcs8_bytes(&self) -> &[u8] {
        &self.pkcs8
    }
}

/// `node_id == SHA-512(public_key || pk_signature)`.
pub fn pmid_of(public_key: &[u8], pk_signature: &[u8]) -> Pmid {
    let mut hasher = Sha512::new();
    hasher.update(public_key);
    hasher.update(pk_signature);
    Pmid::from_hash(&hasher.finalize())
}

fn ed25519_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(message, signature)
        .is_ok()
}

/// `validate_identity(id, public_key, pk_signature)`.
///
/// Checks `id == SHA-512(public_key || pk_signature)` and that
/// `pk_signature` is `public_key`'s own signature over itself.
pub fn validate_identity(id: &Pmid, public_key: &[u8], pk_signature: &[u8]) -> bool {
    if pmid_of(public_key, pk_signature) != *id {
        return false;
    }
    ed25519_verify(public_key, public_key, pk_signature)
}

/// A client-signed claim about a chunk's size, carried on `StorePrep`,
/// `AddToWatchList`, `DeleteChunk`, and `AmendAccount`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignedSize {
    pub data_size: u64,
    pub pmid_of_client: Pmid,
    pub public_key: Vec<u8>,
    pub pk_signature: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedSize {
    pub fn sign(key: &SelfCertifiedKey, data_size: u64) -> Self {
        let signature = key.sign(data_size.to_string().as_bytes());
        Self {
            data_size,
            pmid_of_client: key.pmid,
            public_key: key.public_key.clone(),
            pk_signature: key.pk_signature.clone(),
            signature,
        }
    }
}

/// `validate_signed_size(s)`: identity valid AND `Verify(pk, signature,
/// ascii(size))`.
pub fn validate_signed_size(s: &SignedSize) -> bool {
    if !validate_identity(&s.pmid_of_client, &s.public_key, &s.pk_signature) {
        return false;
    }
    ed25519_verify(
        &s.public_key,
        s.data_size.to_string().as_bytes(),
        &s.signature,
    )
}

/// RPC result code (§6.1): the only two user-visible outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RpcResult {
    Ack,
    Nack,
}

/// §3.4: doubly-signed record proving a holder agreed to store a chunk.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InnerContract {
    pub result: RpcResult,
    pub signed_size: SignedSize,
}

impl InnerContract {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .expect("InnerContract serialization is infallible for in-memory buffers");
        bytes
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreContract {
    pub pmid_of_holder: Pmid,
    pub public_key: Vec<u8>,
    pub public_key_signature: Vec<u8>,
    pub inner_contract: InnerContract,
    /// Outer signature: holder's signature over the canonical bytes of
    /// `inner_contract`.
    pub outer_signature: Vec<u8>,
}

impl StoreContract {
    pub fn sign(holder: &SelfCertifiedKey, inner_contract: InnerContract) -> Self {
        let outer_signature = holder.sign(&inner_contract.canonical_bytes());
        Self {
            pmid_of_holder: holder.pmid,
            public_key: holder.public_key.clone(),
            public_key_signature: holder.pk_signature.clone(),
            outer_signature,
            inner_contract,
        }
    }
}

/// `validate_store_contract(sc)`: identity valid AND inner-signature valid
/// AND `inner.result = Ack` AND inner signed-size valid AND
/// `outer.pmid != inner.signed_size.pmid` (a holder cannot contract to
/// store for itself).
pub fn validate_store_contract(sc: &StoreContract) -> Result<(), IdentityError> {
    if !validate_identity(
        &sc.pmid_of_holder,
        &sc.public_key,
        &sc.public_key_signature,
    ) {
        return Err(IdentityError::IdentityMismatch);
    }
    if !ed25519_verify(
        &sc.public_key,
        &sc.inner_contract.canonical_bytes(),
        &sc.outer_signature,
    ) {
        return Err(IdentityError::SignatureInvalid);
    }
    if sc.inner_contract.result != RpcResult::Ack {
        return Err(IdentityError::ContractNotAcked);
    }
    if !validate_signed_size(&sc.inner_contract.signed_size) {
        return Err(IdentityError::SizeSignatureInvalid);
    }
    if sc.pmid_of_holder == sc.inner_contract.signed_size.pmid_of_client {
        return Err(IdentityError::SelfContract);
    }
    Ok(())
}

/// `validate_signed_request(pk, pks, request_sig, key, signer_id)`: identity
/// valid AND `Verify(pk, request_sig, SHA-512(pk || pks || key))`. The
/// anonymous PMID always validates.
pub fn validate_signed_request(
    public_key: &[u8],
    pk_signature: &[u8],
    request_signature: &[u8],
    key: &[u8],
    signer_id: &Pmid,
) -> bool {
    if signer_id.as_bytes() == &ANONYMOUS_PMID {
        return true;
    }
    if !validate_identity(signer_id, public_key, pk_signature) {
        return false;
    }
    let mut hasher = Sha512::new();
    hasher.update(public_key);
    hasher.update(pk_signature);
    hasher.update(key);
    let digest = hasher.finalize();
    ed25519_verify(public_key, &digest, request_signature)
}
