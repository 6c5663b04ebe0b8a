//! 64-byte identifier types used throughout the vault core.
//!
//! A PMID, a chunk name, and an account name are all SHA-512 digests, but
//! mixing them up is a real category error (e.g. looking a chunk up in the
//! account table). [`Id64<K>`] carries a zero-sized marker type so the three
//! kinds cannot be substituted for one another at compile time, while still
//! sharing one implementation of hex formatting, XOR distance, and CBOR
//! encoding.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use std::marker::PhantomData;

/// Raw byte length of every identifier in this system.
pub const ID_LEN: usize = 64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier must be {ID_LEN} bytes, got {0}")]
    WrongLength(usize),
}

/// Marker for [`Id64`] specializations. Not constructible.
pub trait IdKind {
    const LABEL: &'static str;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PmidKind;
impl IdKind for PmidKind {
    const LABEL: &'static str = "pmid";
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkNameKind;
impl IdKind for ChunkNameKind {
    const LABEL: &'static str = "chunk";
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AccountNameKind;
impl IdKind for AccountNameKind {
    const LABEL: &'static str = "account";
}

/// A 64-byte identifier specialized by marker type `K`.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Id64<K> {
    bytes: [u8; ID_LEN],
    #[serde(skip)]
    _kind: PhantomData<K>,
}

pub type Pmid = Id64<PmidKind>;
pub type ChunkName = Id64<ChunkNameKind>;
pub type AccountName = Id64<AccountNameKind>;

impl<K> Id64<K> {
    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Self {
            bytes,
            _kind: PhantomData,
        }
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, IdError> {
        if slice.len() != ID_LEN {
            return Err(IdError::WrongLength(slice.len()));
        }
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(slice);
        Ok(Self::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// XOR distance between two identifiers of the same kind, used by the
    /// overlay collaborator (§4.10) to rank candidates around a key.
    pub fn xor_distance(&self, other: &Self) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.bytes[i] ^ other.bytes[i];
        }
        out
    }
}

impl<K: IdKind> Id64<K> {
    pub fn from_hash(data: &[u8]) -> Self {
        let digest = Sha512::digest(data);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&digest);
        Self::new(bytes)
    }
}

impl AccountName {
    /// `account_name = SHA-512(pmid || "ACCOUNT")` (§3, GLOSSARY).
    pub fn of(pmid: &Pmid) -> Self {
        let mut input = Vec::with_capacity(ID_LEN + 7);
        input.extend_from_slice(pmid.as_bytes());
        input.extend_from_slice(b"ACCOUNT");
        AccountName::from_hash(&input)
    }
}

impl<K> PartialEq for Id64<K> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}
impl<K> Eq for Id64<K> {}

impl<K> PartialOrd for Id64<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for Id64<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl<K> std::hash::Hash for Id64<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl<K: IdKind> fmt::Debug for Id64<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", K::LABEL, &self.to_hex()[..16])
    }
}

impl<K> fmt::Display for Id64<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
