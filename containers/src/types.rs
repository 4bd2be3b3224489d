use ethereum_types::H256;
use hex::FromHex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Block height.
pub type Height = u32;

/// Cumulative difficulty-weighted work.
pub type Weight = u128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Bytes32(pub H256);

impl Bytes32 {
    pub fn zero() -> Self {
        Bytes32(H256::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// SHA-256 of an arbitrary byte string.
    pub fn sha256(data: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(data).into();
        Bytes32(H256::from(digest))
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Bytes32(H256::from(bytes))
    }
}

impl FromStr for Bytes32 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 32] = <[u8; 32]>::from_hex(s.trim_start_matches("0x"))?;
        Ok(Bytes32(H256::from(bytes)))
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.as_bytes()))
    }
}

/// Incremental SHA-256 over the fixed-width little-endian encoding of
/// consensus fields. Every hashed container feeds its fields in declaration
/// order, so two containers hash equal iff their fields are equal.
#[derive(Default)]
pub struct HashWriter(Sha256);

impl HashWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.0.update([value]);
        self
    }

    pub fn bool(self, value: bool) -> Self {
        self.u8(value as u8)
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.0.update(value.to_le_bytes());
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.0.update(value.to_le_bytes());
        self
    }

    pub fn u128(mut self, value: u128) -> Self {
        self.0.update(value.to_le_bytes());
        self
    }

    pub fn bytes32(mut self, value: &Bytes32) -> Self {
        self.0.update(value.as_bytes());
        self
    }

    pub fn opt_bytes32(self, value: Option<&Bytes32>) -> Self {
        match value {
            Some(value) => self.u8(1).bytes32(value),
            None => self.u8(0),
        }
    }

    pub fn opt_u64(self, value: Option<u64>) -> Self {
        match value {
            Some(value) => self.u8(1).u64(value),
            None => self.u8(0),
        }
    }

    /// Length-prefixed byte string.
    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value);
        self
    }

    pub fn finish(self) -> Bytes32 {
        let digest: [u8; 32] = self.0.finalize().into();
        Bytes32::from(digest)
    }
}
