use std::fmt;

use rand::Rng as _;

use crate::error::DhtError;

/// Identifier width in bytes (160 bits).
pub const KUID_LENGTH: usize = 20;

/// Identifier width in bits.
pub const KUID_BITS: usize = KUID_LENGTH * 8;

/// A 160-bit identifier under the XOR metric. Used for node ids,
/// value keys and message ids alike.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kuid(pub [u8; KUID_LENGTH]);

impl Kuid {
    pub fn random() -> Self {
        let mut id = [0u8; KUID_LENGTH];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != KUID_LENGTH {
            return Err(DhtError::InvalidKuid);
        }
        let mut id = [0u8; KUID_LENGTH];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; KUID_LENGTH] {
        &self.0
    }

    pub fn distance(&self, other: &Kuid) -> [u8; KUID_LENGTH] {
        let mut dist = [0u8; KUID_LENGTH];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Index of the first bit in which `self` and `other` differ,
    /// i.e. the length of their common prefix. Equal ids map to the
    /// last bucket.
    pub fn bucket_index(&self, other: &Kuid) -> usize {
        let dist = self.distance(other);

        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                let leading = byte.leading_zeros() as usize;
                return i * 8 + leading;
            }
        }

        KUID_BITS - 1
    }

    /// Bit `i` counted from the most significant end.
    pub fn bit(&self, i: usize) -> bool {
        let byte = self.0[i / 8];
        byte & (0x80 >> (i % 8)) != 0
    }

    /// A random id sharing the first `depth` bits with `prefix`. Used
    /// to aim refresh lookups into a specific bucket's range.
    pub fn random_within(prefix: &Kuid, depth: usize) -> Self {
        let mut id = Kuid::random().0;

        let full_bytes = depth / 8;
        id[..full_bytes].copy_from_slice(&prefix.0[..full_bytes]);

        let rem = depth % 8;
        if rem > 0 {
            let keep = 0xFFu8 << (8 - rem);
            id[full_bytes] = (prefix.0[full_bytes] & keep) | (id[full_bytes] & !keep);
        }

        Self(id)
    }
}

impl fmt::Debug for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kuid({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
