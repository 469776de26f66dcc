use crate::{NsError, NsResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const COOKIE_HEX_LEN: usize = 8;
const MAX_KEY_HEX_LEN: usize = 16;

/// Volume ids at or above this bound do not fit the packed identity layout.
pub const PACKED_VOLUME_LIMIT: u32 = 1 << 15;
pub const PACKED_KEY_BITS: u32 = 48;

/// Identifier of one object in the blob store: storage group (volume),
/// key inside the group and the cookie guarding against key guessing.
///
/// Text form is `<volume>,<key-hex><cookie-hex8>`, e.g. `3,01637037d6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId {
    pub volume_id: u32,
    pub key: u64,
    pub cookie: u32,
}

impl BlobId {
    pub fn new(volume_id: u32, key: u64, cookie: u32) -> Self {
        Self {
            volume_id,
            key,
            cookie,
        }
    }

    /// Packs volume and key into one inode-sized integer when both fit.
    /// The result is always >= 2^48, so it never collides with the root inode,
    /// and its top bit is clear.
    pub fn packed_identity(&self) -> Option<u64> {
        if self.volume_id == 0 || self.volume_id >= PACKED_VOLUME_LIMIT {
            return None;
        }
        if self.key >> PACKED_KEY_BITS != 0 {
            return None;
        }
        Some(((self.volume_id as u64) << PACKED_KEY_BITS) | self.key)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut key_hex = format!("{:x}", self.key);
        if key_hex.len() % 2 == 1 {
            key_hex.insert(0, '0');
        }
        write!(f, "{},{}{:08x}", self.volume_id, key_hex, self.cookie)
    }
}

impl FromStr for BlobId {
    type Err = NsError;

    fn from_str(s: &str) -> NsResult<Self> {
        let (volume, rest) = s
            .split_once(',')
            .ok_or_else(|| NsError::InvalidId(format!("missing ',' in {}", s)))?;
        let volume_id = volume
            .parse::<u32>()
            .map_err(|e| NsError::InvalidId(format!("bad volume id in {}: {}", s, e)))?;
        if rest.len() <= COOKIE_HEX_LEN || !rest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(NsError::InvalidId(format!("bad key/cookie in {}", s)));
        }

        let (key_hex, cookie_hex) = rest.split_at(rest.len() - COOKIE_HEX_LEN);
        let key_hex = key_hex.trim_start_matches('0');
        if key_hex.len() > MAX_KEY_HEX_LEN {
            return Err(NsError::InvalidId(format!("key too long in {}", s)));
        }
        let key = if key_hex.is_empty() {
            0
        } else {
            u64::from_str_radix(key_hex, 16)
                .map_err(|e| NsError::InvalidId(format!("bad key in {}: {}", s, e)))?
        };
        let cookie = u32::from_str_radix(cookie_hex, 16)
            .map_err(|e| NsError::InvalidId(format!("bad cookie in {}: {}", s, e)))?;

        Ok(Self::new(volume_id, key, cookie))
    }
}

impl TryFrom<String> for BlobId {
    type Error = NsError;

    fn try_from(value: String) -> NsResult<Self> {
        value.parse()
    }
}

impl From<BlobId> for String {
    fn from(value: BlobId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blob_id() {
        let id: BlobId = "3,01637037d6".parse().unwrap();
        assert_eq!(id.volume_id, 3);
        assert_eq!(id.key, 1);
        assert_eq!(id.cookie, 0x637037d6);
        assert_eq!(id.to_string(), "3,01637037d6");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("301637037d6".parse::<BlobId>().is_err());
        assert!("x,01637037d6".parse::<BlobId>().is_err());
        assert!("3,637037d6".parse::<BlobId>().is_err());
        assert!("3,01g37037d6".parse::<BlobId>().is_err());
        assert!("3,1ffffffffffffffff637037d6".parse::<BlobId>().is_err());
    }

    #[test]
    fn test_packed_identity() {
        let id = BlobId::new(7, 0x1234, 0xdeadbeef);
        assert_eq!(id.packed_identity(), Some((7u64 << 48) | 0x1234));

        // cookie does not take part in the identity
        let same_key = BlobId::new(7, 0x1234, 1);
        assert_eq!(id.packed_identity(), same_key.packed_identity());

        assert_eq!(BlobId::new(0, 1, 0).packed_identity(), None);
        assert_eq!(BlobId::new(PACKED_VOLUME_LIMIT, 1, 0).packed_identity(), None);
        assert_eq!(BlobId::new(1, 1 << 48, 0).packed_identity(), None);
    }

    #[test]
    fn test_serde_as_string() {
        let id = BlobId::new(12, 0xabcdef, 0x01020304);
        let value = serde_json::to_value(id).unwrap();
        assert_eq!(value, serde_json::json!("12,abcdef01020304"));
        let back: BlobId = serde_json::from_value(value).unwrap();
        assert_eq!(back, id);
    }
}
