//! Cache element value model and its arena encoding
//!
//! Binary format: [4 bytes: flags][8 bytes: expire][8 bytes: stored_at]
//! [8 bytes: cas_unique][1 byte: blocked][8 bytes: blocked_until][N bytes: data]
//!
//! The key is not part of the encoding; it lives in the bucket chain entry.
//!
//! Expiry rules (memcached-compatible):
//! - 0 = never expire
//! - magnitude < 2592000 (30 days) = seconds relative to `stored_at`
//! - otherwise = absolute Unix timestamp

use crate::StorageError;
use crate::storage::Key;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expire values below this magnitude are relative offsets (30 days in seconds)
pub const THIRTY_DAYS: i64 = 2_592_000;

const HEADER_LEN: usize = 4 + 8 + 8 + 8 + 1 + 8;

/// One cached value with its memcached metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheElement {
    pub key: Key,
    /// Opaque client flags
    pub flags: u32,
    /// Expiry as sent by the client, see module docs
    pub expire: i64,
    /// Unix time the element was created, base for relative expiry
    pub stored_at: i64,
    pub data: Vec<u8>,
    /// Version stamp; 0 on incoming writes means "no CAS check"
    pub cas_unique: u64,
    /// Provisionally deleted until `blocked_until`
    pub blocked: bool,
    pub blocked_until: i64,
}

impl CacheElement {
    /// Create a new element stamped with the current time
    pub fn new(key: impl Into<Key>, flags: u32, expire: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            flags,
            expire,
            stored_at: current_timestamp(),
            data: data.into(),
            cas_unique: 0,
            blocked: false,
            blocked_until: 0,
        }
    }

    /// Absolute Unix time at which the element expires, `None` if never
    pub fn expires_at(&self) -> Option<i64> {
        resolve_expiry(self.expire, self.stored_at)
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Mark the element as deleted for reads until `until` (absolute time)
    pub fn block(&mut self, until: i64) {
        self.blocked = true;
        self.blocked_until = until;
    }

    /// Blocked and still inside the hold window
    pub fn is_blocked_at(&self, now: i64) -> bool {
        self.blocked && now < self.blocked_until
    }

    /// Whether the element should be physically removed: it has expired, or
    /// its delayed-delete hold has passed.
    pub fn should_purge_at(&self, now: i64) -> bool {
        self.is_expired_at(now) || (self.blocked && now >= self.blocked_until)
    }

    /// Readable by clients at `now`
    pub fn is_live_at(&self, now: i64) -> bool {
        !self.should_purge_at(now) && !self.is_blocked_at(now)
    }

    /// New element with `other`'s data after this element's data.
    ///
    /// Flags, expiry and creation time are kept from `self`; the CAS value is
    /// reset for the caller to assign.
    pub fn append(&self, other: &CacheElement) -> CacheElement {
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        self.with_data(data)
    }

    /// New element with `other`'s data before this element's data
    pub fn prepend(&self, other: &CacheElement) -> CacheElement {
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&other.data);
        data.extend_from_slice(&self.data);
        self.with_data(data)
    }

    /// Increment (positive `delta`) or decrement (negative) the decimal
    /// payload, saturating at 0 and `u64::MAX`.
    pub fn add(&self, delta: i64) -> Result<(CacheElement, u64), StorageError> {
        let current = self.as_u64()?;
        let value = if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        let mut buf = itoa::Buffer::new();
        let updated = self.with_data(buf.format(value).as_bytes().to_vec());
        Ok((updated, value))
    }

    /// Parse the payload as a base-10 unsigned integer
    pub fn as_u64(&self) -> Result<u64, StorageError> {
        let s = std::str::from_utf8(&self.data).map_err(|_| StorageError::NotANumber)?;
        s.trim_end_matches([' ', '\r', '\n'])
            .parse::<u64>()
            .map_err(|_| StorageError::NotANumber)
    }

    fn with_data(&self, data: Vec<u8>) -> CacheElement {
        CacheElement {
            key: self.key.clone(),
            flags: self.flags,
            expire: self.expire,
            stored_at: self.stored_at,
            data,
            cas_unique: 0,
            blocked: false,
            blocked_until: 0,
        }
    }

    /// Bytes needed to store this element in an arena
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.expire.to_le_bytes());
        buf.extend_from_slice(&self.stored_at.to_le_bytes());
        buf.extend_from_slice(&self.cas_unique.to_le_bytes());
        buf.push(u8::from(self.blocked));
        buf.extend_from_slice(&self.blocked_until.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(key: Key, bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() < HEADER_LEN {
            return Err(StorageError::Decoding(format!(
                "element of {} bytes is shorter than the {HEADER_LEN} byte header",
                bytes.len()
            )));
        }

        let (flags, rest) = bytes.split_at(4);
        let (expire, rest) = rest.split_at(8);
        let (stored_at, rest) = rest.split_at(8);
        let (cas_unique, rest) = rest.split_at(8);
        let (blocked, rest) = rest.split_at(1);
        let (blocked_until, data) = rest.split_at(8);

        Ok(Self {
            key,
            flags: u32::from_le_bytes(fixed(flags)?),
            expire: i64::from_le_bytes(fixed(expire)?),
            stored_at: i64::from_le_bytes(fixed(stored_at)?),
            data: data.to_vec(),
            cas_unique: u64::from_le_bytes(fixed(cas_unique)?),
            blocked: blocked[0] != 0,
            blocked_until: i64::from_le_bytes(fixed(blocked_until)?),
        })
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], StorageError> {
    bytes
        .try_into()
        .map_err(|_| StorageError::Decoding(format!("expected {N} bytes")))
}

/// Resolve a client expire value against the time the element was stored
pub fn resolve_expiry(expire: i64, stored_at: i64) -> Option<i64> {
    if expire == 0 {
        None
    } else if expire.unsigned_abs() < THIRTY_DAYS.unsigned_abs() {
        Some(stored_at.saturating_add(expire))
    } else {
        Some(expire)
    }
}

/// Get the current Unix timestamp
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(data: &str) -> CacheElement {
        CacheElement::new("k", 7, 0, data.as_bytes())
    }

    #[test]
    fn test_encode_decode() {
        let mut value = CacheElement::new("key", 42, 1_234_567_890, b"hello".to_vec());
        value.cas_unique = 99;
        value.block(1_700_000_000);
        let encoded = value.encode();
        assert_eq!(encoded.len(), value.encoded_len());

        let decoded = CacheElement::decode(Key::from("key"), &encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_decode_too_short() {
        let result = CacheElement::decode(Key::from("k"), &[0, 1, 2]);
        assert!(matches!(result, Err(StorageError::Decoding(_))));
    }

    #[test]
    fn test_never_expire() {
        let value = element("data");
        assert_eq!(value.expires_at(), None);
        assert!(!value.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_relative_expiry() {
        let mut value = CacheElement::new("k", 0, 60, b"data".to_vec());
        value.stored_at = 1_000;
        assert_eq!(value.expires_at(), Some(1_060));
        assert!(!value.is_expired_at(1_059));
        assert!(value.is_expired_at(1_060));
    }

    #[test]
    fn test_absolute_expiry() {
        let at = THIRTY_DAYS + 10;
        let mut value = CacheElement::new("k", 0, at, b"data".to_vec());
        value.stored_at = 5;
        assert_eq!(value.expires_at(), Some(at));
        assert!(!value.is_expired_at(at - 1));
        assert!(value.is_expired_at(at));
    }

    #[test]
    fn test_threshold_is_absolute() {
        let value = CacheElement::new("k", 0, THIRTY_DAYS, b"data".to_vec());
        assert_eq!(value.expires_at(), Some(THIRTY_DAYS));
        assert!(value.is_expired_at(current_timestamp()));
    }

    #[test]
    fn test_negative_expire_is_already_expired() {
        let value = CacheElement::new("k", 0, -1, b"data".to_vec());
        assert!(value.is_expired_at(current_timestamp()));
    }

    #[test]
    fn test_append_prepend_keep_metadata() {
        let mut base = CacheElement::new("k", 3, 120, b"mid".to_vec());
        base.cas_unique = 10;

        let appended = base.append(&element("+tail"));
        assert_eq!(appended.data, b"mid+tail");
        assert_eq!(appended.flags, 3);
        assert_eq!(appended.expire, 120);
        assert_eq!(appended.stored_at, base.stored_at);
        assert_eq!(appended.cas_unique, 0);

        let prepended = base.prepend(&element("head+"));
        assert_eq!(prepended.data, b"head+mid");
    }

    #[test]
    fn test_increment_and_decrement() {
        let (incremented, value) = element("1").add(5).unwrap();
        assert_eq!(value, 6);
        assert_eq!(incremented.data, b"6");

        let (_, value) = incremented.add(-10).unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn test_increment_saturates() {
        let max = u64::MAX.to_string();
        let (_, value) = element(&max).add(1).unwrap();
        assert_eq!(value, u64::MAX);

        let (_, value) = element("18446744073709551610").add(i64::MAX).unwrap();
        assert_eq!(value, u64::MAX);

        let (_, value) = element("3").add(i64::MIN).unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn test_add_not_a_number() {
        assert_eq!(element("hello").add(1).unwrap_err(), StorageError::NotANumber);
        assert_eq!(element("-5").add(1).unwrap_err(), StorageError::NotANumber);
        assert_eq!(element("").add(1).unwrap_err(), StorageError::NotANumber);
    }

    #[test]
    fn test_blocking_window() {
        let mut value = element("v");
        value.block(100);
        assert!(value.is_blocked_at(99));
        assert!(!value.is_live_at(99));
        assert!(!value.should_purge_at(99));

        assert!(!value.is_blocked_at(100));
        assert!(value.should_purge_at(100));
    }

    #[test]
    fn test_live() {
        let value = element("v");
        assert!(value.is_live_at(current_timestamp()));
    }
}
