//! Binary envelope around cached values.
//!
//! # Layout
//!
//! ```text
//! [magic: 1][version: 1][flags: 1][created_at ms: i64 LE][ttl ms: u64 LE]
//! [tags len: u32 LE][tags: JSON array][payload]
//! ```
//!
//! Flag bit 0 marks a zstd-compressed payload, bit 1 marks a present TTL.
//! The payload itself is produced by [`crate::codec`].

use chrono::{DateTime, TimeDelta, Utc};
use recall_core::{BackendError, CacheKey};
use std::collections::BTreeSet;
use std::time::Duration;

pub const ENTRY_MAGIC: u8 = b'R';
pub const ENTRY_VERSION: u8 = 1;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_HAS_TTL: u8 = 0b0000_0010;
const HEADER_LEN: usize = 1 + 1 + 1 + 8 + 8 + 4;

/// Creation time and TTL, readable without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub created_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub compressed: bool,
}

impl EntryHeader {
    /// Parse only the fixed header of an encoded entry.
    pub fn peek(key: &CacheKey, bytes: &[u8]) -> Result<Self, BackendError> {
        parse_header(key, bytes).map(|(header, _)| header)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = TimeDelta::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires| now >= expires)
    }

    /// Time left before expiry. `None` for entries without a TTL.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let expires = self.expires_at()?;
        Some((expires - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A cached value with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub header: EntryHeader,
    pub tags: BTreeSet<String>,
    pub payload: Vec<u8>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            key,
            header: EntryHeader {
                created_at: Utc::now(),
                ttl,
                compressed: false,
            },
            tags: BTreeSet::new(),
            payload,
        }
    }

    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.header.compressed = compressed;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.header.created_at = created_at;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.header.is_expired_at(now)
    }

    pub fn encode(&self) -> Result<Vec<u8>, BackendError> {
        let tags = serde_json::to_vec(&self.tags).map_err(|e| BackendError::Serialization {
            reason: format!("entry tags: {e}"),
        })?;
        let tags_len = u32::try_from(tags.len()).map_err(|_| BackendError::Serialization {
            reason: "entry tags exceed 4 GiB".to_string(),
        })?;

        let mut flags = 0u8;
        if self.header.compressed {
            flags |= FLAG_COMPRESSED;
        }
        let ttl_ms = match self.header.ttl {
            Some(ttl) => {
                flags |= FLAG_HAS_TTL;
                u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
            }
            None => 0,
        };

        let mut out = Vec::with_capacity(HEADER_LEN + tags.len() + self.payload.len());
        out.push(ENTRY_MAGIC);
        out.push(ENTRY_VERSION);
        out.push(flags);
        out.extend_from_slice(&self.header.created_at.timestamp_millis().to_le_bytes());
        out.extend_from_slice(&ttl_ms.to_le_bytes());
        out.extend_from_slice(&tags_len.to_le_bytes());
        out.extend_from_slice(&tags);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(key: &CacheKey, bytes: &[u8]) -> Result<Self, BackendError> {
        let (header, tags_len) = parse_header(key, bytes)?;
        let tags_end = HEADER_LEN + tags_len;
        if bytes.len() < tags_end {
            return Err(corrupt(key, "truncated tag block"));
        }
        let tags: BTreeSet<String> = serde_json::from_slice(&bytes[HEADER_LEN..tags_end])
            .map_err(|e| corrupt(key, &format!("invalid tag block: {e}")))?;
        Ok(Self {
            key: key.clone(),
            header,
            tags,
            payload: bytes[tags_end..].to_vec(),
        })
    }
}

fn corrupt(key: &CacheKey, reason: &str) -> BackendError {
    BackendError::CorruptEntry {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_header(key: &CacheKey, bytes: &[u8]) -> Result<(EntryHeader, usize), BackendError> {
    if bytes.len() < HEADER_LEN {
        return Err(corrupt(key, "shorter than entry header"));
    }
    if bytes[0] != ENTRY_MAGIC {
        return Err(corrupt(key, "bad magic byte"));
    }
    if bytes[1] != ENTRY_VERSION {
        return Err(corrupt(key, &format!("unsupported entry version {}", bytes[1])));
    }
    let flags = bytes[2];

    let mut millis = [0u8; 8];
    millis.copy_from_slice(&bytes[3..11]);
    let created_at = DateTime::from_timestamp_millis(i64::from_le_bytes(millis))
        .ok_or_else(|| corrupt(key, "creation time out of range"))?;

    let mut ttl_raw = [0u8; 8];
    ttl_raw.copy_from_slice(&bytes[11..19]);
    let ttl = (flags & FLAG_HAS_TTL != 0).then(|| Duration::from_millis(u64::from_le_bytes(ttl_raw)));

    let mut tags_len = [0u8; 4];
    tags_len.copy_from_slice(&bytes[19..23]);

    Ok((
        EntryHeader {
            created_at,
            ttl,
            compressed: flags & FLAG_COMPRESSED != 0,
        },
        u32::from_le_bytes(tags_len) as usize,
    ))
}
