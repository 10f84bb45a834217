//! Signal index cache: the session mapping between publisher-assigned
//! runtime ids and 128-bit signal GUIDs.
//!
//! Two cache instances coexist on a subscriber so the publisher can
//! populate a replacement while data packets still reference the old
//! one; each data packet selects its slot with a header flag. A cache is
//! immutable once decoded and is shared behind an `Arc`; the embedded
//! TSSC decoder slot is the only mutable part and belongs to the reader
//! that is draining packets against this cache.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::guid;
use crate::tssc;
use crate::wire::WireReader;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheRecord {
    signal_id: Uuid,
    source: String,
    id: u64,
}

/// Bidirectional runtime-id ↔ signal-GUID map with per-signal source
/// metadata.
#[derive(Debug, Default)]
pub struct SignalIndexCache {
    records: HashMap<i32, CacheRecord>,
    signal_indices: HashMap<Uuid, i32>,
    max_signal_index: u32,
    pub(crate) tssc_decoder: Mutex<Option<tssc::Decoder>>,
}

impl SignalIndexCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a runtime id is mapped.
    pub fn contains(&self, runtime_id: i32) -> bool {
        self.records.contains_key(&runtime_id)
    }

    /// Signal GUID for a runtime id; nil when unmapped.
    pub fn signal_id(&self, runtime_id: i32) -> Uuid {
        self.records
            .get(&runtime_id)
            .map(|r| r.signal_id)
            .unwrap_or(Uuid::nil())
    }

    /// Runtime id for a signal GUID; `-1` when unmapped.
    pub fn runtime_index(&self, signal_id: Uuid) -> i32 {
        self.signal_indices.get(&signal_id).copied().unwrap_or(-1)
    }

    /// Source name for a runtime id; empty when unmapped.
    pub fn source(&self, runtime_id: i32) -> &str {
        self.records
            .get(&runtime_id)
            .map(|r| r.source.as_str())
            .unwrap_or("")
    }

    /// Publisher-side numeric id for a runtime id; zero when unmapped.
    pub fn id(&self, runtime_id: i32) -> u64 {
        self.records.get(&runtime_id).map(|r| r.id).unwrap_or(0)
    }

    /// Full record for a runtime id.
    ///
    /// Returns `(signal_id, source, id, found)`; the first three are
    /// empty defaults when `found` is false.
    pub fn record(&self, runtime_id: i32) -> (Uuid, String, u64, bool) {
        match self.records.get(&runtime_id) {
            Some(r) => (r.signal_id, r.source.clone(), r.id, true),
            None => (Uuid::nil(), String::new(), 0, false),
        }
    }

    /// Number of mapped signals.
    pub fn count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Zero-based ordinal of the last accepted reference.
    pub fn max_signal_index(&self) -> u32 {
        self.max_signal_index
    }

    /// All mapped runtime ids.
    pub fn runtime_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.records.keys().copied()
    }

    /// Decode a cache image.
    ///
    /// `data` must already be inflated when the session gzips cache
    /// payloads. Returns the cache and the subscriber id the publisher
    /// stamped into the image. Trailing bytes beyond the references hold
    /// the reserved unauthorized-signal list and are skipped.
    pub fn decode(data: &[u8], swap_guid_endianness: bool) -> Result<(Self, Uuid)> {
        let mut r = WireReader::new(data);

        let binary_length = r
            .u32_be()
            .map_err(|_| Error::MalformedCache("image too short for length field".into()))?
            as usize;
        if data.len() < binary_length {
            return Err(Error::MalformedCache(format!(
                "image is {} bytes but declares {binary_length}",
                data.len()
            )));
        }

        let subscriber_id = guid::from_wire(
            r.bytes_16()
                .map_err(|_| Error::MalformedCache("image too short for subscriber id".into()))?,
            swap_guid_endianness,
        );

        let mut cache = Self::new();
        let reference_count = cache.decode_references(&mut r, swap_guid_endianness)?;

        // Remaining bytes carry the unauthorized-signal list; reserved.
        let _ = r.rest();

        if reference_count > 0 {
            cache.max_signal_index = reference_count - 1;
        }

        Ok((cache, subscriber_id))
    }

    fn decode_references(
        &mut self,
        r: &mut WireReader<'_>,
        swap_guid_endianness: bool,
    ) -> Result<u32> {
        let reference_count = r
            .u32_be()
            .map_err(|_| Error::MalformedCache("image too short for reference count".into()))?;

        for ordinal in 0..reference_count {
            let malformed =
                |what: &str| Error::MalformedCache(format!("reference {ordinal}: {what}"));

            let runtime_id = r.u32_be().map_err(|_| malformed("missing runtime id"))? as i32;
            let signal_id = guid::from_wire(
                r.bytes_16().map_err(|_| malformed("missing signal id"))?,
                swap_guid_endianness,
            );
            let source = r
                .string()
                .map_err(|_| malformed("missing or invalid source"))?
                .to_owned();
            let id = r.u64_be().map_err(|_| malformed("missing id"))?;

            self.signal_indices.insert(signal_id, runtime_id);
            self.records.insert(
                runtime_id,
                CacheRecord {
                    signal_id,
                    source,
                    id,
                },
            );
        }

        Ok(reference_count)
    }

    /// Encode this cache into the wire image [`Self::decode`] accepts.
    pub fn encode(&self, subscriber_id: Uuid, swap_guid_endianness: bool) -> Vec<u8> {
        let mut body = Vec::with_capacity(24 + self.records.len() * 40);
        body.extend_from_slice(&[0u8; 4]); // length, patched below
        body.extend_from_slice(&guid::to_wire(subscriber_id, swap_guid_endianness));
        body.extend_from_slice(&(self.records.len() as u32).to_be_bytes());

        for (runtime_id, record) in &self.records {
            body.extend_from_slice(&(*runtime_id as u32).to_be_bytes());
            body.extend_from_slice(&guid::to_wire(record.signal_id, swap_guid_endianness));
            body.extend_from_slice(&(record.source.len() as u32).to_be_bytes());
            body.extend_from_slice(record.source.as_bytes());
            body.extend_from_slice(&record.id.to_be_bytes());
        }

        let total = body.len() as u32;
        body[..4].copy_from_slice(&total.to_be_bytes());
        body
    }

    /// Insert a mapping directly; test and tooling support.
    pub fn insert(&mut self, runtime_id: i32, signal_id: Uuid, source: &str, id: u64) {
        self.signal_indices.insert(signal_id, runtime_id);
        self.records.insert(
            runtime_id,
            CacheRecord {
                signal_id,
                source: source.to_owned(),
                id,
            },
        );
        self.max_signal_index = self.records.len().saturating_sub(1) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One reference (runtime id 7 → "TEST"/42), no trailing list.
    fn single_reference_image(guid_bytes: [u8; 16]) -> Vec<u8> {
        let mut image = vec![
            0x00, 0x00, 0x00, 0x2E, // declared length
        ];
        image.extend_from_slice(&[0u8; 16]); // subscriber id (nil)
        image.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // reference count
        image.extend_from_slice(&[0x00, 0x00, 0x00, 0x07]); // runtime id
        image.extend_from_slice(&guid_bytes);
        image.extend_from_slice(&[0x00, 0x00, 0x00, 0x04]); // source length
        image.extend_from_slice(b"TEST");
        image.extend_from_slice(&42u64.to_be_bytes());
        image
    }

    #[test]
    fn test_decode_single_reference() {
        let guid_bytes = [
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D,
            0x1E, 0x1F,
        ];
        let (cache, subscriber_id) =
            SignalIndexCache::decode(&single_reference_image(guid_bytes), false).unwrap();

        assert_eq!(subscriber_id, Uuid::nil());
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.max_signal_index(), 0);
        assert!(cache.contains(7));
        assert_eq!(cache.signal_id(7), Uuid::from_bytes(guid_bytes));
        assert_eq!(cache.source(7), "TEST");
        assert_eq!(cache.id(7), 42);
        assert_eq!(cache.runtime_index(Uuid::from_bytes(guid_bytes)), 7);
        assert_eq!(cache.runtime_index(Uuid::from_u128(99)), -1);
    }

    #[test]
    fn test_decode_rejects_short_image() {
        let image = single_reference_image([0u8; 16]);
        // Declare more bytes than the buffer holds.
        let mut bad = image.clone();
        bad[3] = 0xFF;
        assert!(matches!(
            SignalIndexCache::decode(&bad, false),
            Err(Error::MalformedCache(_))
        ));

        // Reference truncated mid-record.
        let truncated = &image[..image.len() - 4];
        let mut short = truncated.to_vec();
        short[3] = truncated.len() as u8;
        assert!(matches!(
            SignalIndexCache::decode(&short, false),
            Err(Error::MalformedCache(_))
        ));
    }

    #[test]
    fn test_trailing_unauthorized_list_skipped() {
        let mut image = single_reference_image([1u8; 16]);
        image.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let (cache, _) = SignalIndexCache::decode(&image, false).unwrap();
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut original = SignalIndexCache::new();
        original.insert(1, Uuid::from_u128(0xAA), "PPA", 10);
        original.insert(2, Uuid::from_u128(0xBB), "PPA", 11);
        original.insert(9, Uuid::from_u128(0xCC), "SHELBY", 12);

        let subscriber_id = Uuid::from_u128(0x5151);
        for swap in [false, true] {
            let image = original.encode(subscriber_id, swap);
            let (decoded, sid) = SignalIndexCache::decode(&image, swap).unwrap();
            assert_eq!(sid, subscriber_id);
            assert_eq!(decoded.count(), original.count());
            assert_eq!(decoded.max_signal_index(), original.max_signal_index());
            for runtime_id in [1, 2, 9] {
                assert_eq!(decoded.record(runtime_id), original.record(runtime_id));
            }
        }
    }
}
