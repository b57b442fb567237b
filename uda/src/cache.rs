//! Process-local result cache keyed by a request fingerprint. GET requests
//! only; puts never touch it. Eviction is LRU over bounded entry and byte
//! budgets.

use std::collections::HashSet;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::block::DataBlock;
use crate::errors::{Result, UdaError};
use crate::protocol::{expect_header, ProtocolId, CLIENT_VERSION};
use crate::request::RequestBlock;

pub const DEFAULT_MAX_ENTRIES: usize = 256;
pub const DEFAULT_MAX_BYTES: usize = 64 << 20;

pub struct ResultCache {
    entries: IndexMap<u128, Vec<u8>>,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
    in_flight: HashSet<u128>,
}

impl Default for ResultCache {
    fn default() -> Self {
        ResultCache {
            entries: IndexMap::new(),
            bytes: 0,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
            in_flight: HashSet::new(),
        }
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budgets(max_entries: usize, max_bytes: usize) -> Self {
        ResultCache {
            max_entries,
            max_bytes,
            ..Default::default()
        }
    }

    /// Canonicalised request identity: the rendered request minus volatile
    /// fields (client properties, flags, put payloads).
    pub fn fingerprint(request: &RequestBlock) -> u128 {
        let (signal, source) = request.render();
        let canonical = format!(
            "{:?}|{}|{}|{}|{}|{}|{}",
            request.kind,
            request.device,
            request.server,
            signal,
            source,
            request.exp_number,
            request.tpass,
        );
        cityhash_rs::cityhash_102_128(canonical.as_bytes())
    }

    /// Claims a fingerprint for materialisation. At most one materialisation
    /// per fingerprint may be in flight; duplicates are rejected.
    pub fn begin(&mut self, fingerprint: u128) -> Result<()> {
        if !self.in_flight.insert(fingerprint) {
            return Err(UdaError::CacheBusy);
        }
        Ok(())
    }

    pub fn end(&mut self, fingerprint: u128) {
        self.in_flight.remove(&fingerprint);
    }

    /// Materialises a cached block, refreshing its recency.
    pub async fn lookup(&mut self, fingerprint: u128) -> Result<Option<DataBlock>> {
        let Some(bytes) = self.entries.shift_remove(&fingerprint) else {
            return Ok(None);
        };
        let mut cursor = std::io::Cursor::new(bytes);
        expect_header(&mut cursor, ProtocolId::DataBlock).await?;
        let (block, _) = DataBlock::read(&mut cursor, CLIENT_VERSION).await?;
        self.entries.insert(fingerprint, cursor.into_inner());
        trace!("cache hit for {fingerprint:032x}");
        Ok(Some(block))
    }

    /// Writes a completed block back, evicting least-recently-used entries
    /// until the budgets hold.
    pub async fn store(&mut self, fingerprint: u128, block: &DataBlock) -> Result<()> {
        let mut bytes = Vec::new();
        block.write(&mut bytes, CLIENT_VERSION).await?;
        if bytes.len() > self.max_bytes {
            return Ok(());
        }
        if let Some(old) = self.entries.shift_remove(&fingerprint) {
            self.bytes -= old.len();
        }
        self.bytes += bytes.len();
        self.entries.insert(fingerprint, bytes);
        while self.entries.len() > self.max_entries || self.bytes > self.max_bytes {
            // IndexMap keeps insertion order, so the front is the LRU entry.
            let Some((evicted, old)) = self.entries.shift_remove_index(0) else {
                break;
            };
            self.bytes -= old.len();
            debug!("cache evicted {evicted:032x}");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestKind;

    fn request(signal: &str, shot: i32) -> RequestBlock {
        let mut rb = RequestBlock::new();
        rb.kind = RequestKind::Generic;
        rb.signal = signal.to_string();
        rb.exp_number = shot;
        rb
    }

    fn block(values: &[f64]) -> DataBlock {
        let mut b = DataBlock::new();
        b.set_data_f64(values);
        b
    }

    #[tokio::test]
    async fn store_then_lookup_round_trips() {
        let mut cache = ResultCache::new();
        let fp = ResultCache::fingerprint(&request("ip", 12345));
        cache.store(fp, &block(&[1.0, 2.0])).await.unwrap();
        let hit = cache.lookup(fp).await.unwrap().unwrap();
        assert_eq!(hit.data_f64().unwrap(), vec![1.0, 2.0]);
        assert!(cache.lookup(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn distinct_requests_have_distinct_fingerprints() {
        let a = ResultCache::fingerprint(&request("ip", 12345));
        let b = ResultCache::fingerprint(&request("ip", 12346));
        let c = ResultCache::fingerprint(&request("te", 12345));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn lru_eviction_drops_the_oldest() {
        let mut cache = ResultCache::with_budgets(2, usize::MAX);
        cache.store(1, &block(&[1.0])).await.unwrap();
        cache.store(2, &block(&[2.0])).await.unwrap();
        // Touch 1 so that 2 becomes the LRU entry.
        cache.lookup(1).await.unwrap();
        cache.store(3, &block(&[3.0])).await.unwrap();
        assert!(cache.lookup(2).await.unwrap().is_none());
        assert!(cache.lookup(1).await.unwrap().is_some());
        assert!(cache.lookup(3).await.unwrap().is_some());
    }

    #[test]
    fn duplicate_materialisation_is_rejected() {
        let mut cache = ResultCache::new();
        cache.begin(42).unwrap();
        assert!(matches!(cache.begin(42), Err(UdaError::CacheBusy)));
        cache.end(42);
        cache.begin(42).unwrap();
    }
}
