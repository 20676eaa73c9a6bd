//! Local inventory ledger: the single source of truth for what an
//! account owns and which items are reserved by outstanding offers.
//!
//! One ledger per account, keyed (collection, sub-collection) → item id.
//! All mutation goes through the methods here; a single `RwLock`
//! serializes access so no two callers can interleave on the same slot.
//! Missing keys are expected (local belief and platform truth drift) and
//! always degrade to "not found" or "unavailable" rather than panicking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use swap_common::{CollectionKey, ItemKey, ItemRecord};

use crate::events::EventSink;
use crate::platform::{FetchError, InventoryFetcher};

/// Consecutive attempts per (collection, sub-collection) pair before a
/// fetch is reported as failed.
const FETCH_ATTEMPTS: u32 = 6;

/// Result of a batch reservation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReserveOutcome {
    /// Items now marked reserved.
    pub reserved: Vec<ItemKey>,
    /// Requested items with no ledger record.
    pub missing: Vec<ItemKey>,
}

/// Per-account item ledger.
pub struct Ledger {
    account_id: String,
    tracked: Vec<CollectionKey>,
    slots: RwLock<HashMap<CollectionKey, HashMap<String, ItemRecord>>>,
    fetcher: Arc<dyn InventoryFetcher>,
    events: EventSink,
}

impl Ledger {
    pub fn new(
        account_id: impl Into<String>,
        tracked: Vec<CollectionKey>,
        fetcher: Arc<dyn InventoryFetcher>,
        events: EventSink,
    ) -> Self {
        let mut slots = HashMap::new();
        for pair in &tracked {
            slots.insert(pair.clone(), HashMap::new());
        }
        Self {
            account_id: account_id.into(),
            tracked,
            slots: RwLock::new(slots),
            fetcher,
            events,
        }
    }

    pub fn tracked(&self) -> &[CollectionKey] {
        &self.tracked
    }

    /// Initial scan of every tracked pair. Returns the total item count.
    pub async fn start_tracking(&self) -> Result<usize, FetchError> {
        let count = self.resync(&[]).await?;
        self.events.info(format!(
            "Tracked inventories have {count} items ({})",
            self.account_id
        ));
        Ok(count)
    }

    /// Full re-synchronization from platform truth.
    ///
    /// Replaces every tracked slot with freshly fetched records, then
    /// reapplies the given reservations. Items that vanished platform-side
    /// simply stop existing here; refreshed items come back un-reserved
    /// unless they are in `reapply`.
    pub async fn refresh(&self, reapply: &[ItemKey]) -> Result<usize, FetchError> {
        let count = self.resync(reapply).await?;
        self.events.info(format!(
            "Tracked inventories have been refreshed, {count} items ({})",
            self.account_id
        ));
        Ok(count)
    }

    async fn resync(&self, reapply: &[ItemKey]) -> Result<usize, FetchError> {
        // Fetch everything before touching local state, so a failed pair
        // leaves the ledger untouched.
        let mut fetched: Vec<(CollectionKey, Vec<ItemRecord>)> =
            Vec::with_capacity(self.tracked.len());
        for pair in &self.tracked {
            let records = self.fetch_pair(pair).await?;
            fetched.push((pair.clone(), records));
        }

        let reapply: HashSet<&ItemKey> = reapply.iter().collect();
        let mut count = 0;
        let mut slots = self.slots.write();
        for (pair, records) in fetched {
            let slot = slots.entry(pair).or_default();
            slot.clear();
            for mut record in records {
                record.reserved = reapply.contains(&record.key);
                count += 1;
                slot.insert(record.key.item.clone(), record);
            }
        }
        Ok(count)
    }

    async fn fetch_pair(&self, pair: &CollectionKey) -> Result<Vec<ItemRecord>, FetchError> {
        let mut attempt = 1;
        loop {
            match self
                .fetcher
                .fetch_inventory(&self.account_id, &pair.collection, &pair.sub_collection)
                .await
            {
                Ok(records) => return Ok(records),
                Err(err) if attempt < FETCH_ATTEMPTS => {
                    self.events.warning(format!(
                        "Retrying inventory fetch for {pair} (attempt {attempt}): {err}"
                    ));
                    attempt += 1;
                }
                Err(err) => {
                    self.events.err(
                        format!("Giving up on inventory fetch for {pair}"),
                        Some(err.to_string()),
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Mark each item reserved. Items with no record are skipped and
    /// reported back rather than failing the batch.
    pub fn reserve(&self, items: &[ItemKey]) -> ReserveOutcome {
        let mut slots = self.slots.write();
        let mut outcome = ReserveOutcome::default();
        for key in items {
            match Self::record_mut(&mut slots, key) {
                Some(record) => {
                    record.reserved = true;
                    outcome.reserved.push(key.clone());
                }
                None => outcome.missing.push(key.clone()),
            }
        }
        outcome
    }

    /// All-or-nothing reservation: either every item is present and
    /// unreserved and all become reserved, or nothing changes and the
    /// unavailable subset is returned. This is `available` + `reserve`
    /// fused under one write guard so concurrent offer attempts
    /// linearize.
    pub fn try_reserve_all(&self, items: &[ItemKey]) -> Result<(), Vec<ItemKey>> {
        let mut slots = self.slots.write();
        let unavailable: Vec<ItemKey> = items
            .iter()
            .filter(|key| {
                !matches!(Self::record(&slots, key), Some(record) if !record.reserved)
            })
            .cloned()
            .collect();
        if !unavailable.is_empty() {
            return Err(unavailable);
        }
        for key in items {
            if let Some(record) = Self::record_mut(&mut slots, key) {
                record.reserved = true;
            }
        }
        Ok(())
    }

    /// Clear reservations. No-op for items not found.
    pub fn release(&self, items: &[ItemKey]) {
        let mut slots = self.slots.write();
        for key in items {
            if let Some(record) = Self::record_mut(&mut slots, key) {
                record.reserved = false;
            }
        }
    }

    /// The subset of `items` that cannot currently be offered: absent
    /// from the ledger or already reserved. Empty means go ahead.
    pub fn available(&self, items: &[ItemKey]) -> Vec<ItemKey> {
        let slots = self.slots.read();
        items
            .iter()
            .filter(|key| {
                !matches!(Self::record(&slots, key), Some(record) if !record.reserved)
            })
            .cloned()
            .collect()
    }

    /// Delete records for items that left the account.
    pub fn remove(&self, items: &[ItemKey]) {
        let mut slots = self.slots.write();
        Self::remove_locked(&mut slots, items);
    }

    /// Insert or overwrite records for items that arrived.
    pub fn add(&self, items: Vec<ItemRecord>) {
        let mut slots = self.slots.write();
        Self::add_locked(&mut slots, items);
    }

    /// Apply a completed exchange: remove the sent items, then add the
    /// received ones, under a single write guard so no reader can observe
    /// the ledger mid-swap.
    pub fn remove_and_add(&self, remove: &[ItemKey], add: Vec<ItemRecord>) {
        let mut slots = self.slots.write();
        Self::remove_locked(&mut slots, remove);
        Self::add_locked(&mut slots, add);
    }

    fn remove_locked(
        slots: &mut HashMap<CollectionKey, HashMap<String, ItemRecord>>,
        items: &[ItemKey],
    ) {
        for key in items {
            if let Some(slot) = slots.get_mut(&key.collection_key()) {
                slot.remove(&key.item);
            }
        }
    }

    fn add_locked(
        slots: &mut HashMap<CollectionKey, HashMap<String, ItemRecord>>,
        items: Vec<ItemRecord>,
    ) {
        for record in items {
            slots
                .entry(record.key.collection_key())
                .or_default()
                .insert(record.key.item.clone(), record);
        }
    }

    fn record<'a>(
        slots: &'a HashMap<CollectionKey, HashMap<String, ItemRecord>>,
        key: &ItemKey,
    ) -> Option<&'a ItemRecord> {
        slots.get(&key.collection_key())?.get(&key.item)
    }

    fn record_mut<'a>(
        slots: &'a mut HashMap<CollectionKey, HashMap<String, ItemRecord>>,
        key: &ItemKey,
    ) -> Option<&'a mut ItemRecord> {
        slots.get_mut(&key.collection_key())?.get_mut(&key.item)
    }

    /// Snapshot of one slot's records.
    pub fn items(&self, pair: &CollectionKey) -> Vec<ItemRecord> {
        self.slots
            .read()
            .get(pair)
            .map(|slot| slot.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a single record.
    pub fn item(&self, key: &ItemKey) -> Option<ItemRecord> {
        Self::record(&self.slots.read(), key).cloned()
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        Self::record(&self.slots.read(), key).is_some()
    }

    pub fn is_reserved(&self, key: &ItemKey) -> bool {
        Self::record(&self.slots.read(), key).is_some_and(|record| record.reserved)
    }

    pub fn len(&self) -> usize {
        self.slots.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimPlatform;
    use serde_json::json;

    fn key(item: &str) -> ItemKey {
        ItemKey::new("440", "2", item)
    }

    fn record(item: &str) -> ItemRecord {
        ItemRecord::new(key(item), json!({ "name": item }))
    }

    fn ledger_with(items: &[&str]) -> Ledger {
        let (sink, _rx) = EventSink::new("acct-1");
        let ledger = Ledger::new(
            "acct-1",
            vec![CollectionKey::new("440", "2")],
            Arc::new(SimPlatform::new()),
            sink,
        );
        ledger.add(items.iter().map(|item| record(item)).collect());
        ledger
    }

    #[test]
    fn test_reserve_reports_missing_without_failing_batch() {
        let ledger = ledger_with(&["a", "b"]);

        let outcome = ledger.reserve(&[key("a"), key("ghost"), key("b")]);
        assert_eq!(outcome.reserved, vec![key("a"), key("b")]);
        assert_eq!(outcome.missing, vec![key("ghost")]);
        assert!(ledger.is_reserved(&key("a")));
        assert!(ledger.is_reserved(&key("b")));
    }

    #[test]
    fn test_available_flags_absent_and_reserved() {
        let ledger = ledger_with(&["a", "b"]);
        ledger.reserve(&[key("a")]);

        let unavailable = ledger.available(&[key("a"), key("b"), key("ghost")]);
        assert_eq!(unavailable, vec![key("a"), key("ghost")]);

        // Full availability yields an empty subset.
        assert!(ledger.available(&[key("b")]).is_empty());
    }

    #[test]
    fn test_try_reserve_all_is_all_or_nothing() {
        let ledger = ledger_with(&["a", "b"]);
        ledger.reserve(&[key("b")]);

        let unavailable = ledger.try_reserve_all(&[key("a"), key("b")]).unwrap_err();
        assert_eq!(unavailable, vec![key("b")]);
        // The available item must not have been reserved by the failed batch.
        assert!(!ledger.is_reserved(&key("a")));

        ledger.release(&[key("b")]);
        assert!(ledger.try_reserve_all(&[key("a"), key("b")]).is_ok());
        assert!(ledger.is_reserved(&key("a")));
        assert!(ledger.is_reserved(&key("b")));
    }

    #[test]
    fn test_release_is_noop_for_missing() {
        let ledger = ledger_with(&["a"]);
        ledger.reserve(&[key("a")]);
        ledger.release(&[key("a"), key("ghost")]);
        assert!(!ledger.is_reserved(&key("a")));
    }

    #[test]
    fn test_remove_and_add_swaps_atomically() {
        let ledger = ledger_with(&["a"]);
        ledger.reserve(&[key("a")]);

        ledger.remove_and_add(&[key("a")], vec![record("z")]);

        assert!(!ledger.contains(&key("a")));
        let received = ledger.item(&key("z")).unwrap();
        assert!(!received.reserved);
    }

    #[test]
    fn test_add_creates_untracked_slot() {
        let ledger = ledger_with(&[]);
        let foreign = ItemRecord::new(ItemKey::new("570", "2", "x"), json!({}));
        ledger.add(vec![foreign]);
        assert!(ledger.contains(&ItemKey::new("570", "2", "x")));
    }

    #[tokio::test]
    async fn test_start_tracking_counts_all_pairs() {
        let sim = Arc::new(SimPlatform::new());
        sim.set_inventory("acct-1", "440", "2", vec![record("a"), record("b")]);

        let (sink, _rx) = EventSink::new("acct-1");
        let ledger = Ledger::new(
            "acct-1",
            vec![CollectionKey::new("440", "2")],
            sim,
            sink,
        );

        let count = ledger.start_tracking().await.unwrap();
        assert_eq!(count, 2);
        assert!(ledger.contains(&key("a")));
        assert!(!ledger.is_reserved(&key("a")));
    }

    #[tokio::test]
    async fn test_refresh_replaces_slots_and_reapplies_reservations() {
        let sim = Arc::new(SimPlatform::new());
        sim.set_inventory("acct-1", "440", "2", vec![record("a"), record("c")]);

        let (sink, _rx) = EventSink::new("acct-1");
        let ledger = Ledger::new(
            "acct-1",
            vec![CollectionKey::new("440", "2")],
            sim,
            sink,
        );
        // Local belief diverged: "b" exists locally but not platform-side,
        // and "a" is reserved by an outstanding offer.
        ledger.add(vec![record("a"), record("b")]);
        ledger.reserve(&[key("a"), key("b")]);

        let count = ledger.refresh(&[key("a")]).await.unwrap();
        assert_eq!(count, 2);

        assert!(ledger.is_reserved(&key("a")), "reapplied reservation");
        assert!(!ledger.contains(&key("b")), "stale record dropped");
        assert!(!ledger.is_reserved(&key("c")), "fresh records unreserved");
    }

    #[tokio::test]
    async fn test_fetch_retries_then_fails() {
        let sim = Arc::new(SimPlatform::new());
        sim.set_inventory("acct-1", "440", "2", vec![record("a")]);
        sim.fail_inventory_fetches(usize::MAX);

        let (sink, _rx) = EventSink::new("acct-1");
        let ledger = Ledger::new(
            "acct-1",
            vec![CollectionKey::new("440", "2")],
            sim.clone(),
            sink,
        );

        assert!(ledger.start_tracking().await.is_err());
        assert_eq!(sim.inventory_fetch_calls(), 6, "initial attempt plus five retries");
    }

    #[tokio::test]
    async fn test_fetch_recovers_within_retry_budget() {
        let sim = Arc::new(SimPlatform::new());
        sim.set_inventory("acct-1", "440", "2", vec![record("a")]);
        sim.fail_inventory_fetches(3);

        let (sink, _rx) = EventSink::new("acct-1");
        let ledger = Ledger::new(
            "acct-1",
            vec![CollectionKey::new("440", "2")],
            sim,
            sink,
        );

        assert_eq!(ledger.start_tracking().await.unwrap(), 1);
    }
}
