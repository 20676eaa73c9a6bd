//! Outstanding-offer tracking and per-offer resolution de-duplication.
//!
//! An offer enters the outstanding set when it is sent (or discovered
//! already open) and leaves it on any terminal branch, never to re-enter
//! except via a fresh send or a fresh discovery. The in-flight guard
//! ensures at most one resolution pass runs per offer id; a concurrent
//! trigger is coalesced by the caller.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};

use swap_common::{ItemKey, OfferId, OfferState, TradeOffer};

use super::retry::{RetryCategory, RetryState};

/// One offer the engine is still driving to a terminal disposition.
#[derive(Debug, Clone)]
pub struct OutstandingOffer {
    pub offer_id: OfferId,
    pub created_at: DateTime<Utc>,
    pub items_to_give: Vec<ItemKey>,
    pub retries: RetryState,
    pub last_state: OfferState,
}

impl OutstandingOffer {
    /// Record for an offer this engine just sent.
    pub fn sent(offer_id: OfferId, items_to_give: Vec<ItemKey>) -> Self {
        Self {
            offer_id,
            created_at: Utc::now(),
            items_to_give,
            retries: RetryState::default(),
            last_state: OfferState::Active,
        }
    }

    /// Record for an offer discovered already open on the platform.
    pub fn discovered(offer: &TradeOffer) -> Self {
        Self {
            offer_id: offer.id.clone(),
            created_at: offer.created_at,
            items_to_give: offer.items_to_give.clone(),
            retries: RetryState::default(),
            last_state: offer.state,
        }
    }
}

/// The set of offers not yet driven to a terminal disposition.
#[derive(Default)]
pub struct OutstandingOffers {
    offers: DashMap<OfferId, OutstandingOffer>,
}

impl OutstandingOffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, offer: OutstandingOffer) {
        self.offers.insert(offer.offer_id.clone(), offer);
    }

    pub fn remove(&self, id: &OfferId) -> Option<OutstandingOffer> {
        self.offers.remove(id).map(|(_, offer)| offer)
    }

    pub fn contains(&self, id: &OfferId) -> bool {
        self.offers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn ids(&self) -> Vec<OfferId> {
        self.offers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn items_to_give(&self, id: &OfferId) -> Option<Vec<ItemKey>> {
        self.offers.get(id).map(|entry| entry.items_to_give.clone())
    }

    pub fn note_state(&self, id: &OfferId, state: OfferState) {
        if let Some(mut entry) = self.offers.get_mut(id) {
            entry.last_state = state;
        }
    }

    pub fn retry_count(&self, id: &OfferId, category: RetryCategory) -> Option<u32> {
        self.offers.get(id).map(|entry| entry.retries.count(category))
    }

    pub fn bump_retry(&self, id: &OfferId, category: RetryCategory) -> Option<u32> {
        self.offers
            .get_mut(id)
            .map(|mut entry| entry.retries.bump(category))
    }

    pub fn reset_retry(&self, id: &OfferId, category: RetryCategory) {
        if let Some(mut entry) = self.offers.get_mut(id) {
            entry.retries.reset(category);
        }
    }

    /// Union of give-items across outstanding offers, optionally skipping
    /// one offer. Used to reapply live reservations after a full ledger
    /// refresh.
    pub fn reserved_items_excluding(&self, skip: Option<&OfferId>) -> Vec<ItemKey> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for entry in self.offers.iter() {
            if skip.is_some_and(|id| id == entry.key()) {
                continue;
            }
            for key in &entry.items_to_give {
                if seen.insert(key.clone()) {
                    items.push(key.clone());
                }
            }
        }
        items
    }
}

/// Lock-free guard ensuring one resolution pass per offer id.
#[derive(Debug, Default)]
pub struct InFlightGuard {
    in_flight: DashSet<OfferId>,
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an offer id for resolution.
    ///
    /// Returns true if claimed (caller runs the pass), false if a pass is
    /// already running (caller drops the trigger).
    pub fn begin(&self, id: &OfferId) -> bool {
        self.in_flight.insert(id.clone())
    }

    pub fn finish(&self, id: &OfferId) {
        self.in_flight.remove(id);
    }

    pub fn is_in_flight(&self, id: &OfferId) -> bool {
        self.in_flight.contains(id)
    }
}
