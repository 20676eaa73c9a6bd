//! Domain types shared between the engine, ledger, and orchestration layers.
//!
//! Item identity is a three-part composite key: the platform partitions
//! item namespaces into collections and sub-collections, and item ids are
//! only unique within one (collection, sub-collection) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A (collection, sub-collection) pair identifying one tracked inventory slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionKey {
    pub collection: String,
    pub sub_collection: String,
}

impl CollectionKey {
    pub fn new(collection: impl Into<String>, sub_collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            sub_collection: sub_collection.into(),
        }
    }
}

impl std::fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.sub_collection)
    }
}

/// Composite identity of a single tradable item.
///
/// Unique within one account's ledger; never shared across accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub collection: String,
    pub sub_collection: String,
    pub item: String,
}

impl ItemKey {
    pub fn new(
        collection: impl Into<String>,
        sub_collection: impl Into<String>,
        item: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            sub_collection: sub_collection.into(),
            item: item.into(),
        }
    }

    /// The (collection, sub-collection) slot this item lives in.
    pub fn collection_key(&self) -> CollectionKey {
        CollectionKey {
            collection: self.collection.clone(),
            sub_collection: self.sub_collection.clone(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.collection, self.sub_collection, self.item)
    }
}

/// One owned item as tracked by the ledger.
///
/// `payload` carries whatever metadata the platform attaches to the item;
/// the engine never inspects it. `reserved` is the engine-owned lock flag
/// marking the item as committed to an outstanding offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub key: ItemKey,
    pub payload: serde_json::Value,
    pub reserved: bool,
}

impl ItemRecord {
    pub fn new(key: ItemKey, payload: serde_json::Value) -> Self {
        Self {
            key,
            payload,
            reserved: false,
        }
    }
}

/// Platform-assigned identifier of a trade offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferId(pub String);

impl OfferId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OfferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OfferId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OfferId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Coarse offer-level state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferState {
    /// Malformed or not-yet-materialized offer.
    Invalid,
    /// Offer is open and awaiting the counterparty.
    Active,
    /// Counterparty accepted. Items have not necessarily moved yet.
    Accepted,
    /// Counterparty replied with a counter-offer.
    Countered,
    /// Offer expired without a response.
    Expired,
    /// Offer was cancelled by the sender.
    Canceled,
    /// Counterparty declined.
    Declined,
    /// One or more offered items became invalid.
    InvalidItems,
    /// Created but awaiting mobile confirmation by the sender.
    NeedsConfirmation,
    /// Cancelled through the sender's second factor.
    CanceledBySecondFactor,
    /// Held in escrow pending a waiting period or support action.
    InEscrow,
}

impl OfferState {
    /// States in which the offer is still pending and should simply be
    /// watched until the platform moves it.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            OfferState::Active | OfferState::NeedsConfirmation | OfferState::Invalid
        )
    }

    /// States the engine responds to by actively declining the offer.
    pub fn requires_decline(&self) -> bool {
        matches!(self, OfferState::Countered | OfferState::InEscrow)
    }

    /// Terminal states other than `Accepted`: the platform has concluded
    /// the offer and no items will be exchanged.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            OfferState::Expired
                | OfferState::Canceled
                | OfferState::Declined
                | OfferState::InvalidItems
                | OfferState::CanceledBySecondFactor
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OfferState::Invalid => "invalid",
            OfferState::Active => "active",
            OfferState::Accepted => "accepted",
            OfferState::Countered => "countered",
            OfferState::Expired => "expired",
            OfferState::Canceled => "canceled",
            OfferState::Declined => "declined",
            OfferState::InvalidItems => "invalid-items",
            OfferState::NeedsConfirmation => "needs-confirmation",
            OfferState::CanceledBySecondFactor => "canceled-by-second-factor",
            OfferState::InEscrow => "in-escrow",
        }
    }
}

impl std::fmt::Display for OfferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fine-grained exchange status reported once an offer is `Accepted`.
///
/// Distinct from [`OfferState`]: `Accepted` only means the counterparty
/// agreed; this signal says whether items actually changed hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeStatus {
    /// Exchange record created, nothing moved yet.
    Init,
    /// Both sides validated, commit not started.
    PreCommitted,
    /// Commit in progress.
    Committed,
    /// Items have changed hands.
    Completed,
    /// Exchange failed and was fully rolled back platform-side.
    Failed,
    /// Support rolled back part of the exchange.
    PartialRollback,
    /// Support rolled back the whole exchange.
    FullRollback,
    /// Support rolled back selected items.
    SelectiveRollback,
    /// A rollback was attempted and could not complete.
    RollbackFailed,
    /// A rollback was abandoned by support.
    RollbackAbandoned,
    /// Items are held in escrow.
    InEscrow,
    /// An escrowed exchange was rolled back.
    EscrowRollback,
}

impl ExchangeStatus {
    /// Items have not moved yet but should, absent platform trouble.
    pub fn is_settling(&self) -> bool {
        matches!(
            self,
            ExchangeStatus::Init | ExchangeStatus::PreCommitted | ExchangeStatus::Committed
        )
    }

    /// Any rollback variant: the platform reversed the exchange and local
    /// state can no longer be trusted without a full re-scan.
    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            ExchangeStatus::PartialRollback
                | ExchangeStatus::FullRollback
                | ExchangeStatus::SelectiveRollback
                | ExchangeStatus::RollbackAbandoned
                | ExchangeStatus::EscrowRollback
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeStatus::Init => "init",
            ExchangeStatus::PreCommitted => "pre-committed",
            ExchangeStatus::Committed => "committed",
            ExchangeStatus::Completed => "completed",
            ExchangeStatus::Failed => "failed",
            ExchangeStatus::PartialRollback => "partial-rollback",
            ExchangeStatus::FullRollback => "full-rollback",
            ExchangeStatus::SelectiveRollback => "selective-rollback",
            ExchangeStatus::RollbackFailed => "rollback-failed",
            ExchangeStatus::RollbackAbandoned => "rollback-abandoned",
            ExchangeStatus::InEscrow => "in-escrow",
            ExchangeStatus::EscrowRollback => "escrow-rollback",
        }
    }
}

impl std::fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A trade offer as observed from the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOffer {
    pub id: OfferId,
    pub state: OfferState,
    pub items_to_give: Vec<ItemKey>,
    pub items_to_receive: Vec<ItemKey>,
    pub created_at: DateTime<Utc>,
}

/// The exchange record behind an accepted offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeDetails {
    pub status: ExchangeStatus,
    /// Items that left this account, per the platform.
    pub sent_items: Vec<ItemKey>,
    /// Items that arrived, per the platform (keys only; full records come
    /// from a separate received-items fetch).
    pub received_items: Vec<ItemKey>,
}

/// Kind of a mobile confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationKind {
    /// Confirms a trade offer.
    Trade,
    /// Confirms a market listing.
    Listing,
    /// Anything else the platform may invent.
    Unknown,
}

/// A pending mobile confirmation. Transient: never persisted beyond the
/// handler's in-memory retry counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: String,
    pub kind: ConfirmationKind,
    /// The offer this confirmation was created for.
    pub creator: OfferId,
}

/// Phase labels for the outward `trade` event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradePhase {
    /// Offer was sent to the platform.
    SendSent,
    /// Mobile confirmation approved.
    ConfirmConfirmed,
    /// Mobile confirmation gave up after repeated transient failures.
    ConfirmFailed,
    /// Offer concluded without an exchange.
    OfferFailed,
    /// Offer concluded with items exchanged and the ledger updated.
    OfferExchanged,
}

impl TradePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradePhase::SendSent => "send.sent",
            TradePhase::ConfirmConfirmed => "confirm.confirmed",
            TradePhase::ConfirmFailed => "confirm.failed",
            TradePhase::OfferFailed => "offer.failed",
            TradePhase::OfferExchanged => "offer.exchanged",
        }
    }
}

impl std::fmt::Display for TradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Account credentials for the session transport and code generator.
///
/// Secrets are expected to arrive via environment overrides, never from
/// a checked-in config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Secret for one-time login codes.
    pub shared_secret: String,
    /// Secret for confirmation keys.
    pub identity_secret: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_key_display() {
        let key = ItemKey::new("440", "2", "812374");
        assert_eq!(key.to_string(), "440/2/812374");
        assert_eq!(key.collection_key(), CollectionKey::new("440", "2"));
    }

    #[test]
    fn test_offer_state_classes() {
        assert!(OfferState::Active.is_pending());
        assert!(OfferState::NeedsConfirmation.is_pending());
        assert!(OfferState::Invalid.is_pending());
        assert!(!OfferState::Accepted.is_pending());

        assert!(OfferState::Countered.requires_decline());
        assert!(OfferState::InEscrow.requires_decline());

        for state in [
            OfferState::Expired,
            OfferState::Canceled,
            OfferState::Declined,
            OfferState::InvalidItems,
            OfferState::CanceledBySecondFactor,
        ] {
            assert!(state.is_dead(), "{state} should be dead");
            assert!(!state.is_pending());
            assert!(!state.requires_decline());
        }

        assert!(!OfferState::Accepted.is_dead());
    }

    #[test]
    fn test_exchange_status_classes() {
        assert!(ExchangeStatus::Init.is_settling());
        assert!(ExchangeStatus::PreCommitted.is_settling());
        assert!(ExchangeStatus::Committed.is_settling());
        assert!(!ExchangeStatus::Completed.is_settling());

        for status in [
            ExchangeStatus::PartialRollback,
            ExchangeStatus::FullRollback,
            ExchangeStatus::SelectiveRollback,
            ExchangeStatus::RollbackAbandoned,
            ExchangeStatus::EscrowRollback,
        ] {
            assert!(status.is_rollback(), "{status} should be a rollback");
        }

        // RollbackFailed retries; it is not itself a resolved rollback.
        assert!(!ExchangeStatus::RollbackFailed.is_rollback());
        assert!(!ExchangeStatus::Failed.is_rollback());
    }

    #[test]
    fn test_trade_phase_labels() {
        assert_eq!(TradePhase::SendSent.to_string(), "send.sent");
        assert_eq!(TradePhase::ConfirmConfirmed.to_string(), "confirm.confirmed");
        assert_eq!(TradePhase::ConfirmFailed.to_string(), "confirm.failed");
        assert_eq!(TradePhase::OfferFailed.to_string(), "offer.failed");
        assert_eq!(TradePhase::OfferExchanged.to_string(), "offer.exchanged");
    }
}
