//! Collaborator contracts for the trading platform.
//!
//! Everything network-shaped lives behind these traits: the session
//! transport, the trade-offer API, one-time code generation, and the raw
//! inventory fetch. The engine only ever sees these seams, so the same
//! resolution logic runs against the real platform or the in-memory
//! simulator in [`sim`].
//!
//! Platform-sourced events (session expiry, new confirmations, offer
//! state changes) arrive on a plain channel as [`PlatformEvent`]s; the
//! external polling loop that produces them is out of scope here.

pub mod sim;

use async_trait::async_trait;
use thiserror::Error;

use swap_common::{
    Confirmation, Credentials, ExchangeDetails, ItemKey, ItemRecord, OfferId, OfferState,
    TradeOffer,
};

/// Errors from the session transport.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A manual step on the operator's device is required; retrying alone
    /// will not resolve this.
    #[error("mobile confirmation required")]
    MobileConfirmationRequired,

    #[error("rate limited")]
    RateLimited,

    #[error("network failure: {0}")]
    Network(String),
}

/// Errors from acting on a mobile confirmation.
#[derive(Debug, Error)]
pub enum ConfirmationError {
    /// The platform acknowledged the confirmation but refused to act on
    /// it right now. The external checker will resurface it next poll.
    #[error("could not act on confirmation")]
    CouldNotAct,

    #[error("confirmation not found")]
    NotFound,

    #[error("network failure: {0}")]
    Network(String),
}

impl ConfirmationError {
    /// Transient failures are retried across polling cycles; anything
    /// else means the confirmation is gone and tracking should stop.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConfirmationError::CouldNotAct)
    }
}

/// Errors from the trade-offer API.
#[derive(Debug, Error)]
pub enum OfferError {
    #[error("offer not found")]
    NotFound,

    #[error("offer rejected by platform: {0}")]
    Rejected(String),

    #[error("network failure: {0}")]
    Network(String),
}

/// Errors from the inventory fetch transport.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("inventory is private")]
    Private,

    #[error("rate limited")]
    RateLimited,

    #[error("network failure: {0}")]
    Network(String),
}

/// Opaque session token returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken(pub String);

/// A not-yet-sent offer under construction.
#[derive(Debug, Clone, Default)]
pub struct OfferDraft {
    pub counterparty: String,
    pub access_token: Option<String>,
    pub items_to_give: Vec<ItemKey>,
    pub items_to_receive: Vec<ItemKey>,
}

impl OfferDraft {
    pub fn add_my_items(&mut self, items: &[ItemKey]) {
        self.items_to_give.extend_from_slice(items);
    }

    pub fn add_their_items(&mut self, items: &[ItemKey]) {
        self.items_to_receive.extend_from_slice(items);
    }
}

/// An event sourced from the platform for one account.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    /// The platform invalidated the current session.
    SessionExpired,
    /// A new mobile confirmation appeared.
    NewConfirmation(Confirmation),
    /// A sent offer changed coarse state.
    OfferChanged {
        offer: TradeOffer,
        previous: OfferState,
    },
}

/// Login and confirmation transport.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Authenticate with a fresh one-time code.
    async fn login(&self, credentials: &Credentials, code: &str)
        -> Result<SessionToken, AuthError>;

    /// Approve or reject a mobile confirmation, proving possession of the
    /// identity secret via a time/key pair.
    async fn respond_to_confirmation(
        &self,
        confirmation: &Confirmation,
        approve: bool,
        time: i64,
        key: &str,
    ) -> Result<(), ConfirmationError>;
}

/// Trade-offer API.
#[async_trait]
pub trait OfferClient: Send + Sync {
    /// Start a draft offer to a counterparty.
    fn create_offer(&self, counterparty: &str, access_token: Option<&str>) -> OfferDraft;

    /// Send a draft; returns the platform-assigned offer id.
    async fn send(&self, draft: OfferDraft) -> Result<OfferId, OfferError>;

    async fn get_offer(&self, id: &OfferId) -> Result<TradeOffer, OfferError>;

    async fn accept(&self, id: &OfferId) -> Result<(), OfferError>;

    async fn decline(&self, id: &OfferId) -> Result<(), OfferError>;

    /// The exchange record behind an accepted offer.
    async fn exchange_details(&self, id: &OfferId) -> Result<ExchangeDetails, OfferError>;

    /// Full records for items received through a completed exchange.
    async fn received_items(&self, id: &OfferId) -> Result<Vec<ItemRecord>, OfferError>;
}

/// One-time code generation. Pure computation; no suspension points.
pub trait CodeGenerator: Send + Sync {
    /// Platform-synchronized timestamp used for code derivation.
    fn current_time(&self) -> i64;

    /// One-time login code from the shared secret.
    fn auth_code(&self, shared_secret: &str) -> String;

    /// Confirmation key from the identity secret for the given tag.
    fn confirmation_key(&self, identity_secret: &str, time: i64, tag: &str) -> String;
}

/// Raw inventory fetch for one (collection, sub-collection) pair.
#[async_trait]
pub trait InventoryFetcher: Send + Sync {
    async fn fetch_inventory(
        &self,
        account_id: &str,
        collection: &str,
        sub_collection: &str,
    ) -> Result<Vec<ItemRecord>, FetchError>;
}
