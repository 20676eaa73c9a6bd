//! In-memory simulated platform.
//!
//! Implements every collaborator trait against scriptable local state, so
//! the full engine can run without a network: the demo binary drives a
//! paper session through it, and the async tests script failure sequences
//! (stuck exchange statuses, transient confirmation faults, login
//! failures) that would be impossible to provoke against the real
//! platform on demand.
//!
//! Scripted response queues repeat their last entry, so a single pushed
//! status means "stuck there forever" and a sequence means "progress
//! through these, then stabilize".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use swap_common::{
    Confirmation, Credentials, ExchangeDetails, ItemRecord, OfferId, OfferState, TradeOffer,
};

use super::{
    AuthError, CodeGenerator, ConfirmationError, FetchError, InventoryFetcher, OfferClient,
    OfferDraft, OfferError, PlatformEvent, SessionToken, SessionTransport,
};

type InventorySlot = (String, String, String);

#[derive(Default)]
pub struct SimPlatform {
    // Offers
    offers: Mutex<HashMap<OfferId, TradeOffer>>,
    next_offer: AtomicU64,
    send_failures: AtomicUsize,
    decline_failures: AtomicUsize,
    get_offer_calls: AtomicUsize,
    decline_calls: AtomicUsize,

    // Exchange details
    details: Mutex<HashMap<OfferId, VecDeque<ExchangeDetails>>>,
    details_failures: AtomicUsize,
    details_calls: AtomicUsize,

    // Received items
    received: Mutex<HashMap<OfferId, Vec<ItemRecord>>>,
    received_failures: AtomicUsize,

    // Session
    login_failures: Mutex<VecDeque<AuthError>>,
    login_calls: AtomicUsize,
    confirmation_results: Mutex<VecDeque<Result<(), SimConfirmationError>>>,
    confirmation_responses: Mutex<Vec<(String, bool)>>,

    // Inventory
    inventories: Mutex<HashMap<InventorySlot, Vec<ItemRecord>>>,
    inventory_failures: AtomicUsize,
    inventory_calls: AtomicUsize,

    // Event push channel, wired by `events()`
    event_tx: Mutex<Option<mpsc::UnboundedSender<PlatformEvent>>>,
}

/// Cloneable stand-in for [`ConfirmationError`] so scripts can queue it.
#[derive(Debug, Clone, Copy)]
pub enum SimConfirmationError {
    CouldNotAct,
    NotFound,
}

impl From<SimConfirmationError> for ConfirmationError {
    fn from(err: SimConfirmationError) -> Self {
        match err {
            SimConfirmationError::CouldNotAct => ConfirmationError::CouldNotAct,
            SimConfirmationError::NotFound => ConfirmationError::NotFound,
        }
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    pub fn set_inventory(
        &self,
        account_id: &str,
        collection: &str,
        sub_collection: &str,
        records: Vec<ItemRecord>,
    ) {
        self.inventories.lock().insert(
            (
                account_id.to_string(),
                collection.to_string(),
                sub_collection.to_string(),
            ),
            records,
        );
    }

    /// Make the next `n` inventory fetches fail with a network error.
    pub fn fail_inventory_fetches(&self, n: usize) {
        self.inventory_failures.store(n, Ordering::SeqCst);
    }

    pub fn inventory_fetch_calls(&self) -> usize {
        self.inventory_calls.load(Ordering::SeqCst)
    }

    /// Register an offer the platform already knows about (startup
    /// discovery scenarios).
    pub fn register_offer(&self, offer: TradeOffer) {
        self.offers.lock().insert(offer.id.clone(), offer);
    }

    pub fn set_offer_state(&self, id: &OfferId, state: OfferState) {
        if let Some(offer) = self.offers.lock().get_mut(id) {
            offer.state = state;
        }
    }

    pub fn offer_state(&self, id: &OfferId) -> Option<OfferState> {
        self.offers.lock().get(id).map(|offer| offer.state)
    }

    pub fn offer(&self, id: &OfferId) -> Option<TradeOffer> {
        self.offers.lock().get(id).cloned()
    }

    /// Append a scripted exchange-details response for an offer.
    pub fn push_exchange_details(&self, id: &OfferId, details: ExchangeDetails) {
        self.details
            .lock()
            .entry(id.clone())
            .or_default()
            .push_back(details);
    }

    pub fn fail_exchange_details(&self, n: usize) {
        self.details_failures.store(n, Ordering::SeqCst);
    }

    pub fn exchange_details_calls(&self) -> usize {
        self.details_calls.load(Ordering::SeqCst)
    }

    pub fn set_received_items(&self, id: &OfferId, items: Vec<ItemRecord>) {
        self.received.lock().insert(id.clone(), items);
    }

    pub fn fail_received_items(&self, n: usize) {
        self.received_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, n: usize) {
        self.send_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_declines(&self, n: usize) {
        self.decline_failures.store(n, Ordering::SeqCst);
    }

    pub fn decline_calls(&self) -> usize {
        self.decline_calls.load(Ordering::SeqCst)
    }

    pub fn get_offer_calls(&self) -> usize {
        self.get_offer_calls.load(Ordering::SeqCst)
    }

    /// Queue a login failure; logins succeed once the queue drains.
    pub fn push_login_failure(&self, err: AuthError) {
        self.login_failures.lock().push_back(err);
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Queue a confirmation response; the queue's last entry repeats.
    pub fn push_confirmation_result(&self, result: Result<(), SimConfirmationError>) {
        self.confirmation_results.lock().push_back(result);
    }

    /// `(confirmation id, approve)` pairs in the order they were acted on.
    pub fn confirmation_responses(&self) -> Vec<(String, bool)> {
        self.confirmation_responses.lock().clone()
    }

    // =========================================================================
    // Event push
    // =========================================================================

    /// Wire up the platform event stream for one account worker.
    pub fn events(&self) -> mpsc::UnboundedReceiver<PlatformEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_tx.lock() = Some(tx);
        rx
    }

    fn push_event(&self, event: PlatformEvent) {
        if let Some(tx) = self.event_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn emit_session_expired(&self) {
        self.push_event(PlatformEvent::SessionExpired);
    }

    pub fn emit_new_confirmation(&self, confirmation: Confirmation) {
        self.push_event(PlatformEvent::NewConfirmation(confirmation));
    }

    /// Emit an offer-changed event carrying the offer's current state.
    pub fn emit_offer_changed(&self, id: &OfferId, previous: OfferState) {
        if let Some(offer) = self.offer(id) {
            self.push_event(PlatformEvent::OfferChanged { offer, previous });
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SessionTransport for SimPlatform {
    async fn login(
        &self,
        _credentials: &Credentials,
        _code: &str,
    ) -> Result<SessionToken, AuthError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.login_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(SessionToken(uuid::Uuid::new_v4().to_string()))
    }

    async fn respond_to_confirmation(
        &self,
        confirmation: &Confirmation,
        approve: bool,
        _time: i64,
        _key: &str,
    ) -> Result<(), ConfirmationError> {
        self.confirmation_responses
            .lock()
            .push((confirmation.id.clone(), approve));
        let mut results = self.confirmation_results.lock();
        match results.front().copied() {
            Some(result) => {
                if results.len() > 1 {
                    results.pop_front();
                }
                result.map_err(ConfirmationError::from)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OfferClient for SimPlatform {
    fn create_offer(&self, counterparty: &str, access_token: Option<&str>) -> OfferDraft {
        OfferDraft {
            counterparty: counterparty.to_string(),
            access_token: access_token.map(str::to_string),
            items_to_give: Vec::new(),
            items_to_receive: Vec::new(),
        }
    }

    async fn send(&self, draft: OfferDraft) -> Result<OfferId, OfferError> {
        if Self::take_failure(&self.send_failures) {
            return Err(OfferError::Network("simulated send failure".into()));
        }
        let id = OfferId(format!(
            "sim-offer-{}",
            self.next_offer.fetch_add(1, Ordering::SeqCst) + 1
        ));
        let offer = TradeOffer {
            id: id.clone(),
            state: OfferState::Active,
            items_to_give: draft.items_to_give,
            items_to_receive: draft.items_to_receive,
            created_at: Utc::now(),
        };
        self.offers.lock().insert(id.clone(), offer);
        Ok(id)
    }

    async fn get_offer(&self, id: &OfferId) -> Result<TradeOffer, OfferError> {
        self.get_offer_calls.fetch_add(1, Ordering::SeqCst);
        self.offer(id).ok_or(OfferError::NotFound)
    }

    async fn accept(&self, id: &OfferId) -> Result<(), OfferError> {
        let mut offers = self.offers.lock();
        let offer = offers.get_mut(id).ok_or(OfferError::NotFound)?;
        offer.state = OfferState::Accepted;
        Ok(())
    }

    async fn decline(&self, id: &OfferId) -> Result<(), OfferError> {
        self.decline_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.decline_failures) {
            return Err(OfferError::Network("simulated decline failure".into()));
        }
        let mut offers = self.offers.lock();
        let offer = offers.get_mut(id).ok_or(OfferError::NotFound)?;
        offer.state = OfferState::Declined;
        Ok(())
    }

    async fn exchange_details(&self, id: &OfferId) -> Result<ExchangeDetails, OfferError> {
        self.details_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.details_failures) {
            return Err(OfferError::Network("simulated details failure".into()));
        }
        let mut details = self.details.lock();
        let queue = details.get_mut(id).ok_or(OfferError::NotFound)?;
        match queue.front().cloned() {
            Some(entry) => {
                if queue.len() > 1 {
                    queue.pop_front();
                }
                Ok(entry)
            }
            None => Err(OfferError::NotFound),
        }
    }

    async fn received_items(&self, id: &OfferId) -> Result<Vec<ItemRecord>, OfferError> {
        if Self::take_failure(&self.received_failures) {
            return Err(OfferError::Network("simulated received-items failure".into()));
        }
        Ok(self.received.lock().get(id).cloned().unwrap_or_default())
    }
}

impl CodeGenerator for SimPlatform {
    fn current_time(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn auth_code(&self, shared_secret: &str) -> String {
        format!("code-{}-{}", shared_secret.len(), self.current_time() / 30)
    }

    fn confirmation_key(&self, identity_secret: &str, time: i64, tag: &str) -> String {
        format!("key-{}-{}-{}", identity_secret.len(), time, tag)
    }
}

#[async_trait]
impl InventoryFetcher for SimPlatform {
    async fn fetch_inventory(
        &self,
        account_id: &str,
        collection: &str,
        sub_collection: &str,
    ) -> Result<Vec<ItemRecord>, FetchError> {
        self.inventory_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.inventory_failures) {
            return Err(FetchError::Network("simulated fetch failure".into()));
        }
        Ok(self
            .inventories
            .lock()
            .get(&(
                account_id.to_string(),
                collection.to_string(),
                sub_collection.to_string(),
            ))
            .cloned()
            .unwrap_or_default())
    }
}
