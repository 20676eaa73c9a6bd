//! Offer resolution engine.
//!
//! Drives every sent (or discovered) trade offer from creation to a
//! terminal, locally-consistent outcome: a completed exchange reflected
//! in the ledger, or a cancelled/rolled-back offer with its reservations
//! released. The platform offers no push guarantees beyond periodic
//! state-change events, so the engine leans on three mechanisms:
//!
//! - an outstanding-offer set with per-category bounded retry counters,
//! - an in-flight guard de-duplicating concurrent resolution passes for
//!   the same offer id (an event-driven and a timer-driven check may
//!   race),
//! - cancellable single-shot watch timers guaranteeing forward progress
//!   for offers the platform goes silent on.
//!
//! Resolution passes run as spawned tasks, so one stalled offer's backoff
//! never blocks other offers or the account's event loop.

mod outstanding;
mod resolve;
mod retry;
mod watch;

pub use outstanding::{InFlightGuard, OutstandingOffer, OutstandingOffers};
pub use retry::{RetryCategory, RetryPolicy, RetryState};
pub use watch::WatchTimers;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use swap_common::{ItemKey, OfferId, OfferState, TradeOffer, TradePhase};

use crate::events::EventSink;
use crate::ledger::Ledger;
use crate::platform::{OfferClient, OfferError};

/// Failures surfaced to the caller of [`ResolutionEngine::send_trade`].
#[derive(Debug, Error)]
pub enum SendTradeError {
    /// Some requested items are absent from the ledger or already
    /// reserved by another outstanding offer. No offer was created.
    #[error("{} item(s) unavailable for offer", .0.len())]
    ItemsUnavailable(Vec<ItemKey>),

    #[error("failed to send offer")]
    Transport(#[from] OfferError),

    /// Returned by the orchestration layer for an unrecognized account.
    #[error("unknown account: {0}")]
    UnknownAccount(String),
}

/// Deadline configuration for the per-offer watch timer.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Time before an unresolved offer should be force-checked.
    pub cancel_after: Duration,
    /// Margin on top of `cancel_after`.
    pub grace: Duration,
}

impl WatchConfig {
    pub fn deadline(&self) -> Duration {
        self.cancel_after + self.grace
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            cancel_after: Duration::from_secs(300),
            grace: Duration::from_secs(30),
        }
    }
}

pub struct ResolutionEngine {
    account_id: String,
    offers: Arc<dyn OfferClient>,
    ledger: Arc<Ledger>,
    outstanding: OutstandingOffers,
    in_flight: InFlightGuard,
    timers: WatchTimers,
    policy: RetryPolicy,
    watch: WatchConfig,
    events: EventSink,
}

impl ResolutionEngine {
    /// Build an engine. `check_tx` is the channel watch timers notify on;
    /// the account worker feeds it back into [`Self::check_offer`].
    pub fn new(
        account_id: impl Into<String>,
        offers: Arc<dyn OfferClient>,
        ledger: Arc<Ledger>,
        policy: RetryPolicy,
        watch: WatchConfig,
        events: EventSink,
        check_tx: mpsc::UnboundedSender<OfferId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            account_id: account_id.into(),
            offers,
            ledger,
            outstanding: OutstandingOffers::new(),
            in_flight: InFlightGuard::new(),
            timers: WatchTimers::new(check_tx),
            policy,
            watch,
            events,
        })
    }

    /// Send a new offer: reserve the given items, send, register the
    /// outstanding offer, and arm its watch timer.
    pub async fn send_trade(
        self: &Arc<Self>,
        counterparty: &str,
        access_token: Option<&str>,
        items_to_give: Vec<ItemKey>,
        items_to_receive: Vec<ItemKey>,
    ) -> Result<OfferId, SendTradeError> {
        if let Err(unavailable) = self.ledger.try_reserve_all(&items_to_give) {
            self.events.err(
                format!(
                    "{} item(s) not available in the ledger, offer not sent",
                    unavailable.len()
                ),
                None,
            );
            return Err(SendTradeError::ItemsUnavailable(unavailable));
        }

        let mut draft = self.offers.create_offer(counterparty, access_token);
        draft.add_my_items(&items_to_give);
        draft.add_their_items(&items_to_receive);

        match self.offers.send(draft).await {
            Ok(offer_id) => {
                self.outstanding
                    .insert(OutstandingOffer::sent(offer_id.clone(), items_to_give));
                self.timers.schedule(offer_id.clone(), self.watch.deadline());
                self.events.trade(&offer_id, TradePhase::SendSent);
                Ok(offer_id)
            }
            Err(err) => {
                self.ledger.release(&items_to_give);
                self.events.err(
                    format!("Failed to send offer to {counterparty}"),
                    Some(err.to_string()),
                );
                Err(SendTradeError::Transport(err))
            }
        }
    }

    /// Entry point for platform `offer_changed` events.
    pub fn handle_offer_changed(self: &Arc<Self>, offer: TradeOffer, previous: OfferState) {
        self.events.info(format!(
            "Offer {} has changed state '{previous}' -> '{}'",
            offer.id, offer.state
        ));

        if !self.outstanding.contains(&offer.id) {
            // Created manually, or lost over a restart.
            if offer.state.is_dead() {
                self.events.info(format!(
                    "Ignoring unknown offer {} already in terminal state '{}'",
                    offer.id, offer.state
                ));
                return;
            }
            self.events
                .info(format!("Adopting unknown open offer {}", offer.id));
            let outcome = self.ledger.reserve(&offer.items_to_give);
            if !outcome.missing.is_empty() {
                self.events.warning(format!(
                    "Adopted offer {} references {} item(s) missing from the ledger",
                    offer.id,
                    outcome.missing.len()
                ));
            }
            self.outstanding.insert(OutstandingOffer::discovered(&offer));
            self.timers.schedule(offer.id.clone(), self.watch.deadline());
        }

        self.outstanding.note_state(&offer.id, offer.state);
        self.trigger(offer.id.clone(), Some(offer));
    }

    /// Entry point for watch-timer checks. A timer outliving its offer is
    /// a no-op.
    pub fn check_offer(self: &Arc<Self>, offer_id: OfferId) {
        if !self.outstanding.contains(&offer_id) {
            debug!(account = %self.account_id, offer = %offer_id, "watch check for resolved offer, ignoring");
            return;
        }
        self.trigger(offer_id, None);
    }

    /// Decline an offer and let the state machine observe the result and
    /// clean up. Used by the confirmation handler's escalation path.
    pub async fn cancel_offer(self: &Arc<Self>, offer_id: &OfferId) {
        self.events.info(format!("Cancelling offer {offer_id}"));
        if let Err(err) = self.offers.decline(offer_id).await {
            self.events.err(
                format!("Failed to decline offer {offer_id}"),
                Some(err.to_string()),
            );
        }
        if self.outstanding.contains(offer_id) {
            self.trigger(offer_id.clone(), None);
        }
    }

    /// Spawn a resolution pass unless one is already running for this id.
    fn trigger(self: &Arc<Self>, offer_id: OfferId, snapshot: Option<TradeOffer>) {
        if !self.in_flight.begin(&offer_id) {
            debug!(account = %self.account_id, offer = %offer_id, "resolution in flight, coalescing trigger");
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.resolve(&offer_id, snapshot).await;
            engine.in_flight.finish(&offer_id);
        });
    }

    /// Items currently reserved by outstanding offers. Passed to
    /// [`Ledger::refresh`] so a background re-scan keeps live locks.
    pub fn reserved_items(&self) -> Vec<ItemKey> {
        self.outstanding.reserved_items_excluding(None)
    }

    pub fn is_outstanding(&self, offer_id: &OfferId) -> bool {
        self.outstanding.contains(offer_id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Abort all pending watch timers (worker shutdown).
    pub fn shutdown(&self) {
        self.timers.shutdown();
    }
}
