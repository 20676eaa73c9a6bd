//! The resolution pass: classify an offer's coarse state (and, once
//! accepted, its fine exchange status) and drive it to a terminal
//! disposition.
//!
//! A pass loops until the offer either concludes or is parked pending
//! further platform events. Each retry iteration re-fetches the
//! authoritative offer rather than trusting a stale snapshot. Exactly one
//! pass runs per offer id; the caller holds the in-flight claim for the
//! whole pass.

use std::sync::Arc;

use swap_common::{ExchangeStatus, OfferId, TradeOffer, TradePhase};

use super::retry::RetryCategory;
use super::ResolutionEngine;
use crate::platform::OfferError;

impl ResolutionEngine {
    pub(super) async fn resolve(self: &Arc<Self>, offer_id: &OfferId, snapshot: Option<TradeOffer>) {
        let mut snapshot = snapshot;
        loop {
            let offer = match snapshot.take() {
                Some(offer) => offer,
                None => match self.offers.get_offer(offer_id).await {
                    Ok(offer) => offer,
                    Err(OfferError::NotFound) => {
                        self.events.err(
                            format!("Offer {offer_id} is unknown to the platform, abandoning resolution"),
                            None,
                        );
                        self.conclude_failure(offer_id);
                        return;
                    }
                    Err(err) => {
                        if self
                            .retry(offer_id, RetryCategory::ExchangeDetails, &err.to_string())
                            .await
                        {
                            continue;
                        }
                        return;
                    }
                },
            };
            self.outstanding.note_state(offer_id, offer.state);

            if offer.state.is_pending() {
                // Still waiting on the counterparty or our own
                // confirmation; keep the deadline armed so a silent
                // platform cannot stall the offer forever.
                self.timers.schedule(offer_id.clone(), self.watch.deadline());
                return;
            }

            if offer.state.requires_decline() {
                self.events.info(format!(
                    "Cancelling offer {offer_id} (state: {})",
                    offer.state
                ));
                match self.offers.decline(offer_id).await {
                    Ok(()) => {
                        self.release_and_fail(offer_id);
                        return;
                    }
                    Err(err) => {
                        if self
                            .retry(offer_id, RetryCategory::EscrowDecline, &err.to_string())
                            .await
                        {
                            continue;
                        }
                        return;
                    }
                }
            }

            if offer.state.is_dead() {
                // Authoritative negative outcome: items will no longer be
                // exchanged.
                self.release_and_fail(offer_id);
                return;
            }

            // Accepted does not mean items have moved; consult the
            // exchange record.
            let details = match self.offers.exchange_details(offer_id).await {
                Ok(details) => {
                    self.outstanding
                        .reset_retry(offer_id, RetryCategory::ExchangeDetails);
                    details
                }
                Err(err) => {
                    if self
                        .retry(offer_id, RetryCategory::ExchangeDetails, &err.to_string())
                        .await
                    {
                        continue;
                    }
                    return;
                }
            };

            match details.status {
                ExchangeStatus::Failed => {
                    self.events.info(format!(
                        "Exchange for offer {offer_id} failed and was fully rolled back"
                    ));
                    self.release_and_fail(offer_id);
                    return;
                }

                ExchangeStatus::PartialRollback
                | ExchangeStatus::FullRollback
                | ExchangeStatus::SelectiveRollback
                | ExchangeStatus::RollbackAbandoned
                | ExchangeStatus::EscrowRollback => {
                    self.events.info(format!(
                        "Exchange for offer {offer_id} was rolled back ({}), refreshing ledger",
                        details.status
                    ));
                    let reapply = self.outstanding.reserved_items_excluding(Some(offer_id));
                    if let Err(err) = self.ledger.refresh(&reapply).await {
                        self.events.err(
                            format!("Ledger refresh after rollback of offer {offer_id} failed"),
                            Some(err.to_string()),
                        );
                    }
                    self.conclude(offer_id);
                    self.events.trade(offer_id, TradePhase::OfferFailed);
                    return;
                }

                ExchangeStatus::RollbackFailed => {
                    if self
                        .retry(
                            offer_id,
                            RetryCategory::RollbackFailed,
                            "exchange stuck in a failed rollback",
                        )
                        .await
                    {
                        continue;
                    }
                    return;
                }

                ExchangeStatus::InEscrow => {
                    self.events
                        .info(format!("Cancelling escrowed offer {offer_id}"));
                    match self.offers.decline(offer_id).await {
                        Ok(()) => {
                            self.release_and_fail(offer_id);
                            return;
                        }
                        Err(err) => {
                            if self
                                .retry(offer_id, RetryCategory::EscrowDecline, &err.to_string())
                                .await
                            {
                                continue;
                            }
                            return;
                        }
                    }
                }

                ExchangeStatus::Init | ExchangeStatus::PreCommitted | ExchangeStatus::Committed => {
                    self.events.warning(format!(
                        "Offer {offer_id} has been accepted but its exchange is still '{}'",
                        details.status
                    ));
                    if self
                        .retry(offer_id, RetryCategory::NotComplete, "items not exchanged yet")
                        .await
                    {
                        continue;
                    }
                    return;
                }

                ExchangeStatus::Completed => {
                    // Fetch the incoming records before touching the
                    // ledger so the remove/add swap stays atomic.
                    let received = match self.offers.received_items(offer_id).await {
                        Ok(items) => items,
                        Err(err) => {
                            if self
                                .retry(offer_id, RetryCategory::ExchangeDetails, &err.to_string())
                                .await
                            {
                                continue;
                            }
                            return;
                        }
                    };
                    let given = self
                        .outstanding
                        .items_to_give(offer_id)
                        .unwrap_or_default();
                    self.ledger.remove_and_add(&details.sent_items, received);
                    // Any give-item the platform did not list as sent
                    // stays owned; drop its reservation.
                    self.ledger.release(&given);
                    self.conclude(offer_id);
                    self.events.trade(offer_id, TradePhase::OfferExchanged);
                    self.events.info(format!(
                        "Offer {offer_id} has been completed and new items recorded"
                    ));
                    return;
                }
            }
        }
    }

    /// Bounded backoff for one ambiguous condition.
    ///
    /// Returns true if the caller should re-check (after the category's
    /// backoff), false if the budget is exhausted and the offer has been
    /// failed terminally.
    async fn retry(&self, offer_id: &OfferId, category: RetryCategory, cause: &str) -> bool {
        let count = match self.outstanding.retry_count(offer_id, category) {
            Some(count) => count,
            // Concluded out from under us; nothing left to drive.
            None => return false,
        };
        if count >= self.policy.cap {
            self.events.err(
                format!(
                    "Offer {offer_id} still failing after {} retries ({category}: {cause}), giving up",
                    self.policy.cap
                ),
                None,
            );
            self.conclude_failure(offer_id);
            return false;
        }
        self.outstanding.bump_retry(offer_id, category);
        self.events.warning(format!(
            "Offer {offer_id}: {category} ({cause}), retry {} of {} in {:?}",
            count + 1,
            self.policy.cap,
            self.policy.backoff(category)
        ));
        tokio::time::sleep(self.policy.backoff(category)).await;
        true
    }

    /// Terminal branch for "items will not be exchanged": release the
    /// reservations and conclude.
    fn release_and_fail(&self, offer_id: &OfferId) {
        if let Some(items) = self.outstanding.items_to_give(offer_id) {
            self.ledger.release(&items);
        }
        self.conclude(offer_id);
        self.events.trade(offer_id, TradePhase::OfferFailed);
    }

    /// Terminal failure after an exhausted retry budget. Reservations are
    /// deliberately left in place: the items may or may not have moved,
    /// and an explicitly logged inconsistency beats silently re-offering
    /// items that are gone.
    fn conclude_failure(&self, offer_id: &OfferId) {
        let leftover = self
            .outstanding
            .items_to_give(offer_id)
            .unwrap_or_default();
        if !leftover.is_empty() {
            self.events.warning(format!(
                "Offer {offer_id} abandoned with {} item(s) still reserved, a ledger refresh may be needed",
                leftover.len()
            ));
        }
        self.conclude(offer_id);
        self.events.trade(offer_id, TradePhase::OfferFailed);
    }

    /// Remove the offer from the outstanding set and drop its timer.
    fn conclude(&self, offer_id: &OfferId) {
        self.timers.cancel(offer_id);
        self.outstanding.remove(offer_id);
    }
}
