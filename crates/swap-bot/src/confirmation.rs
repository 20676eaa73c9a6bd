//! Mobile confirmation handling.
//!
//! Each confirmation goes `Pending -> Approved` or `Pending -> Rejected`.
//! Non-trade confirmations are rejected outright: this bot only ever
//! creates trade offers, so anything else was not ours to approve. Trade
//! confirmations are approved with a time/key proof from the code
//! generator.
//!
//! A transient "could not act" failure is not busy-retried; the external
//! confirmation checker will resurface the confirmation on its next poll
//! and we count the strike. On the fifth strike for the same confirmation
//! id the offer is declared unconfirmable: emit `confirm.failed`, decline
//! the offer, and let the resolution engine release its reservations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use swap_common::{Confirmation, ConfirmationKind, TradePhase};

use crate::engine::ResolutionEngine;
use crate::events::EventSink;
use crate::platform::{CodeGenerator, ConfirmationError, SessionTransport};

/// Transient failures tolerated per confirmation id before escalating.
pub const CONFIRMATION_RETRY_CAP: u32 = 5;

pub struct ConfirmationHandler {
    session: Arc<dyn SessionTransport>,
    codes: Arc<dyn CodeGenerator>,
    identity_secret: String,
    retries: Mutex<HashMap<String, u32>>,
    events: EventSink,
}

impl ConfirmationHandler {
    pub fn new(
        session: Arc<dyn SessionTransport>,
        codes: Arc<dyn CodeGenerator>,
        identity_secret: impl Into<String>,
        events: EventSink,
    ) -> Self {
        Self {
            session,
            codes,
            identity_secret: identity_secret.into(),
            retries: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// React to one confirmation surfaced by the external checker.
    pub async fn handle(&self, confirmation: Confirmation, engine: &Arc<ResolutionEngine>) {
        if confirmation.kind != ConfirmationKind::Trade {
            self.events
                .warning("A non-trade confirmation was created".to_string());
            if let Err(err) = self.respond(&confirmation, false).await {
                self.events.err(
                    format!("Failed to reject confirmation {}", confirmation.id),
                    Some(err.to_string()),
                );
            }
            return;
        }

        let offer_id = confirmation.creator.clone();
        match self.respond(&confirmation, true).await {
            Ok(()) => {
                self.retries.lock().remove(&confirmation.id);
                self.events
                    .info(format!("Accepted confirmation {}", confirmation.id));
                self.events.trade(&offer_id, TradePhase::ConfirmConfirmed);
            }
            Err(err) if err.is_transient() => {
                let strikes = {
                    let mut retries = self.retries.lock();
                    let count = retries.entry(confirmation.id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                if strikes >= CONFIRMATION_RETRY_CAP {
                    self.retries.lock().remove(&confirmation.id);
                    self.events.info(format!(
                        "Retried confirmation {} too many times, cancelling offer {offer_id}",
                        confirmation.id
                    ));
                    self.events.trade(&offer_id, TradePhase::ConfirmFailed);
                    engine.cancel_offer(&offer_id).await;
                }
                // Otherwise: leave it for the checker's next polling cycle.
            }
            Err(err) => {
                // The confirmation vanished; it will not be resurfaced.
                self.retries.lock().remove(&confirmation.id);
                self.events.err(
                    format!("Failed to act on confirmation {}", confirmation.id),
                    Some(err.to_string()),
                );
            }
        }
    }

    async fn respond(
        &self,
        confirmation: &Confirmation,
        approve: bool,
    ) -> Result<(), ConfirmationError> {
        let time = self.codes.current_time();
        let tag = if approve { "allow" } else { "cancel" };
        let key = self.codes.confirmation_key(&self.identity_secret, time, tag);
        self.session
            .respond_to_confirmation(confirmation, approve, time, &key)
            .await
    }

    /// Number of confirmation ids currently carrying strikes.
    pub fn tracked(&self) -> usize {
        self.retries.lock().len()
    }
}
