//! Outward structured event stream.
//!
//! Operators observe the bot exclusively through this channel: `info`,
//! `warning`, `err`, and `trade` phase events. Components receive a
//! cloned [`EventSink`] at construction time; sends are fire-and-forget
//! so a slow or dropped consumer can never stall the engine. Every emit
//! is mirrored to `tracing` for diagnostics.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use swap_common::{OfferId, TradePhase};

/// One event from one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    Info(String),
    Warning(String),
    Err {
        message: String,
        cause: Option<String>,
    },
    Trade {
        offer_id: OfferId,
        phase: TradePhase,
    },
}

/// An account event tagged with its account id, as fanned in by the
/// manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerEvent {
    pub account_id: String,
    pub event: AccountEvent,
}

/// Cloneable emitter handed to every component of one account.
#[derive(Clone)]
pub struct EventSink {
    account_id: String,
    tx: mpsc::UnboundedSender<AccountEvent>,
}

impl EventSink {
    /// Create a sink and the receiving end for its account.
    pub fn new(account_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<AccountEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                account_id: account_id.into(),
                tx,
            },
            rx,
        )
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(account = %self.account_id, "{message}");
        let _ = self.tx.send(AccountEvent::Info(message));
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(account = %self.account_id, "{message}");
        let _ = self.tx.send(AccountEvent::Warning(message));
    }

    pub fn err(&self, message: impl Into<String>, cause: Option<String>) {
        let message = message.into();
        match &cause {
            Some(cause) => error!(account = %self.account_id, cause = %cause, "{message}"),
            None => error!(account = %self.account_id, "{message}"),
        }
        let _ = self.tx.send(AccountEvent::Err { message, cause });
    }

    pub fn trade(&self, offer_id: &OfferId, phase: TradePhase) {
        info!(account = %self.account_id, offer = %offer_id, phase = %phase, "trade event");
        let _ = self.tx.send(AccountEvent::Trade {
            offer_id: offer_id.clone(),
            phase,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_flow_through() {
        let (sink, mut rx) = EventSink::new("acct-1");

        sink.info("hello");
        sink.warning("careful");
        sink.err("broke", Some("cause".to_string()));
        sink.trade(&OfferId::from("42"), TradePhase::SendSent);

        assert_eq!(rx.recv().await, Some(AccountEvent::Info("hello".into())));
        assert_eq!(rx.recv().await, Some(AccountEvent::Warning("careful".into())));
        assert_eq!(
            rx.recv().await,
            Some(AccountEvent::Err {
                message: "broke".into(),
                cause: Some("cause".into())
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(AccountEvent::Trade {
                offer_id: OfferId::from("42"),
                phase: TradePhase::SendSent
            })
        );
    }

    #[test]
    fn test_send_without_receiver_does_not_panic() {
        let (sink, rx) = EventSink::new("acct-1");
        drop(rx);
        sink.info("nobody listening");
        sink.trade(&OfferId::from("1"), TradePhase::OfferFailed);
    }
}
