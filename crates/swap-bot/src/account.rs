//! Per-account worker.
//!
//! One task per account owns the component bundle (ledger, session
//! coordinator, confirmation handler, resolution engine) and multiplexes
//! its inputs: platform events, watch-timer checks, the optional periodic
//! inventory re-scan, and shutdown. Accounts are fully isolated; nothing
//! here is shared across accounts.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use swap_common::{ItemKey, OfferId};

use crate::config::ResolvedAccountConfig;
use crate::confirmation::ConfirmationHandler;
use crate::engine::{ResolutionEngine, SendTradeError};
use crate::events::EventSink;
use crate::ledger::Ledger;
use crate::platform::{
    CodeGenerator, FetchError, InventoryFetcher, OfferClient, PlatformEvent, SessionTransport,
};
use crate::session::{SessionCoordinator, SessionState};

/// The external collaborators one account talks to.
#[derive(Clone)]
pub struct AccountCollaborators {
    pub session: Arc<dyn SessionTransport>,
    pub offers: Arc<dyn OfferClient>,
    pub codes: Arc<dyn CodeGenerator>,
    pub fetcher: Arc<dyn InventoryFetcher>,
}

/// Failures that abort account startup.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("initial inventory scan failed")]
    Tracking(#[from] FetchError),
}

/// Handle to a running account worker.
pub struct AccountHandle {
    account_id: String,
    engine: Arc<ResolutionEngine>,
    ledger: Arc<Ledger>,
    session: Arc<SessionCoordinator>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: JoinHandle<()>,
}

impl AccountHandle {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Send a new offer from this account.
    pub async fn send_trade(
        &self,
        counterparty: &str,
        access_token: Option<&str>,
        items_to_give: Vec<ItemKey>,
        items_to_receive: Vec<ItemKey>,
    ) -> Result<OfferId, SendTradeError> {
        self.engine
            .send_trade(counterparty, access_token, items_to_give, items_to_receive)
            .await
    }

    pub fn engine(&self) -> Arc<ResolutionEngine> {
        self.engine.clone()
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn outstanding_count(&self) -> usize {
        self.engine.outstanding_count()
    }

    /// Stop the worker and wait for it to drain.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.worker).await;
    }
}

/// Bring an account up: scan its inventories, log in, and start the
/// worker loop.
pub async fn spawn_account(
    config: ResolvedAccountConfig,
    collaborators: AccountCollaborators,
    platform_rx: mpsc::UnboundedReceiver<PlatformEvent>,
    events: EventSink,
) -> Result<AccountHandle, AccountError> {
    let account_id = config.id.clone();
    events.info("Starting tracking");

    let ledger = Arc::new(Ledger::new(
        account_id.clone(),
        config.tracked.clone(),
        collaborators.fetcher.clone(),
        events.clone(),
    ));
    ledger.start_tracking().await?;

    let session = SessionCoordinator::new(
        collaborators.session.clone(),
        collaborators.codes.clone(),
        config.credentials.clone(),
        events.clone(),
    );
    events.info("Logging in");
    if session.login_once().await.is_err() {
        // Login is never abandoned; the coordinator keeps retrying while
        // the worker comes up.
        session.handle_session_expired();
    }

    let (check_tx, check_rx) = mpsc::unbounded_channel();
    let engine = ResolutionEngine::new(
        account_id.clone(),
        collaborators.offers.clone(),
        ledger.clone(),
        config.policy.clone(),
        config.watch.clone(),
        events.clone(),
        check_tx,
    );
    let confirmations = Arc::new(ConfirmationHandler::new(
        collaborators.session.clone(),
        collaborators.codes.clone(),
        config.credentials.identity_secret.clone(),
        events.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let worker = tokio::spawn(run_worker(
        engine.clone(),
        ledger.clone(),
        session.clone(),
        confirmations,
        platform_rx,
        check_rx,
        shutdown_rx,
        config.refresh_interval,
    ));

    Ok(AccountHandle {
        account_id,
        engine,
        ledger,
        session,
        shutdown_tx: Some(shutdown_tx),
        worker,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    engine: Arc<ResolutionEngine>,
    ledger: Arc<Ledger>,
    session: Arc<SessionCoordinator>,
    confirmations: Arc<ConfirmationHandler>,
    mut platform_rx: mpsc::UnboundedReceiver<PlatformEvent>,
    mut check_rx: mpsc::UnboundedReceiver<OfferId>,
    mut shutdown_rx: oneshot::Receiver<()>,
    refresh_interval: Option<Duration>,
) {
    let mut refresh = refresh_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            event = platform_rx.recv() => match event {
                Some(PlatformEvent::SessionExpired) => session.handle_session_expired(),
                Some(PlatformEvent::NewConfirmation(confirmation)) => {
                    // Confirmations involve network round trips; keep the
                    // loop free for other events.
                    let confirmations = confirmations.clone();
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        confirmations.handle(confirmation, &engine).await;
                    });
                }
                Some(PlatformEvent::OfferChanged { offer, previous }) => {
                    engine.handle_offer_changed(offer, previous);
                }
                None => break,
            },
            Some(offer_id) = check_rx.recv() => engine.check_offer(offer_id),
            _ = tick(refresh.as_mut()) => {
                let ledger = ledger.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    let _ = ledger.refresh(&engine.reserved_items()).await;
                });
            }
            _ = &mut shutdown_rx => break,
        }
    }

    engine.shutdown();
}

/// Await the next refresh tick, or park forever when refresh is disabled.
async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use swap_common::{
        CollectionKey, ExchangeDetails, ExchangeStatus, ItemRecord, OfferState, TradePhase,
    };

    use crate::config::{AccountConfig, AccountDefaults};
    use crate::events::AccountEvent;
    use crate::platform::sim::SimPlatform;
    use swap_common::Credentials;

    fn key(item: &str) -> ItemKey {
        ItemKey::new("440", "2", item)
    }

    fn record(item: &str) -> ItemRecord {
        ItemRecord::new(key(item), json!({ "name": item }))
    }

    fn resolved_config(refresh_interval: Option<Duration>) -> ResolvedAccountConfig {
        let account = AccountConfig {
            id: "acct-1".to_string(),
            credentials: Credentials {
                username: "bot".into(),
                password: "hunter2".into(),
                shared_secret: "shared".into(),
                identity_secret: "identity".into(),
            },
            tracked: vec![CollectionKey::new("440", "2")],
            cancel_time: None,
            refresh_interval,
        };
        account.resolve(&AccountDefaults::default())
    }

    async fn start(
        refresh_interval: Option<Duration>,
    ) -> (
        Arc<SimPlatform>,
        AccountHandle,
        mpsc::UnboundedReceiver<AccountEvent>,
    ) {
        let sim = Arc::new(SimPlatform::new());
        sim.set_inventory("acct-1", "440", "2", vec![record("a"), record("b")]);
        let platform_rx = sim.events();
        let (sink, events) = EventSink::new("acct-1");

        let collaborators = AccountCollaborators {
            session: sim.clone(),
            offers: sim.clone(),
            codes: sim.clone(),
            fetcher: sim.clone(),
        };
        let handle = spawn_account(resolved_config(refresh_interval), collaborators, platform_rx, sink)
            .await
            .expect("account starts");
        (sim, handle, events)
    }

    async fn next_trade(
        events: &mut mpsc::UnboundedReceiver<AccountEvent>,
    ) -> (OfferId, TradePhase) {
        tokio::time::timeout(Duration::from_secs(3600), async {
            loop {
                match events.recv().await {
                    Some(AccountEvent::Trade { offer_id, phase }) => return (offer_id, phase),
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for a trade event")
    }

    #[tokio::test]
    async fn test_account_startup_scans_and_logs_in() {
        let (sim, handle, _events) = start(None).await;

        assert_eq!(handle.ledger().len(), 2);
        assert_eq!(handle.session_state(), SessionState::LoggedIn);
        assert_eq!(sim.login_calls(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_offer_lifecycle_through_platform_events() {
        let (sim, handle, mut events) = start(None).await;

        let id = handle
            .send_trade("counterparty-1", None, vec![key("a")], vec![])
            .await
            .unwrap();
        assert_eq!(next_trade(&mut events).await, (id.clone(), TradePhase::SendSent));

        sim.set_offer_state(&id, OfferState::Accepted);
        sim.push_exchange_details(
            &id,
            ExchangeDetails {
                status: ExchangeStatus::Completed,
                sent_items: vec![key("a")],
                received_items: vec![key("z")],
            },
        );
        sim.set_received_items(&id, vec![record("z")]);
        sim.emit_offer_changed(&id, OfferState::Active);

        assert_eq!(
            next_trade(&mut events).await,
            (id, TradePhase::OfferExchanged)
        );
        assert!(!handle.ledger().contains(&key("a")));
        assert!(handle.ledger().contains(&key("z")));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_confirmation_event_is_approved() {
        let (sim, handle, mut events) = start(None).await;

        let id = handle
            .send_trade("counterparty-1", None, vec![key("a")], vec![])
            .await
            .unwrap();
        let _ = next_trade(&mut events).await;

        sim.emit_new_confirmation(swap_common::Confirmation {
            id: "c1".to_string(),
            kind: swap_common::ConfirmationKind::Trade,
            creator: id.clone(),
        });

        assert_eq!(
            next_trade(&mut events).await,
            (id, TradePhase::ConfirmConfirmed)
        );

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expiry_triggers_relogin() {
        let (sim, handle, _events) = start(None).await;
        assert_eq!(sim.login_calls(), 1);

        sim.emit_session_expired();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert_eq!(sim.login_calls(), 2);
        assert_eq!(handle.session_state(), SessionState::LoggedIn);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh_keeps_live_reservations() {
        let (sim, handle, mut events) = start(Some(Duration::from_secs(900))).await;

        let id = handle
            .send_trade("counterparty-1", None, vec![key("a")], vec![])
            .await
            .unwrap();
        let _ = next_trade(&mut events).await;

        // Platform truth gained an item while we hold a reservation.
        sim.set_inventory("acct-1", "440", "2", vec![record("a"), record("b"), record("c")]);

        let fetches = sim.inventory_fetch_calls();
        // Let the worker's select loop poll the refresh interval once so its
        // tick deadline is registered against the paused clock before we
        // advance it.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(901)).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert!(sim.inventory_fetch_calls() > fetches, "refresh ran");
        assert!(handle.ledger().contains(&key("c")));
        assert!(
            handle.ledger().is_reserved(&key("a")),
            "outstanding offer {id} kept its reservation through the refresh"
        );

        handle.shutdown().await;
    }
}
