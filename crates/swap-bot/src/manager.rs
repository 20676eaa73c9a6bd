//! Multi-account orchestration.
//!
//! Owns the mapping from account id to its running worker, merges the
//! per-account default config, routes `send_trade` calls, aggregates
//! inventories across accounts, and fans every account's event stream
//! into one outward channel tagged with the account id.

use dashmap::DashMap;
use tokio::sync::mpsc;

use swap_common::{CollectionKey, ItemKey, ItemRecord, OfferId};

use crate::account::{spawn_account, AccountCollaborators, AccountError, AccountHandle};
use crate::config::{AccountConfig, AccountDefaults, ManagerConfig};
use crate::engine::SendTradeError;
use crate::events::{EventSink, ManagerEvent};
use crate::platform::PlatformEvent;

pub struct Manager {
    defaults: AccountDefaults,
    accounts: DashMap<String, AccountHandle>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl Manager {
    /// Build a manager and the merged event stream its caller consumes.
    pub fn new(config: &ManagerConfig) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                defaults: config.defaults.clone(),
                accounts: DashMap::new(),
                events_tx,
            },
            events_rx,
        )
    }

    /// Start tracking an account. `platform_rx` is the event stream the
    /// external session/polling layer produces for this account.
    pub async fn add_account(
        &self,
        config: &AccountConfig,
        collaborators: AccountCollaborators,
        platform_rx: mpsc::UnboundedReceiver<PlatformEvent>,
    ) -> Result<String, AccountError> {
        let account_id = config.id.clone();
        let (sink, mut account_rx) = EventSink::new(account_id.clone());

        // Fan this account's events into the merged stream.
        let events_tx = self.events_tx.clone();
        let forward_id = account_id.clone();
        tokio::spawn(async move {
            while let Some(event) = account_rx.recv().await {
                let _ = events_tx.send(ManagerEvent {
                    account_id: forward_id.clone(),
                    event,
                });
            }
        });

        let resolved = config.resolve(&self.defaults);
        let handle = spawn_account(resolved, collaborators, platform_rx, sink).await?;
        self.accounts.insert(account_id.clone(), handle);
        Ok(account_id)
    }

    /// Send an offer from one account.
    pub async fn send_trade(
        &self,
        account_id: &str,
        counterparty: &str,
        access_token: Option<&str>,
        items_to_give: Vec<ItemKey>,
        items_to_receive: Vec<ItemKey>,
    ) -> Result<OfferId, SendTradeError> {
        // Clone the engine handle out so no map guard is held across the
        // network round trip.
        let engine = self
            .accounts
            .get(account_id)
            .map(|handle| handle.engine())
            .ok_or_else(|| SendTradeError::UnknownAccount(account_id.to_string()))?;
        engine
            .send_trade(counterparty, access_token, items_to_give, items_to_receive)
            .await
    }

    /// Snapshot of one (collection, sub-collection) slot across accounts.
    /// `accounts = None` means all tracked accounts.
    pub fn account_inventories(
        &self,
        pair: &CollectionKey,
        accounts: Option<&[String]>,
    ) -> Vec<ItemRecord> {
        self.accounts
            .iter()
            .filter(|entry| {
                accounts
                    .map(|ids| ids.iter().any(|id| id == entry.key()))
                    .unwrap_or(true)
            })
            .flat_map(|entry| entry.value().ledger().items(pair))
            .collect()
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.accounts.contains_key(account_id)
    }

    /// Stop every account worker and wait for them to drain.
    pub async fn shutdown(&self) {
        let ids = self.account_ids();
        for id in ids {
            if let Some((_, handle)) = self.accounts.remove(&id) {
                handle.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use swap_common::{Credentials, TradePhase};

    use crate::events::AccountEvent;
    use crate::platform::sim::SimPlatform;

    fn key(item: &str) -> ItemKey {
        ItemKey::new("440", "2", item)
    }

    fn record(item: &str) -> ItemRecord {
        ItemRecord::new(key(item), json!({ "name": item }))
    }

    fn account_config(id: &str) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            credentials: Credentials {
                username: id.to_string(),
                password: "hunter2".into(),
                shared_secret: "shared".into(),
                identity_secret: "identity".into(),
            },
            tracked: vec![CollectionKey::new("440", "2")],
            cancel_time: None,
            refresh_interval: None,
        }
    }

    fn sim_for(id: &str, items: &[&str]) -> (Arc<SimPlatform>, AccountCollaborators) {
        let sim = Arc::new(SimPlatform::new());
        sim.set_inventory(id, "440", "2", items.iter().map(|i| record(i)).collect());
        let collaborators = AccountCollaborators {
            session: sim.clone(),
            offers: sim.clone(),
            codes: sim.clone(),
            fetcher: sim.clone(),
        };
        (sim, collaborators)
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let config = ManagerConfig::default();
        let (manager, _events) = Manager::new(&config);

        let (sim_a, collab_a) = sim_for("acct-a", &["a1", "a2"]);
        let (sim_b, collab_b) = sim_for("acct-b", &["b1"]);

        manager
            .add_account(&account_config("acct-a"), collab_a, sim_a.events())
            .await
            .unwrap();
        manager
            .add_account(&account_config("acct-b"), collab_b, sim_b.events())
            .await
            .unwrap();

        let all = manager.account_inventories(&CollectionKey::new("440", "2"), None);
        assert_eq!(all.len(), 3);

        let only_b = manager.account_inventories(
            &CollectionKey::new("440", "2"),
            Some(&["acct-b".to_string()]),
        );
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].key, key("b1"));

        // Reserving on one account never touches the other.
        manager
            .send_trade("acct-a", "counterparty", None, vec![key("a1")], vec![])
            .await
            .unwrap();
        let b_items = manager.account_inventories(
            &CollectionKey::new("440", "2"),
            Some(&["acct-b".to_string()]),
        );
        assert!(b_items.iter().all(|item| !item.reserved));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_trade_unknown_account() {
        let config = ManagerConfig::default();
        let (manager, _events) = Manager::new(&config);

        let err = manager
            .send_trade("ghost", "counterparty", None, vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SendTradeError::UnknownAccount(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_events_are_tagged_with_account_id() {
        let config = ManagerConfig::default();
        let (manager, mut events) = Manager::new(&config);

        let (sim, collaborators) = sim_for("acct-a", &["a1"]);
        manager
            .add_account(&account_config("acct-a"), collaborators, sim.events())
            .await
            .unwrap();

        manager
            .send_trade("acct-a", "counterparty", None, vec![key("a1")], vec![])
            .await
            .unwrap();

        let tagged = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream open");
                if matches!(
                    event.event,
                    AccountEvent::Trade {
                        phase: TradePhase::SendSent,
                        ..
                    }
                ) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for the tagged trade event");

        assert_eq!(tagged.account_id, "acct-a");

        manager.shutdown().await;
    }
}
