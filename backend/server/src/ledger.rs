//! # Campaign Ledger
//!
//! Owns the aggregate financial fields of every campaign: `raised`, `contributors` and
//! `contributions_count`.
//!
//! ## Serialization
//!
//! Every mutation of one campaign goes through a single serialization point, so concurrent
//! settlements never lose an update:
//!
//! - [`InMemoryLedger`]: one async mutex per campaign. The map lock is only held long enough to
//!   find the campaign, so campaigns never wait on each other.
//! - [`RedisLedger`](crate::database::RedisLedger): one Lua script per mutation, which Redis runs
//!   atomically.
//!
//! Nothing here ever awaits the network while holding a campaign lock.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use gateway::Amount;
use redis::RedisError;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    campaign::{Campaign, CampaignStatus},
    user::Caller,
};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Campaign {0} not found")]
    NotFound(Uuid),

    #[error("Campaign {0} already exists")]
    AlreadyExists(Uuid),

    #[error("Campaign {0} is not accepting contributions")]
    NotAcceptingContributions(Uuid),

    #[error("Campaign cannot move from {from} to {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Caller may not change this campaign")]
    Forbidden,

    #[error("Campaign {0} changed concurrently, reload and retry")]
    Conflict(Uuid),

    #[error("Raised amount of campaign {0} overflowed")]
    Overflow(Uuid),

    #[error("Ledger storage failure: {0}")]
    Storage(String),
}

impl From<RedisError> for LedgerError {
    fn from(e: RedisError) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

#[async_trait]
pub trait CampaignLedger: Send + Sync {
    async fn create(&self, campaign: Campaign) -> Result<Campaign, LedgerError>;

    async fn get(&self, id: Uuid) -> Result<Campaign, LedgerError>;

    /// Moves a campaign through its lifecycle, failing with [`LedgerError::Conflict`] if another
    /// transition landed first.
    async fn set_status(
        &self,
        id: Uuid,
        next: CampaignStatus,
        caller: &Caller,
    ) -> Result<Campaign, LedgerError>;

    /// Adds one succeeded contribution: `raised += amount`, contributor joins the set,
    /// `contributions_count += 1`. Atomic per campaign.
    ///
    /// Keyed by `order_id`: applying an order the ledger already holds changes nothing and
    /// returns `Ok(false)`.
    async fn apply_contribution(
        &self,
        id: Uuid,
        order_id: &str,
        contributor: &str,
        amount: Amount,
    ) -> Result<bool, LedgerError>;

    async fn is_applied(&self, id: Uuid, order_id: &str) -> Result<bool, LedgerError>;

    async fn get_for_contribution(&self, id: Uuid) -> Result<Campaign, LedgerError> {
        let campaign = self.get(id).await?;
        campaign.ensure_accepting(Utc::now())?;

        Ok(campaign)
    }
}

/// One campaign plus the orders already counted into it.
struct Entry {
    campaign: Campaign,
    applied: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    campaigns: RwLock<HashMap<Uuid, Arc<Mutex<Entry>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: Uuid) -> Result<Arc<Mutex<Entry>>, LedgerError> {
        self.campaigns
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))
    }
}

#[async_trait]
impl CampaignLedger for InMemoryLedger {
    async fn create(&self, campaign: Campaign) -> Result<Campaign, LedgerError> {
        let mut campaigns = self.campaigns.write().await;

        if campaigns.contains_key(&campaign.id) {
            return Err(LedgerError::AlreadyExists(campaign.id));
        }

        let entry = Entry {
            campaign: campaign.clone(),
            applied: HashSet::new(),
        };
        campaigns.insert(campaign.id, Arc::new(Mutex::new(entry)));

        Ok(campaign)
    }

    async fn get(&self, id: Uuid) -> Result<Campaign, LedgerError> {
        let slot = self.slot(id).await?;
        let entry = slot.lock().await;

        Ok(entry.campaign.clone())
    }

    async fn set_status(
        &self,
        id: Uuid,
        next: CampaignStatus,
        caller: &Caller,
    ) -> Result<Campaign, LedgerError> {
        let slot = self.slot(id).await?;
        let mut entry = slot.lock().await;

        entry.campaign.check_transition(next, caller)?;
        entry.campaign.status = next;
        entry.campaign.version += 1;

        Ok(entry.campaign.clone())
    }

    async fn apply_contribution(
        &self,
        id: Uuid,
        order_id: &str,
        contributor: &str,
        amount: Amount,
    ) -> Result<bool, LedgerError> {
        let slot = self.slot(id).await?;
        let mut entry = slot.lock().await;

        if entry.applied.contains(order_id) {
            return Ok(false);
        }

        entry.campaign.apply(contributor, amount)?;
        entry.applied.insert(order_id.to_string());

        Ok(true)
    }

    async fn is_applied(&self, id: Uuid, order_id: &str) -> Result<bool, LedgerError> {
        let slot = self.slot(id).await?;
        let entry = slot.lock().await;

        Ok(entry.applied.contains(order_id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use gateway::Amount;
    use uuid::Uuid;

    use super::{CampaignLedger, InMemoryLedger, LedgerError};
    use crate::{
        campaign::{Campaign, CampaignStatus},
        user::Caller,
    };

    async fn approved(ledger: &InMemoryLedger) -> Uuid {
        let campaign = Campaign::new(
            "owner",
            "Library roof",
            Amount::from_minor(10000),
            Utc::now() + Duration::days(7),
        );
        let id = ledger.create(campaign).await.unwrap().id;

        ledger
            .set_status(id, CampaignStatus::Approved, &Caller::moderator("mod"))
            .await
            .unwrap();

        id
    }

    #[tokio::test]
    async fn test_get_for_contribution() {
        let ledger = InMemoryLedger::new();
        let pending = ledger
            .create(Campaign::new(
                "owner",
                "Pending",
                Amount::from_minor(100),
                Utc::now() + Duration::days(1),
            ))
            .await
            .unwrap();

        assert!(matches!(
            ledger.get_for_contribution(pending.id).await,
            Err(LedgerError::NotAcceptingContributions(_))
        ));
        assert!(matches!(
            ledger.get_for_contribution(Uuid::new_v4()).await,
            Err(LedgerError::NotFound(_))
        ));

        let id = approved(&ledger).await;
        assert_eq!(
            ledger.get_for_contribution(id).await.unwrap().status,
            CampaignStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_duplicate_create() {
        let ledger = InMemoryLedger::new();
        let campaign = Campaign::new(
            "owner",
            "Twice",
            Amount::from_minor(100),
            Utc::now() + Duration::days(1),
        );

        ledger.create(campaign.clone()).await.unwrap();
        assert!(matches!(
            ledger.create(campaign).await,
            Err(LedgerError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_unknown_campaign() {
        let ledger = InMemoryLedger::new();

        assert!(matches!(
            ledger
                .apply_contribution(Uuid::new_v4(), "order_1", "u1", Amount::from_minor(1))
                .await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_change_bumps_version() {
        let ledger = InMemoryLedger::new();
        let id = approved(&ledger).await;

        let closed = ledger
            .set_status(id, CampaignStatus::Closed, &Caller::member("owner"))
            .await
            .unwrap();

        assert_eq!(closed.status, CampaignStatus::Closed);
        assert_eq!(closed.version, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_applies_lose_nothing() {
        let ledger = Arc::new(InMemoryLedger::new());
        let id = approved(&ledger).await;

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .apply_contribution(
                            id,
                            &format!("order_{i}"),
                            &format!("u{}", i % 10),
                            Amount::from_minor(25),
                        )
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        let campaign = ledger.get(id).await.unwrap();
        assert_eq!(campaign.raised, Amount::from_minor(200 * 25));
        assert_eq!(campaign.contributions_count, 200);
        assert_eq!(campaign.contributors.len(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_campaigns_do_not_block_each_other() {
        let ledger = Arc::new(InMemoryLedger::new());
        let first = approved(&ledger).await;
        let second = approved(&ledger).await;

        let slot = ledger.slot(first).await.unwrap();
        let _held = slot.lock().await;

        assert!(
            ledger
                .apply_contribution(second, "order_1", "u1", Amount::from_minor(5))
                .await
                .unwrap()
        );
        assert_eq!(ledger.get(second).await.unwrap().raised, Amount::from_minor(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_order_counts_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let id = approved(&ledger).await;

        assert!(!ledger.is_applied(id, "order_1").await.unwrap());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .apply_contribution(id, "order_1", "u1", Amount::from_minor(40))
                        .await
                })
            })
            .collect();

        let mut fresh = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                fresh += 1;
            }
        }

        assert_eq!(fresh, 1);
        assert!(ledger.is_applied(id, "order_1").await.unwrap());

        let campaign = ledger.get(id).await.unwrap();
        assert_eq!(campaign.raised, Amount::from_minor(40));
        assert_eq!(campaign.contributions_count, 1);
    }
}
