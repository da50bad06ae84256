//! # Contribution Records
//!
//! Append-only log of contribution attempts keyed by gateway order id.
//!
//! - A record is created `pending` when the gateway hands out an order.
//! - It moves exactly once, to `succeeded` or `failed`. The move is a compare-and-set on the
//!   `pending` outcome, which is what turns a replayed callback into
//!   [`RecordError::AlreadySettled`] instead of a second ledger update.
//! - Records are never deleted. Pending records count for nothing in the ledger, so orphans
//!   from abandoned checkouts are harmless until the reaper fails them.
use std::{
    collections::{BTreeSet, HashMap, hash_map::Entry},
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    str::FromStr,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway::Amount;
use redis::RedisError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Outcome::Pending),
            "succeeded" => Ok(Outcome::Succeeded),
            "failed" => Ok(Outcome::Failed),
            other => Err(format!("unknown outcome {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub contributor: String,
    pub amount: Amount,
    pub order_id: String,
    pub outcome: Outcome,
    pub created_at: DateTime<Utc>,
}

impl Contribution {
    pub fn pending(campaign_id: Uuid, contributor: &str, amount: Amount, order_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            contributor: contributor.to_string(),
            amount,
            order_id: order_id.to_string(),
            outcome: Outcome::Pending,
            created_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Order {0} is already recorded")]
    DuplicateOrder(String),

    #[error("No contribution recorded for order {0}")]
    NotFound(String),

    #[error("Order {0} is already settled")]
    AlreadySettled(String),

    #[error("A contribution can only be settled as succeeded or failed")]
    InvalidOutcome,

    #[error("Contribution storage failure: {0}")]
    Storage(String),
}

impl From<RedisError> for RecordError {
    fn from(e: RedisError) -> Self {
        RecordError::Storage(e.to_string())
    }
}

#[async_trait]
pub trait ContributionStore: Send + Sync {
    async fn create_pending(
        &self,
        campaign_id: Uuid,
        contributor: &str,
        amount: Amount,
        order_id: &str,
    ) -> Result<Contribution, RecordError>;

    async fn get(&self, order_id: &str) -> Result<Option<Contribution>, RecordError>;

    /// Settles a pending record. Fails with [`RecordError::AlreadySettled`] for anything that is
    /// no longer pending.
    async fn mark_outcome(&self, order_id: &str, outcome: Outcome) -> Result<(), RecordError>;

    async fn for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Contribution>, RecordError>;

    /// Order ids still pending that were created before `cutoff`.
    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, RecordError>;

    async fn flag_unreconciled(&self, order_id: &str) -> Result<(), RecordError>;

    async fn unreconciled(&self) -> Result<Vec<String>, RecordError>;

    async fn is_unreconciled(&self, order_id: &str) -> Result<bool, RecordError>;
}

const SHARDS: usize = 16;

type Shard = RwLock<HashMap<String, Contribution>>;

/// Process-local store, used for development and tests.
///
/// Records are spread over [`SHARDS`] locks by order id, so settling one order never waits on
/// an unrelated one. Campaign-wide reads visit every shard.
pub struct InMemoryRecords {
    shards: Vec<Shard>,
    unreconciled: Mutex<BTreeSet<String>>,
}

impl Default for InMemoryRecords {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::default()).collect(),
            unreconciled: Mutex::default(),
        }
    }
}

impl InMemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard_index(order_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        order_id.hash(&mut hasher);

        (hasher.finish() % SHARDS as u64) as usize
    }

    fn shard(&self, order_id: &str) -> &Shard {
        &self.shards[Self::shard_index(order_id)]
    }

    async fn collect<T>(&self, pick: impl Fn(&Contribution) -> Option<T>) -> Vec<T> {
        let mut picked = Vec::new();

        for shard in &self.shards {
            picked.extend(shard.read().await.values().filter_map(&pick));
        }

        picked
    }
}

#[async_trait]
impl ContributionStore for InMemoryRecords {
    async fn create_pending(
        &self,
        campaign_id: Uuid,
        contributor: &str,
        amount: Amount,
        order_id: &str,
    ) -> Result<Contribution, RecordError> {
        match self.shard(order_id).write().await.entry(order_id.to_string()) {
            Entry::Occupied(_) => Err(RecordError::DuplicateOrder(order_id.to_string())),
            Entry::Vacant(entry) => {
                let record = Contribution::pending(campaign_id, contributor, amount, order_id);
                entry.insert(record.clone());

                Ok(record)
            }
        }
    }

    async fn get(&self, order_id: &str) -> Result<Option<Contribution>, RecordError> {
        Ok(self.shard(order_id).read().await.get(order_id).cloned())
    }

    async fn mark_outcome(&self, order_id: &str, outcome: Outcome) -> Result<(), RecordError> {
        if outcome == Outcome::Pending {
            return Err(RecordError::InvalidOutcome);
        }

        let mut records = self.shard(order_id).write().await;
        let record = records
            .get_mut(order_id)
            .ok_or_else(|| RecordError::NotFound(order_id.to_string()))?;

        if record.outcome != Outcome::Pending {
            return Err(RecordError::AlreadySettled(order_id.to_string()));
        }

        record.outcome = outcome;

        Ok(())
    }

    async fn for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Contribution>, RecordError> {
        let mut records = self
            .collect(|record| (record.campaign_id == campaign_id).then(|| record.clone()))
            .await;

        records.sort_by_key(|record| record.created_at);

        Ok(records)
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, RecordError> {
        Ok(self
            .collect(|record| {
                (record.outcome == Outcome::Pending && record.created_at < cutoff)
                    .then(|| record.order_id.clone())
            })
            .await)
    }

    async fn flag_unreconciled(&self, order_id: &str) -> Result<(), RecordError> {
        self.unreconciled.lock().await.insert(order_id.to_string());

        Ok(())
    }

    async fn unreconciled(&self) -> Result<Vec<String>, RecordError> {
        Ok(self.unreconciled.lock().await.iter().cloned().collect())
    }

    async fn is_unreconciled(&self, order_id: &str) -> Result<bool, RecordError> {
        Ok(self.unreconciled.lock().await.contains(order_id))
    }
}
