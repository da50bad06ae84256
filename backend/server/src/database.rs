//! # Redis
//!
//! Durable home of campaign aggregates and contribution records.
//!
//! ## Layout
//!
//! - `campaign:{id}`: hash of the campaign fields, including `raised`, `contributions_count`
//!   and `version`
//! - `campaign:{id}:contributors`: set of contributor ids
//! - `campaign:{id}:contributions`: set of order ids recorded for the campaign
//! - `campaign:{id}:applied`: set of order ids already counted into `raised`
//! - `contribution:{order id}`: hash of one contribution record
//! - `contributions:pending`: sorted set of pending order ids scored by creation time (ms)
//! - `contributions:unreconciled`: set of order ids waiting for manual reconciliation
//!
//! ## Atomicity
//!
//! Every write that needs to read first is a Lua script. Redis runs a script to completion
//! before serving anything else, which gives us:
//!
//! - insert-if-absent for campaigns and records
//! - compare-and-set on campaign status and contribution outcome
//! - one atomic increment of `raised`, `contributions_count`, `version` plus the contributor
//!   `SADD`, skipped when the order is already in the applied set
//!
//! Redis does not roll a script back when a command fails halfway. The first write of every
//! script is the one that can fail (`HINCRBY` overflow), so a failed script has written nothing.
//!
//! Scripts that change a campaign return the campaign they left behind, so a committed write
//! never needs a second round trip to report itself.
use std::{collections::HashMap, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use gateway::Amount;
use redis::{
    AsyncCommands, Client, RedisResult, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    campaign::{Campaign, CampaignStatus},
    ledger::{CampaignLedger, LedgerError},
    records::{Contribution, ContributionStore, Outcome, RecordError},
    user::Caller,
};

const PENDING_KEY: &str = "contributions:pending";
const UNRECONCILED_KEY: &str = "contributions:unreconciled";

const INSERT_IF_ABSENT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
";

const SET_STATUS: &str = r"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return {-1, {}, {}} end
if current ~= ARGV[1] then return {0, {}, {}} end
redis.call('HSET', KEYS[1], 'status', ARGV[2])
redis.call('HINCRBY', KEYS[1], 'version', 1)
return {1, redis.call('HGETALL', KEYS[1]), redis.call('SMEMBERS', KEYS[2])}
";

const APPLY_CONTRIBUTION: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
if redis.call('SISMEMBER', KEYS[3], ARGV[3]) == 1 then return 0 end
redis.call('HINCRBY', KEYS[1], 'raised', ARGV[1])
redis.call('SADD', KEYS[3], ARGV[3])
redis.call('HINCRBY', KEYS[1], 'contributions_count', 1)
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('HINCRBY', KEYS[1], 'version', 1)
return 1
";

const CREATE_PENDING: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
return 1
";

const MARK_OUTCOME: &str = r"
local outcome = redis.call('HGET', KEYS[1], 'outcome')
if not outcome then return -1 end
if outcome ~= 'pending' then return 0 end
redis.call('HSET', KEYS[1], 'outcome', ARGV[2])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
";

pub async fn init_redis(redis_url: &str) -> RedisResult<ConnectionManager> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;

    client.get_connection_manager_with_config(config).await
}

fn campaign_key(id: Uuid) -> String {
    format!("campaign:{id}")
}

fn contributors_key(id: Uuid) -> String {
    format!("campaign:{id}:contributors")
}

fn campaign_contributions_key(id: Uuid) -> String {
    format!("campaign:{id}:contributions")
}

fn applied_key(id: Uuid) -> String {
    format!("campaign:{id}:applied")
}

fn contribution_key(order_id: &str) -> String {
    format!("contribution:{order_id}")
}

fn field<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T, String> {
    fields
        .get(name)
        .ok_or_else(|| format!("missing field {name}"))?
        .parse()
        .map_err(|_| format!("unreadable field {name}"))
}

/// `HGETALL` as returned from inside a script: a flat `[field, value, ...]` list.
fn pairs(flat: Vec<String>) -> HashMap<String, String> {
    let mut fields = HashMap::with_capacity(flat.len() / 2);
    let mut flat = flat.into_iter();

    while let (Some(name), Some(value)) = (flat.next(), flat.next()) {
        fields.insert(name, value);
    }

    fields
}

fn timestamp(fields: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>, String> {
    Utc.timestamp_millis_opt(field(fields, name)?)
        .single()
        .ok_or_else(|| format!("out of range timestamp {name}"))
}

fn campaign_from_fields(
    id: Uuid,
    fields: &HashMap<String, String>,
    contributors: Vec<String>,
) -> Result<Campaign, String> {
    Ok(Campaign {
        id,
        owner: field(fields, "owner")?,
        title: field(fields, "title")?,
        goal: Amount::from_minor(field(fields, "goal")?),
        raised: Amount::from_minor(field(fields, "raised")?),
        deadline: timestamp(fields, "deadline")?,
        status: field(fields, "status")?,
        contributors: contributors.into_iter().collect(),
        contributions_count: field(fields, "contributions_count")?,
        version: field(fields, "version")?,
        created_at: timestamp(fields, "created_at")?,
    })
}

fn contribution_from_fields(fields: &HashMap<String, String>) -> Result<Contribution, String> {
    Ok(Contribution {
        id: field(fields, "id")?,
        campaign_id: field(fields, "campaign_id")?,
        contributor: field(fields, "contributor")?,
        amount: Amount::from_minor(field(fields, "amount")?),
        order_id: field(fields, "order_id")?,
        outcome: field(fields, "outcome")?,
        created_at: timestamp(fields, "created_at")?,
    })
}

pub struct RedisLedger {
    connection: ConnectionManager,
    insert: Script,
    swap_status: Script,
    apply: Script,
}

impl RedisLedger {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            insert: Script::new(INSERT_IF_ABSENT),
            swap_status: Script::new(SET_STATUS),
            apply: Script::new(APPLY_CONTRIBUTION),
        }
    }
}

#[async_trait]
impl CampaignLedger for RedisLedger {
    async fn create(&self, campaign: Campaign) -> Result<Campaign, LedgerError> {
        let mut connection = self.connection.clone();

        let mut invocation = self.insert.key(campaign_key(campaign.id));
        invocation
            .arg("owner")
            .arg(&campaign.owner)
            .arg("title")
            .arg(&campaign.title)
            .arg("goal")
            .arg(campaign.goal.minor())
            .arg("raised")
            .arg(campaign.raised.minor())
            .arg("deadline")
            .arg(campaign.deadline.timestamp_millis())
            .arg("status")
            .arg(campaign.status.as_str())
            .arg("contributions_count")
            .arg(campaign.contributions_count)
            .arg("version")
            .arg(campaign.version)
            .arg("created_at")
            .arg(campaign.created_at.timestamp_millis());

        let inserted: i64 = invocation.invoke_async(&mut connection).await?;
        if inserted == 0 {
            return Err(LedgerError::AlreadyExists(campaign.id));
        }

        Ok(campaign)
    }

    async fn get(&self, id: Uuid) -> Result<Campaign, LedgerError> {
        let mut connection = self.connection.clone();

        let (fields, contributors): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .atomic()
            .hgetall(campaign_key(id))
            .smembers(contributors_key(id))
            .query_async(&mut connection)
            .await?;

        if fields.is_empty() {
            return Err(LedgerError::NotFound(id));
        }

        campaign_from_fields(id, &fields, contributors)
            .map_err(|e| LedgerError::Storage(format!("campaign {id}: {e}")))
    }

    async fn set_status(
        &self,
        id: Uuid,
        next: CampaignStatus,
        caller: &Caller,
    ) -> Result<Campaign, LedgerError> {
        let campaign = self.get(id).await?;
        campaign.check_transition(next, caller)?;

        let mut connection = self.connection.clone();
        let (swapped, fields, contributors): (i64, Vec<String>, Vec<String>) = self
            .swap_status
            .key(campaign_key(id))
            .key(contributors_key(id))
            .arg(campaign.status.as_str())
            .arg(next.as_str())
            .invoke_async(&mut connection)
            .await?;

        match swapped {
            -1 => Err(LedgerError::NotFound(id)),
            0 => Err(LedgerError::Conflict(id)),
            _ => match campaign_from_fields(id, &pairs(fields), contributors) {
                Ok(updated) => Ok(updated),
                Err(e) => {
                    warn!("Campaign {id} moved to {next} but reads back badly: {e}");

                    Ok(Campaign {
                        status: next,
                        version: campaign.version + 1,
                        ..campaign
                    })
                }
            },
        }
    }

    async fn apply_contribution(
        &self,
        id: Uuid,
        order_id: &str,
        contributor: &str,
        amount: Amount,
    ) -> Result<bool, LedgerError> {
        let mut connection = self.connection.clone();

        let applied: i64 = self
            .apply
            .key(campaign_key(id))
            .key(contributors_key(id))
            .key(applied_key(id))
            .arg(amount.minor())
            .arg(contributor)
            .arg(order_id)
            .invoke_async(&mut connection)
            .await?;

        match applied {
            -1 => Err(LedgerError::NotFound(id)),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    async fn is_applied(&self, id: Uuid, order_id: &str) -> Result<bool, LedgerError> {
        let mut connection = self.connection.clone();

        Ok(connection.sismember(applied_key(id), order_id).await?)
    }
}

pub struct RedisRecords {
    connection: ConnectionManager,
    create: Script,
    mark: Script,
}

impl RedisRecords {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            create: Script::new(CREATE_PENDING),
            mark: Script::new(MARK_OUTCOME),
        }
    }

    async fn load(&self, order_ids: &[String]) -> Result<Vec<Contribution>, RecordError> {
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut connection = self.connection.clone();
        let mut pipe = redis::pipe();
        for order_id in order_ids {
            pipe.hgetall(contribution_key(order_id));
        }

        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut connection).await?;

        rows.iter()
            .filter(|fields| !fields.is_empty())
            .map(|fields| contribution_from_fields(fields).map_err(RecordError::Storage))
            .collect()
    }
}

#[async_trait]
impl ContributionStore for RedisRecords {
    async fn create_pending(
        &self,
        campaign_id: Uuid,
        contributor: &str,
        amount: Amount,
        order_id: &str,
    ) -> Result<Contribution, RecordError> {
        let record = Contribution::pending(campaign_id, contributor, amount, order_id);
        let mut connection = self.connection.clone();

        let mut invocation = self.create.key(contribution_key(order_id));
        invocation
            .key(PENDING_KEY)
            .key(campaign_contributions_key(campaign_id))
            .arg(order_id)
            .arg(record.created_at.timestamp_millis())
            .arg("id")
            .arg(record.id.to_string())
            .arg("campaign_id")
            .arg(campaign_id.to_string())
            .arg("contributor")
            .arg(contributor)
            .arg("amount")
            .arg(amount.minor())
            .arg("order_id")
            .arg(order_id)
            .arg("outcome")
            .arg(Outcome::Pending.as_str())
            .arg("created_at")
            .arg(record.created_at.timestamp_millis());

        let inserted: i64 = invocation.invoke_async(&mut connection).await?;
        if inserted == 0 {
            return Err(RecordError::DuplicateOrder(order_id.to_string()));
        }

        Ok(record)
    }

    async fn get(&self, order_id: &str) -> Result<Option<Contribution>, RecordError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> =
            connection.hgetall(contribution_key(order_id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        contribution_from_fields(&fields)
            .map(Some)
            .map_err(RecordError::Storage)
    }

    async fn mark_outcome(&self, order_id: &str, outcome: Outcome) -> Result<(), RecordError> {
        if outcome == Outcome::Pending {
            return Err(RecordError::InvalidOutcome);
        }

        let mut connection = self.connection.clone();
        let swapped: i64 = self
            .mark
            .key(contribution_key(order_id))
            .key(PENDING_KEY)
            .arg(order_id)
            .arg(outcome.as_str())
            .invoke_async(&mut connection)
            .await?;

        match swapped {
            -1 => Err(RecordError::NotFound(order_id.to_string())),
            0 => Err(RecordError::AlreadySettled(order_id.to_string())),
            _ => Ok(()),
        }
    }

    async fn for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Contribution>, RecordError> {
        let mut connection = self.connection.clone();
        let order_ids: Vec<String> = connection
            .smembers(campaign_contributions_key(campaign_id))
            .await?;

        let mut records = self.load(&order_ids).await?;
        records.sort_by_key(|record| record.created_at);

        Ok(records)
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, RecordError> {
        let mut connection = self.connection.clone();

        Ok(connection
            .zrangebyscore(PENDING_KEY, "-inf", format!("({}", cutoff.timestamp_millis()))
            .await?)
    }

    async fn flag_unreconciled(&self, order_id: &str) -> Result<(), RecordError> {
        let mut connection = self.connection.clone();
        let _: i64 = connection.sadd(UNRECONCILED_KEY, order_id).await?;

        Ok(())
    }

    async fn unreconciled(&self) -> Result<Vec<String>, RecordError> {
        let mut connection = self.connection.clone();
        let mut order_ids: Vec<String> = connection.smembers(UNRECONCILED_KEY).await?;
        order_ids.sort();

        Ok(order_ids)
    }
    async fn is_unreconciled(&self, order_id: &str) -> Result<bool, RecordError> {
        let mut connection = self.connection.clone();

        Ok(connection.sismember(UNRECONCILED_KEY, order_id).await?)
    }
}


/// Runs the scripts against a live Redis at `REDIS_URL` (default `redis://127.0.0.1:6379`):
///
/// ```sh
/// cargo test -p crowdfund -- --ignored
/// ```
#[cfg(test)]
mod redis_tests {
    use std::{env, sync::Arc};

    use chrono::{Duration, Utc};
    use gateway::Amount;
    use uuid::Uuid;

    use super::{RedisLedger, RedisRecords, init_redis};
    use crate::{
        campaign::{Campaign, CampaignStatus},
        ledger::{CampaignLedger, LedgerError},
        records::{ContributionStore, Outcome, RecordError},
        user::Caller,
    };

    async fn ledger() -> RedisLedger {
        let url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        RedisLedger::new(init_redis(&url).await.unwrap())
    }

    async fn records() -> RedisRecords {
        let url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        RedisRecords::new(init_redis(&url).await.unwrap())
    }

    async fn approved(ledger: &RedisLedger) -> Uuid {
        let campaign = Campaign::new(
            "owner",
            "Water pump",
            Amount::from_minor(10000),
            Utc::now() + Duration::days(7),
        );
        let id = ledger.create(campaign).await.unwrap().id;

        let updated = ledger
            .set_status(id, CampaignStatus::Approved, &Caller::moderator("mod"))
            .await
            .unwrap();
        assert_eq!(updated.status, CampaignStatus::Approved);
        assert_eq!(updated.version, 1);

        id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs a running Redis"]
    async fn test_concurrent_applies_and_replays() {
        let ledger = Arc::new(ledger().await);
        let id = approved(&ledger).await;

        let handles: Vec<_> = (0..60)
            .map(|i| {
                let ledger = ledger.clone();
                // Every fifth call replays order_0.
                let order = if i % 5 == 0 { 0 } else { i };
                tokio::spawn(async move {
                    ledger
                        .apply_contribution(
                            id,
                            &format!("order_{order}"),
                            &format!("u{}", i % 6),
                            Amount::from_minor(100),
                        )
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

        // 48 distinct orders plus order_0 once.
        assert_eq!(fresh, 49);

        let campaign = ledger.get(id).await.unwrap();
        assert_eq!(campaign.raised, Amount::from_minor(49 * 100));
        assert_eq!(campaign.contributions_count, 49);
        assert!(ledger.is_applied(id, "order_0").await.unwrap());
        assert!(!ledger.is_applied(id, "order_5").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "needs a running Redis"]
    async fn test_failed_apply_writes_nothing() {
        let ledger = ledger().await;
        let id = approved(&ledger).await;

        assert!(
            ledger
                .apply_contribution(id, "order_big", "u1", Amount::MAX)
                .await
                .unwrap()
        );
        assert!(matches!(
            ledger
                .apply_contribution(id, "order_over", "u2", Amount::from_minor(1))
                .await,
            Err(LedgerError::Storage(_))
        ));

        let campaign = ledger.get(id).await.unwrap();
        assert_eq!(campaign.raised, Amount::MAX);
        assert_eq!(campaign.contributions_count, 1);
        assert!(!campaign.contributors.contains("u2"));
        assert!(!ledger.is_applied(id, "order_over").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs a running Redis"]
    async fn test_record_outcome_has_one_winner() {
        let records = Arc::new(records().await);
        let campaign = Uuid::new_v4();
        let order = format!("order_{}", Uuid::new_v4().simple());

        records
            .create_pending(campaign, "u1", Amount::from_minor(10), &order)
            .await
            .unwrap();
        assert!(matches!(
            records
                .create_pending(campaign, "u2", Amount::from_minor(10), &order)
                .await,
            Err(RecordError::DuplicateOrder(_))
        ));
        assert!(
            records
                .pending_before(Utc::now() + Duration::seconds(1))
                .await
                .unwrap()
                .contains(&order)
        );

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let records = records.clone();
                let order = order.clone();
                let outcome = if i % 2 == 0 { Outcome::Succeeded } else { Outcome::Failed };
                tokio::spawn(async move { records.mark_outcome(&order, outcome).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(RecordError::AlreadySettled(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(winners, 1);
        assert!(
            !records
                .pending_before(Utc::now() + Duration::seconds(1))
                .await
                .unwrap()
                .contains(&order)
        );
        assert_eq!(records.for_campaign(campaign).await.unwrap().len(), 1);

        records.flag_unreconciled(&order).await.unwrap();
        assert!(records.is_unreconciled(&order).await.unwrap());
    }
}
