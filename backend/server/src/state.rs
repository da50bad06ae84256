use std::sync::Arc;

use gateway::{HttpGateway, SignatureVerifier};
use tracing::info;

use super::{
    config::{Config, Storage},
    database::{RedisLedger, RedisRecords, init_redis},
    ledger::{CampaignLedger, InMemoryLedger},
    records::{ContributionStore, InMemoryRecords},
    settlement::Coordinator,
};

pub struct AppState {
    pub config: Config,
    pub ledger: Arc<dyn CampaignLedger>,
    pub records: Arc<dyn ContributionStore>,
    pub coordinator: Coordinator,
}

impl AppState {
    pub async fn new() -> Arc<Self> {
        let config = Config::load();

        let (ledger, records): (Arc<dyn CampaignLedger>, Arc<dyn ContributionStore>) =
            match config.storage {
                Storage::Redis => {
                    let connection = init_redis(&config.redis_url)
                        .await
                        .expect("Redis unreachable!");

                    (
                        Arc::new(RedisLedger::new(connection.clone())),
                        Arc::new(RedisRecords::new(connection)),
                    )
                }
                Storage::Memory => {
                    info!("Using in-memory storage, nothing survives a restart");

                    (Arc::new(InMemoryLedger::new()), Arc::new(InMemoryRecords::new()))
                }
            };

        let gateway = HttpGateway::new(
            &config.gateway_url,
            config.gateway_key_id.clone(),
            config.gateway_key_secret.clone(),
            config.gateway_timeout,
        )
        .expect("Gateway misconfigured!");

        let coordinator = Coordinator::new(
            ledger.clone(),
            records.clone(),
            Arc::new(gateway),
            SignatureVerifier::new(config.gateway_key_secret.as_bytes()),
            &config.currency,
            config.gateway_retry,
        );

        Arc::new(Self {
            config,
            ledger,
            records,
            coordinator,
        })
    }
}
