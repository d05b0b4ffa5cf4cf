use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::catalog::auth::{CatalogCredential, ClientSecretCredential};
use crate::catalog::CatalogClient;
use crate::checkpoint::PgCheckpointStore;
use crate::config::{CatalogAuth, Config};
use crate::consumer::StreamConsumer;
use crate::coordination::LeaseCoordinator;
use crate::health::HealthRegistry;
use crate::policy::ClassificationPolicyTable;
use crate::processor::{EventProcessor, MalformedEventPolicy};
use crate::sink::kafka::create_producer;
use crate::sink::{AlertSink, ConsoleAlertSink, DedupingAlertSink, FanOutSink, KafkaPublisher};
use crate::stream::KafkaStreamSource;
use crate::types::StreamScope;

/// The assembled service: stream consumer wired to the catalog, the policy
/// table, the alert sinks and the checkpoint store.
pub struct ClassificationAlerterService {
    consumer: StreamConsumer,
    partition_filter: Option<Vec<i32>>,
}

impl ClassificationAlerterService {
    /// Connect every collaborator. Anything misconfigured or unreachable
    /// fails here, before the first event is read.
    pub async fn new(config: Config, liveness: &HealthRegistry) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let policy = ClassificationPolicyTable::from_path(&config.classification_policy_path)
            .with_context(|| {
                format!(
                    "Failed to load classification policy from {}",
                    config.classification_policy_path
                )
            })?;
        info!(
            classifications = policy.len(),
            "loaded classification policy"
        );

        let credential = match config.catalog_auth()? {
            CatalogAuth::AccessToken(token) => CatalogCredential::StaticToken(token),
            CatalogAuth::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => CatalogCredential::ClientSecret(
                ClientSecretCredential::new(
                    reqwest::Client::new(),
                    &config.catalog_authority_host,
                    &tenant_id,
                    &client_id,
                    &client_secret,
                )
                .context("Invalid catalog authority")?,
            ),
        };
        let catalog = CatalogClient::new(&config.catalog_config()?, credential)
            .context("Failed to build catalog client")?;
        catalog
            .verify_credentials()
            .await
            .context("Failed to authenticate against the catalog")?;

        let store = PgCheckpointStore::new(
            &config.checkpoint_database_url,
            config.checkpoint_max_connections,
        )
        .await
        .context("Failed to connect to the checkpoint store")?;
        store
            .run_migrations()
            .await
            .context("Failed to migrate the checkpoint store")?;
        let store = Arc::new(store);

        let settings = config.stream_settings();
        let source = KafkaStreamSource::new(
            settings.clone(),
            config.stream_name.clone(),
            config.stream_consumer_group.clone(),
        )
        .context("Failed to create stream consumer")?;

        let malformed = config.malformed_event_policy()?;
        let producer = if config.alert_topic.is_some()
            || malformed == MalformedEventPolicy::DeadLetter
        {
            Some(
                create_producer(&settings, config.kafka_message_timeout())
                    .context("Failed to create kafka producer")?,
            )
        } else {
            None
        };

        let mut sinks: Vec<Arc<dyn AlertSink>> =
            vec![Arc::new(ConsoleAlertSink::stdout(config.alert_format()?))];
        if let (Some(topic), Some(producer)) = (&config.alert_topic, &producer) {
            info!(topic = %topic, "publishing alerts to topic");
            sinks.push(Arc::new(KafkaPublisher::new(producer.clone(), topic.clone())));
        }
        let alerts =
            DedupingAlertSink::new(Arc::new(FanOutSink::new(sinks)), config.alert_dedup_ttl());

        let mut processor =
            EventProcessor::new(Arc::new(catalog), Arc::new(policy), Arc::new(alerts))
                .with_lookup_timeout(config.catalog_timeout());
        if malformed == MalformedEventPolicy::DeadLetter {
            if let (Some(topic), Some(producer)) = (&config.dead_letter_topic, &producer) {
                info!(topic = %topic, "dead-lettering malformed events");
                let sink = KafkaPublisher::new(producer.clone(), topic.clone());
                processor = processor.with_dead_letter_sink(Arc::new(sink));
            }
        }

        let scope = StreamScope::new(
            config.stream_consumer_group.clone(),
            config.stream_name.clone(),
        );
        let owner_id = config
            .consumer_owner_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        info!(scope = %scope, owner_id = %owner_id, "consumer identity");

        let coordinator = LeaseCoordinator::new(
            store.clone(),
            scope.clone(),
            owner_id,
            config.lease_duration(),
        );

        let consumer = StreamConsumer::new(
            Arc::new(source),
            Arc::new(processor),
            store,
            Arc::new(coordinator),
            scope,
            config.consumer_config()?,
        )
        .with_liveness(liveness.register("stream_consumer", config.lease_duration()));

        Ok(Self {
            consumer,
            partition_filter: config.partition_filter()?,
        })
    }

    /// Consume until `shutdown` resolves, then drain and release partitions.
    pub async fn run_with_shutdown(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let cancel = CancellationToken::new();
        let consumer = self.consumer;
        let partition_filter = self.partition_filter;

        let mut handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.run(partition_filter, cancel).await }
        });

        tokio::select! {
            _ = shutdown => {
                info!("received shutdown signal, shutting down gracefully");
            }
            result = &mut handle => {
                result.context("Consumer task panicked")??;
                return Ok(());
            }
        }

        cancel.cancel();
        handle.await.context("Consumer task panicked")??;
        info!("consumer stopped");
        Ok(())
    }
}
