use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;
use url::Url;

use crate::catalog::CatalogClientConfig;
use crate::consumer::ConsumerConfig;
use crate::processor::MalformedEventPolicy;
use crate::retry::RetryPolicy;
use crate::sink::AlertFormat;
use crate::stream::kafka::ConnectionSettings;
use crate::types::StartPosition;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("catalog authentication needs either CATALOG_ACCESS_TOKEN or all of CATALOG_TENANT_ID, CATALOG_CLIENT_ID and CATALOG_CLIENT_SECRET, not both")]
    CatalogAuth,
    #[error("DEAD_LETTER_TOPIC is required when MALFORMED_EVENT_POLICY is dead_letter")]
    MissingDeadLetterTopic,
}

fn invalid(name: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Event stream
    pub stream_endpoint: String,

    pub stream_name: String,

    pub stream_consumer_group: String,

    /// Enables SASL PLAIN with `$ConnectionString` as the user.
    pub stream_connection_string: Option<String>,

    #[envconfig(default = "false")]
    pub stream_tls: bool,

    #[envconfig(default = "earliest")]
    pub stream_start_position: String,

    /// Comma separated partition ids. Disables load balancing.
    pub stream_partitions: Option<String>,

    // Checkpoint and ownership store
    pub checkpoint_database_url: String,

    #[envconfig(default = "4")]
    pub checkpoint_max_connections: u32,

    // Catalog
    pub catalog_endpoint: String,

    pub catalog_access_token: Option<String>,

    pub catalog_tenant_id: Option<String>,

    pub catalog_client_id: Option<String>,

    pub catalog_client_secret: Option<String>,

    #[envconfig(default = "https://login.microsoftonline.com")]
    pub catalog_authority_host: String,

    #[envconfig(default = "10000")]
    pub catalog_timeout_ms: u64,

    // Policy and alerting
    pub classification_policy_path: String,

    #[envconfig(default = "text")]
    pub alert_output_format: String,

    /// Alerts are also published here when set.
    pub alert_topic: Option<String>,

    #[envconfig(default = "3600")]
    pub alert_dedup_ttl_secs: u64,

    #[envconfig(default = "skip")]
    pub malformed_event_policy: String,

    pub dead_letter_topic: Option<String>,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u64,

    // Consumer
    /// Random when unset.
    pub consumer_owner_id: Option<String>,

    #[envconfig(default = "60")]
    pub lease_duration_secs: u64,

    #[envconfig(default = "10")]
    pub rebalance_interval_secs: u64,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "500")]
    pub batch_max_wait_ms: u64,

    #[envconfig(default = "500")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(default = "30")]
    pub retry_max_interval_secs: u64,

    // HTTP server
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

/// How the catalog client authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogAuth {
    AccessToken(String),
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Check every derived setting, so misconfiguration fails before
    /// anything connects.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.start_position()?;
        self.partition_filter()?;
        self.catalog_auth()?;
        self.catalog_config()?;
        self.alert_format()?;
        self.malformed_event_policy()?;
        if self.lease_duration_secs == 0 {
            return Err(invalid("LEASE_DURATION_SECS", "must be positive"));
        }
        if self.rebalance_interval_secs == 0
            || self.rebalance_interval_secs >= self.lease_duration_secs
        {
            return Err(invalid(
                "REBALANCE_INTERVAL_SECS",
                "must be positive and shorter than LEASE_DURATION_SECS",
            ));
        }
        if self.batch_size == 0 {
            return Err(invalid("BATCH_SIZE", "must be positive"));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn start_position(&self) -> Result<StartPosition, ConfigError> {
        self.stream_start_position
            .parse()
            .map_err(|e| invalid("STREAM_START_POSITION", e))
    }

    /// `None` when unset or blank, which means load-balanced consumption.
    pub fn partition_filter(&self) -> Result<Option<Vec<i32>>, ConfigError> {
        let Some(raw) = self.stream_partitions.as_deref() else {
            return Ok(None);
        };

        let mut partitions = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.parse::<i32>() {
                Ok(id) if id >= 0 => Ok(id),
                _ => Err(invalid("STREAM_PARTITIONS", format!("bad partition id {p}"))),
            })
            .collect::<Result<Vec<i32>, ConfigError>>()?;
        partitions.sort_unstable();
        partitions.dedup();

        Ok(Some(partitions).filter(|p| !p.is_empty()))
    }

    pub fn stream_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            bootstrap_servers: self.stream_endpoint.clone(),
            connection_string: self.stream_connection_string.clone(),
            tls: self.stream_tls,
        }
    }

    pub fn catalog_auth(&self) -> Result<CatalogAuth, ConfigError> {
        let token = self.catalog_access_token.clone().filter(|t| !t.is_empty());
        let client = (
            self.catalog_tenant_id.clone(),
            self.catalog_client_id.clone(),
            self.catalog_client_secret.clone(),
        );

        match (token, client) {
            (Some(token), (None, None, None)) => Ok(CatalogAuth::AccessToken(token)),
            (None, (Some(tenant_id), Some(client_id), Some(client_secret))) => {
                Ok(CatalogAuth::ClientSecret {
                    tenant_id,
                    client_id,
                    client_secret,
                })
            }
            _ => Err(ConfigError::CatalogAuth),
        }
    }

    pub fn catalog_config(&self) -> Result<CatalogClientConfig, ConfigError> {
        let endpoint =
            Url::parse(&self.catalog_endpoint).map_err(|e| invalid("CATALOG_ENDPOINT", e))?;
        Ok(CatalogClientConfig {
            endpoint,
            timeout: self.catalog_timeout(),
        })
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }

    pub fn alert_format(&self) -> Result<AlertFormat, ConfigError> {
        self.alert_output_format
            .parse()
            .map_err(|e| invalid("ALERT_OUTPUT_FORMAT", e))
    }

    pub fn alert_dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.alert_dedup_ttl_secs)
    }

    pub fn kafka_message_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_message_timeout_ms)
    }

    pub fn malformed_event_policy(&self) -> Result<MalformedEventPolicy, ConfigError> {
        let policy: MalformedEventPolicy = self
            .malformed_event_policy
            .parse()
            .map_err(|e| invalid("MALFORMED_EVENT_POLICY", e))?;
        if policy == MalformedEventPolicy::DeadLetter && self.dead_letter_topic.is_none() {
            return Err(ConfigError::MissingDeadLetterTopic);
        }
        Ok(policy)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(2, Duration::from_millis(self.retry_initial_interval_ms))
            .maximum_interval(Duration::from_secs(self.retry_max_interval_secs))
            .provide()
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn consumer_config(&self) -> Result<ConsumerConfig, ConfigError> {
        Ok(ConsumerConfig {
            batch_size: self.batch_size,
            batch_max_wait: Duration::from_millis(self.batch_max_wait_ms),
            start_position: self.start_position()?,
            retry: self.retry_policy(),
            rebalance_interval: Duration::from_secs(self.rebalance_interval_secs),
            ownership_timeout: self.lease_duration(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(extra: &[(&str, &str)]) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = [
            ("STREAM_ENDPOINT", "localhost:9092"),
            ("STREAM_NAME", "atlas_hook"),
            ("STREAM_CONSUMER_GROUP", "$Default"),
            ("CHECKPOINT_DATABASE_URL", "postgres://localhost/alerter"),
            ("CATALOG_ENDPOINT", "https://contoso.purview.azure.com"),
            ("CATALOG_ACCESS_TOKEN", "token"),
            ("CLASSIFICATION_POLICY_PATH", "/etc/alerter/policy.json"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            env.insert(k.to_string(), v.to_string());
        }
        env
    }

    fn config(extra: &[(&str, &str)]) -> Config {
        Config::init_from_hashmap(&env(extra)).unwrap()
    }

    #[test]
    fn defaults() {
        let config = config(&[]);
        config.validate().unwrap();

        assert_eq!(config.start_position().unwrap(), StartPosition::Earliest);
        assert_eq!(config.partition_filter().unwrap(), None);
        assert_eq!(config.alert_format().unwrap(), AlertFormat::Text);
        assert_eq!(
            config.malformed_event_policy().unwrap(),
            MalformedEventPolicy::Skip
        );
        assert_eq!(
            config.catalog_auth().unwrap(),
            CatalogAuth::AccessToken("token".to_string())
        );
        assert_eq!(config.catalog_timeout(), Duration::from_secs(10));
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.lease_duration(), Duration::from_secs(60));
    }

    #[test]
    fn required_settings() {
        let mut env = env(&[]);
        env.remove("STREAM_NAME");
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn partition_filter() {
        let config = config(&[("STREAM_PARTITIONS", " 3, 1,3 ,")]);
        assert_eq!(config.partition_filter().unwrap(), Some(vec![1, 3]));

        let blank = self::config(&[("STREAM_PARTITIONS", "")]);
        assert_eq!(blank.partition_filter().unwrap(), None);

        let bad = self::config(&[("STREAM_PARTITIONS", "1,x")]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn exactly_one_catalog_auth_mode() {
        let both = config(&[
            ("CATALOG_TENANT_ID", "t"),
            ("CATALOG_CLIENT_ID", "c"),
            ("CATALOG_CLIENT_SECRET", "s"),
        ]);
        assert!(matches!(both.validate(), Err(ConfigError::CatalogAuth)));

        let mut env = env(&[
            ("CATALOG_TENANT_ID", "t"),
            ("CATALOG_CLIENT_ID", "c"),
            ("CATALOG_CLIENT_SECRET", "s"),
        ]);
        env.remove("CATALOG_ACCESS_TOKEN");
        let client = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(
            client.catalog_auth().unwrap(),
            CatalogAuth::ClientSecret {
                tenant_id: "t".to_string(),
                client_id: "c".to_string(),
                client_secret: "s".to_string(),
            }
        );

        let mut env = env.clone();
        env.remove("CATALOG_CLIENT_SECRET");
        let partial = Config::init_from_hashmap(&env).unwrap();
        assert!(matches!(partial.validate(), Err(ConfigError::CatalogAuth)));
    }

    #[test]
    fn dead_letter_policy_needs_topic() {
        let missing = config(&[("MALFORMED_EVENT_POLICY", "dead_letter")]);
        assert!(matches!(
            missing.validate(),
            Err(ConfigError::MissingDeadLetterTopic)
        ));

        let configured = config(&[
            ("MALFORMED_EVENT_POLICY", "dead_letter"),
            ("DEAD_LETTER_TOPIC", "classification_dead_letters"),
        ]);
        configured.validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        for (name, value) in [
            ("STREAM_START_POSITION", "yesterday"),
            ("ALERT_OUTPUT_FORMAT", "xml"),
            ("CATALOG_ENDPOINT", "not a url"),
            ("REBALANCE_INTERVAL_SECS", "60"),
        ] {
            assert!(config(&[(name, value)]).validate().is_err(), "{name}");
        }
    }
}
