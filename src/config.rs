use crate::outbox::OutboxOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global configuration for Lemline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct LemlineConfig {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// The retry outbox: caught errors waiting for their backoff, plus the
    /// FAILED archive of faulted instances and dead inputs.
    #[serde(default)]
    pub retry: OutboxGroupConfig,
    /// The wait outbox: instances parked by a Wait task.
    #[serde(default)]
    pub wait: OutboxGroupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConsumerConfig {
    /// Attach to the inbound channel.
    pub enabled: bool,
    /// Cooperative workers draining the inbound stream.
    pub workers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProducerConfig {
    /// Attach to the outbound channel.
    pub enabled: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MessagingKind {
    #[default]
    InMemory,
    Kafka,
    Rabbitmq,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct MessagingConfig {
    #[serde(rename = "type")]
    pub kind: MessagingKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseKind {
    #[default]
    InMemory,
    Postgresql,
    Mysql,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    /// Connection string; required for the SQL backends.
    pub url: Option<String>,
}

/// One outbox table's processing + cleanup knobs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OutboxGroupConfig {
    #[serde(default)]
    pub outbox: OutboxSectionConfig,
    #[serde(default)]
    pub cleanup: CleanupSectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutboxSectionConfig {
    pub batch_size: u32,
    pub max_attempts: i32,
    /// Base of the exponential redelivery backoff, in seconds.
    pub initial_delay: u64,
    /// Processing period, in seconds.
    pub schedule: u64,
}

impl Default for OutboxSectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 5,
            initial_delay: 5,
            schedule: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CleanupSectionConfig {
    /// Retention of SENT rows, in seconds.
    pub after: u64,
    pub batch_size: u32,
    /// Cleanup period, in seconds.
    pub schedule: u64,
}

impl Default for CleanupSectionConfig {
    fn default() -> Self {
        Self {
            after: 3600,
            batch_size: 500,
            schedule: 3600,
        }
    }
}

impl OutboxGroupConfig {
    #[must_use]
    pub fn options(&self) -> OutboxOptions {
        OutboxOptions {
            batch_size: self.outbox.batch_size,
            max_attempts: self.outbox.max_attempts,
            initial_delay: Duration::from_secs(self.outbox.initial_delay),
            schedule: Duration::from_secs(self.outbox.schedule),
            cleanup_after: Duration::from_secs(self.cleanup.after),
            cleanup_batch_size: self.cleanup.batch_size,
            cleanup_schedule: Duration::from_secs(self.cleanup.schedule),
        }
    }
}

impl LemlineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (`LEMLINE__*`, `__` separated)
    /// 2. Config file (`lemline.yaml` in the current dir or
    ///    `~/.config/lemline/lemline.yaml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_builder = config::Config::builder()
            .add_source(config::Config::try_from(&LemlineConfig::default())?)
            .add_source(
                config::File::with_name("lemline")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::File::with_name(&format!(
                    "{}/.config/lemline/lemline",
                    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
                ))
                .format(config::FileFormat::Yaml)
                .required(false),
            )
            .add_source(
                config::Environment::with_prefix("LEMLINE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = config_builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LemlineConfig::default();
        assert!(config.consumer.enabled);
        assert_eq!(config.messaging.kind, MessagingKind::InMemory);
        assert_eq!(config.database.kind, DatabaseKind::InMemory);
        assert_eq!(config.retry.outbox.batch_size, 100);
        assert_eq!(config.wait.cleanup.after, 3600);
    }

    #[test]
    fn test_kebab_case_keys() {
        let config: LemlineConfig = serde_yaml::from_str(
            r"
messaging:
  type: in-memory
database:
  type: postgresql
  url: postgresql://localhost/lemline
retry:
  outbox:
    batch-size: 50
    max-attempts: 3
    initial-delay: 1
    schedule: 5
  cleanup:
    after: 86400
    batch-size: 200
    schedule: 1800
",
        )
        .unwrap();
        assert_eq!(config.database.kind, DatabaseKind::Postgresql);
        assert_eq!(config.retry.outbox.batch_size, 50);
        let options = config.retry.options();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.cleanup_after, Duration::from_secs(86400));
    }
}
