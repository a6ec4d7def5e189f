use clap::Args;
use std::time::Duration;

use crate::outbox::DEFAULT_BATCH_SIZE;

#[derive(Debug, Clone, Args)]
pub struct KafkaArgs {
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    pub kafka_brokers: String,
}

/// Cadence and batch bound shared by every poller in a service.
#[derive(Debug, Clone, Args)]
pub struct PollingArgs {
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: i64,
}

impl PollingArgs {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        kafka: KafkaArgs,
        #[command(flatten)]
        polling: PollingArgs,
    }

    #[test]
    fn test_defaults() {
        let args = TestArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.kafka.kafka_brokers, "localhost:9092");
        assert_eq!(args.polling.batch_size, 100);
        assert_eq!(args.polling.interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_overrides() {
        let args = TestArgs::try_parse_from([
            "test",
            "--kafka-brokers",
            "kafka:29092",
            "--poll-interval-ms",
            "250",
            "--batch-size",
            "10",
        ])
        .unwrap();
        assert_eq!(args.kafka.kafka_brokers, "kafka:29092");
        assert_eq!(args.polling.batch_size, 10);
        assert_eq!(args.polling.interval(), Duration::from_millis(250));
    }
}
