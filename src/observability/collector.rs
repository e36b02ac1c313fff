use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::CollectorConfig;

/// One request/response exchange, recorded after the response is produced.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "clientIp")]
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    #[serde(rename = "latencyMs")]
    pub latency_ms: u64,
    #[serde(rename = "requestBytes")]
    pub request_bytes: usize,
    #[serde(rename = "responseBytes")]
    pub response_bytes: usize,
}

/// Fire-and-forget traffic collection.
///
/// Records go through a bounded queue to a single worker task; a full queue
/// drops the record rather than blocking the response path, and worker
/// failures never propagate back to a request.
pub struct TrafficCollector {
    tx: mpsc::Sender<ExchangeRecord>,
    max_body_bytes: usize,
}

impl TrafficCollector {
    pub fn spawn(config: &CollectorConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<ExchangeRecord>(config.queue_size);

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match serde_json::to_string(&record) {
                    Ok(line) => info!(target: "traffic", "{}", line),
                    Err(e) => warn!("Failed to serialize exchange record: {}", e),
                }
            }
        });

        Self {
            tx,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Never blocks. Oversized exchanges and queue overflow both drop the
    /// record with a warning.
    pub fn record(&self, record: ExchangeRecord) {
        if record.request_bytes + record.response_bytes > self.max_body_bytes {
            warn!(
                trace_id = %record.trace_id,
                bytes = record.request_bytes + record.response_bytes,
                "Exchange exceeds max size, dropping record"
            );
            return;
        }

        if let Err(e) = self.tx.try_send(record) {
            warn!("Traffic collector queue full, dropping record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bytes: usize) -> ExchangeRecord {
        ExchangeRecord {
            timestamp: Utc::now(),
            trace_id: "tr-test".to_string(),
            client_ip: "127.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/api/users".to_string(),
            status: 200,
            latency_ms: 12,
            request_bytes: 0,
            response_bytes: bytes,
        }
    }

    #[tokio::test]
    async fn record_never_blocks_even_when_queue_is_full() {
        let collector = TrafficCollector::spawn(&CollectorConfig {
            enabled: true,
            queue_size: 1,
            max_body_bytes: 1024,
        });

        // No await between sends: the worker cannot drain, so the queue fills
        // and overflow records are dropped without blocking.
        for _ in 0..50 {
            collector.record(sample(10));
        }
    }

    #[tokio::test]
    async fn oversized_exchanges_are_dropped() {
        let collector = TrafficCollector::spawn(&CollectorConfig {
            enabled: true,
            queue_size: 8,
            max_body_bytes: 100,
        });
        collector.record(sample(1000));
        collector.record(sample(10));
    }

    #[test]
    fn record_serializes_with_camel_case_keys() {
        let json = serde_json::to_value(sample(5)).unwrap();
        assert_eq!(json["traceId"], "tr-test");
        assert_eq!(json["latencyMs"], 12);
        assert_eq!(json["responseBytes"], 5);
    }
}
