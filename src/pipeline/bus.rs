//! Record bus seam
//!
//! The pipeline only ever sees keyed byte records through these two traits.
//! The production message-bus client plugs in here; the in-process
//! `MemoryBus` below backs the demo binary and the tests, partitioning by
//! user key so per-key ordering matches the external bus contract.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One keyed message value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// Pull side of one partition. Exactly one worker owns a source at a time.
#[async_trait]
pub trait RecordSource: Send {
    /// Next record, or None once the stream is closed and drained.
    async fn poll(&mut self) -> Option<Record>;

    /// Commit consumed offsets; invoked on the configured commit interval
    /// and once at worker exit. At-least-once: a crash before this point
    /// replays records.
    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Push side of a topic.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn publish(&self, record: Record) -> Result<()>;
}

const PARTITION_CAPACITY: usize = 1024;

/// In-process bus: N bounded partitions, records routed by key hash so all
/// records for one user land on one partition in publish order.
#[derive(Clone)]
pub struct MemoryBus {
    senders: Vec<mpsc::Sender<Record>>,
}

impl MemoryBus {
    /// Build a bus plus one source per partition.
    pub fn with_partitions(partitions: usize) -> (Self, Vec<MemorySource>) {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut sources = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let (tx, rx) = mpsc::channel(PARTITION_CAPACITY);
            senders.push(tx);
            sources.push(MemorySource { rx });
        }
        (Self { senders }, sources)
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    pub async fn publish(&self, record: Record) -> Result<()> {
        let partition = self.partition_for(&record.key);
        self.senders[partition]
            .send(record)
            .await
            .map_err(|_| anyhow!("bus partition {partition} closed"))
    }
}

pub struct MemorySource {
    rx: mpsc::Receiver<Record>,
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn poll(&mut self) -> Option<Record> {
        self.rx.recv().await
    }
}

/// Sink delivering into an unbounded channel; the receiving half acts as the
/// downstream consumer.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Record>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn publish(&self, record: Record) -> Result<()> {
        self.tx
            .send(record)
            .map_err(|_| anyhow!("sink consumer dropped"))
    }
}

/// Sink that only logs. Stands in for a topic nobody consumes in-process.
pub struct LogSink {
    topic: String,
    loud: bool,
}

impl LogSink {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            loud: false,
        }
    }

    /// Log each publish at info level (console-consumer behaviour).
    pub fn announcing(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            loud: true,
        }
    }
}

#[async_trait]
impl RecordSink for LogSink {
    async fn publish(&self, record: Record) -> Result<()> {
        if self.loud {
            info!(
                topic = %self.topic,
                key = %record.key,
                payload = %String::from_utf8_lossy(&record.payload),
                "record published"
            );
        } else {
            debug!(topic = %self.topic, key = %record.key, bytes = record.payload.len(), "record published");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_lands_on_same_partition_in_order() {
        let (bus, mut sources) = MemoryBus::with_partitions(4);
        for i in 0..20 {
            bus.publish(Record::new("user-a", vec![i])).await.unwrap();
        }
        drop(bus);

        let mut seen = Vec::new();
        for source in &mut sources {
            while let Some(record) = source.poll().await {
                assert_eq!(record.key, "user-a");
                seen.push(record.payload[0]);
            }
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish(Record::new("k", b"v".to_vec())).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.key, "k");
        assert_eq!(got.payload, b"v");
    }
}
