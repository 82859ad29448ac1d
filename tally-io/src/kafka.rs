use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context as AnyhowContext;
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tally_core::{
    durable_offsets, CheckpointStore, Context, Error, RawMessage, Record, Result, Sink, Source,
};
use tracing::{debug, info, warn};

const CP_NS: &str = "kafka:offset:";

/// Consumes a topic and hands each payload, undecoded, to the pipeline.
///
/// Every `commit_interval` the group is committed up to the offsets all
/// stream checkpoints report as durable, never past an event whose window is
/// still open. The committed offsets are mirrored into the state store under
/// `kafka:offset:<topic>:<group>:<partition>`.
pub struct KafkaSource {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub auto_offset_reset: Option<String>,
    pub commit_interval: Duration,
    partitions: u32,
}

impl KafkaSource {
    pub fn new(
        brokers: impl Into<String>,
        group_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            topic: topic.into(),
            auto_offset_reset: None,
            commit_interval: Duration::from_secs(5),
            partitions: 1,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "10000");
        if let Some(r) = &self.auto_offset_reset {
            cfg.set("auto.offset.reset", r);
        }
        cfg
    }

    /// Look up the topic's partition count so one worker runs per partition.
    pub async fn discover_partitions(&mut self) -> Result<u32> {
        let cfg = self.client_config();
        let topic = self.topic.clone();
        let n = tokio::task::spawn_blocking(move || -> anyhow::Result<u32> {
            let consumer: BaseConsumer =
                cfg.create().context("failed to create kafka metadata client")?;
            let md = consumer
                .fetch_metadata(Some(&topic), Duration::from_secs(10))
                .context("failed to fetch topic metadata")?;
            let n = md
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .map_or(0, |t| t.partitions().len());
            Ok(n as u32)
        })
        .await
        .map_err(|e| Error::Anyhow(e.into()))??;
        if n == 0 {
            return Err(Error::Config(format!("kafka topic {} has no partitions", self.topic)));
        }
        info!(topic = %self.topic, partitions = n, "discovered kafka partitions");
        self.partitions = n;
        Ok(n)
    }

    async fn commit_durable(&self, consumer: &StreamConsumer, ctx: &mut dyn Context) -> Result<()> {
        let kv = ctx.kv();
        let safe = durable_offsets(&CheckpointStore::new(kv.clone()).list().await?);
        if safe.is_empty() {
            return Ok(());
        }
        let tpl = offset_list(&self.topic, &safe)?;
        if let Err(e) = consumer.commit(&tpl, CommitMode::Async) {
            warn!(error = %e, "kafka offset commit failed");
        }
        for (&partition, next) in &safe {
            let key = cp_key(&self.topic, &self.group_id, partition as i32);
            kv.put(key.as_bytes(), next.to_string().into_bytes()).await?;
        }
        debug!(partitions = safe.len(), "kafka offsets committed");
        Ok(())
    }
}

pub(crate) fn cp_key(topic: &str, group: &str, partition: i32) -> String {
    format!("{CP_NS}{topic}:{group}:{partition}")
}

#[async_trait]
impl Source for KafkaSource {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
        let consumer: StreamConsumer =
            self.client_config().create().context("failed to create kafka consumer")?;
        consumer.subscribe(&[&self.topic]).context("failed to subscribe to topic")?;

        let mut last_commit = std::time::Instant::now();
        let mut stream = consumer.stream();
        while let Some(ev) = stream.next().await {
            let (partition, offset, payload) = match ev {
                Ok(m) => {
                    let payload = m.payload().map(<[u8]>::to_vec).unwrap_or_default();
                    (m.partition(), m.offset(), payload)
                }
                Err(e) => {
                    warn!(error = %e, "kafka consume error");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            ctx.collect(RawMessage::new(partition.max(0) as u32, payload).with_offset(offset))
                .await?;

            if last_commit.elapsed() >= self.commit_interval {
                self.commit_durable(&consumer, ctx).await?;
                last_commit = std::time::Instant::now();
            }
        }
        Ok(())
    }
}

fn offset_list(topic: &str, offsets: &BTreeMap<u32, i64>) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (&partition, &next) in offsets {
        tpl.add_partition_offset(topic, partition as i32, Offset::Offset(next))
            .context("failed to track kafka offset")?;
    }
    Ok(tpl)
}

/// Produces each record value as JSON, keyed by the record key.
///
/// Every send is awaited with `acks=all`, so an `Ok` means the broker holds
/// the record. Delivery failures surface as `SinkUnavailable` and are retried
/// upstream.
pub struct KafkaSink {
    pub brokers: String,
    pub topic: String,
    pub acks: Option<String>,
    pub send_timeout: Duration,
    producer: Option<FutureProducer>,
}

impl KafkaSink {
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            acks: Some("all".into()),
            send_timeout: Duration::from_secs(5),
            producer: None,
        }
    }

    fn producer(&mut self) -> anyhow::Result<&FutureProducer> {
        if self.producer.is_none() {
            let mut cfg = ClientConfig::new();
            cfg.set("bootstrap.servers", &self.brokers);
            if let Some(a) = &self.acks {
                cfg.set("acks", a);
            }
            self.producer = Some(cfg.create().context("failed to create kafka producer")?);
        }
        self.producer.as_ref().context("kafka producer missing")
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn on_element(&mut self, record: Record) -> Result<()> {
        let payload = serde_json::to_string(&record.value)?;
        let topic = self.topic.clone();
        let timeout = self.send_timeout;
        let producer = self.producer()?;
        let mut fr = FutureRecord::to(&topic).payload(&payload);
        if let Some(k) = record.key.as_deref() {
            fr = fr.key(k);
        }
        producer
            .send(fr, timeout)
            .await
            .map_err(|(e, _)| Error::sink_unavailable(topic.as_str(), e))?;
        tally_core::metrics::BYTES_WRITTEN
            .with_label_values(&["kafka"])
            .inc_by(payload.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_key_format() {
        assert_eq!(cp_key("retail", "tally", 3), "kafka:offset:retail:tally:3");
    }

    #[test]
    fn commits_only_durable_offsets() {
        let tpl = offset_list("retail", &BTreeMap::from([(0, 41), (2, 7)])).unwrap();
        let got: Vec<_> = tpl.elements().iter().map(|e| (e.partition(), e.offset())).collect();
        assert_eq!(got, vec![(0, Offset::Offset(41)), (2, Offset::Offset(7))]);
    }

    #[test]
    fn source_defaults_to_one_partition() {
        let src = KafkaSource::new("b:9092", "g1", "t1");
        assert_eq!(src.partitions(), 1);
        assert_eq!(src.commit_interval, Duration::from_secs(5));
    }

    #[test]
    fn sink_requires_acks_from_all_replicas() {
        let sink = KafkaSink::new("b:9092", "time-kpi");
        assert_eq!(sink.acks.as_deref(), Some("all"));
    }
}
