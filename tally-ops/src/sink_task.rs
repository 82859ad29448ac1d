//! One consumer task per output stream.
//!
//! A task owns its sink, retries transient failures with exponential backoff
//! and commits the stream checkpoint only after the sink flushed.

use std::time::{Duration, Instant};

use tally_core::{metrics, CheckpointMeta, CheckpointStore, Error, Record, Result, Sink};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

pub enum SinkCommand {
    Write(Record),
    /// Make buffered writes durable.
    Flush,
    /// Flush, then persist progress for this stream.
    Commit(CheckpointMeta),
}

/// Exponential delay between retries, starting at 50ms.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        let initial = Duration::from_millis(50).min(max);
        Self {
            initial,
            current: initial,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub struct SinkTask {
    stream: String,
    sink: Box<dyn Sink>,
    checkpoints: Option<CheckpointStore>,
    max_backoff: Duration,
}

impl SinkTask {
    pub fn new(stream: impl Into<String>, sink: Box<dyn Sink>, max_backoff: Duration) -> Self {
        Self {
            stream: stream.into(),
            sink,
            checkpoints: None,
            max_backoff,
        }
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Consume commands until every sender is gone, then close the sink.
    /// Returns the number of records written.
    #[instrument(name = "sink_task", skip_all, fields(stream = %self.stream))]
    pub async fn run(mut self, mut rx: mpsc::Receiver<SinkCommand>) -> Result<u64> {
        let mut written = 0u64;
        let mut backoff = Backoff::new(self.max_backoff);
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SinkCommand::Write(rec) => {
                    let started = Instant::now();
                    loop {
                        match self.sink.on_element(rec.clone()).await {
                            Ok(()) => break,
                            Err(e) if e.is_transient() => {
                                pause(&self.stream, &mut backoff, &e).await
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    backoff.reset();
                    let ms = started.elapsed().as_secs_f64() * 1_000.0;
                    metrics::SINK_PROC_LATENCY_MS.observe(ms);
                    written += 1;
                }
                SinkCommand::Flush => self.flush(&mut backoff).await?,
                SinkCommand::Commit(meta) => {
                    self.flush(&mut backoff).await?;
                    if let Some(store) = &self.checkpoints {
                        store.commit(&meta).await?;
                        debug!(last_closed_end = %meta.last_closed_end, "checkpoint committed");
                    }
                }
            }
        }
        loop {
            match self.sink.close().await {
                Ok(()) => break,
                Err(e) if e.is_transient() => pause(&self.stream, &mut backoff, &e).await,
                Err(e) => return Err(e),
            }
        }
        info!(written, "sink closed");
        Ok(written)
    }

    async fn flush(&mut self, backoff: &mut Backoff) -> Result<()> {
        loop {
            match self.sink.flush().await {
                Ok(()) => {
                    backoff.reset();
                    return Ok(());
                }
                Err(e) if e.is_transient() => pause(&self.stream, backoff, &e).await,
                Err(e) => return Err(e),
            }
        }
    }
}

async fn pause(stream: &str, backoff: &mut Backoff, err: &Error) {
    let delay = backoff.next_delay();
    metrics::SINK_RETRIES.with_label_values(&[stream]).inc();
    warn!(error = %err, delay_ms = delay.as_millis() as u64, "sink unavailable, retrying");
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tally_state::InMemoryState;

    #[derive(Default, Clone)]
    struct Flaky {
        fail_next: Arc<Mutex<u32>>,
        written: Arc<Mutex<Vec<Record>>>,
        flushes: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl Sink for Flaky {
        async fn on_element(&mut self, record: Record) -> Result<()> {
            let mut left = self.fail_next.lock();
            if *left > 0 {
                *left -= 1;
                return Err(Error::sink_unavailable("flaky", "try again"));
            }
            self.written.lock().push(record);
            Ok(())
        }

        async fn flush(&mut self) -> Result<()> {
            *self.flushes.lock() += 1;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Sink for Broken {
        async fn on_element(&mut self, _record: Record) -> Result<()> {
            Err(Error::Checkpoint("disk gone".into()))
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new(Duration::from_millis(300));
        let delays: Vec<_> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 200, 300, 300]);
        b.reset();
        assert_eq!(b.next_delay().as_millis(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_without_loss() {
        let sink = Flaky::default();
        *sink.fail_next.lock() = 3;
        let (tx, rx) = mpsc::channel(4);
        let task = SinkTask::new("time-kpi", Box::new(sink.clone()), Duration::from_secs(1));
        let handle = tokio::spawn(task.run(rx));
        tx.send(SinkCommand::Write(Record::keyed("w1", at(60), serde_json::json!({"OPM": 1}))))
            .await
            .unwrap();
        drop(tx);
        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(sink.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn commit_flushes_before_persisting_checkpoint() {
        let sink = Flaky::default();
        let store = CheckpointStore::new(Arc::new(InMemoryState::default()));
        let (tx, rx) = mpsc::channel(4);
        let task = SinkTask::new("time-kpi", Box::new(sink.clone()), Duration::from_secs(1))
            .with_checkpoints(store.clone());
        let handle = tokio::spawn(task.run(rx));
        tx.send(SinkCommand::Write(Record::keyed("w1", at(60), serde_json::json!({}))))
            .await
            .unwrap();
        tx.send(SinkCommand::Commit(CheckpointMeta {
            stream: "time-kpi".into(),
            last_closed_end: at(60),
            watermark: at(61),
            source_offsets: BTreeMap::from([(0, 7)]),
        }))
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();
        // one flush for the commit, one from close()
        assert_eq!(*sink.flushes.lock(), 2);
        let cp = store.load("time-kpi").await.unwrap().unwrap();
        assert_eq!(cp.last_closed_end, at(60));
        assert_eq!(cp.source_offsets.get(&0), Some(&7));
    }

    #[tokio::test]
    async fn flush_command_reaches_the_sink_while_running() {
        let sink = Flaky::default();
        let (tx, rx) = mpsc::channel(4);
        let task = SinkTask::new("raw", Box::new(sink.clone()), Duration::from_secs(1));
        let handle = tokio::spawn(task.run(rx));
        tx.send(SinkCommand::Write(Record::new(at(5), serde_json::json!({}))))
            .await
            .unwrap();
        tx.send(SinkCommand::Flush).await.unwrap();
        // the task is still open; the flush must not wait for close()
        tokio::time::timeout(Duration::from_secs(5), async {
            while *sink.flushes.lock() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();
        assert_eq!(*sink.flushes.lock(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_stops_the_task() {
        let (tx, rx) = mpsc::channel(1);
        let task = SinkTask::new("raw", Box::new(Broken), Duration::from_secs(1));
        let handle = tokio::spawn(task.run(rx));
        tx.send(SinkCommand::Write(Record::new(at(0), serde_json::json!({}))))
            .await
            .unwrap();
        assert!(matches!(handle.await.unwrap(), Err(Error::Checkpoint(_))));
    }
}
