//! Usage Tracker (§4.6): a bounded producer/consumer queue that batches
//! usage records into the repository so the request path never blocks on
//! a storage write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sa_domain::config::UsageConfig;
use sa_domain::repository::Repository;
use sa_domain::usage::UsageRecord;
use tokio::sync::mpsc;

pub struct UsageTracker {
    sender: mpsc::Sender<UsageRecord>,
    dropped: Arc<AtomicU64>,
}

impl UsageTracker {
    /// Spawn the single consumer task and return a handle for enqueueing.
    pub fn spawn(repo: Arc<dyn Repository>, config: UsageConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_consumer(repo, config, rx));
        Self { sender: tx, dropped }
    }

    /// Enqueue a usage record. Drop-newest-on-full: if the channel is at
    /// capacity the record is discarded immediately rather than blocking
    /// the request path, and an observability counter is bumped.
    pub fn enqueue(&self, record: UsageRecord) {
        let request_id = record.request_id;
        let status_code = record.upstream_status;
        match self.sender.try_send(record) {
            Ok(()) => {
                sa_domain::trace::TraceEvent::UsageRecordEnqueued {
                    request_id: request_id.to_string(),
                    status_code,
                }
                .emit();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(total_dropped = total, "usage queue full, dropping record");
                sa_domain::trace::TraceEvent::UsageRecordDropped {
                    request_id: request_id.to_string(),
                }
                .emit();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("usage tracker consumer task is gone, record dropped");
                sa_domain::trace::TraceEvent::UsageRecordDropped {
                    request_id: request_id.to_string(),
                }
                .emit();
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_consumer(
    repo: Arc<dyn Repository>,
    config: UsageConfig,
    mut rx: mpsc::Receiver<UsageRecord>,
) {
    let mut batch = Vec::with_capacity(config.batch_size);
    let flush_interval = Duration::from_millis(config.flush_interval_ms);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_record = rx.recv() => {
                match maybe_record {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= config.batch_size {
                            flush(&repo, &mut batch).await;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            flush(&repo, &mut batch).await;
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&repo, &mut batch).await;
                }
            }
        }
    }
}

/// Write a batch to the repository, retrying with exponential backoff on
/// failure. The whole batch is dropped (and logged) if it still fails
/// after the retry budget — the tracker never blocks the request path to
/// wait on storage.
async fn flush(repo: &Arc<dyn Repository>, batch: &mut Vec<UsageRecord>) {
    const MAX_RETRIES: u32 = 5;
    let records = std::mem::take(batch);
    let count = records.len();
    let mut attempt = 0;
    let mut pending = records;
    loop {
        match repo.append_usage_records(pending.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < MAX_RETRIES => {
                attempt += 1;
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
                tracing::warn!(attempt, error = %e, batch_size = count, "usage batch write failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                tracing::error!(error = %e, batch_size = count, "usage batch write failed after max retries, dropping batch");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::repository::InMemoryRepository;

    #[tokio::test]
    async fn enqueued_records_eventually_reach_the_repository() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut config = UsageConfig {
            queue_capacity: 10,
            batch_size: 2,
            flush_interval_ms: 20,
            retention_days: 90,
            cleanup_time_utc: "03:00".into(),
        };
        config.batch_size = 2;
        let dyn_repo: Arc<dyn Repository> = repo.clone();
        let tracker = UsageTracker::spawn(dyn_repo, config);

        tracker.enqueue(UsageRecord::new("sk-1", "gpt-4o", 200));
        tracker.enqueue(UsageRecord::new("sk-1", "gpt-4o", 200));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let records = repo.list_usage_for_test();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn full_queue_drops_newest_and_counts_it() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let config = UsageConfig {
            queue_capacity: 1,
            batch_size: 100,
            flush_interval_ms: 60_000,
            retention_days: 90,
            cleanup_time_utc: "03:00".into(),
        };
        let tracker = UsageTracker::spawn(repo, config);
        for _ in 0..5 {
            tracker.enqueue(UsageRecord::new("sk-1", "gpt-4o", 200));
        }
        // Give the consumer a beat to drain one slot, then flood again.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tracker.dropped_count() <= 5);
    }
}
