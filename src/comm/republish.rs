//! Legacy periodic republisher
//!
//! Compatibility path for consumers that expect a fixed-interval repeating
//! broadcast per edge instead of one-shot or batched delivery. One
//! cancellable background task per edge key; re-sending an edge replaces
//! its task. Cancellation is cooperative with a bounded join, then the
//! task is aborted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::bus::BusEndpoint;
use crate::transform::Transform;
use crate::wire::{self, TransformPayload, TransformRecord};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

struct RepublishTask {
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct LegacyRepublisher {
    interval: Duration,
    join_timeout: Duration,
    tasks: tokio::sync::Mutex<HashMap<String, RepublishTask>>,
}

impl LegacyRepublisher {
    pub fn new(interval: Duration, join_timeout: Duration) -> Self {
        Self {
            interval,
            join_timeout,
            tasks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Replace the republish task for an edge key: any running task for the
    /// key is cancelled and joined first, so at most one task per key is
    /// ever live. The first broadcast of the new task happens after one
    /// interval.
    pub async fn restart(
        &self,
        key: String,
        transform: Transform,
        endpoint: Arc<dyn BusEndpoint>,
        channel: String,
        metadata: HashMap<String, String>,
    ) {
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.remove(&key) {
            log::debug!("replacing legacy republish task for edge {}", key);
            self.stop_task(previous).await;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(republish_loop(
            key.clone(),
            transform,
            endpoint,
            channel,
            metadata,
            self.interval,
            Arc::clone(&cancelled),
            Arc::clone(&wake),
        ));

        tasks.insert(
            key,
            RepublishTask {
                cancelled,
                wake,
                handle,
            },
        );
    }

    /// Cancel and join every task.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (key, task) in tasks.drain() {
            log::debug!("stopping legacy republish task for edge {}", key);
            self.stop_task(task).await;
        }
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    async fn stop_task(&self, mut task: RepublishTask) {
        task.cancelled.store(true, Ordering::SeqCst);
        task.wake.notify_one();
        if timeout(self.join_timeout, &mut task.handle).await.is_err() {
            log::warn!("legacy republish task did not stop in time, aborting");
            task.handle.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn republish_loop(
    key: String,
    mut transform: Transform,
    endpoint: Arc<dyn BusEndpoint>,
    channel: String,
    metadata: HashMap<String, String>,
    interval: Duration,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    let stamp_offset =
        chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());

    'run: loop {
        tokio::select! {
            _ = wake.notified() => break 'run,
            _ = sleep(interval) => {}
        }
        if cancelled.load(Ordering::SeqCst) {
            break 'run;
        }

        // Fresh send stamp on every broadcast, one interval ahead, so
        // consumers interpolating near "now" keep the edge alive.
        transform.set_time(Utc::now() + stamp_offset);
        let record = TransformRecord::from_transform(&transform);
        let payload = match wire::encode(&TransformPayload::Single(record)) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("cannot encode legacy republish for edge {}: {}", key, e);
                break 'run;
            }
        };

        loop {
            match endpoint
                .publish(&channel, metadata.clone(), payload.clone())
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    log::warn!("legacy republish failed for edge {}: {}, retrying", key, e);
                    tokio::select! {
                        _ = wake.notified() => break 'run,
                        _ = sleep(RETRY_BACKOFF) => {}
                    }
                    if cancelled.load(Ordering::SeqCst) {
                        break 'run;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, BusMessage, MemoryBus};
    use crate::transform::TransformKind;
    use async_trait::async_trait;
    use chrono::DateTime;
    use nalgebra::{Isometry3, Translation3, UnitQuaternion};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    fn edge(x: f64) -> Transform {
        Transform::new(
            Isometry3::from_parts(Translation3::new(x, 0.0, 0.0), UnitQuaternion::identity()),
            "base",
            "lidar",
            DateTime::UNIX_EPOCH,
            TransformKind::Static,
        )
    }

    fn republisher() -> LegacyRepublisher {
        LegacyRepublisher::new(Duration::from_millis(50), Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_broadcast_with_fresh_stamp() {
        let bus = MemoryBus::new();
        let endpoint = bus.endpoint("legacy");
        let mut rx = endpoint.subscribe();

        let rp = republisher();
        rp.restart(
            "baselidar".to_string(),
            edge(1.0),
            endpoint.clone(),
            "/tf/dynamic".to_string(),
            HashMap::new(),
        )
        .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        let decode = |msg: &BusMessage| {
            wire::decode::<TransformPayload>(&msg.payload)
                .unwrap()
                .records()
                .remove(0)
        };
        let r1 = decode(&first);
        let r2 = decode(&second);
        assert_eq!(r1.frame_parent, "base");
        // stamps are freshly taken at send time, not the cached epoch stamp
        assert!(r1.time > 0);
        assert!(r2.time >= r1.time);

        rp.shutdown().await;
        assert_eq!(rp.task_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_one_task_and_newest_pose() {
        let bus = MemoryBus::new();
        let endpoint = bus.endpoint("legacy");
        let mut rx = endpoint.subscribe();

        let rp = republisher();
        let key = "baselidar".to_string();
        rp.restart(key.clone(), edge(1.0), endpoint.clone(), "/tf".into(), HashMap::new())
            .await;
        rp.restart(key.clone(), edge(2.0), endpoint.clone(), "/tf".into(), HashMap::new())
            .await;
        rp.restart(key.clone(), edge(3.0), endpoint.clone(), "/tf".into(), HashMap::new())
            .await;

        assert_eq!(rp.task_count().await, 1);

        let msg = rx.recv().await.unwrap();
        let record = wire::decode::<TransformPayload>(&msg.payload)
            .unwrap()
            .records()
            .remove(0);
        assert_eq!(record.transform.translation.x, 3.0);

        rp.shutdown().await;
    }

    struct FlakyEndpoint {
        inner: Arc<dyn BusEndpoint>,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl BusEndpoint for FlakyEndpoint {
        fn id(&self) -> Uuid {
            self.inner.id()
        }

        fn node_name(&self) -> &str {
            self.inner.node_name()
        }

        async fn publish(
            &self,
            channel: &str,
            metadata: HashMap<String, String>,
            payload: Vec<u8>,
        ) -> Result<(), BusError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BusError::Publish("transient outage".to_string()));
            }
            self.inner.publish(channel, metadata, payload).await
        }

        fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
            self.inner.subscribe()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_is_retried_not_fatal() {
        let bus = MemoryBus::new();
        let endpoint = bus.endpoint("legacy");
        let mut rx = endpoint.subscribe();
        let flaky = Arc::new(FlakyEndpoint {
            inner: endpoint,
            failures_left: AtomicUsize::new(3),
            attempts: AtomicUsize::new(0),
        });

        let rp = republisher();
        rp.restart(
            "baselidar".to_string(),
            edge(1.0),
            flaky.clone() as Arc<dyn BusEndpoint>,
            "/tf".into(),
            HashMap::new(),
        )
        .await;

        // The broadcast still arrives after the transient failures burn off.
        let msg = rx.recv().await.unwrap();
        assert!(!msg.payload.is_empty());
        assert!(flaky.attempts.load(Ordering::SeqCst) >= 4);
        assert_eq!(rp.task_count().await, 1);

        rp.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_twice_is_harmless() {
        let rp = republisher();
        rp.shutdown().await;
        rp.shutdown().await;
        assert_eq!(rp.task_count().await, 0);
    }
}
