//! Late-joiner synchronization protocol
//!
//! A node that starts after its peers must converge without waiting for
//! every edge's next natural update. On init each communicator publishes a
//! zero-payload trigger on the sync channel; any peer receiving a foreign
//! trigger floods its entire cache back out, re-tagged with the original
//! authorities. Flood/gossip style: nothing is addressed, nothing is
//! acknowledged, duplicates are expected and harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bus::BusEndpoint;
use crate::comm::cache::AuthorityCache;
use crate::comm::CommConfig;
use crate::error::CommError;
use crate::transform::TransformKind;
use crate::wire::{self, TransformPayload, TransformRecord};

/// Publish the zero-payload sync trigger.
pub(crate) async fn send_trigger(
    endpoint: &Arc<dyn BusEndpoint>,
    channel_sync: &str,
) -> Result<(), CommError> {
    log::debug!("sending sync request trigger from endpoint {}", endpoint.id());
    endpoint
        .publish(channel_sync, HashMap::new(), Vec::new())
        .await?;
    Ok(())
}

/// Republish the entire cache: per kind partition, per authority, one batch
/// message tagged with that authority — or per-edge messages in legacy
/// mode. Snapshots are taken under the cache lock; publishing happens
/// without it.
pub(crate) async fn flood_cache(
    cfg: CommConfig,
    endpoint: Arc<dyn BusEndpoint>,
    cache: Arc<AuthorityCache>,
) {
    log::debug!("flooding cache from endpoint {}", endpoint.id());
    let partitions = [
        (TransformKind::Dynamic, cfg.channel_dynamic()),
        (TransformKind::Static, cfg.channel_static()),
    ];
    for (kind, channel) in partitions {
        for (authority, transforms) in cache.snapshot(kind) {
            let mut metadata = HashMap::new();
            metadata.insert(cfg.key_authority.clone(), authority.clone());

            if cfg.legacy_mode {
                for t in &transforms {
                    let record = TransformRecord::from_transform(t);
                    let payload = match wire::encode(&TransformPayload::Single(record)) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::error!("cannot encode cache flood record: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = endpoint.publish(&channel, metadata.clone(), payload).await {
                        log::warn!("cache flood publish failed for {}: {}", authority, e);
                    }
                }
            } else {
                let records: Vec<TransformRecord> =
                    transforms.iter().map(TransformRecord::from_transform).collect();
                let payload = match wire::encode(&TransformPayload::Batch(records)) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("cannot encode cache flood batch: {}", e);
                        continue;
                    }
                };
                if let Err(e) = endpoint.publish(&channel, metadata.clone(), payload).await {
                    log::warn!("cache flood publish failed for {}: {}", authority, e);
                }
            }
        }
    }
}

/// Handles of in-flight flood responders, so shutdown can wait for them.
pub(crate) struct FloodTasks {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FloodTasks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Track a newly spawned flood responder, dropping finished handles.
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Wait (bounded) for in-flight floods, aborting stragglers.
    pub async fn shutdown(&self, join_timeout: std::time::Duration) {
        let drained: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for mut handle in drained {
            if timeout(join_timeout, &mut handle).await.is_err() {
                log::warn!("cache flood task did not finish in time, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::transform::Transform;
    use chrono::{TimeZone, Utc};
    use nalgebra::{Isometry3, Translation3, UnitQuaternion};
    use std::time::Duration;

    fn edge(parent: &str, child: &str, kind: TransformKind) -> Transform {
        let mut t = Transform::new(
            Isometry3::from_parts(Translation3::new(1.0, 0.0, 0.0), UnitQuaternion::identity()),
            parent,
            child,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            kind,
        );
        t.set_authority("origin_node");
        t
    }

    #[tokio::test]
    async fn test_flood_batches_per_authority_and_kind() {
        let bus = MemoryBus::new();
        let endpoint = bus.endpoint("flooder");
        let observer = bus.endpoint("observer");
        let mut rx = observer.subscribe();

        let cache = Arc::new(AuthorityCache::new());
        cache.store("origin_node", &edge("a", "b", TransformKind::Static));
        cache.store("origin_node", &edge("b", "c", TransformKind::Static));
        cache.store("other_node", &edge("c", "d", TransformKind::Dynamic));

        let cfg = CommConfig::new("flooder");
        flood_cache(cfg, endpoint.clone() as Arc<dyn BusEndpoint>, cache).await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let msg = rx.recv().await.unwrap();
            let records = wire::decode::<TransformPayload>(&msg.payload)
                .unwrap()
                .records();
            seen.push((msg.channel, msg.metadata.get("authority").cloned(), records.len()));
        }

        assert!(seen.contains(&(
            "/framecast/transform/static".to_string(),
            Some("origin_node".to_string()),
            2
        )));
        assert!(seen.contains(&(
            "/framecast/transform/dynamic".to_string(),
            Some("other_node".to_string()),
            1
        )));
    }

    #[tokio::test]
    async fn test_legacy_flood_sends_per_edge_messages() {
        let bus = MemoryBus::new();
        let endpoint = bus.endpoint("flooder");
        let observer = bus.endpoint("observer");
        let mut rx = observer.subscribe();

        let cache = Arc::new(AuthorityCache::new());
        cache.store("origin_node", &edge("a", "b", TransformKind::Static));
        cache.store("origin_node", &edge("b", "c", TransformKind::Static));

        let cfg = CommConfig::new("flooder").with_legacy_mode(true);
        flood_cache(cfg, endpoint.clone() as Arc<dyn BusEndpoint>, cache).await;

        for _ in 0..2 {
            let msg = rx.recv().await.unwrap();
            let payload: TransformPayload = wire::decode(&msg.payload).unwrap();
            assert!(matches!(payload, TransformPayload::Single(_)));
        }
    }

    #[tokio::test]
    async fn test_trigger_is_zero_payload() {
        let bus = MemoryBus::new();
        let endpoint = bus.endpoint("joiner");
        let observer = bus.endpoint("observer");
        let mut rx = observer.subscribe();

        send_trigger(&(endpoint.clone() as Arc<dyn BusEndpoint>), "/framecast/sync")
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "/framecast/sync");
        assert!(msg.payload.is_empty());
        assert_eq!(msg.origin, endpoint.id());
    }

    #[tokio::test]
    async fn test_flood_tasks_shutdown_waits_then_aborts() {
        let tracker = FloodTasks::new();
        tracker.track(tokio::spawn(async {}));
        tracker.track(tokio::spawn(async {
            // never finishes on its own
            std::future::pending::<()>().await;
        }));

        tracker.shutdown(Duration::from_millis(20)).await;
        // both handles are gone; tracking again starts clean
        tracker.track(tokio::spawn(async {}));
        tracker.shutdown(Duration::from_millis(20)).await;
    }
}
