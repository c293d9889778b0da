//! Mesh-flavored communicator
//!
//! Authority travels in the `"authority"` metadata key of every outbound
//! message, and self-echo is detected by comparing the message origin
//! against this communicator's own endpoint identity. Batch sends produce
//! one message per (authority, kind) group; legacy mode degrades every
//! send to single-transform messages for consumers that cannot parse
//! batched payloads.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::bus::BusEndpoint;
use crate::comm::cache::AuthorityCache;
use crate::comm::sync::{flood_cache, send_trigger, FloodTasks};
use crate::comm::{
    effective_authority, CommConfig, ListenerRegistry, TransformCommunicator, TransformListener,
};
use crate::error::CommError;
use crate::transform::{Transform, TransformKind};
use crate::wire::{self, TransformPayload, TransformRecord};

enum Phase {
    Created,
    Running { recv_tasks: Vec<JoinHandle<()>> },
    ShutDown,
}

pub struct MeshCommunicator {
    config: CommConfig,
    endpoint: Arc<dyn BusEndpoint>,
    cache: Arc<AuthorityCache>,
    listeners: Arc<ListenerRegistry>,
    floods: Arc<FloodTasks>,
    phase: Mutex<Phase>,
}

impl MeshCommunicator {
    pub fn new(config: CommConfig, endpoint: Arc<dyn BusEndpoint>) -> Self {
        Self {
            config,
            endpoint,
            cache: Arc::new(AuthorityCache::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            floods: FloodTasks::new(),
            phase: Mutex::new(Phase::Created),
        }
    }

    /// Register a listener at construction time.
    pub fn with_listener(self, listener: Arc<dyn TransformListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn with_listeners(self, listeners: Vec<Arc<dyn TransformListener>>) -> Self {
        self.listeners.add_many(listeners);
        self
    }

    /// Cache access for inspection; the cache itself is owned exclusively
    /// by this communicator.
    pub fn cache(&self) -> &AuthorityCache {
        &self.cache
    }

    fn ensure_running(&self) -> Result<(), CommError> {
        match &*self.phase.lock().unwrap() {
            Phase::Running { .. } => Ok(()),
            Phase::Created => Err(CommError::NotInitialized),
            Phase::ShutDown => Err(CommError::AlreadyShutdown),
        }
    }

    fn channel_for(&self, kind: TransformKind) -> Option<String> {
        match kind {
            TransformKind::Static => Some(self.config.channel_static()),
            TransformKind::Dynamic => Some(self.config.channel_dynamic()),
            TransformKind::Unknown(_) => None,
        }
    }
}

#[async_trait]
impl TransformCommunicator for MeshCommunicator {
    async fn init(&self) -> Result<(), CommError> {
        {
            let mut phase = self.phase.lock().unwrap();
            match &*phase {
                Phase::Running { .. } => {
                    log::warn!("init() called on a running communicator, ignoring");
                    return Ok(());
                }
                Phase::ShutDown => return Err(CommError::AlreadyShutdown),
                Phase::Created => {}
            }
            *phase = Phase::Running { recv_tasks: Vec::new() };
        }
        log::debug!("init() authority={}", self.config.authority);

        let transform_task = tokio::spawn(transform_recv_loop(
            self.endpoint.subscribe(),
            self.config.clone(),
            self.endpoint.id(),
            Arc::clone(&self.listeners),
        ));
        let sync_task = tokio::spawn(sync_recv_loop(
            self.endpoint.subscribe(),
            self.config.clone(),
            Arc::clone(&self.endpoint),
            Arc::clone(&self.cache),
            Arc::clone(&self.floods),
        ));
        {
            let mut phase = self.phase.lock().unwrap();
            match &mut *phase {
                Phase::Running { recv_tasks } => {
                    recv_tasks.push(transform_task);
                    recv_tasks.push(sync_task);
                }
                _ => {
                    // shut down while we were spawning
                    transform_task.abort();
                    sync_task.abort();
                    return Err(CommError::AlreadyShutdown);
                }
            }
        }

        self.request_sync().await
    }

    async fn send_transform(&self, transform: &Transform) -> Result<bool, CommError> {
        self.ensure_running()?;

        let channel = match self.channel_for(transform.kind()) {
            Some(channel) => channel,
            None => {
                log::error!(
                    "cannot send transform: {}",
                    CommError::UnknownKind(transform.kind().code())
                );
                return Ok(false);
            }
        };

        let authority = effective_authority(&self.config.authority, transform);
        let mut attributed = transform.clone();
        attributed.set_authority(&authority);
        self.cache.store(&authority, &attributed);

        let record = TransformRecord::from_transform(&attributed);
        let payload = wire::encode(&TransformPayload::Single(record))?;
        let mut metadata = HashMap::new();
        metadata.insert(self.config.key_authority.clone(), authority);

        log::trace!("publishing transform on {}", channel);
        self.endpoint.publish(&channel, metadata, payload).await?;
        Ok(true)
    }

    async fn send_transforms(&self, transforms: &[Transform]) -> Result<bool, CommError> {
        if self.config.legacy_mode {
            for transform in transforms {
                if !self.send_transform(transform).await? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        self.ensure_running()?;

        // Validate every kind before touching the cache, so a rejected
        // batch leaves no partial state behind.
        for transform in transforms {
            if let TransformKind::Unknown(code) = transform.kind() {
                log::error!("cannot send transform batch: {}", CommError::UnknownKind(code));
                return Ok(false);
            }
        }

        let mut groups: BTreeMap<(String, bool), Vec<Transform>> = BTreeMap::new();
        for transform in transforms {
            let authority = effective_authority(&self.config.authority, transform);
            let mut attributed = transform.clone();
            attributed.set_authority(&authority);
            self.cache.store(&authority, &attributed);
            let is_static = attributed.kind() == TransformKind::Static;
            groups.entry((authority, is_static)).or_default().push(attributed);
        }

        for ((authority, is_static), group) in groups {
            let channel = if is_static {
                self.config.channel_static()
            } else {
                self.config.channel_dynamic()
            };
            let records: Vec<TransformRecord> =
                group.iter().map(TransformRecord::from_transform).collect();
            let payload = wire::encode(&TransformPayload::Batch(records))?;
            let mut metadata = HashMap::new();
            metadata.insert(self.config.key_authority.clone(), authority);
            self.endpoint.publish(&channel, metadata, payload).await?;
        }
        Ok(true)
    }

    async fn request_sync(&self) -> Result<(), CommError> {
        self.ensure_running()?;
        send_trigger(&self.endpoint, &self.config.channel_sync).await
    }

    fn add_transform_listener(&self, listener: Arc<dyn TransformListener>) {
        self.listeners.add(listener);
    }

    fn add_transform_listeners(&self, listeners: Vec<Arc<dyn TransformListener>>) {
        self.listeners.add_many(listeners);
    }

    fn remove_transform_listener(&self, listener: &Arc<dyn TransformListener>) {
        self.listeners.remove(listener);
    }

    async fn shutdown(&self) {
        let recv_tasks = {
            let mut phase = self.phase.lock().unwrap();
            match std::mem::replace(&mut *phase, Phase::ShutDown) {
                Phase::Running { recv_tasks } => recv_tasks,
                _ => Vec::new(),
            }
        };

        self.listeners.clear();
        for task in recv_tasks {
            task.abort();
            let _ = task.await;
        }
        self.floods.shutdown(self.config.join_timeout).await;
        self.cache.clear();
    }

    fn authority_name(&self) -> String {
        self.config.authority.clone()
    }
}

impl fmt::Display for MeshCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "authority = {}, communication = mesh, #listeners = {}, #cache = {}",
            self.config.authority,
            self.listeners.len(),
            self.cache.authority_count(TransformKind::Dynamic),
        )
    }
}

async fn transform_recv_loop(
    mut rx: tokio::sync::broadcast::Receiver<crate::bus::BusMessage>,
    config: CommConfig,
    own_id: uuid::Uuid,
    listeners: Arc<ListenerRegistry>,
) {
    let channel_static = config.channel_static();
    let channel_dynamic = config.channel_dynamic();
    loop {
        let msg = match rx.recv().await {
            Ok(msg) => msg,
            Err(RecvError::Lagged(n)) => {
                log::warn!("transform subscription lagged, {} messages lost", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let is_static = if msg.channel == channel_static {
            true
        } else if msg.channel == channel_dynamic {
            false
        } else {
            continue;
        };

        if msg.origin == own_id {
            log::trace!("received transform from myself, ignoring (endpoint {})", own_id);
            continue;
        }

        let authority = msg
            .metadata
            .get(&config.key_authority)
            .cloned()
            .unwrap_or_default();
        let payload: TransformPayload = match wire::decode(&msg.payload) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("received undecodable transform payload: {}", e);
                continue;
            }
        };

        let kind = if is_static {
            TransformKind::Static
        } else {
            TransformKind::Dynamic
        };
        for record in payload.records() {
            let mut transform = record.into_transform(kind);
            transform.set_authority(&authority);
            listeners.notify(&transform, is_static);
        }
    }
}

async fn sync_recv_loop(
    mut rx: tokio::sync::broadcast::Receiver<crate::bus::BusMessage>,
    config: CommConfig,
    endpoint: Arc<dyn BusEndpoint>,
    cache: Arc<AuthorityCache>,
    floods: Arc<FloodTasks>,
) {
    let own_id = endpoint.id();
    loop {
        let msg = match rx.recv().await {
            Ok(msg) => msg,
            Err(RecvError::Lagged(n)) => {
                log::warn!("sync subscription lagged, {} messages lost", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if msg.channel != config.channel_sync {
            continue;
        }
        if msg.origin == own_id {
            log::trace!("got sync request from myself, ignoring (endpoint {})", own_id);
            continue;
        }

        log::debug!("got sync request from {}, answering with cache", msg.origin_node);
        floods.track(tokio::spawn(flood_cache(
            config.clone(),
            Arc::clone(&endpoint),
            Arc::clone(&cache),
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use chrono::{TimeZone, Utc};
    use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct RecordingListener {
        seen: Mutex<Vec<(Transform, bool)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn snapshot(&self) -> Vec<(Transform, bool)> {
            self.seen.lock().unwrap().clone()
        }

        async fn wait_for(&self, n: usize) {
            timeout(Duration::from_secs(2), async {
                while self.count() < n {
                    sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("timed out waiting for transforms");
        }
    }

    impl TransformListener for RecordingListener {
        fn new_transform_available(&self, transform: &Transform, is_static: bool) {
            self.seen.lock().unwrap().push((transform.clone(), is_static));
        }
    }

    fn edge(parent: &str, child: &str, x: f64, kind: TransformKind) -> Transform {
        Transform::new(
            Isometry3::from_parts(Translation3::new(x, 0.0, 0.0), UnitQuaternion::identity()),
            parent,
            child,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            kind,
        )
    }

    fn mesh(bus: &Arc<MemoryBus>, authority: &str) -> MeshCommunicator {
        MeshCommunicator::new(CommConfig::new(authority), bus.endpoint(authority))
    }

    #[tokio::test]
    async fn test_send_before_init_raises() {
        let bus = MemoryBus::new();
        let comm = mesh(&bus, "alpha");
        let result = comm.send_transform(&edge("a", "b", 1.0, TransformKind::Static)).await;
        assert!(matches!(result, Err(CommError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected_without_cache_mutation() {
        let bus = MemoryBus::new();
        let comm = mesh(&bus, "alpha");
        comm.init().await.unwrap();

        let sent = comm
            .send_transform(&edge("a", "b", 1.0, TransformKind::Unknown(9)))
            .await
            .unwrap();
        assert!(!sent);
        assert_eq!(comm.cache().edge_count(TransformKind::Static), 0);
        assert_eq!(comm.cache().edge_count(TransformKind::Dynamic), 0);

        let sent = comm
            .send_transform(&edge("a", "b", 1.0, TransformKind::Static))
            .await
            .unwrap();
        assert!(sent);
        assert_eq!(comm.cache().edge_count(TransformKind::Static), 1);

        comm.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_echo_suppressed_peer_delivered() {
        let bus = MemoryBus::new();
        let listener_a = RecordingListener::new();
        let listener_b = RecordingListener::new();

        let comm_a = mesh(&bus, "alpha").with_listener(listener_a.clone());
        let comm_b = mesh(&bus, "beta").with_listener(listener_b.clone());
        comm_a.init().await.unwrap();
        comm_b.init().await.unwrap();

        comm_a
            .send_transform(&edge("map", "odom", 1.0, TransformKind::Dynamic))
            .await
            .unwrap();

        listener_b.wait_for(1).await;
        let (seen, is_static) = listener_b.snapshot().remove(0);
        assert_eq!(seen.frame_parent(), "map");
        assert_eq!(seen.authority(), "alpha");
        assert!(!is_static);

        // the sender's own listener never hears the loopback echo
        sleep(Duration::from_millis(50)).await;
        assert_eq!(listener_a.count(), 0);

        comm_a.shutdown().await;
        comm_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_authority_passes_through() {
        let bus = MemoryBus::new();
        let listener_b = RecordingListener::new();
        let comm_a = mesh(&bus, "alpha");
        let comm_b = mesh(&bus, "beta").with_listener(listener_b.clone());
        comm_a.init().await.unwrap();
        comm_b.init().await.unwrap();

        let mut t = edge("map", "odom", 1.0, TransformKind::Static);
        t.set_authority("surveyor");
        comm_a.send_transform(&t).await.unwrap();

        listener_b.wait_for(1).await;
        assert_eq!(listener_b.snapshot()[0].0.authority(), "surveyor");
        assert!(comm_a
            .cache()
            .get(TransformKind::Static, "surveyor", "map", "odom")
            .is_some());

        comm_a.shutdown().await;
        comm_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_one_message_per_authority_kind_group() {
        let bus = MemoryBus::new();
        let observer = bus.endpoint("observer");
        let comm = mesh(&bus, "alpha");
        comm.init().await.unwrap();

        let mut rx = observer.subscribe();

        let mut foreign = edge("x", "y", 4.0, TransformKind::Static);
        foreign.set_authority("ext");
        comm.send_transforms(&[
            edge("a", "b", 1.0, TransformKind::Static),
            edge("b", "c", 2.0, TransformKind::Static),
            edge("c", "d", 3.0, TransformKind::Dynamic),
            foreign,
        ])
        .await
        .unwrap();

        let mut groups = Vec::new();
        while groups.len() < 3 {
            let msg = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            if msg.channel.starts_with("/framecast/transform") {
                let records = wire::decode::<TransformPayload>(&msg.payload).unwrap().records();
                groups.push((
                    msg.channel.clone(),
                    msg.metadata.get("authority").cloned().unwrap(),
                    records.len(),
                ));
            }
        }

        assert!(groups.contains(&("/framecast/transform/static".into(), "alpha".into(), 2)));
        assert!(groups.contains(&("/framecast/transform/dynamic".into(), "alpha".into(), 1)));
        assert!(groups.contains(&("/framecast/transform/static".into(), "ext".into(), 1)));

        comm.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_with_unknown_kind_rejected_whole() {
        let bus = MemoryBus::new();
        let comm = mesh(&bus, "alpha");
        comm.init().await.unwrap();

        let sent = comm
            .send_transforms(&[
                edge("a", "b", 1.0, TransformKind::Static),
                edge("b", "c", 2.0, TransformKind::Unknown(3)),
            ])
            .await
            .unwrap();
        assert!(!sent);
        assert_eq!(comm.cache().edge_count(TransformKind::Static), 0);

        comm.shutdown().await;
    }

    #[tokio::test]
    async fn test_legacy_batch_degrades_to_single_messages() {
        let bus = MemoryBus::new();
        let observer = bus.endpoint("observer");
        let comm = MeshCommunicator::new(
            CommConfig::new("alpha").with_legacy_mode(true),
            bus.endpoint("alpha"),
        );
        comm.init().await.unwrap();

        let mut rx = observer.subscribe();
        comm.send_transforms(&[
            edge("a", "b", 1.0, TransformKind::Static),
            edge("b", "c", 2.0, TransformKind::Static),
        ])
        .await
        .unwrap();

        for _ in 0..2 {
            let msg = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            let payload: TransformPayload = wire::decode(&msg.payload).unwrap();
            assert!(matches!(payload, TransformPayload::Single(_)));
        }

        comm.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_joiner_converges_via_sync_flood() {
        let bus = MemoryBus::new();
        let comm_a = mesh(&bus, "alpha");
        comm_a.init().await.unwrap();

        // A publishes its scene before B exists.
        comm_a
            .send_transforms(&[
                edge("map", "odom", 1.0, TransformKind::Static),
                edge("odom", "base", 2.0, TransformKind::Static),
                edge("base", "lidar", 3.0, TransformKind::Static),
                edge("base", "arm", 4.0, TransformKind::Dynamic),
                edge("arm", "tool", 5.0, TransformKind::Dynamic),
            ])
            .await
            .unwrap();

        // B joins late; its init trigger makes A flood its cache.
        let listener_b = RecordingListener::new();
        let comm_b = mesh(&bus, "beta").with_listener(listener_b.clone());
        comm_b.init().await.unwrap();

        listener_b.wait_for(5).await;
        let seen = listener_b.snapshot();
        let mut edges: Vec<(String, String, bool)> = seen
            .iter()
            .map(|(t, is_static)| {
                (t.frame_parent().to_string(), t.frame_child().to_string(), *is_static)
            })
            .collect();
        edges.sort();
        edges.dedup();
        assert_eq!(edges.len(), 5);
        assert!(edges.contains(&("map".into(), "odom".into(), true)));
        assert!(edges.contains(&("arm".into(), "tool".into(), false)));
        assert!(seen.iter().all(|(t, _)| t.authority() == "alpha"));

        comm_a.shutdown().await;
        comm_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_sync_deliveries_are_tolerated() {
        let bus = MemoryBus::new();
        let comm_a = mesh(&bus, "alpha");
        comm_a.init().await.unwrap();
        comm_a
            .send_transform(&edge("map", "odom", 1.0, TransformKind::Static))
            .await
            .unwrap();

        let listener_b = RecordingListener::new();
        let comm_b = mesh(&bus, "beta").with_listener(listener_b.clone());
        comm_b.init().await.unwrap();

        listener_b.wait_for(1).await;
        comm_b.request_sync().await.unwrap();
        listener_b.wait_for(2).await;

        // same edge re-announced; the listener simply sees it again
        let seen = listener_b.snapshot();
        assert!(seen.len() >= 2);
        assert!(seen.iter().all(|(t, _)| t.frame_parent() == "map"));

        comm_a.shutdown().await;
        comm_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_safe_without_init() {
        let bus = MemoryBus::new();

        let never_initialized = mesh(&bus, "alpha");
        never_initialized.shutdown().await;
        never_initialized.shutdown().await;

        let comm = mesh(&bus, "beta");
        comm.init().await.unwrap();
        comm.send_transform(&edge("a", "b", 1.0, TransformKind::Static))
            .await
            .unwrap();
        comm.shutdown().await;
        comm.shutdown().await;

        assert_eq!(comm.cache().edge_count(TransformKind::Static), 0);
        assert!(comm.listeners.is_empty());
        assert!(matches!(
            comm.send_transform(&edge("a", "b", 1.0, TransformKind::Static)).await,
            Err(CommError::AlreadyShutdown)
        ));
    }

    #[tokio::test]
    async fn test_last_write_wins_through_send_path() {
        let bus = MemoryBus::new();
        let comm = mesh(&bus, "alpha");
        comm.init().await.unwrap();

        let newer = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let mut first = edge("a", "b", 1.0, TransformKind::Dynamic);
        first.set_time(newer);
        comm.send_transform(&first).await.unwrap();
        comm.send_transform(&edge("a", "b", 2.0, TransformKind::Dynamic))
            .await
            .unwrap();

        let cached = comm
            .cache()
            .get(TransformKind::Dynamic, "alpha", "a", "b")
            .unwrap();
        assert_eq!(cached.translation(), Vector3::new(2.0, 0.0, 0.0));

        comm.shutdown().await;
    }
}
