//! Node-flavored communicator
//!
//! Authority rides on the transport's own addressing: receivers take the
//! origin node name (slashes stripped) as the authority unless an explicit
//! metadata override is present — the override is how cache floods keep
//! their original authorities. Self-echo is detected by node name, so every
//! process on a bus needs a distinct one. Legacy mode emulates the old
//! fixed-interval static broadcast: static sends feed a per-edge periodic
//! republish task that broadcasts on the dynamic channel, where legacy
//! consumers listen.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::bus::BusEndpoint;
use crate::comm::cache::{edge_key, AuthorityCache};
use crate::comm::republish::LegacyRepublisher;
use crate::comm::sync::{flood_cache, send_trigger, FloodTasks};
use crate::comm::{
    effective_authority, CommConfig, ListenerRegistry, TransformCommunicator, TransformListener,
};
use crate::error::CommError;
use crate::transform::{Transform, TransformKind};
use crate::wire::{self, TransformPayload, TransformRecord};

fn clean_node_name(name: &str) -> String {
    name.replace('/', "")
}

enum Phase {
    Created,
    Running { recv_tasks: Vec<JoinHandle<()>> },
    ShutDown,
}

pub struct NodeCommunicator {
    config: CommConfig,
    endpoint: Arc<dyn BusEndpoint>,
    cache: Arc<AuthorityCache>,
    listeners: Arc<ListenerRegistry>,
    republisher: LegacyRepublisher,
    floods: Arc<FloodTasks>,
    phase: Mutex<Phase>,
}

impl NodeCommunicator {
    /// The endpoint should be attached under this communicator's authority
    /// name; inbound attribution and echo filtering both key off it.
    pub fn new(config: CommConfig, endpoint: Arc<dyn BusEndpoint>) -> Self {
        let republisher = LegacyRepublisher::new(config.legacy_interval, config.join_timeout);
        Self {
            config,
            endpoint,
            cache: Arc::new(AuthorityCache::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            republisher,
            floods: FloodTasks::new(),
            phase: Mutex::new(Phase::Created),
        }
    }

    pub fn with_listener(self, listener: Arc<dyn TransformListener>) -> Self {
        self.listeners.add(listener);
        self
    }

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

    /// Authority metadata is attached only when it differs from what the
    /// origin node name already says.
    fn metadata_for(&self, authority: &str) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        if authority != self.config.authority {
            metadata.insert(self.config.key_authority.clone(), authority.to_string());
        }
        metadata
    }
}

#[async_trait]
impl TransformCommunicator for NodeCommunicator {
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
        log::debug!("init() node={}", self.endpoint.node_name());

        let transform_task = tokio::spawn(transform_recv_loop(
            self.endpoint.subscribe(),
            self.config.clone(),
            self.endpoint.node_name().to_string(),
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

        if let TransformKind::Unknown(code) = transform.kind() {
            log::error!("cannot send transform: {}", CommError::UnknownKind(code));
            return Ok(false);
        }

        let authority = effective_authority(&self.config.authority, transform);
        let mut attributed = transform.clone();
        attributed.set_authority(&authority);
        self.cache.store(&authority, &attributed);

        let is_static = attributed.kind() == TransformKind::Static;
        if is_static && self.config.legacy_mode {
            // old-style consumers expect this edge repeated on the dynamic
            // stream; hand it to the periodic republisher instead of
            // broadcasting once
            let key = edge_key(attributed.frame_parent(), attributed.frame_child());
            log::debug!("scheduling legacy republish for edge {}", key);
            self.republisher
                .restart(
                    key,
                    attributed,
                    Arc::clone(&self.endpoint),
                    self.config.channel_dynamic(),
                    self.metadata_for(&authority),
                )
                .await;
            return Ok(true);
        }

        let channel = if is_static {
            self.config.channel_static()
        } else {
            self.config.channel_dynamic()
        };
        let record = TransformRecord::from_transform(&attributed);
        let payload = wire::encode(&TransformPayload::Single(record))?;
        self.endpoint
            .publish(&channel, self.metadata_for(&authority), payload)
            .await?;
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
            self.endpoint
                .publish(&channel, self.metadata_for(&authority), payload)
                .await?;
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
        self.republisher.shutdown().await;
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

impl fmt::Display for NodeCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "authority = {}, communication = node, #listeners = {}",
            self.config.authority,
            self.listeners.len(),
        )
    }
}

async fn transform_recv_loop(
    mut rx: tokio::sync::broadcast::Receiver<crate::bus::BusMessage>,
    config: CommConfig,
    own_node: String,
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

        if msg.origin_node == own_node {
            log::trace!("received transform from myself, ignoring (node {})", own_node);
            continue;
        }

        let authority = match msg.metadata.get(&config.key_authority) {
            Some(authority) => authority.clone(),
            None => clean_node_name(&msg.origin_node),
        };
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
    let own_node = endpoint.node_name().to_string();
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
        if msg.origin_node == own_node {
            log::trace!("got sync request from myself, ignoring (node {})", own_node);
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
