//! Communicator layer
//!
//! The transport adapter contract every backend implements, the listener
//! contract the downstream buffer engine registers against, and the shared
//! pieces both backend flavors are built from: configuration, the listener
//! registry, the authority cache, and the legacy republisher.

pub mod cache;
pub mod mesh;
pub mod node;
pub mod republish;
pub mod sync;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CommError;
use crate::transform::{Transform, AUTHORITY_UNINITIALIZED};

/// Default channel the transform streams hang off.
pub const DEFAULT_CHANNEL_TRANSFORMS: &str = "/framecast/transform";
/// Default channel for sync trigger messages.
pub const DEFAULT_CHANNEL_SYNC: &str = "/framecast/sync";
pub const DEFAULT_SUFFIX_STATIC: &str = "/static";
pub const DEFAULT_SUFFIX_DYNAMIC: &str = "/dynamic";

/// Receives every delivered, de-echoed transform.
///
/// Called synchronously on the task that received the transport event —
/// there is no internal dispatch queue, so implementations must return
/// promptly or they stall delivery for the whole process.
pub trait TransformListener: Send + Sync {
    fn new_transform_available(&self, transform: &Transform, is_static: bool);
}

/// The capability contract every transport backend satisfies.
///
/// Lifecycle: construct, [`init`](Self::init), send/receive, then
/// [`shutdown`](Self::shutdown). Operations other than listener management
/// fail with [`CommError::NotInitialized`] before `init`; unknown transform
/// kinds are reported with `Ok(false)` instead — use-before-init is a
/// programming error, an unrecognized kind is runtime data.
#[async_trait]
pub trait TransformCommunicator: Send + Sync {
    /// Open subscriptions on the transform and sync channels, start the
    /// receive loops, and trigger the sync protocol.
    async fn init(&self) -> Result<(), CommError>;

    /// Cache and publish one transform. `Ok(false)` when the kind is
    /// unrecognized; the cache is left untouched in that case.
    async fn send_transform(&self, transform: &Transform) -> Result<bool, CommError>;

    /// Cache and publish a sequence of transforms, batched by
    /// (effective authority, kind). In legacy mode this degrades to one
    /// single-transform send per element.
    async fn send_transforms(&self, transforms: &[Transform]) -> Result<bool, CommError>;

    /// Ask all peers to republish their caches.
    async fn request_sync(&self) -> Result<(), CommError>;

    fn add_transform_listener(&self, listener: Arc<dyn TransformListener>);

    fn add_transform_listeners(&self, listeners: Vec<Arc<dyn TransformListener>>);

    /// Remove a previously added listener, matched by identity. A no-op if
    /// the listener was never added.
    fn remove_transform_listener(&self, listener: &Arc<dyn TransformListener>);

    /// Tear down: clear listeners, cancel and join background tasks
    /// (bounded wait), clear the caches. Safe to call repeatedly or
    /// without a prior `init`.
    async fn shutdown(&self);

    fn authority_name(&self) -> String;
}

/// Communicator configuration. Channel names and the metadata key mirror
/// the transport conventions; override them only to interoperate with a
/// deployment that renamed its channels.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// This node's authority identity.
    pub authority: String,
    pub channel_transforms: String,
    pub channel_sync: String,
    pub suffix_static: String,
    pub suffix_dynamic: String,
    /// Metadata key under which authority travels.
    pub key_authority: String,
    /// Compatibility mode for consumers that cannot parse batched payloads.
    pub legacy_mode: bool,
    /// Period of the legacy per-edge republish loop.
    pub legacy_interval: Duration,
    /// Bounded wait when joining a cancelled background task.
    pub join_timeout: Duration,
}

impl CommConfig {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            channel_transforms: DEFAULT_CHANNEL_TRANSFORMS.to_string(),
            channel_sync: DEFAULT_CHANNEL_SYNC.to_string(),
            suffix_static: DEFAULT_SUFFIX_STATIC.to_string(),
            suffix_dynamic: DEFAULT_SUFFIX_DYNAMIC.to_string(),
            key_authority: crate::wire::KEY_AUTHORITY.to_string(),
            legacy_mode: false,
            legacy_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_legacy_mode(mut self, legacy_mode: bool) -> Self {
        self.legacy_mode = legacy_mode;
        self
    }

    pub fn with_legacy_interval(mut self, interval: Duration) -> Self {
        self.legacy_interval = interval;
        self
    }

    pub fn with_channels(mut self, transforms: impl Into<String>, sync: impl Into<String>) -> Self {
        self.channel_transforms = transforms.into();
        self.channel_sync = sync.into();
        self
    }

    pub(crate) fn channel_static(&self) -> String {
        crate::wire::kind_channel(&self.channel_transforms, &self.suffix_static)
    }

    pub(crate) fn channel_dynamic(&self) -> String {
        crate::wire::kind_channel(&self.channel_transforms, &self.suffix_dynamic)
    }
}

/// Resolve the authority a transform is attributed to on send: the
/// communicator's own name when the transform carries the uninitialized
/// sentinel or nothing at all, the transform's own authority otherwise.
pub(crate) fn effective_authority(own: &str, transform: &Transform) -> String {
    let authority = transform.authority();
    if authority == AUTHORITY_UNINITIALIZED || authority.is_empty() {
        own.to_string()
    } else {
        authority.to_string()
    }
}

/// Ordered listener collection. Insertion order is delivery order,
/// duplicates are allowed, removal matches by identity.
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn TransformListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn TransformListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn add_many(&self, listeners: Vec<Arc<dyn TransformListener>>) {
        self.listeners.lock().unwrap().extend(listeners);
    }

    pub fn remove(&self, listener: &Arc<dyn TransformListener>) {
        let mut guard = self.listeners.lock().unwrap();
        if let Some(pos) = guard.iter().position(|l| Arc::ptr_eq(l, listener)) {
            guard.remove(pos);
        }
    }

    pub fn clear(&self) {
        self.listeners.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan a transform out to every listener, in insertion order. The
    /// registry lock is released before the callbacks run.
    pub fn notify(&self, transform: &Transform, is_static: bool) {
        let snapshot: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            listener.new_transform_available(transform, is_static);
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
