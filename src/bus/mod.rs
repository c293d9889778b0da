//! Abstract pub/sub transport primitives
//!
//! The communicator layer assumes nothing beyond what these traits offer:
//! publish to a named channel with metadata tags, subscribe to everything,
//! and an origin identity on each delivery. At-most-once, unordered across
//! publishers, no acknowledgments. Wire adapters for concrete network
//! technologies live outside this crate; [`memory::MemoryBus`] is the
//! in-process reference medium.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use memory::MemoryBus;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("publish failed: {0}")]
    Publish(String),
}

/// A message as delivered by the bus.
///
/// `origin` identifies the publishing endpoint, `origin_node` the node name
/// that endpoint was attached under. Typical pub/sub media deliver a
/// publisher's own messages back to its own subscriptions; consumers filter
/// by origin.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub origin: Uuid,
    pub origin_node: String,
    pub metadata: HashMap<String, String>,
    pub payload: Vec<u8>,
}

/// One attached participant on a bus.
#[async_trait]
pub trait BusEndpoint: Send + Sync {
    /// Unique identity of this endpoint on the bus.
    fn id(&self) -> Uuid;

    /// Node name this endpoint was attached under.
    fn node_name(&self) -> &str;

    /// Publish a payload on a channel with metadata tags.
    async fn publish(
        &self,
        channel: &str,
        metadata: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Subscribe to all bus traffic. The medium does not filter; callers
    /// match on [`BusMessage::channel`] and drop their own echoes.
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

/// A transport medium endpoints can attach to.
pub trait Bus: Send + Sync {
    fn attach(&self, node_name: &str) -> Arc<dyn BusEndpoint>;
}
