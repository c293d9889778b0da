//! In-process bus
//!
//! A shared medium through which all endpoints in one process communicate.
//! One broadcast channel carries every message; subscribers see all traffic
//! including their own publishes, so the layer above must filter echoes.
//! Capacity is bounded: a slow subscriber lags and loses messages rather
//! than applying backpressure, matching the at-most-once transport model.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{Bus, BusEndpoint, BusError, BusMessage};

const DEFAULT_CAPACITY: usize = 256;

/// The in-process medium. Clone-free: share via `Arc`.
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    /// Attach a new endpoint under the given node name.
    pub fn endpoint(self: &Arc<Self>, node_name: &str) -> Arc<MemoryEndpoint> {
        Arc::new(MemoryEndpoint {
            id: Uuid::new_v4(),
            node_name: node_name.to_string(),
            bus: Arc::clone(self),
        })
    }
}

impl Bus for Arc<MemoryBus> {
    fn attach(&self, node_name: &str) -> Arc<dyn BusEndpoint> {
        self.endpoint(node_name)
    }
}

pub struct MemoryEndpoint {
    id: Uuid,
    node_name: String,
    bus: Arc<MemoryBus>,
}

#[async_trait]
impl BusEndpoint for MemoryEndpoint {
    fn id(&self) -> Uuid {
        self.id
    }

    fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn publish(
        &self,
        channel: &str,
        metadata: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        let msg = BusMessage {
            channel: channel.to_string(),
            origin: self.id,
            origin_node: self.node_name.clone(),
            metadata,
            payload,
        };
        // Publishing into silence is not an error: a send with no active
        // subscribers simply vanishes, like any broadcast medium.
        let _ = self.bus.tx.send(msg);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.bus.tx.subscribe()
    }
}
