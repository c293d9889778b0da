//! Application-facing publisher facade
//!
//! Wraps a communicator behind the narrow surface producer code needs:
//! send one or many transforms, ask for the authority name, shut down.
//! Which backend flavor sits underneath is chosen at construction.

use std::fmt;
use std::sync::Arc;

use crate::comm::{CommConfig, TransformCommunicator};
use crate::error::CommError;
use crate::transform::Transform;

pub struct TransformPublisher {
    comm: Arc<dyn TransformCommunicator>,
    config: CommConfig,
}

impl TransformPublisher {
    pub fn new(comm: Arc<dyn TransformCommunicator>, config: CommConfig) -> Self {
        Self { comm, config }
    }

    /// Hand one transform to the distribution layer.
    /// Returns true unless the transform was rejected.
    pub async fn send_transform(&self, transform: &Transform) -> Result<bool, CommError> {
        self.comm.send_transform(transform).await
    }

    /// Hand a sequence of transforms to the distribution layer.
    pub async fn send_transforms(&self, transforms: &[Transform]) -> Result<bool, CommError> {
        self.comm.send_transforms(transforms).await
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn authority_name(&self) -> String {
        self.comm.authority_name()
    }

    pub async fn shutdown(&self) {
        self.comm.shutdown().await;
    }
}

impl fmt::Display for TransformPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "publisher = {{ authority = {}, legacy = {} }}",
            self.config.authority, self.config.legacy_mode,
        )
    }
}
