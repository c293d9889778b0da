// framecast - Distributed Coordinate-Frame Transform Broadcasting

pub mod bus;
pub mod comm;
pub mod error;
pub mod publisher;
pub mod transform;
pub mod wire;

pub use comm::mesh::MeshCommunicator;
pub use comm::node::NodeCommunicator;
pub use comm::{CommConfig, TransformCommunicator, TransformListener};
pub use error::{CommError, GeometryError};
pub use publisher::TransformPublisher;
pub use transform::{Transform, TransformKind};
