//! Late-joiner convergence demo
//!
//! Node A publishes a small robot scene, then node B starts afterwards and
//! converges to the full transform graph through the sync flood. Run with
//! RUST_LOG=debug to watch the protocol.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use framecast::bus::MemoryBus;
use framecast::{
    CommConfig, MeshCommunicator, Transform, TransformCommunicator, TransformKind,
    TransformListener,
};

struct PrintingListener {
    name: &'static str,
    edges: Mutex<Vec<String>>,
}

impl TransformListener for PrintingListener {
    fn new_transform_available(&self, transform: &Transform, is_static: bool) {
        let label = format!(
            "{} -> {} ({}, authority {})",
            transform.frame_parent(),
            transform.frame_child(),
            if is_static { "static" } else { "dynamic" },
            transform.authority(),
        );
        println!("[{}] observed {}", self.name, label);
        self.edges.lock().unwrap().push(label);
    }
}

fn pose(x: f64, y: f64, z: f64, yaw: f64) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw),
    )
}

fn edge(parent: &str, child: &str, pose: Isometry3<f64>, kind: TransformKind) -> Transform {
    Transform::new(pose, parent, child, Utc::now(), kind)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let bus = MemoryBus::new();

    let comm_a = MeshCommunicator::new(CommConfig::new("scene_publisher"), bus.endpoint("scene_publisher"));
    comm_a.init().await?;

    comm_a
        .send_transforms(&[
            edge("map", "odom", pose(0.0, 0.0, 0.0, 0.0), TransformKind::Static),
            edge("odom", "base", pose(2.5, 1.0, 0.0, 0.7), TransformKind::Dynamic),
            edge("base", "lidar", pose(0.1, 0.0, 0.4, 0.0), TransformKind::Static),
            edge("base", "camera", pose(0.2, 0.0, 0.3, 0.0), TransformKind::Static),
        ])
        .await?;
    println!("[scene_publisher] scene published, cache primed");

    // B starts later; nothing it missed is ever re-sent naturally, so its
    // init trigger asks peers to flood their caches.
    let listener = Arc::new(PrintingListener {
        name: "late_viewer",
        edges: Mutex::new(Vec::new()),
    });
    let comm_b =
        MeshCommunicator::new(CommConfig::new("late_viewer"), bus.endpoint("late_viewer"))
            .with_listener(listener.clone());
    comm_b.init().await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let observed = listener.edges.lock().unwrap().len();
    println!("[late_viewer] converged on {} edges", observed);

    comm_a.shutdown().await;
    comm_b.shutdown().await;
    Ok(())
}
