//! Legacy republish demo
//!
//! A node-flavored communicator in legacy mode: a static edge is broadcast
//! on a fixed interval for old-style consumers, and re-sending the edge
//! swaps the repeating pose without ever running two tasks for the key.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use nalgebra::{Isometry3, Translation3, UnitQuaternion};

use framecast::bus::{BusEndpoint, MemoryBus};
use framecast::wire::{decode, TransformPayload};
use framecast::{CommConfig, NodeCommunicator, Transform, TransformCommunicator, TransformKind};

fn lidar_mount(height: f64) -> Transform {
    Transform::new(
        Isometry3::from_parts(
            Translation3::new(0.0, 0.0, height),
            UnitQuaternion::identity(),
        ),
        "base",
        "lidar",
        Utc::now(),
        TransformKind::Static,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let bus = MemoryBus::new();
    let observer = bus.endpoint("observer");
    let mut rx = observer.subscribe();

    let comm = NodeCommunicator::new(
        CommConfig::new("mount_calibration")
            .with_legacy_mode(true)
            .with_legacy_interval(Duration::from_millis(100)),
        bus.endpoint("mount_calibration"),
    );
    comm.init().await?;

    comm.send_transform(&lidar_mount(0.40)).await?;
    println!("[mount_calibration] broadcasting lidar mount at 0.40m");

    tokio::time::sleep(Duration::from_millis(350)).await;

    // recalibrated: the running task is replaced, not duplicated
    comm.send_transform(&lidar_mount(0.42)).await?;
    println!("[mount_calibration] recalibrated to 0.42m");

    tokio::time::sleep(Duration::from_millis(350)).await;
    comm.shutdown().await;

    let mut heights = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if msg.channel.ends_with("/dynamic") {
            if let Ok(payload) = decode::<TransformPayload>(&msg.payload) {
                for record in payload.records() {
                    heights.push(record.transform.translation.z);
                }
            }
        }
    }
    println!(
        "[observer] saw {} broadcasts, first {:?}, last {:?}",
        heights.len(),
        heights.first(),
        heights.last(),
    );
    Ok(())
}
