//! Abstract wire schema for transform messages
//!
//! One record per edge: frame names, a microsecond stamp, and the rigid
//! transform split into translation and quaternion components. Batched
//! messages carry a sequence of records. The authority tag travels
//! out-of-band in bus message metadata, never inside the payload.
//!
//! Payloads are CBOR on the wire.

use chrono::{DateTime, Utc};
use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::CommError;
use crate::transform::{Transform, TransformKind};

/// Metadata key under which the authority travels.
pub const KEY_AUTHORITY: &str = "authority";

/// Build the kind-specific transform channel name.
pub fn kind_channel(base: &str, suffix: &str) -> String {
    format!("{}{}", base, suffix)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireVec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireQuat {
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WirePose {
    pub translation: WireVec3,
    pub rotation: WireQuat,
}

/// One transform on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    pub frame_parent: String,
    pub frame_child: String,
    /// Microseconds since the Unix epoch, in the sender's clock domain.
    pub time: i64,
    pub transform: WirePose,
}

impl TransformRecord {
    pub fn from_transform(t: &Transform) -> Self {
        let translation = t.translation();
        let q = t.rotation_quat();
        Self {
            frame_parent: t.frame_parent().to_string(),
            frame_child: t.frame_child().to_string(),
            time: t.time().timestamp_micros(),
            transform: WirePose {
                translation: WireVec3 {
                    x: translation.x,
                    y: translation.y,
                    z: translation.z,
                },
                rotation: WireQuat {
                    qw: q.w,
                    qx: q.i,
                    qy: q.j,
                    qz: q.k,
                },
            },
        }
    }

    /// Rebuild a [`Transform`] from this record. Kind and authority are not
    /// on the wire; the receiver derives them from the channel and the
    /// message metadata.
    pub fn into_transform(self, kind: TransformKind) -> Transform {
        let tr = self.transform.translation;
        let q = self.transform.rotation;
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(q.qw, q.qx, q.qy, q.qz));
        let pose = Isometry3::from_parts(Translation3::new(tr.x, tr.y, tr.z), rotation);
        let time = DateTime::<Utc>::from_timestamp_micros(self.time).unwrap_or(DateTime::UNIX_EPOCH);
        Transform::new(pose, self.frame_parent, self.frame_child, time, kind)
    }
}

/// A transform message payload: one record, or a batched sequence.
///
/// Untagged so single records and sequences stay distinguishable on the
/// wire (CBOR map vs. array) without an envelope byte; legacy consumers
/// only ever see the single-record form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformPayload {
    Batch(Vec<TransformRecord>),
    Single(TransformRecord),
}

impl TransformPayload {
    pub fn records(self) -> Vec<TransformRecord> {
        match self {
            TransformPayload::Batch(records) => records,
            TransformPayload::Single(record) => vec![record],
        }
    }
}

/// Serialize a value to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CommError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CommError::Encoding(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CommError> {
    ciborium::from_reader(data).map_err(|e| CommError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn sample_transform() -> Transform {
        let pose = Isometry3::from_parts(
            Translation3::new(0.25, -1.5, 3.0),
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
        );
        let mut t = Transform::new(
            pose,
            "base_link",
            "camera",
            DateTime::<Utc>::from_timestamp_micros(1_500_000_123_456).unwrap(),
            TransformKind::Dynamic,
        );
        t.set_authority("camera_driver");
        t
    }

    #[test]
    fn test_record_round_trip_within_tolerance() {
        let original = sample_transform();
        let record = TransformRecord::from_transform(&original);

        let bytes = encode(&record).unwrap();
        let decoded: TransformRecord = decode(&bytes).unwrap();
        let restored = decoded.into_transform(TransformKind::Dynamic);

        assert_eq!(restored.frame_parent(), original.frame_parent());
        assert_eq!(restored.frame_child(), original.frame_child());
        assert_eq!(restored.time(), original.time());

        let dt: Vector3<f64> = restored.translation() - original.translation();
        assert!(dt.norm() < 1e-12);
        let angle = restored
            .rotation_quat()
            .angle_to(&original.rotation_quat());
        assert!(angle < 1e-12);
    }

    #[test]
    fn test_payload_single_vs_batch_distinguishable() {
        let record = TransformRecord::from_transform(&sample_transform());

        let single = encode(&TransformPayload::Single(record.clone())).unwrap();
        let batch = encode(&TransformPayload::Batch(vec![record.clone(), record.clone()])).unwrap();

        let decoded_single: TransformPayload = decode(&single).unwrap();
        let decoded_batch: TransformPayload = decode(&batch).unwrap();

        assert_eq!(decoded_single.records().len(), 1);
        assert_eq!(decoded_batch.records().len(), 2);
    }

    #[test]
    fn test_record_is_json_readable() {
        // The schema should stay debuggable with ordinary tooling.
        let record = TransformRecord::from_transform(&sample_transform());
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"frame_parent\":\"base_link\""));
        assert!(json.contains("\"qw\""));

        let back: TransformRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_kind_channel_concatenation() {
        assert_eq!(kind_channel("/framecast/transform", "/static"), "/framecast/transform/static");
    }

    #[test]
    fn test_decode_garbage_is_encoding_error() {
        let result: Result<TransformPayload, _> = decode(&[0xFF, 0x00, 0x13]);
        assert!(matches!(result, Err(CommError::Encoding(_))));
    }
}
