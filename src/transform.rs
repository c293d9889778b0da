//! Transform value type
//!
//! A [`Transform`] is one edge of the coordinate-frame graph: a rigid pose
//! from a parent frame to a child frame, stamped with a time and attributed
//! to an authority. Derived representations (translation, quaternion, Euler
//! angles, rotation matrix) are recomputed from the single internal pose on
//! every call; nothing is cached.

use std::fmt;

use chrono::{DateTime, Utc};
use nalgebra::{Isometry3, Matrix3, UnitQuaternion, Vector3};

/// Authority value of a transform that has not been attributed yet.
/// The communicator substitutes its own authority name when it encounters
/// this sentinel on the send path.
pub const AUTHORITY_UNINITIALIZED: &str = "uninitialized";

const FRAME_UNINITIALIZED: &str = "uninitialized";

/// Whether an edge is assumed constant over time or updated continuously.
///
/// `Unknown` holds integer codes outside the recognized range, as they can
/// appear when kinds are carried as raw integers by foreign producers. The
/// send path rejects such transforms; they never reach the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Static,
    Dynamic,
    Unknown(i32),
}

impl TransformKind {
    /// Map an integer-coded kind to the enum. Codes 0 and 1 are static and
    /// dynamic; anything else is preserved as `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TransformKind::Static,
            1 => TransformKind::Dynamic,
            other => TransformKind::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            TransformKind::Static => 0,
            TransformKind::Dynamic => 1,
            TransformKind::Unknown(code) => *code,
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, TransformKind::Static | TransformKind::Dynamic)
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformKind::Static => write!(f, "static"),
            TransformKind::Dynamic => write!(f, "dynamic"),
            TransformKind::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

/// One stamped, attributed edge of the transform graph.
///
/// Plain value semantics: cloning yields an independent transform, and
/// setters mutate only the local copy. Malformed poses are accepted as-is;
/// validation is a caller responsibility.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pose: Isometry3<f64>,
    frame_parent: String,
    frame_child: String,
    time: DateTime<Utc>,
    authority: String,
    kind: TransformKind,
}

impl Transform {
    pub fn new(
        pose: Isometry3<f64>,
        frame_parent: impl Into<String>,
        frame_child: impl Into<String>,
        time: DateTime<Utc>,
        kind: TransformKind,
    ) -> Self {
        Self {
            pose,
            frame_parent: frame_parent.into(),
            frame_child: frame_child.into(),
            time,
            authority: AUTHORITY_UNINITIALIZED.to_string(),
            kind,
        }
    }

    pub fn frame_parent(&self) -> &str {
        &self.frame_parent
    }

    pub fn set_frame_parent(&mut self, frame_parent: impl Into<String>) {
        self.frame_parent = frame_parent.into();
    }

    pub fn frame_child(&self) -> &str {
        &self.frame_child
    }

    pub fn set_frame_child(&mut self, frame_child: impl Into<String>) {
        self.frame_child = frame_child.into();
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn set_time(&mut self, time: DateTime<Utc>) {
        self.time = time;
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn set_authority(&mut self, authority: impl Into<String>) {
        self.authority = authority.into();
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: TransformKind) {
        self.kind = kind;
    }

    pub fn pose(&self) -> &Isometry3<f64> {
        &self.pose
    }

    pub fn set_pose(&mut self, pose: Isometry3<f64>) {
        self.pose = pose;
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.pose.translation.vector
    }

    pub fn rotation_quat(&self) -> UnitQuaternion<f64> {
        self.pose.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.pose.rotation.to_rotation_matrix().into_inner()
    }

    /// Euler angles as (yaw, pitch, roll).
    ///
    /// At gimbal lock (|pitch| = pi/2) yaw and pitch are corrected by pi so
    /// the output stays continuous instead of jumping through the
    /// degenerate solution.
    pub fn rotation_ypr(&self) -> Vector3<f64> {
        euler_ypr(&self.rotation_matrix())
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            pose: Isometry3::identity(),
            frame_parent: FRAME_UNINITIALIZED.to_string(),
            frame_child: FRAME_UNINITIALIZED.to_string(),
            time: DateTime::UNIX_EPOCH,
            authority: AUTHORITY_UNINITIALIZED.to_string(),
            kind: TransformKind::Dynamic,
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.translation();
        let q = self.rotation_quat();
        write!(
            f,
            "authority = {}, frame_parent = {}, frame_child = {}, time = {}, \
             translation = [{:.3}, {:.3}, {:.3}], rotation = [{:.3}, {:.3}, {:.3}, {:.3}], kind = {}",
            self.authority,
            self.frame_parent,
            self.frame_child,
            self.time,
            t.x,
            t.y,
            t.z,
            q.w,
            q.i,
            q.j,
            q.k,
            self.kind,
        )
    }
}

/// Yaw-pitch-roll extraction, after the bullet `btMatrix3x3` getEulerYPR.
fn euler_ypr(mat: &Matrix3<f64>) -> Vector3<f64> {
    let mut yaw = mat[(1, 0)].atan2(mat[(0, 0)]);
    let mut pitch = (-mat[(2, 0)]).asin();
    let roll = mat[(2, 1)].atan2(mat[(2, 2)]);

    // on pitch = +/- pi/2 the standard solution degenerates
    if pitch.abs() == std::f64::consts::FRAC_PI_2 {
        if yaw > 0.0 {
            yaw -= std::f64::consts::PI;
        } else {
            yaw += std::f64::consts::PI;
        }
        if pitch > 0.0 {
            pitch -= std::f64::consts::PI;
        } else {
            pitch += std::f64::consts::PI;
        }
    }

    Vector3::new(yaw, pitch, roll)
}
