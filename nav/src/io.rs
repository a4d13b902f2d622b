//! Seams to the hardware and middleware the core does not own: pose feedback,
//! localization health, the protector bus, the rotate service and the Bézier
//! curve generator. The supervisor and the planner worker share these handles.

use crate::status::Twist;
use gridnav_lattice::Pose;
use std::sync::Arc;

pub trait PoseSource: Send + Sync {
    /// Latest robot pose in the global frame, `None` while the transform is
    /// unavailable.
    fn current_pose(&self) -> Option<Pose>;
    fn current_velocity(&self) -> Twist;
}

pub trait LocalizationSource: Send + Sync {
    fn valid(&self) -> bool;
}

/// Hardware bumper / safety-bar bitmask.
pub trait ProtectorBus: Send + Sync {
    fn status(&self) -> u32;
}

/// In-place rotation performed by a hardware service rather than the local
/// controller (used during localization recovery).
pub trait RotateService: Send + Sync {
    /// Requests a rotation to the target yaw; false when the hardware refuses.
    fn start(&self, target_yaw: f64) -> bool;
    fn is_done(&self) -> bool;
    fn stop(&self);
}

/// External curve generator for short-range goals.
pub trait BezierSource: Send + Sync {
    fn curve(&self, start: &Pose, goal: &Pose) -> Option<Vec<Pose>>;
}

/// The full set of external handles, cloneable so the supervisor and the
/// worker thread can each hold one.
#[derive(Clone)]
pub struct NavIo {
    pub pose: Arc<dyn PoseSource>,
    pub localization: Arc<dyn LocalizationSource>,
    pub protector: Arc<dyn ProtectorBus>,
    pub rotate: Arc<dyn RotateService>,
    pub bezier: Arc<dyn BezierSource>,
}

/// Localization that is always healthy.
pub struct AlwaysLocalized;

impl LocalizationSource for AlwaysLocalized {
    fn valid(&self) -> bool {
        true
    }
}

/// A protector bus with no sensors attached.
pub struct QuietProtector;

impl ProtectorBus for QuietProtector {
    fn status(&self) -> u32 {
        0
    }
}

/// Rotate hardware that declines every request, forcing software recovery.
pub struct NoRotateHardware;

impl RotateService for NoRotateHardware {
    fn start(&self, _target_yaw: f64) -> bool {
        false
    }

    fn is_done(&self) -> bool {
        true
    }

    fn stop(&self) {}
}

/// A curve source that always declines, pushing short goals to the lattice.
pub struct NoBezier;

impl BezierSource for NoBezier {
    fn curve(&self, _start: &Pose, _goal: &Pose) -> Option<Vec<Pose>> {
        None
    }
}
