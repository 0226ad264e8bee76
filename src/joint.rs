use bitflags::bitflags;
use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::body::RigidBody;
use crate::config::ArticulationConfig;
use crate::error::{PhysError, PhysResult};
use crate::geometry::Pose;
use crate::math::integrate_rotation;
use crate::spatial::{MotionSubspace, SpatialMatrix, SpatialVector};

bitflags! {
    /// Per-joint runtime state.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct JointFlags: u8 {
        const AT_LIMIT_X    = 1 << 0;
        const AT_LIMIT_Y    = 1 << 1;
        const AT_LIMIT_Z    = 1 << 2;
        /// Third axis frozen near gimbal lock.
        const GIMBAL_FROZEN = 1 << 3;
        /// Velocity was reset after diverging.
        const RESET         = 1 << 4;
    }
}

impl JointFlags {
    pub fn at_limit(axis: usize) -> JointFlags {
        JointFlags::from_bits_truncate(1 << axis)
    }
}

/// Tunables of one joint. Angles in radians, per Euler axis (XYZ order).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JointParams {
    /// Lower angle limits; an infinite bound leaves that side free.
    pub limit_min: Vec3,
    pub limit_max: Vec3,
    /// Spring toward `target`.
    pub stiffness: Vec3,
    pub damping: Vec3,
    pub target: Vec3,
    /// Extra damping applied within the dashpot window of a limit.
    pub dashpot: Vec3,
    /// Restitution when an axis hits its limit.
    pub bounciness: f32,
    /// Axes without a degree of freedom.
    pub locked: [bool; 3],
}

impl Default for JointParams {
    fn default() -> Self {
        Self {
            limit_min: Vec3::splat(f32::NEG_INFINITY),
            limit_max: Vec3::splat(f32::INFINITY),
            stiffness: Vec3::ZERO,
            damping: Vec3::ZERO,
            target: Vec3::ZERO,
            dashpot: Vec3::ZERO,
            bounciness: 0.0,
            locked: [false; 3],
        }
    }
}

impl JointParams {
    /// Single rotational degree of freedom about local axis `axis` (0..3).
    pub fn hinge(axis: usize) -> Self {
        let mut locked = [true; 3];
        if let Some(l) = locked.get_mut(axis) {
            *l = false;
        }
        Self { locked, ..Self::default() }
    }

    pub fn with_limits(mut self, min: Vec3, max: Vec3) -> Self {
        self.limit_min = min;
        self.limit_max = max;
        self
    }

    pub fn validate(&self) -> PhysResult<()> {
        for k in 0..3 {
            if self.limit_min[k] > self.limit_max[k] {
                let reason = format!("axis {k} min exceeds max");
                return Err(PhysError::invalid("joint.limit_min", reason));
            }
        }
        let finite = self.stiffness.is_finite()
            && self.damping.is_finite()
            && self.target.is_finite()
            && self.dashpot.is_finite()
            && self.bounciness.is_finite();
        if !finite {
            return Err(PhysError::NonFinite("joint params"));
        }
        if self.stiffness.min_element() < 0.0
            || self.damping.min_element() < 0.0
            || self.dashpot.min_element() < 0.0
        {
            return Err(PhysError::invalid("joint", "negative spring, damper or dashpot"));
        }
        Ok(())
    }
}

/// Descriptor of one joint of an articulated entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointDesc {
    /// Parent joint index; `None` for the root. Parents precede children.
    pub parent: Option<usize>,
    /// Pivot in the parent's joint frame (for the root: the entity frame, or
    /// the host's frame when grounded on a host).
    pub pivot: Vec3,
    /// Joint frame relative to the parent frame at zero angles.
    pub rest: Quat,
    pub angles: Vec3,
    #[serde(default)]
    pub params: JointParams,
}

impl JointDesc {
    pub fn new(parent: Option<usize>, pivot: Vec3) -> Self {
        Self {
            parent,
            pivot,
            rest: Quat::IDENTITY,
            angles: Vec3::ZERO,
            params: JointParams::default(),
        }
    }

    pub fn with_params(mut self, params: JointParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_angles(mut self, angles: Vec3) -> Self {
        self.angles = angles;
        self
    }
}

/// Rotation `Rx(a) * Ry(b) * Rz(c)`.
pub fn quat_from_euler(angles: Vec3) -> Quat {
    let q = Quat::from_rotation_x(angles.x)
        * Quat::from_rotation_y(angles.y)
        * Quat::from_rotation_z(angles.z);
    q.normalize()
}

/// Inverse of [`quat_from_euler`].
pub fn euler_from_quat(q: Quat) -> Vec3 {
    let m = Mat3::from_quat(q);
    // m.col(c)[r] is the element at row r, column c
    let r02 = m.z_axis.x.clamp(-1.0, 1.0);
    let b = r02.asin();
    let a = (-m.z_axis.y).atan2(m.z_axis.z);
    let c = (-m.y_axis.x).atan2(m.x_axis.x);
    Vec3::new(a, b, c)
}

/// Euler rate axes in the joint frame for the given angles.
pub fn local_axes(angles: Vec3) -> [Vec3; 3] {
    let qx = Quat::from_rotation_x(angles.x);
    let qy = Quat::from_rotation_y(angles.y);
    [Vec3::X, qx * Vec3::Y, qx * qy * Vec3::Z]
}

/// Solver workspace of one joint, rebuilt every tick.
#[derive(Clone, Debug, Default)]
pub(crate) struct JointScratch {
    /// World axes of the three Euler rates.
    pub axes: [Vec3; 3],
    pub s: MotionSubspace,
    /// Spatial velocity of the joint body.
    pub v: SpatialVector,
    /// Velocity-product acceleration.
    pub c: SpatialVector,
    pub inertia: SpatialMatrix,
    pub ia: SpatialMatrix,
    pub pa: SpatialVector,
    pub u_mat: MotionSubspace,
    pub d_inv: nalgebra::Matrix3<f64>,
    pub u: nalgebra::Vector3<f64>,
    /// External spatial force (pending impulses spread over the step).
    pub ext: SpatialVector,
    /// Joint-space torques from springs, dampers and dashpots.
    pub tau: nalgebra::Vector3<f64>,
    pub active: [bool; 3],
}

/// One joint plus the body it moves.
#[derive(Clone, Debug)]
pub struct Joint {
    pub parent: Option<usize>,
    pub pivot: Vec3,
    pub rest: Quat,
    pub params: JointParams,
    /// Rotation of the joint frame relative to `parent frame * rest`.
    pub q_rel: Quat,
    /// Euler angles re-derived from `q_rel` every tick.
    pub angles: Vec3,
    /// Euler angle rates.
    pub q_dot: Vec3,
    pub flags: JointFlags,
    pub n_children: usize,
    /// Number of descendants in the subtree.
    pub n_children_tree: usize,
    pub body: RigidBody,
    pub com_local: Vec3,
    pub principal: Quat,
    /// World pose of the joint frame (origin at the pivot).
    pub frame: Pose,
    /// Requested joint rates, held until replaced.
    pub drive: Option<Vec3>,
    pub(crate) scratch: JointScratch,
}

impl Joint {
    pub fn from_desc(desc: &JointDesc) -> Self {
        Self {
            parent: desc.parent,
            pivot: desc.pivot,
            rest: desc.rest.normalize(),
            params: desc.params.clone(),
            q_rel: quat_from_euler(desc.angles),
            angles: desc.angles,
            q_dot: Vec3::ZERO,
            flags: JointFlags::empty(),
            n_children: 0,
            n_children_tree: 0,
            body: RigidBody::default(),
            com_local: Vec3::ZERO,
            principal: Quat::IDENTITY,
            frame: Pose::IDENTITY,
            drive: None,
            scratch: JointScratch::default(),
        }
    }

    /// Whether axis `k` carries a degree of freedom this tick.
    pub fn axis_active(&self, k: usize) -> bool {
        !self.params.locked[k] && !(k == 2 && self.flags.contains(JointFlags::GIMBAL_FROZEN))
    }

    pub fn is_limited(&self, k: usize) -> bool {
        self.params.limit_min[k].is_finite() || self.params.limit_max[k].is_finite()
    }

    /// Place the joint frame and body given the parent frame.
    pub fn place(&mut self, parent_frame: &Pose) {
        let rotation = (parent_frame.rotation * self.rest * self.q_rel).normalize();
        self.frame = Pose { position: parent_frame.transform_point(self.pivot), rotation };
        self.body.set_pose(self.frame.transform_point(self.com_local), rotation * self.principal);
    }

    /// World Euler-rate axes given the parent frame rotation.
    pub fn world_axes(&self, parent_rotation: Quat) -> [Vec3; 3] {
        let base = parent_rotation * self.rest;
        local_axes(self.angles).map(|a| base * a)
    }

    /// Spring, damper and dashpot torque on axis `k`.
    pub fn passive_torque(&self, k: usize, cfg: &ArticulationConfig) -> f32 {
        let p = &self.params;
        let spring = p.stiffness[k] * (self.angles[k] - p.target[k]);
        let mut tau = -(spring + p.damping[k] * self.q_dot[k]);
        if p.dashpot[k] > 0.0 && self.is_limited(k) {
            let near_min = self.angles[k] - p.limit_min[k] < cfg.dashpot_window;
            let near_max = p.limit_max[k] - self.angles[k] < cfg.dashpot_window;
            if near_min || near_max {
                tau -= p.dashpot[k] * self.q_dot[k];
            }
        }
        tau
    }

    /// Freeze the third axis when it lines up with the first, moving its rate
    /// onto the first axis. Returns true when the state changed.
    pub fn update_gimbal(&mut self, cfg: &ArticulationConfig) -> bool {
        let axes = local_axes(self.angles);
        let d = axes[0].dot(axes[2]);
        let frozen = self.flags.contains(JointFlags::GIMBAL_FROZEN);
        if !frozen && d.abs() > cfg.gimbal_freeze {
            self.q_dot.x += self.q_dot.z * d.signum();
            self.q_dot.z = 0.0;
            self.flags.insert(JointFlags::GIMBAL_FROZEN);
            return true;
        }
        if frozen && d.abs() < cfg.gimbal_release {
            self.flags.remove(JointFlags::GIMBAL_FROZEN);
            return true;
        }
        false
    }

    /// Advance `q_rel` by the current rates and re-derive the angles.
    pub fn integrate(&mut self, h: f32) {
        let axes = local_axes(self.angles);
        let w = axes[0] * self.q_dot.x + axes[1] * self.q_dot.y + axes[2] * self.q_dot.z;
        self.q_rel = integrate_rotation(self.q_rel, w, h);
        self.angles = euler_from_quat(self.q_rel);
    }

    /// Clamp angles into their limits. Returns, per axis, the rate change that
    /// stops (or bounces) motion into a limit that was reached.
    pub fn enforce_limits(&mut self) -> [f32; 3] {
        let mut dv = [0.0; 3];
        let mut clamped = false;
        for k in 0..3 {
            let flag = JointFlags::at_limit(k);
            if !self.axis_active(k) || !self.is_limited(k) {
                self.flags.remove(flag);
                continue;
            }
            let (lo, hi) = (self.params.limit_min[k], self.params.limit_max[k]);
            let a = self.angles[k];
            if a <= lo || a >= hi {
                let bound = if a <= lo { lo } else { hi };
                let into = if a <= lo { self.q_dot[k] < 0.0 } else { self.q_dot[k] > 0.0 };
                self.angles[k] = bound;
                clamped = true;
                self.flags.insert(flag);
                if into {
                    dv[k] = -(1.0 + self.params.bounciness) * self.q_dot[k];
                }
            } else {
                self.flags.remove(flag);
            }
        }
        if clamped {
            self.q_rel = quat_from_euler(self.angles);
        }
        dv
    }

    pub fn within_limits(&self, tolerance: f32) -> bool {
        (0..3).all(|k| {
            !self.axis_active(k)
                || (self.angles[k] >= self.params.limit_min[k] - tolerance
                    && self.angles[k] <= self.params.limit_max[k] + tolerance)
        })
    }

    /// Zero the rates and mark the joint as reset.
    pub fn reset_rates(&mut self) {
        self.q_dot = Vec3::ZERO;
        self.flags.insert(JointFlags::RESET);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euler_round_trip() {
        let angles = Vec3::new(0.3, -0.7, 1.2);
        let back = euler_from_quat(quat_from_euler(angles));
        assert!((back - angles).length() < 1e-5, "{back:?}");
    }

    #[test]
    fn test_local_axes_match_finite_difference() {
        let angles = Vec3::new(0.4, 0.2, -0.3);
        let rates = Vec3::new(0.5, -1.0, 2.0);
        let h = 1e-3;
        let q0 = quat_from_euler(angles);
        let q1 = quat_from_euler(angles + rates * h);
        let axes = local_axes(angles);
        let w = axes[0] * rates.x + axes[1] * rates.y + axes[2] * rates.z;
        let predicted = integrate_rotation(q0, w, h);
        assert!(predicted.dot(q1).abs() > 1.0 - 1e-6);
    }

    #[test]
    fn test_limits_clamp_and_bounce() {
        let params = JointParams { bounciness: 0.5, ..JointParams::hinge(1) }
            .with_limits(Vec3::splat(-0.5), Vec3::splat(0.5));
        let desc = JointDesc::new(None, Vec3::ZERO).with_params(params);
        let mut j = Joint::from_desc(&desc);
        j.angles.y = 0.6;
        j.q_dot.y = 2.0;
        let dv = j.enforce_limits();
        assert_eq!(j.angles.y, 0.5);
        assert!(j.flags.contains(JointFlags::AT_LIMIT_Y));
        assert!((dv[1] + 3.0).abs() < 1e-6);
        assert!(j.within_limits(0.0));
        // moving away from the limit: no impulse
        j.q_dot.y = -1.0;
        assert_eq!(j.enforce_limits()[1], 0.0);
    }

    #[test]
    fn test_gimbal_freeze_and_release() {
        let cfg = ArticulationConfig::default();
        let mut j = Joint::from_desc(&JointDesc::new(None, Vec3::ZERO));
        j.angles = Vec3::new(0.0, 1.5, 0.0);
        j.q_dot = Vec3::new(1.0, 0.0, 2.0);
        assert!(j.update_gimbal(&cfg));
        assert!(j.flags.contains(JointFlags::GIMBAL_FROZEN));
        assert_eq!(j.q_dot.z, 0.0);
        assert!((j.q_dot.x - 3.0).abs() < 1e-6);
        assert!(!j.axis_active(2));
        j.angles.y = 0.2;
        assert!(j.update_gimbal(&cfg));
        assert!(j.axis_active(2));
    }

    #[test]
    fn test_passive_torque() {
        let cfg = ArticulationConfig::default();
        let mut j = Joint::from_desc(&JointDesc::new(None, Vec3::ZERO).with_params(JointParams {
            stiffness: Vec3::splat(10.0),
            damping: Vec3::splat(1.0),
            ..JointParams::default()
        }));
        j.angles.x = 0.1;
        j.q_dot.x = 0.5;
        assert!((j.passive_torque(0, &cfg) + 1.5).abs() < 1e-6);
    }
}
