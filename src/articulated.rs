//! Joint-space dynamics of one articulated entity.
//!
//! The joint array is parent-ordered, so every pass is a forward or backward
//! sweep over indices. A tick runs:
//!
//! 1. `prepare`: spatial inertias, motion subspaces and body velocities about
//!    a reference point fixed for the solve (the root frame origin).
//! 2. `factorize`: articulated inertias and bias forces, leaves to root.
//! 3. `accelerations`: root solve, then joint accelerations root to leaves.
//! 4. `step_position`: integrate joint rotations, enforce limits, place bodies.
//!
//! Gravity never enters the bias forces. A world-grounded tree gets it as a
//! fictitious base acceleration; free trees and trees on a movable host fall
//! with their base, which receives gravity directly.

use glam::{Quat, Vec3};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::body::RigidBody;
use crate::config::ArticulationConfig;
use crate::error::{PhysError, PhysResult};
use crate::geometry::{mass_properties, Part, Pose};
use crate::joint::{Joint, JointDesc, JointFlags, JointParams};
use crate::rigid::SleepState;
use crate::spatial::{
    body_inertia, com_from_motion, cross_force, cross_motion, impulse_at, mat3_to_na,
    motion_from_com, point_velocity, revolute, spatial, to_glam, to_na, SpatialMatrix,
    SpatialVector,
};
use crate::types::EntityId;

/// How the root joint is anchored.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootMode {
    /// Root body moves freely in six degrees of freedom.
    Free,
    /// Root pivot is fixed in the world.
    Fixed,
    /// Root pivot rides on another entity.
    Host { host: EntityId },
}

/// Base of the tree for the current solve.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Base {
    World,
    /// Joint 0's own body (free root).
    Own,
    /// A movable host body.
    Body,
}

/// Velocity changes produced by a set of impulses.
struct ImpulseResponse {
    dq: Vec<Vector3<f64>>,
    dv: Vec<SpatialVector>,
    dbase: SpatialVector,
}

#[derive(Clone, Debug)]
pub struct ArticulatedCore {
    pub joints: Vec<Joint>,
    pub mode: RootMode,
    /// Frame the root pivot is expressed in (entity placement or host frame).
    pub placement: Pose,
    pub sleep: SleepState,
    pub damping: f32,
    origin: Vec3,
    base: Base,
    base_ia: SpatialMatrix,
    base_pa: SpatialVector,
    base_ia_inv: Option<SpatialMatrix>,
    host_inertia: SpatialMatrix,
    host_v: SpatialVector,
    host_dv: SpatialVector,
    pending: Vec<(usize, Vec3, Vec3)>,
    saved: Option<Vec<(Quat, Vec3, Vec3, RigidBody)>>,
    saved_pending: Vec<(usize, Vec3, Vec3)>,
    warned_singular: bool,
}

impl ArticulatedCore {
    pub fn new(
        entity: EntityId,
        descs: &[JointDesc],
        parts: &[Part],
        placement: Pose,
        mode: RootMode,
        velocity: Vec3,
        angular_velocity: Vec3,
    ) -> PhysResult<Self> {
        if descs.is_empty() {
            return Err(PhysError::invalid("joints", "articulated entity needs at least one joint"));
        }
        for (i, d) in descs.iter().enumerate() {
            let ordered = match d.parent {
                None => i == 0,
                Some(p) => p < i,
            };
            if !ordered {
                return Err(PhysError::InvalidJoint { entity, index: i });
            }
            d.params.validate()?;
            if !d.pivot.is_finite() || !d.rest.is_finite() || !d.angles.is_finite() {
                return Err(PhysError::NonFinite("joint descriptor"));
            }
        }
        for (i, p) in parts.iter().enumerate() {
            if p.joint.is_some_and(|j| j >= descs.len()) {
                return Err(PhysError::InvalidPart { entity, index: i });
            }
        }
        let mut joints: Vec<Joint> = descs.iter().map(Joint::from_desc).collect();
        for (i, joint) in joints.iter_mut().enumerate() {
            let own = parts.iter().filter(|p| p.joint.unwrap_or(0) == i);
            let mp = mass_properties(own);
            if mp.mass <= 0.0 {
                return Err(PhysError::InvalidJoint { entity, index: i });
            }
            joint.com_local = mp.com;
            joint.principal = mp.principal;
            joint.body = RigidBody::new(mp.mass, mp.inertia, Vec3::ZERO, Quat::IDENTITY);
        }
        for i in (1..joints.len()).rev() {
            if let Some(p) = joints[i].parent {
                let tree = joints[i].n_children_tree;
                joints[p].n_children += 1;
                joints[p].n_children_tree += 1 + tree;
            }
        }
        let mut core = Self {
            joints,
            mode,
            placement,
            sleep: SleepState::default(),
            damping: 0.0,
            origin: placement.position,
            base: Base::World,
            base_ia: SpatialMatrix::zeros(),
            base_pa: SpatialVector::zeros(),
            base_ia_inv: None,
            host_inertia: SpatialMatrix::zeros(),
            host_v: SpatialVector::zeros(),
            host_dv: SpatialVector::zeros(),
            pending: Vec::new(),
            saved: None,
            saved_pending: Vec::new(),
            warned_singular: false,
        };
        if mode == RootMode::Free {
            let root = &mut core.joints[0];
            root.frame = placement;
            let com = placement.transform_point(root.com_local);
            root.body.set_pose(com, placement.rotation * root.principal);
            root.body.set_velocity(velocity, angular_velocity);
        }
        core.refresh(None, None);
        Ok(core)
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn host(&self) -> Option<EntityId> {
        match self.mode {
            RootMode::Host { host } => Some(host),
            _ => None,
        }
    }

    pub fn root_frame(&self) -> Pose {
        self.joints[0].frame
    }

    /// World pose of a part attached to one of the joints.
    pub fn part_pose(&self, part: &Part) -> Pose {
        let j = part.joint.unwrap_or(0).min(self.joints.len() - 1);
        self.joints[j].frame.compose(&part.local)
    }

    pub fn total_mass(&self) -> f32 {
        self.joints.iter().map(|j| j.body.mass()).sum()
    }

    pub fn kinetic_energy(&self) -> f32 {
        self.joints.iter().map(|j| j.body.kinetic_energy()).sum()
    }

    pub fn energy_per_mass(&self) -> f32 {
        let m = self.total_mass();
        if m > 0.0 { self.kinetic_energy() / m } else { 0.0 }
    }

    fn parent_frame(&self, i: usize) -> Pose {
        match self.joints[i].parent {
            Some(p) => self.joints[p].frame,
            None => self.placement,
        }
    }

    /// Place every joint frame and body, root to leaves.
    pub fn forward_kinematics(&mut self, host_frame: Option<Pose>) {
        if let Some(f) = host_frame {
            self.placement = f;
        }
        for i in 0..self.joints.len() {
            if i == 0 && self.mode == RootMode::Free {
                let root = &mut self.joints[0];
                let rotation = (root.body.orientation * root.principal.inverse()).normalize();
                let position = root.body.position - rotation * root.com_local;
                root.frame = Pose { position, rotation };
                continue;
            }
            let parent = self.parent_frame(i);
            self.joints[i].place(&parent);
        }
    }

    /// Rebuild inertias, subspaces and velocities about the root origin.
    fn prepare(&mut self, host: Option<&RigidBody>) {
        self.origin = self.joints[0].frame.position;
        let o = self.origin;
        self.base = match (self.mode, host) {
            (RootMode::Free, _) => Base::Own,
            (RootMode::Host { .. }, Some(h)) if !h.is_immovable() => Base::Body,
            _ => Base::World,
        };
        if let (Base::Body, Some(h)) = (self.base, host) {
            let c = to_na(h.position - o);
            self.host_inertia = body_inertia(h.mass() as f64, c, &mat3_to_na(&h.inertia_world()));
            self.host_v = motion_from_com(h.linear_velocity(), h.angular_velocity(), c);
        } else {
            self.host_inertia = SpatialMatrix::zeros();
            self.host_v = SpatialVector::zeros();
        }
        for i in 0..self.joints.len() {
            let parent_rotation = self.parent_frame(i).rotation;
            let free_root = i == 0 && self.mode == RootMode::Free;
            let j = &mut self.joints[i];
            let c = to_na(j.body.position - o);
            let inertia = mat3_to_na(&j.body.inertia_world());
            j.scratch.inertia = body_inertia(j.body.mass() as f64, c, &inertia);
            if free_root {
                j.scratch.s = Default::default();
                j.scratch.active = [false; 3];
                continue;
            }
            let axes = j.world_axes(parent_rotation);
            let r = to_na(j.frame.position - o);
            for (k, axis) in axes.iter().enumerate() {
                let active = j.axis_active(k);
                j.scratch.active[k] = active;
                let col = if active { revolute(to_na(*axis), r) } else { SpatialVector::zeros() };
                j.scratch.s.set_column(k, &col);
            }
            j.scratch.axes = axes;
        }
        self.update_velocities();
    }

    /// Spatial body velocities from the base motion and joint rates.
    fn update_velocities(&mut self) {
        let o = self.origin;
        for i in 0..self.joints.len() {
            if i == 0 && self.mode == RootMode::Free {
                let root = &mut self.joints[0];
                let c = to_na(root.body.position - o);
                let (v, w) = (root.body.linear_velocity(), root.body.angular_velocity());
                root.scratch.v = motion_from_com(v, w, c);
                root.scratch.c = SpatialVector::zeros();
                continue;
            }
            let parent_v = match self.joints[i].parent {
                Some(p) => self.joints[p].scratch.v,
                None => self.host_v,
            };
            let j = &mut self.joints[i];
            let sq = j.scratch.s * to_na(j.q_dot);
            j.scratch.v = parent_v + sq;
            j.scratch.c = cross_motion(&j.scratch.v, &sq);
            let (v, w) = com_from_motion(&j.scratch.v, to_na(j.body.position - o));
            j.body.set_velocity(v, w);
        }
    }

    /// Articulated inertias and bias forces, leaves to root.
    fn factorize(&mut self, h: f32, gravity: Vec3, cfg: &ArticulationConfig) {
        let o = self.origin;
        let inv_h = if h > 0.0 { 1.0 / h as f64 } else { 0.0 };
        let mut ext = vec![SpatialVector::zeros(); self.joints.len()];
        for &(j, imp, at) in &self.pending {
            ext[j] += impulse_at(to_na(imp), to_na(at - o)) * inv_h;
        }
        // a movable host carries the weight of the tree
        if self.base == Base::Body {
            for (e, j) in ext.iter_mut().zip(&self.joints) {
                *e += impulse_at(to_na(gravity * j.body.mass()), to_na(j.body.position - o));
            }
        }
        let damping = self.damping as f64;
        for (i, j) in self.joints.iter_mut().enumerate() {
            let v = j.scratch.v;
            let iv = j.scratch.inertia * v;
            j.scratch.ext = ext[i] - iv * damping;
            j.scratch.ia = j.scratch.inertia;
            j.scratch.pa = cross_force(&v, &iv) - j.scratch.ext;
            for k in 0..3 {
                j.scratch.tau[k] =
                    if j.scratch.active[k] { j.passive_torque(k, cfg) as f64 } else { 0.0 };
            }
        }
        self.base_ia = self.host_inertia;
        self.base_pa = cross_force(&self.host_v, &(self.host_inertia * self.host_v));
        for i in (0..self.joints.len()).rev() {
            if i == 0 && self.base == Base::Own {
                break;
            }
            let j = &mut self.joints[i];
            let s = j.scratch.s;
            let u_mat = j.scratch.ia * s;
            let mut d = s.transpose() * u_mat;
            for k in 0..3 {
                if !j.scratch.active[k] {
                    d[(k, k)] = 1.0;
                }
            }
            let d_inv = d.try_inverse().unwrap_or_else(Matrix3::zeros);
            let u = j.scratch.tau - s.transpose() * j.scratch.pa;
            let ia = j.scratch.ia - u_mat * d_inv * u_mat.transpose();
            let pa = j.scratch.pa + ia * j.scratch.c + u_mat * (d_inv * u);
            j.scratch.u_mat = u_mat;
            j.scratch.d_inv = d_inv;
            j.scratch.u = u;
            let parent = j.parent;
            match parent {
                Some(p) => {
                    self.joints[p].scratch.ia += ia;
                    self.joints[p].scratch.pa += pa;
                }
                None => {
                    self.base_ia += ia;
                    self.base_pa += pa;
                }
            }
        }
        let base_ia = match self.base {
            Base::World => None,
            Base::Own => Some(self.joints[0].scratch.ia),
            Base::Body => Some(self.base_ia),
        };
        self.base_ia_inv = base_ia.and_then(|m| m.try_inverse());
        if base_ia.is_some() && self.base_ia_inv.is_none() && !self.warned_singular {
            warn!("singular articulated root inertia; root held for this tick");
            self.warned_singular = true;
        }
    }

    fn base_bias(&self) -> SpatialVector {
        match self.base {
            Base::Own => self.joints[0].scratch.pa,
            _ => self.base_pa,
        }
    }

    /// Base and joint accelerations, root to leaves.
    fn accelerations(&self, gravity: Vec3) -> (Vec<Vector3<f64>>, SpatialVector) {
        let n = self.joints.len();
        let a_base = match (self.base, self.base_ia_inv) {
            (Base::World, _) => spatial(Vector3::zeros(), -to_na(gravity)),
            (_, Some(inv)) => -(inv * self.base_bias()),
            (_, None) => SpatialVector::zeros(),
        };
        let mut qdd = vec![Vector3::zeros(); n];
        let mut acc = vec![SpatialVector::zeros(); n];
        for i in 0..n {
            if i == 0 && self.base == Base::Own {
                acc[0] = a_base;
                continue;
            }
            let j = &self.joints[i];
            let ap = match j.parent {
                Some(p) => acc[p],
                None => a_base,
            } + j.scratch.c;
            let mut q = j.scratch.d_inv * (j.scratch.u - j.scratch.u_mat.transpose() * ap);
            for k in 0..3 {
                if !j.scratch.active[k] {
                    q[k] = 0.0;
                }
            }
            qdd[i] = q;
            acc[i] = ap + j.scratch.s * q;
        }
        (qdd, a_base)
    }

    /// Velocity changes for spatial impulses on bodies plus joint-space impulses.
    fn solve_impulses(
        &self,
        body_imp: &[(usize, SpatialVector)],
        joint_imp: &[(usize, Vector3<f64>)],
    ) -> ImpulseResponse {
        let n = self.joints.len();
        let mut p = vec![SpatialVector::zeros(); n];
        let mut tau = vec![Vector3::zeros(); n];
        for &(j, imp) in body_imp {
            p[j] -= imp;
        }
        for &(j, t) in joint_imp {
            tau[j] += t;
        }
        let mut u = vec![Vector3::zeros(); n];
        let mut base_p = SpatialVector::zeros();
        for i in (0..n).rev() {
            if i == 0 && self.base == Base::Own {
                break;
            }
            let s = &self.joints[i].scratch;
            u[i] = tau[i] - s.s.transpose() * p[i];
            let pa = p[i] + s.u_mat * (s.d_inv * u[i]);
            match self.joints[i].parent {
                Some(parent) => p[parent] += pa,
                None => base_p += pa,
            }
        }
        let dbase = match (self.base, self.base_ia_inv) {
            (Base::Own, Some(inv)) => -(inv * p[0]),
            (Base::Body, Some(inv)) => -(inv * base_p),
            _ => SpatialVector::zeros(),
        };
        let mut dq = vec![Vector3::zeros(); n];
        let mut dv = vec![SpatialVector::zeros(); n];
        for i in 0..n {
            if i == 0 && self.base == Base::Own {
                dv[0] = dbase;
                continue;
            }
            let j = &self.joints[i];
            let ap = match j.parent {
                Some(parent) => dv[parent],
                None => dbase,
            };
            let mut q = j.scratch.d_inv * (u[i] - j.scratch.u_mat.transpose() * ap);
            for k in 0..3 {
                if !j.scratch.active[k] {
                    q[k] = 0.0;
                }
            }
            dq[i] = q;
            dv[i] = ap + j.scratch.s * q;
        }
        ImpulseResponse { dq, dv, dbase }
    }

    fn apply_response(&mut self, r: &ImpulseResponse) {
        for (j, dq) in self.joints.iter_mut().zip(&r.dq) {
            j.q_dot += to_glam(dq);
        }
        match self.base {
            Base::Own => {
                let o = self.origin;
                let root = &mut self.joints[0];
                let c = to_na(root.body.position - o);
                let v = root.scratch.v + r.dbase;
                let (lin, ang) = com_from_motion(&v, c);
                root.body.set_velocity(lin, ang);
            }
            Base::Body => {
                self.host_v += r.dbase;
                self.host_dv += r.dbase;
            }
            Base::World => {}
        }
        self.update_velocities();
    }

    /// Queue an impulse for the next velocity solve.
    pub fn add_impulse(&mut self, joint: usize, impulse: Vec3, at: Vec3) {
        let j = joint.min(self.joints.len() - 1);
        self.pending.push((j, impulse, at));
    }

    /// One velocity sub-step: factorize, solve accelerations (holding axes
    /// pushed into a reached limit), integrate rates, apply drives.
    pub fn step_velocity(
        &mut self,
        h: f32,
        gravity: Vec3,
        cfg: &ArticulationConfig,
        host: Option<&RigidBody>,
    ) {
        self.forward_kinematics(None);
        self.prepare(host);
        self.host_dv = SpatialVector::zeros();
        let mut solved = None;
        for _ in 0..2 {
            self.factorize(h, gravity, cfg);
            let (qdd, a_base) = self.accelerations(gravity);
            if !self.hold_limits(&qdd) {
                solved = Some((qdd, a_base));
                break;
            }
            self.update_velocities();
        }
        let (qdd, a_base) = match solved {
            Some(s) => s,
            None => {
                self.factorize(h, gravity, cfg);
                self.accelerations(gravity)
            }
        };
        self.pending.clear();

        let hd = h as f64;
        for (j, q) in self.joints.iter_mut().zip(&qdd) {
            j.q_dot += to_glam(&(q * hd));
        }
        match self.base {
            Base::Own => {
                let o = self.origin;
                let root = &mut self.joints[0];
                let c = to_na(root.body.position - o);
                let v = root.scratch.v + a_base * hd;
                let (lin, ang) = com_from_motion(&v, c);
                root.body.set_velocity(lin + gravity * h, ang);
            }
            Base::Body => {
                self.host_v += a_base * hd;
                self.host_dv += a_base * hd;
            }
            Base::World => {}
        }
        self.update_velocities();
        self.apply_drives(cfg);
        self.check_divergence(cfg);
    }

    /// Lock axes that sit on a limit and accelerate into it. Returns true if
    /// any axis was locked.
    fn hold_limits(&mut self, qdd: &[Vector3<f64>]) -> bool {
        let mut held = false;
        for (j, q) in self.joints.iter_mut().zip(qdd) {
            for k in 0..3 {
                if !j.scratch.active[k] || !j.flags.contains(JointFlags::at_limit(k)) {
                    continue;
                }
                let at_max = j.angles[k] >= j.params.limit_max[k];
                let at_min = j.angles[k] <= j.params.limit_min[k];
                if (at_max && q[k] > 0.0) || (at_min && q[k] < 0.0) {
                    j.scratch.active[k] = false;
                    j.scratch.s.set_column(k, &SpatialVector::zeros());
                    j.q_dot[k] = 0.0;
                    held = true;
                }
            }
        }
        held
    }

    fn apply_drives(&mut self, cfg: &ArticulationConfig) {
        for i in 0..self.joints.len() {
            let Some(target) = self.joints[i].drive else { continue };
            for k in 0..3 {
                if !self.joints[i].scratch.active[k] {
                    continue;
                }
                let delta = target[k] - self.joints[i].q_dot[k];
                if delta.abs() < cfg.min_drive_velocity {
                    continue;
                }
                let mut unit = Vector3::zeros();
                unit[k] = 1.0;
                let unit_kick = self.solve_impulses(&[], &[(i, unit)]);
                let gain = unit_kick.dq[i][k];
                if gain.abs() < 1e-12 {
                    continue;
                }
                let r = self.solve_impulses(&[], &[(i, unit * (delta as f64 / gain))]);
                self.apply_response(&r);
            }
        }
    }

    fn check_divergence(&mut self, cfg: &ArticulationConfig) {
        let mut reset = false;
        for (i, j) in self.joints.iter_mut().enumerate() {
            j.flags.remove(JointFlags::RESET);
            let qd = j.q_dot;
            if !qd.is_finite() || qd.abs().max_element() > cfg.max_joint_velocity {
                warn!(joint = i, "joint velocity diverged; resetting joint to rest");
                j.reset_rates();
                reset = true;
            }
        }
        if self.base == Base::Own && !self.joints[0].body.is_finite() {
            warn!("articulated root diverged; resetting to rest");
            self.joints[0].body.stop();
            reset = true;
        }
        if reset {
            self.update_velocities();
        }
    }

    /// Velocity change of the host accumulated since the last call.
    pub fn take_host_delta(&mut self) -> SpatialVector {
        std::mem::replace(&mut self.host_dv, SpatialVector::zeros())
    }

    /// Apply a spatial velocity change (about this tree's reference point) to
    /// the host body.
    pub fn apply_host_delta(&self, host: &mut RigidBody, dv: &SpatialVector) {
        if host.is_immovable() {
            return;
        }
        let c = to_na(host.position - self.origin);
        let v = motion_from_com(host.linear_velocity(), host.angular_velocity(), c) + dv;
        let (lin, ang) = com_from_motion(&v, c);
        host.set_velocity(lin, ang);
    }

    /// Integrate joint rotations, enforce limits and place the bodies.
    /// Returns the number of axes that hit a limit.
    pub fn step_position(
        &mut self,
        h: f32,
        cfg: &ArticulationConfig,
        host_frame: Option<Pose>,
        host: Option<&RigidBody>,
    ) -> usize {
        if self.base == Base::Own {
            self.joints[0].body.integrate_position(h);
        }
        let start = usize::from(self.mode == RootMode::Free);
        let mut hits = 0;
        for i in start..self.joints.len() {
            if self.joints[i].update_gimbal(cfg) {
                let frozen = self.joints[i].flags.contains(JointFlags::GIMBAL_FROZEN);
                debug!(joint = i, frozen, "gimbal state changed");
            }
            self.joints[i].integrate(h);
            let dv = self.joints[i].enforce_limits();
            for (k, d) in dv.iter().enumerate() {
                if *d == 0.0 || !self.joints[i].scratch.active[k] {
                    continue;
                }
                hits += 1;
                let mut unit = Vector3::zeros();
                unit[k] = 1.0;
                let gain = self.solve_impulses(&[], &[(i, unit)]).dq[i][k];
                if gain.abs() > 1e-12 {
                    let r = self.solve_impulses(&[], &[(i, unit * (*d as f64 / gain))]);
                    self.apply_response(&r);
                }
                // remove any residual rate into the limit
                let q = self.joints[i].q_dot[k];
                let a = self.joints[i].angles[k];
                let p = &self.joints[i].params;
                if (a >= p.limit_max[k] && q > 0.0) || (a <= p.limit_min[k] && q < 0.0) {
                    self.joints[i].q_dot[k] = 0.0;
                }
            }
        }
        self.forward_kinematics(host_frame);
        self.prepare(host);
        hits
    }

    /// Velocity of the world point `p` attached to joint body `joint`.
    pub fn velocity_at(&self, joint: usize, p: Vec3) -> Vec3 {
        let j = &self.joints[joint.min(self.joints.len() - 1)];
        to_glam(&point_velocity(&j.scratch.v, to_na(p - self.origin)))
    }

    /// Apply a linear impulse at `p` on joint body `joint`, propagated through
    /// the tree.
    pub fn apply_impulse(&mut self, joint: usize, impulse: Vec3, p: Vec3) {
        let j = joint.min(self.joints.len() - 1);
        let imp = impulse_at(to_na(impulse), to_na(p - self.origin));
        let r = self.solve_impulses(&[(j, imp)], &[]);
        self.apply_response(&r);
    }

    /// Velocity change at `p` along `dir` per unit impulse along `dir` at `p`.
    pub fn response(&self, joint: usize, p: Vec3, dir: Vec3) -> f32 {
        let j = joint.min(self.joints.len() - 1);
        let r = to_na(p - self.origin);
        let imp = impulse_at(to_na(dir), r);
        let res = self.solve_impulses(&[(j, imp)], &[]);
        point_velocity(&res.dv[j], r).dot(&to_na(dir)) as f32
    }

    /// Set the root body velocity of a free tree.
    pub fn set_root_velocity(&mut self, v: Vec3, w: Vec3) -> PhysResult<()> {
        if self.mode != RootMode::Free {
            return Err(PhysError::Unsupported("root velocity of a grounded tree"));
        }
        self.joints[0].body.set_velocity(v, w);
        self.update_velocities();
        Ok(())
    }

    pub fn set_joint_params(
        &mut self,
        entity: EntityId,
        joint: usize,
        params: JointParams,
    ) -> PhysResult<()> {
        params.validate()?;
        let j = self.joints.get_mut(joint).ok_or(PhysError::InvalidJoint { entity, index: joint })?;
        j.params = params;
        Ok(())
    }

    pub fn drive(&mut self, entity: EntityId, joint: usize, rates: Option<Vec3>) -> PhysResult<()> {
        if rates.is_some_and(|r| !r.is_finite()) {
            return Err(PhysError::NonFinite("drive rates"));
        }
        let j = self.joints.get_mut(joint).ok_or(PhysError::InvalidJoint { entity, index: joint })?;
        j.drive = rates;
        Ok(())
    }

    /// Stop all motion.
    pub fn stop(&mut self) {
        for j in &mut self.joints {
            j.q_dot = Vec3::ZERO;
        }
        if self.mode == RootMode::Free {
            self.joints[0].body.stop();
        }
        self.pending.clear();
        self.update_velocities();
    }

    /// Set joint angles and rates directly (restore path).
    pub fn set_joint_state(&mut self, joint: usize, q_rel: Quat, q_dot: Vec3, flags: JointFlags) {
        if let Some(j) = self.joints.get_mut(joint) {
            j.q_rel = q_rel.normalize();
            j.angles = crate::joint::euler_from_quat(j.q_rel);
            j.q_dot = q_dot;
            j.flags = flags;
        }
    }

    /// Re-place bodies after an external pose or joint change and refactor
    /// the inertias so impulse responses are valid before the next step.
    pub fn refresh(&mut self, host_frame: Option<Pose>, host: Option<&RigidBody>) {
        self.forward_kinematics(host_frame);
        self.prepare(host);
        self.factorize(0.0, Vec3::ZERO, &ArticulationConfig::default());
    }

    /// Move a free tree so its root frame lands on `pose`.
    pub fn set_root_pose(&mut self, pose: &Pose) {
        if self.mode == RootMode::Free {
            let root = &mut self.joints[0];
            let com = pose.transform_point(root.com_local);
            root.body.set_pose(com, pose.rotation * root.principal);
        } else {
            self.placement = *pose;
        }
        self.refresh(None, None);
    }

    /// Snapshot joint state and queued impulses for step-back.
    pub fn save(&mut self) {
        let joints = self.joints.iter().map(|j| (j.q_rel, j.angles, j.q_dot, j.body.clone()));
        self.saved = Some(joints.collect());
        self.saved_pending.clone_from(&self.pending);
    }

    pub fn restore(&mut self) {
        if let Some(saved) = &self.saved {
            for (j, (q, a, qd, b)) in self.joints.iter_mut().zip(saved) {
                j.q_rel = *q;
                j.angles = *a;
                j.q_dot = *qd;
                j.body = b.clone();
            }
            self.pending.clone_from(&self.saved_pending);
        }
        self.refresh(None, None);
    }

    pub fn is_finite(&self) -> bool {
        self.joints.iter().all(|j| j.q_dot.is_finite() && j.body.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Shape;

    /// Rod of length 2 on a pivot at the origin, horizontal along +Y, hinged about X.
    fn pendulum() -> ArticulatedCore {
        let desc = vec![JointDesc::new(None, Vec3::ZERO).with_params(JointParams::hinge(0))];
        let parts = vec![Part::new(Shape::Box { half: Vec3::new(0.05, 1.0, 0.05) }, 1.0)
            .with_local(Pose::from_position(Vec3::new(0.0, 1.0, 0.0)))
            .on_joint(0)];
        fixed(1, &desc, &parts).expect("valid")
    }

    fn fixed(id: EntityId, desc: &[JointDesc], parts: &[Part]) -> PhysResult<ArticulatedCore> {
        let (mode, zero) = (RootMode::Fixed, Vec3::ZERO);
        ArticulatedCore::new(id, desc, parts, Pose::IDENTITY, mode, zero, zero)
    }

    fn potential(core: &ArticulatedCore, g: f32) -> f32 {
        core.joints.iter().map(|j| j.body.mass() * g * j.body.position.z).sum()
    }

    #[test]
    fn test_descriptor_validation() {
        let parts = vec![Part::new(Shape::Sphere { radius: 0.1 }, 1.0)];
        let bad_order = vec![JointDesc::new(None, Vec3::ZERO), JointDesc::new(Some(1), Vec3::X)];
        assert!(matches!(
            fixed(7, &bad_order, &parts),
            Err(PhysError::InvalidJoint { entity: 7, index: 1 })
        ));
        // second joint has no mass
        let two = vec![JointDesc::new(None, Vec3::ZERO), JointDesc::new(Some(0), Vec3::X)];
        assert!(fixed(7, &two, &parts).is_err());
    }

    #[test]
    fn test_pendulum_falls_down_and_keeps_energy() {
        let mut core = pendulum();
        let cfg = ArticulationConfig::default();
        let g = Vec3::new(0.0, 0.0, -9.81);
        let e0 = core.kinetic_energy() + potential(&core, 9.81);
        let h = 1.0 / 240.0;
        let mut min_z = f32::MAX;
        for _ in 0..480 {
            core.step_velocity(h, g, &cfg, None);
            core.step_position(h, &cfg, None, None);
            min_z = min_z.min(core.joints[0].body.position.z);
            let e = core.kinetic_energy() + potential(&core, 9.81);
            assert!((e - e0).abs() < 0.25, "energy drift {e} vs {e0}");
        }
        // swings through the bottom (COM one unit below the pivot)
        assert!(min_z < -0.95, "{min_z}");
        // pivot stays put
        assert!(core.joints[0].frame.position.length() < 1e-5);
    }

    #[test]
    fn test_contact_response_matches_applied_impulse() {
        let core = pendulum();
        let tip = Vec3::new(0.0, 2.0, 0.0);
        let k = core.response(0, tip, Vec3::Z);
        // I_pivot = m L^2 / 3 for a thin rod: response at the tip is L^2 / I
        let inertia = core.joints[0].body.inertia_body().max_element() + 1.0;
        assert!((k - 4.0 / inertia).abs() < 0.05, "{k}");
        let mut c2 = core.clone();
        c2.apply_impulse(0, Vec3::Z, tip);
        assert!((c2.velocity_at(0, tip).z - k).abs() < 1e-4);
        // a radial impulse does nothing
        let mut c3 = core.clone();
        c3.apply_impulse(0, Vec3::Y, tip);
        assert!(c3.joints[0].q_dot.length() < 1e-6);
    }

    #[test]
    fn test_restore_keeps_queued_impulse() {
        let mut core = pendulum();
        let cfg = ArticulationConfig::default();
        let tip = Vec3::new(0.0, 2.0, 0.0);
        let k = core.response(0, tip, Vec3::Z);
        core.add_impulse(0, Vec3::Z, tip);
        core.save();
        core.step_velocity(0.01, Vec3::ZERO, &cfg, None);
        let kicked = core.joints[0].q_dot.x;
        assert!(kicked.abs() > 1e-3, "{kicked}");

        core.restore();
        assert_eq!(core.joints[0].q_dot, Vec3::ZERO);
        // responses are usable straight after a restore
        assert!((core.response(0, tip, Vec3::Z) - k).abs() < 1e-5);
        core.step_velocity(0.01, Vec3::ZERO, &cfg, None);
        assert!((core.joints[0].q_dot.x - kicked).abs() < 1e-5);
    }

    #[test]
    fn test_limit_holds_axis() {
        let mut core = pendulum();
        core.joints[0].params =
            JointParams::hinge(0).with_limits(Vec3::splat(-0.3), Vec3::splat(0.3));
        let cfg = ArticulationConfig::default();
        for _ in 0..240 {
            core.step_velocity(1.0 / 120.0, Vec3::new(0.0, 0.0, -9.81), &cfg, None);
            core.step_position(1.0 / 120.0, &cfg, None, None);
            assert!(core.joints[0].within_limits(1e-4));
        }
        // gravity pulls the rod down (negative rotation about X) onto the lower limit
        assert!((core.joints[0].angles.x + 0.3).abs() < 2e-3, "{:?}", core.joints[0].angles);
        assert!(core.joints[0].q_dot.x.abs() < 1e-3);
    }

    #[test]
    fn test_free_tree_falls_with_gravity() {
        let desc = vec![
            JointDesc::new(None, Vec3::ZERO),
            JointDesc::new(Some(0), Vec3::new(0.5, 0.0, 0.0)).with_params(JointParams::hinge(1)),
        ];
        let parts = vec![
            Part::new(Shape::Sphere { radius: 0.25 }, 1.0).on_joint(0),
            Part::new(Shape::Sphere { radius: 0.25 }, 1.0)
                .with_local(Pose::from_position(Vec3::new(0.5, 0.0, 0.0)))
                .on_joint(1),
        ];
        let pose = Pose::from_position(Vec3::new(0.0, 0.0, 5.0));
        let mut core =
            ArticulatedCore::new(2, &desc, &parts, pose, RootMode::Free, Vec3::ZERO, Vec3::ZERO)
                .expect("valid");
        assert_eq!(core.joints[0].n_children_tree, 1);
        let cfg = ArticulationConfig::default();
        let h = 0.01;
        for _ in 0..10 {
            core.step_velocity(h, Vec3::new(0.0, 0.0, -10.0), &cfg, None);
            core.step_position(h, &cfg, None, None);
        }
        // uniform gravity: no relative motion, both bodies fall together
        assert!(core.joints[1].q_dot.length() < 1e-4);
        for j in &core.joints {
            assert!((j.body.linear_velocity().z + 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_drive_reaches_rate() {
        let mut core = pendulum();
        let cfg = ArticulationConfig::default();
        core.drive(1, 0, Some(Vec3::new(2.0, 0.0, 0.0))).expect("joint 0");
        core.step_velocity(0.001, Vec3::ZERO, &cfg, None);
        assert!((core.joints[0].q_dot.x - 2.0).abs() < 1e-4);
        assert!(core.drive(1, 5, None).is_err());
    }
}
