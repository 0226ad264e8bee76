use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::body::RigidBody;
use crate::config::{SleepConfig, SolverConfig};
use crate::geometry::{mass_properties, Part, Pose};
use crate::math::clamp_length;
use crate::types::EntityId;

/// Fixed number of point-constraint slots per entity.
pub const MAX_CONSTRAINTS: usize = 32;

/// Energy-based sleep counter shared by rigid and articulated entities.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepState {
    /// Consecutive ticks spent below the energy threshold.
    pub counter: u32,
    /// Seconds since the entity last woke.
    pub awake_time: f32,
}

impl SleepState {
    /// Advance one tick. Returns true once the entity qualifies for sleep.
    ///
    /// `can_rest` folds in the non-energy conditions: the entity has contacts
    /// (or gravity is zero) and no buoyancy force is acting on it.
    pub fn update(
        &mut self,
        energy_per_mass: f32,
        can_rest: bool,
        dt: f32,
        cfg: &SleepConfig,
    ) -> bool {
        self.awake_time += dt;
        if can_rest && energy_per_mass < cfg.min_energy {
            self.counter = self.counter.saturating_add(1);
        } else {
            self.counter = 0;
        }
        self.counter >= cfg.sleep_frames && self.awake_time >= cfg.min_awake_time
    }

    pub fn wake(&mut self) {
        self.counter = 0;
        self.awake_time = 0.0;
    }
}

/// Point-to-point constraint held in one of the entity's slots.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointConstraint {
    pub id: u32,
    /// Other entity, or the world when `None`.
    pub other: Option<EntityId>,
    /// Pivot in this entity's frame.
    pub pivot: Vec3,
    /// Pivot in the other entity's frame, or a world point.
    pub other_pivot: Vec3,
    /// Breaking impulse; zero means unbreakable.
    pub max_impulse: f32,
}

/// Dynamic state of a single rigid body entity.
#[derive(Clone, Debug)]
pub struct RigidCore {
    pub body: RigidBody,
    /// Center of mass in the entity frame.
    pub com_local: Vec3,
    /// Principal axes relative to the entity frame.
    pub principal: Quat,
    pub sleep: SleepState,
    pub damping: f32,
    pub gravity_scale: f32,
    pub constraints: [Option<PointConstraint>; MAX_CONSTRAINTS],
    pending_linear: Vec3,
    pending_angular: Vec3,
    /// Force injected by an external buoyancy provider.
    pub buoyancy: Vec3,
    saved: Option<(RigidBody, Vec3, Vec3)>,
}

impl RigidCore {
    pub fn new(parts: &[Part], pose: &Pose, velocity: Vec3, angular_velocity: Vec3) -> Self {
        let mp = mass_properties(parts.iter());
        let position = pose.transform_point(mp.com);
        let orientation = pose.rotation * mp.principal;
        let mut body = RigidBody::new(mp.mass, mp.inertia, position, orientation);
        body.set_velocity(velocity, angular_velocity);
        Self {
            body,
            com_local: mp.com,
            principal: mp.principal,
            sleep: SleepState::default(),
            damping: 0.0,
            gravity_scale: 1.0,
            constraints: [None; MAX_CONSTRAINTS],
            pending_linear: Vec3::ZERO,
            pending_angular: Vec3::ZERO,
            buoyancy: Vec3::ZERO,
            saved: None,
        }
    }

    /// Entity frame derived from the body's center of mass and principal axes.
    pub fn entity_pose(&self) -> Pose {
        let rotation = (self.body.orientation * self.principal.inverse()).normalize();
        Pose { position: self.body.position - rotation * self.com_local, rotation }
    }

    pub fn set_entity_pose(&mut self, pose: &Pose) {
        self.body.set_pose(pose.transform_point(self.com_local), pose.rotation * self.principal);
    }

    /// Queue an impulse at world point `at` for the next velocity update.
    pub fn add_impulse(&mut self, impulse: Vec3, at: Vec3) {
        self.pending_linear += impulse;
        self.pending_angular += (at - self.body.position).cross(impulse);
    }

    pub fn add_angular_impulse(&mut self, impulse: Vec3) {
        self.pending_angular += impulse;
    }

    pub fn has_pending(&self) -> bool {
        self.pending_linear != Vec3::ZERO || self.pending_angular != Vec3::ZERO
    }

    /// Snapshot the body and queued impulses for step-back.
    pub fn save(&mut self) {
        self.saved = Some((self.body.clone(), self.pending_linear, self.pending_angular));
    }

    pub fn restore(&mut self) {
        if let Some((body, linear, angular)) = &self.saved {
            self.body = body.clone();
            self.pending_linear = *linear;
            self.pending_angular = *angular;
        }
    }

    /// Gravity, damping, buoyancy and pending impulses over `h`, then the
    /// velocity caps. Returns false if the state had to be reset.
    pub fn integrate_velocity(&mut self, gravity: Vec3, h: f32, cfg: &SolverConfig) -> bool {
        if self.body.is_immovable() {
            self.pending_linear = Vec3::ZERO;
            self.pending_angular = Vec3::ZERO;
            return true;
        }
        if self.has_pending() {
            let p = self.body.linear_momentum() + self.pending_linear;
            let l = self.body.angular_momentum() + self.pending_angular;
            self.body.set_momenta(p, l);
            self.pending_linear = Vec3::ZERO;
            self.pending_angular = Vec3::ZERO;
        }
        if self.buoyancy != Vec3::ZERO {
            let p = self.body.linear_momentum() + self.buoyancy * h;
            self.body.set_momenta(p, self.body.angular_momentum());
        }
        self.body.integrate_velocity(gravity * self.gravity_scale, self.damping, h);
        self.cap_velocity(cfg)
    }

    /// Clamp speeds; reset to rest on non-finite state.
    pub fn cap_velocity(&mut self, cfg: &SolverConfig) -> bool {
        if !self.body.is_finite() {
            warn!("non-finite rigid body state; resetting to rest");
            self.restore();
            self.body.stop();
            self.pending_linear = Vec3::ZERO;
            self.pending_angular = Vec3::ZERO;
            return false;
        }
        let v = self.body.linear_velocity();
        let w = self.body.angular_velocity();
        let vc = clamp_length(v, cfg.max_velocity);
        let wc = clamp_length(w, cfg.max_angular_velocity);
        if vc != v || wc != w {
            self.body.set_velocity(vc, wc);
        }
        true
    }

    pub fn integrate_position(&mut self, h: f32) {
        self.body.integrate_position(h);
    }

    pub fn energy_per_mass(&self) -> f32 {
        if self.body.is_immovable() {
            0.0
        } else {
            self.body.kinetic_energy() * self.body.inv_mass()
        }
    }

    /// Bit per occupied constraint slot.
    pub fn constraint_mask(&self) -> u32 {
        self.constraints
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .fold(0, |m, (i, _)| m | (1 << i))
    }

    /// Store a constraint, replacing one with the same id, else in the first
    /// free slot. Returns the slot, or `None` when every slot is taken.
    pub fn add_constraint(&mut self, c: PointConstraint) -> Option<usize> {
        let slot = self
            .constraints
            .iter()
            .position(|s| s.is_some_and(|s| s.id == c.id))
            .or_else(|| self.constraints.iter().position(Option::is_none))?;
        self.constraints[slot] = Some(c);
        Some(slot)
    }

    pub fn remove_constraint(&mut self, id: u32) -> Option<usize> {
        let slot = self.constraints.iter().position(|c| c.is_some_and(|c| c.id == id))?;
        self.constraints[slot] = None;
        Some(slot)
    }

    /// Drop constraints that reference `entity`.
    pub fn forget_partner(&mut self, entity: EntityId) {
        for c in &mut self.constraints {
            if c.is_some_and(|c| c.other == Some(entity)) {
                *c = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Shape;

    fn ball() -> RigidCore {
        let parts = vec![Part::new(Shape::Sphere { radius: 0.5 }, 1.0)];
        let pose = Pose::from_position(Vec3::new(0.0, 0.0, 10.0));
        RigidCore::new(&parts, &pose, Vec3::ZERO, Vec3::ZERO)
    }

    #[test]
    fn test_sleep_hysteresis() {
        let cfg = SleepConfig { sleep_frames: 4, min_energy: 0.01, min_awake_time: 0.0 };
        let mut s = SleepState::default();
        // three quiet ticks, one loud tick, then quiet again
        for _ in 0..3 {
            assert!(!s.update(0.0, true, 0.01, &cfg));
        }
        assert!(!s.update(1.0, true, 0.01, &cfg));
        for _ in 0..3 {
            assert!(!s.update(0.0, true, 0.01, &cfg));
        }
        assert!(s.update(0.0, true, 0.01, &cfg));
        // no contact: never sleeps
        let mut s = SleepState::default();
        for _ in 0..10 {
            assert!(!s.update(0.0, false, 0.01, &cfg));
        }
    }

    #[test]
    fn test_pending_impulse_and_caps() {
        let mut core = ball();
        let cfg = SolverConfig { max_velocity: 5.0, ..SolverConfig::default() };
        core.add_impulse(Vec3::new(100.0, 0.0, 0.0), core.body.position);
        assert!(core.integrate_velocity(Vec3::ZERO, 0.01, &cfg));
        assert!((core.body.linear_velocity().length() - 5.0).abs() < 1e-4);
        assert!(!core.has_pending());
    }

    #[test]
    fn test_restore_requeues_pending_impulse() {
        let mut core = ball();
        let cfg = SolverConfig::default();
        core.add_impulse(Vec3::new(10.0, 0.0, 0.0), core.body.position);
        core.save();
        core.integrate_velocity(Vec3::ZERO, 0.01, &cfg);
        core.restore();
        assert!(core.has_pending());
        assert_eq!(core.body.linear_velocity(), Vec3::ZERO);
        // the retried sub-step applies the impulse once
        core.integrate_velocity(Vec3::ZERO, 0.005, &cfg);
        let expected = 10.0 / core.body.mass();
        let vx = core.body.linear_velocity().x;
        assert!((vx - expected).abs() < 1e-4, "{vx}");
    }

    #[test]
    fn test_entity_pose_round_trip() {
        let parts = vec![
            Part::new(Shape::Box { half: Vec3::new(1.0, 0.2, 0.2) }, 2.0),
            Part::new(Shape::Sphere { radius: 0.3 }, 1.0)
                .with_local(Pose::from_position(Vec3::new(1.0, 0.0, 0.0))),
        ];
        let pose = Pose::new(Vec3::new(3.0, 2.0, 1.0), Quat::from_rotation_z(0.7));
        let core = RigidCore::new(&parts, &pose, Vec3::ZERO, Vec3::ZERO);
        let back = core.entity_pose();
        assert!((back.position - pose.position).length() < 1e-4);
        assert!(back.rotation.dot(pose.rotation).abs() > 1.0 - 1e-5);
    }

    fn pin(id: u32, other: Option<EntityId>) -> PointConstraint {
        PointConstraint { id, other, pivot: Vec3::ZERO, other_pivot: Vec3::ZERO, max_impulse: 0.0 }
    }

    #[test]
    fn test_constraint_slots() {
        let mut core = ball();
        assert_eq!(core.add_constraint(pin(10, None)), Some(0));
        assert_eq!(core.add_constraint(pin(11, Some(4))), Some(1));
        // same id replaces in place
        let stronger = PointConstraint { max_impulse: 5.0, ..pin(10, None) };
        assert_eq!(core.add_constraint(stronger), Some(0));
        assert_eq!(core.constraint_mask(), 0b11);
        assert_eq!(core.remove_constraint(10), Some(0));
        assert_eq!(core.constraint_mask(), 0b10);
        core.forget_partner(4);
        assert_eq!(core.constraint_mask(), 0);
        assert!(core.remove_constraint(11).is_none());
        for i in 0..MAX_CONSTRAINTS as u32 {
            assert!(core.add_constraint(pin(100 + i, None)).is_some());
        }
        assert!(core.add_constraint(pin(7, None)).is_none());
    }

    #[test]
    fn test_immovable_never_integrates() {
        let parts = [Part::new(Shape::Sphere { radius: 1.0 }, 0.0)];
        let mut core = RigidCore::new(&parts, &Pose::IDENTITY, Vec3::ZERO, Vec3::ZERO);
        core.integrate_velocity(Vec3::new(0.0, 0.0, -9.81), 0.1, &SolverConfig::default());
        core.integrate_position(0.1);
        assert_eq!(core.body.position, Vec3::ZERO);
    }
}
