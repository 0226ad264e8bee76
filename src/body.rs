use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::math::{integrate_rotation, mat3_is_finite, rotate_diag};

/// Mass properties plus kinematic state of one rigid body.
///
/// Momenta are the primary state. `v` and `w` are derived and recomputed by
/// every mutator, so `v == p * inv_mass` and `w == inv_inertia_world * l`
/// hold whenever a method returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RigidBody {
    mass: f32,
    inv_mass: f32,
    /// Principal inertia in body space.
    inertia_body: Vec3,
    inertia_world: Mat3,
    inv_inertia_world: Mat3,
    /// Center of mass in world space.
    pub position: Vec3,
    pub orientation: Quat,
    p: Vec3,
    l: Vec3,
    v: Vec3,
    w: Vec3,
}

impl Default for RigidBody {
    fn default() -> Self {
        Self::immovable(Vec3::ZERO, Quat::IDENTITY)
    }
}

impl RigidBody {
    /// Body with `mass` and principal inertia `inertia` (body space).
    /// Non-positive mass yields an immovable body.
    pub fn new(mass: f32, inertia: Vec3, position: Vec3, orientation: Quat) -> Self {
        if !(mass > 0.0 && mass.is_finite()) {
            return Self::immovable(position, orientation);
        }
        let mut b = Self {
            mass,
            inv_mass: 1.0 / mass,
            inertia_body: inertia.max(Vec3::splat(1e-9)),
            inertia_world: Mat3::ZERO,
            inv_inertia_world: Mat3::ZERO,
            position,
            orientation: orientation.normalize(),
            p: Vec3::ZERO,
            l: Vec3::ZERO,
            v: Vec3::ZERO,
            w: Vec3::ZERO,
        };
        b.update_inertia();
        b
    }

    pub fn immovable(position: Vec3, orientation: Quat) -> Self {
        Self {
            mass: 0.0,
            inv_mass: 0.0,
            inertia_body: Vec3::ZERO,
            inertia_world: Mat3::ZERO,
            inv_inertia_world: Mat3::ZERO,
            position,
            orientation,
            p: Vec3::ZERO,
            l: Vec3::ZERO,
            v: Vec3::ZERO,
            w: Vec3::ZERO,
        }
    }

    pub fn mass(&self) -> f32 {
        self.mass
    }

    pub fn inv_mass(&self) -> f32 {
        self.inv_mass
    }

    pub fn inertia_body(&self) -> Vec3 {
        self.inertia_body
    }

    pub fn inertia_world(&self) -> Mat3 {
        self.inertia_world
    }

    pub fn inv_inertia_world(&self) -> Mat3 {
        self.inv_inertia_world
    }

    pub fn linear_momentum(&self) -> Vec3 {
        self.p
    }

    pub fn angular_momentum(&self) -> Vec3 {
        self.l
    }

    pub fn linear_velocity(&self) -> Vec3 {
        self.v
    }

    pub fn angular_velocity(&self) -> Vec3 {
        self.w
    }

    pub fn is_immovable(&self) -> bool {
        self.inv_mass == 0.0
    }

    /// Recompute world inertia from orientation, then refresh derived velocities.
    pub fn update_inertia(&mut self) {
        if self.is_immovable() {
            self.inertia_world = Mat3::ZERO;
            self.inv_inertia_world = Mat3::ZERO;
        } else {
            self.inertia_world = rotate_diag(self.orientation, self.inertia_body);
            self.inv_inertia_world = rotate_diag(self.orientation, self.inertia_body.recip());
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        if self.is_immovable() {
            self.p = Vec3::ZERO;
            self.l = Vec3::ZERO;
        }
        self.v = self.p * self.inv_mass;
        self.w = self.inv_inertia_world * self.l;
    }

    pub fn set_mass(&mut self, mass: f32, inertia: Vec3) {
        let v = self.v;
        let w = self.w;
        *self = Self::new(mass, inertia, self.position, self.orientation);
        self.set_velocity(v, w);
    }

    pub fn set_momenta(&mut self, p: Vec3, l: Vec3) {
        self.p = p;
        self.l = l;
        self.refresh();
    }

    pub fn set_velocity(&mut self, v: Vec3, w: Vec3) {
        self.p = v * self.mass;
        self.l = self.inertia_world * w;
        self.refresh();
    }

    pub fn set_pose(&mut self, position: Vec3, orientation: Quat) {
        self.position = position;
        self.orientation = orientation.normalize();
        self.update_inertia();
    }

    pub fn stop(&mut self) {
        self.set_momenta(Vec3::ZERO, Vec3::ZERO);
    }

    /// Apply an impulse at world point `at`.
    pub fn apply_impulse(&mut self, impulse: Vec3, at: Vec3) {
        self.p += impulse;
        self.l += (at - self.position).cross(impulse);
        self.refresh();
    }

    pub fn apply_angular_impulse(&mut self, impulse: Vec3) {
        self.l += impulse;
        self.refresh();
    }

    pub fn velocity_at(&self, point: Vec3) -> Vec3 {
        self.v + self.w.cross(point - self.position)
    }

    /// Velocity change at `point` per unit impulse along `dir` applied there.
    pub fn response(&self, point: Vec3, dir: Vec3) -> f32 {
        if self.is_immovable() {
            return 0.0;
        }
        let r = point - self.position;
        let rn = r.cross(dir);
        self.inv_mass + rn.dot(self.inv_inertia_world * rn)
    }

    /// `0.5*m*v^2 + 0.5*w.L`.
    pub fn kinetic_energy(&self) -> f32 {
        0.5 * (self.mass * self.v.length_squared() + self.w.dot(self.l))
    }

    /// Explicit Euler on momenta: gravity plus linear/angular damping.
    pub fn integrate_velocity(&mut self, gravity: Vec3, damping: f32, dt: f32) {
        if self.is_immovable() {
            return;
        }
        self.p += gravity * self.mass * dt;
        if damping > 0.0 {
            let k = (1.0 - damping * dt).max(0.0);
            self.p *= k;
            self.l *= k;
        }
        self.refresh();
    }

    /// Advance pose with current velocities, keeping `L` and refreshing `w`.
    pub fn integrate_position(&mut self, dt: f32) {
        if self.is_immovable() {
            return;
        }
        self.position += self.v * dt;
        self.orientation = integrate_rotation(self.orientation, self.w, dt);
        self.update_inertia();
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.orientation.is_finite()
            && self.p.is_finite()
            && self.l.is_finite()
            && mat3_is_finite(&self.inv_inertia_world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariant(b: &RigidBody) {
        assert!((b.linear_velocity() - b.linear_momentum() * b.inv_mass()).length() < 1e-5);
        let w = b.inv_inertia_world() * b.angular_momentum();
        assert!((b.angular_velocity() - w).length() < 1e-4);
    }

    #[test]
    fn test_invariant_after_mutations() {
        let inertia = Vec3::new(1.0, 2.0, 3.0);
        let mut b = RigidBody::new(2.0, inertia, Vec3::ZERO, Quat::from_rotation_x(0.4));
        b.apply_impulse(Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0));
        check_invariant(&b);
        b.integrate_velocity(Vec3::new(0.0, 0.0, -9.81), 0.1, 0.01);
        check_invariant(&b);
        b.integrate_position(0.01);
        check_invariant(&b);
        b.set_velocity(Vec3::X, Vec3::Z);
        check_invariant(&b);
        assert!((b.linear_velocity() - Vec3::X).length() < 1e-6);
        assert!((b.angular_velocity() - Vec3::Z).length() < 1e-5);
        b.set_pose(Vec3::ONE, Quat::from_rotation_y(1.0));
        check_invariant(&b);
    }

    #[test]
    fn test_zero_mass_never_moves() {
        let mut b = RigidBody::new(0.0, Vec3::ONE, Vec3::ZERO, Quat::IDENTITY);
        assert!(b.is_immovable());
        b.apply_impulse(Vec3::X, Vec3::Y);
        b.integrate_velocity(Vec3::new(0.0, 0.0, -9.81), 0.0, 0.1);
        b.integrate_position(0.1);
        assert_eq!(b.position, Vec3::ZERO);
        assert_eq!(b.linear_velocity(), Vec3::ZERO);
        assert_eq!(b.response(Vec3::ZERO, Vec3::X), 0.0);
    }

    #[test]
    fn test_energy_constant_without_damping() {
        let mut b = RigidBody::new(1.0, Vec3::new(0.1, 0.2, 0.3), Vec3::ZERO, Quat::IDENTITY);
        b.set_velocity(Vec3::new(1.0, 2.0, 0.0), Vec3::new(0.0, 0.0, 3.0));
        let e0 = b.kinetic_energy();
        for _ in 0..100 {
            b.integrate_velocity(Vec3::ZERO, 0.0, 0.01);
            b.integrate_position(0.01);
        }
        assert!((b.kinetic_energy() - e0).abs() < 1e-3 * e0);
    }

    #[test]
    fn test_response_of_sphere_center() {
        let b = RigidBody::new(4.0, Vec3::splat(0.4), Vec3::ZERO, Quat::IDENTITY);
        assert!((b.response(Vec3::ZERO, Vec3::Z) - 0.25).abs() < 1e-6);
        assert!(b.response(Vec3::X, Vec3::Z) > 0.25);
    }
}
