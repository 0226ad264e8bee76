//! Spatial (6D) algebra for the articulated solver.
//!
//! Motion vectors are `[w, v_o]`, force vectors `[tau_o, f]`, both expressed in
//! world axes about a reference point `o` that stays fixed for one solve.
//! Double precision keeps the composite inertias well conditioned.

use glam::{Mat3, Vec3};
use nalgebra::{Matrix3, Matrix6, Matrix6x3, Vector3, Vector6};

pub type SpatialVector = Vector6<f64>;
pub type SpatialMatrix = Matrix6<f64>;
pub type MotionSubspace = Matrix6x3<f64>;

pub fn to_na(v: Vec3) -> Vector3<f64> {
    Vector3::new(v.x as f64, v.y as f64, v.z as f64)
}

pub fn to_glam(v: &Vector3<f64>) -> Vec3 {
    Vec3::new(v.x as f32, v.y as f32, v.z as f32)
}

pub fn mat3_to_na(m: &Mat3) -> Matrix3<f64> {
    let c = m.to_cols_array();
    Matrix3::from_column_slice(&c.map(|x| x as f64))
}

pub fn spatial(angular: Vector3<f64>, linear: Vector3<f64>) -> SpatialVector {
    SpatialVector::new(angular.x, angular.y, angular.z, linear.x, linear.y, linear.z)
}

pub fn angular(v: &SpatialVector) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

pub fn linear(v: &SpatialVector) -> Vector3<f64> {
    Vector3::new(v[3], v[4], v[5])
}

/// `v x s` for motion vectors.
pub fn cross_motion(v: &SpatialVector, s: &SpatialVector) -> SpatialVector {
    let w = angular(v);
    let vo = linear(v);
    spatial(w.cross(&angular(s)), w.cross(&linear(s)) + vo.cross(&angular(s)))
}

/// `v x* f` for force vectors.
pub fn cross_force(v: &SpatialVector, f: &SpatialVector) -> SpatialVector {
    let w = angular(v);
    let vo = linear(v);
    spatial(w.cross(&angular(f)) + vo.cross(&linear(f)), w.cross(&linear(f)))
}

/// Spatial inertia about `o` of a body with mass `m`, center of mass `c`
/// (relative to `o`) and world-axis inertia `ic` about the center of mass.
pub fn body_inertia(m: f64, c: Vector3<f64>, ic: &Matrix3<f64>) -> SpatialMatrix {
    let cx = c.cross_matrix();
    let mut out = SpatialMatrix::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&(ic - cx * cx * m));
    out.fixed_view_mut::<3, 3>(0, 3).copy_from(&(cx * m));
    out.fixed_view_mut::<3, 3>(3, 0).copy_from(&(cx.transpose() * m));
    out.fixed_view_mut::<3, 3>(3, 3).copy_from(&(Matrix3::identity() * m));
    out
}

/// Velocity of the point at `r` (relative to `o`) for motion `v`.
pub fn point_velocity(v: &SpatialVector, r: Vector3<f64>) -> Vector3<f64> {
    linear(v) + angular(v).cross(&r)
}

/// Spatial impulse of a linear impulse `j` applied at `r` (relative to `o`).
pub fn impulse_at(j: Vector3<f64>, r: Vector3<f64>) -> SpatialVector {
    spatial(r.cross(&j), j)
}

/// Motion subspace column of a revolute axis `a` through the point `r`.
pub fn revolute(a: Vector3<f64>, r: Vector3<f64>) -> SpatialVector {
    spatial(a, r.cross(&a))
}

/// Spatial motion of a body from its COM velocity `v`, angular velocity `w`
/// and COM offset `c` from `o`.
pub fn motion_from_com(v: Vec3, w: Vec3, c: Vector3<f64>) -> SpatialVector {
    let w = to_na(w);
    spatial(w, to_na(v) - w.cross(&c))
}

/// COM velocity and angular velocity of spatial motion `m`.
pub fn com_from_motion(m: &SpatialVector, c: Vector3<f64>) -> (Vec3, Vec3) {
    (to_glam(&point_velocity(m, c)), to_glam(&angular(m)))
}

pub fn is_finite(v: &SpatialVector) -> bool {
    v.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inertia_matches_momentum() {
        let m = 2.0;
        let c = Vector3::new(1.0, 0.5, -0.25);
        let ic = Matrix3::from_diagonal(&Vector3::new(0.3, 0.4, 0.5));
        let inertia = body_inertia(m, c, &ic);
        // pure rotation about o: linear momentum is m * (w x c)
        let w = Vector3::new(0.0, 0.0, 3.0);
        let h = inertia * spatial(w, Vector3::zeros());
        let expect = w.cross(&c) * m;
        assert!((linear(&h) - expect).norm() < 1e-12);
        assert!((inertia - inertia.transpose()).norm() < 1e-12);
    }

    #[test]
    fn test_com_round_trip_and_cross_identity() {
        let c = Vector3::new(0.2, -1.0, 3.0);
        let m = motion_from_com(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.1, 0.0, -0.4), c);
        let (v, w) = com_from_motion(&m, c);
        assert!((v - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-5);
        assert!((w - Vec3::new(0.1, 0.0, -0.4)).length() < 1e-6);
        // v x* f equals -(v x)^T f
        let f = SpatialVector::new(0.3, -0.2, 1.0, 4.0, 0.5, -2.0);
        let s = SpatialVector::new(1.0, 2.0, 0.0, 0.0, -1.0, 0.5);
        let lhs = cross_force(&m, &f).dot(&s);
        let rhs = -f.dot(&cross_motion(&m, &s));
        assert!((lhs - rhs).abs() < 1e-9);
    }
}
