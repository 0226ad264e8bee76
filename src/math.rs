//! Small glam helpers shared by the dynamics code.

use glam::{Mat3, Quat, Vec3};

/// Cross-product matrix: `skew(a) * b == a.cross(b)`.
pub fn skew(a: Vec3) -> Mat3 {
    Mat3::from_cols(
        Vec3::new(0.0, a.z, -a.y),
        Vec3::new(-a.z, 0.0, a.x),
        Vec3::new(a.y, -a.x, 0.0),
    )
}

/// `R * diag(d) * R^T`.
pub fn rotate_diag(rot: Quat, d: Vec3) -> Mat3 {
    let r = Mat3::from_quat(rot);
    r * Mat3::from_diagonal(d) * r.transpose()
}

/// Two unit vectors orthogonal to `n` and to each other.
pub fn tangent_basis(n: Vec3) -> (Vec3, Vec3) {
    let t1 = n.any_orthonormal_vector();
    let t2 = n.cross(t1);
    (t1, t2)
}

/// Advance `q` by angular velocity `w` over `dt`, exact for constant `w`.
pub fn integrate_rotation(q: Quat, w: Vec3, dt: f32) -> Quat {
    let angle = w.length() * dt;
    if angle < 1e-9 {
        return q;
    }
    let axis = w / w.length();
    (Quat::from_axis_angle(axis, angle) * q).normalize()
}

/// Clamp the length of `v` to `max`.
pub fn clamp_length(v: Vec3, max: f32) -> Vec3 {
    let len2 = v.length_squared();
    if len2 > max * max { v * (max / len2.sqrt()) } else { v }
}

/// Wrap an angle into `(-pi, pi]`.
pub fn wrap_angle(a: f32) -> f32 {
    use std::f32::consts::PI;
    let mut r = a % (2.0 * PI);
    if r <= -PI {
        r += 2.0 * PI;
    } else if r > PI {
        r -= 2.0 * PI;
    }
    r
}

pub fn mat3_is_finite(m: &Mat3) -> bool {
    m.x_axis.is_finite() && m.y_axis.is_finite() && m.z_axis.is_finite()
}

/// Inverse that reports singular input instead of producing infinities.
pub fn try_inverse(m: &Mat3) -> Option<Mat3> {
    let det = m.determinant();
    if det.abs() < 1e-12 || !det.is_finite() {
        return None;
    }
    Some(m.inverse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_matches_cross() {
        let a = Vec3::new(1.0, -2.0, 0.5);
        let b = Vec3::new(0.3, 4.0, -1.0);
        let d = skew(a) * b - a.cross(b);
        assert!(d.length() < 1e-5);
    }

    #[test]
    fn test_integrate_rotation_quarter_turn() {
        let w = Vec3::new(0.0, 0.0, std::f32::consts::FRAC_PI_2);
        let q = integrate_rotation(Quat::IDENTITY, w, 1.0);
        let x = q * Vec3::X;
        assert!((x - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(3.0 * std::f32::consts::PI) - std::f32::consts::PI).abs() < 1e-5);
        assert!((wrap_angle(-0.5) + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_tangent_basis_orthonormal() {
        let n = Vec3::new(0.2, 0.3, 0.9).normalize();
        let (t1, t2) = tangent_basis(n);
        assert!(t1.dot(n).abs() < 1e-5 && t2.dot(n).abs() < 1e-5 && t1.dot(t2).abs() < 1e-5);
        assert!((t2.length() - 1.0).abs() < 1e-5);
    }
}
