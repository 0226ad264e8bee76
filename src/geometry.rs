use bitflags::bitflags;
use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{PhysError, PhysResult};
use crate::types::{Aabb, CollisionFilter, MaterialId};

/// Rigid transform: rotation then translation.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose { position: Vec3::ZERO, rotation: Quat::IDENTITY };

    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self { position, rotation: Quat::IDENTITY }
    }

    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.position + self.rotation * p
    }

    pub fn inverse_transform_point(&self, p: Vec3) -> Vec3 {
        self.rotation.inverse() * (p - self.position)
    }

    /// `self * local`: pose of a child given in this frame.
    pub fn compose(&self, local: &Pose) -> Pose {
        Pose {
            position: self.transform_point(local.position),
            rotation: (self.rotation * local.rotation).normalize(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_finite()
    }
}

/// Collision primitive in its local frame.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Sphere { radius: f32 },
    /// Oriented box given by half extents.
    Box { half: Vec3 },
    /// Segment along local Z of length `2 * half_height`, swept by `radius`.
    Capsule { radius: f32, half_height: f32 },
    /// Infinite half-space below the local XY plane, normal local +Z.
    Plane,
}

impl Shape {
    pub fn validate(&self) -> PhysResult<()> {
        let ok = match *self {
            Shape::Sphere { radius } => radius.is_finite() && radius > 0.0,
            Shape::Box { half } => half.is_finite() && half.min_element() > 0.0,
            Shape::Capsule { radius, half_height } => {
                radius.is_finite() && radius > 0.0 && half_height.is_finite() && half_height >= 0.0
            }
            Shape::Plane => true,
        };
        if ok { Ok(()) } else { Err(PhysError::invalid("shape", format!("degenerate {self:?}"))) }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Shape::Plane)
    }

    pub fn volume(&self) -> f32 {
        use std::f32::consts::PI;
        match *self {
            Shape::Sphere { radius } => 4.0 / 3.0 * PI * radius.powi(3),
            Shape::Box { half } => 8.0 * half.x * half.y * half.z,
            Shape::Capsule { radius, half_height } => {
                PI * radius * radius * (2.0 * half_height) + 4.0 / 3.0 * PI * radius.powi(3)
            }
            Shape::Plane => 0.0,
        }
    }

    /// Principal inertia about the shape's local origin for `mass`.
    pub fn unit_inertia(&self, mass: f32) -> Vec3 {
        match *self {
            Shape::Sphere { radius } => Vec3::splat(0.4 * mass * radius * radius),
            Shape::Box { half } => {
                let s = half * 2.0;
                Vec3::new(
                    mass / 12.0 * (s.y * s.y + s.z * s.z),
                    mass / 12.0 * (s.x * s.x + s.z * s.z),
                    mass / 12.0 * (s.x * s.x + s.y * s.y),
                )
            }
            Shape::Capsule { radius, half_height } => {
                // cylinder plus two hemispheres, split by volume
                let vc = std::f32::consts::PI * radius * radius * 2.0 * half_height;
                let vs = 4.0 / 3.0 * std::f32::consts::PI * radius.powi(3);
                let total = (vc + vs).max(1e-12);
                let mc = mass * vc / total;
                let ms = mass * vs / total;
                let h = 2.0 * half_height;
                let axial = mc * radius * radius * 0.5 + ms * 0.4 * radius * radius;
                let cyl = mc * (3.0 * radius * radius + h * h) / 12.0;
                let caps =
                    ms * (0.4 * radius * radius + half_height * half_height + 0.375 * radius * h);
                Vec3::new(cyl + caps, cyl + caps, axial)
            }
            Shape::Plane => Vec3::ZERO,
        }
    }

    /// World box of the shape placed at `pose`.
    pub fn bounds(&self, pose: &Pose) -> Aabb {
        let half = match *self {
            Shape::Sphere { radius } => Vec3::splat(radius),
            Shape::Box { half } => {
                let m = Mat3::from_quat(pose.rotation);
                let abs = Mat3::from_cols(m.x_axis.abs(), m.y_axis.abs(), m.z_axis.abs());
                abs * half
            }
            Shape::Capsule { radius, half_height } => {
                let axis = pose.rotation * Vec3::Z * half_height;
                axis.abs() + Vec3::splat(radius)
            }
            Shape::Plane => {
                return Aabb::new(Vec3::splat(f32::NEG_INFINITY), Vec3::splat(f32::INFINITY));
            }
        };
        Aabb::from_center_half(pose.position, half)
    }

    /// Radius of the smallest origin-centered sphere enclosing the shape.
    pub fn bounding_radius(&self) -> f32 {
        match *self {
            Shape::Sphere { radius } => radius,
            Shape::Box { half } => half.length(),
            Shape::Capsule { radius, half_height } => radius + half_height,
            Shape::Plane => f32::INFINITY,
        }
    }

    /// Characteristic size used by the fast-body test.
    pub fn min_extent(&self) -> f32 {
        match *self {
            Shape::Sphere { radius } => radius,
            Shape::Box { half } => half.min_element(),
            Shape::Capsule { radius, .. } => radius,
            Shape::Plane => f32::INFINITY,
        }
    }
}

bitflags! {
    /// Per-part participation flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PartFlags: u8 {
        const COLLIDE = 1 << 0;
        const RAYCAST = 1 << 1;
        /// Part contributes no mass.
        const MASSLESS = 1 << 2;
    }
}

impl Default for PartFlags {
    fn default() -> Self {
        PartFlags::COLLIDE | PartFlags::RAYCAST
    }
}

/// One geometry part of an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub shape: Shape,
    /// Pose relative to the owning body's frame.
    pub local: Pose,
    pub material: MaterialId,
    pub mass: f32,
    #[serde(default)]
    pub filter: CollisionFilter,
    #[serde(default)]
    pub flags: PartFlags,
    /// Joint that owns the part, for articulated entities.
    #[serde(default)]
    pub joint: Option<usize>,
}

impl Part {
    pub fn new(shape: Shape, mass: f32) -> Self {
        Self {
            shape,
            local: Pose::IDENTITY,
            material: 0,
            mass,
            filter: CollisionFilter::default(),
            flags: PartFlags::default(),
            joint: None,
        }
    }

    pub fn with_local(mut self, local: Pose) -> Self {
        self.local = local;
        self
    }

    pub fn with_material(mut self, material: MaterialId) -> Self {
        self.material = material;
        self
    }

    pub fn with_filter(mut self, filter: CollisionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn on_joint(mut self, joint: usize) -> Self {
        self.joint = Some(joint);
        self
    }

    pub fn effective_mass(&self) -> f32 {
        if self.flags.contains(PartFlags::MASSLESS) || self.shape.is_unbounded() {
            0.0
        } else {
            self.mass.max(0.0)
        }
    }
}

/// Combined mass properties of a set of parts.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MassProps {
    pub mass: f32,
    /// Center of mass in the parts' common frame.
    pub com: Vec3,
    /// Principal inertia about the center of mass.
    pub inertia: Vec3,
    /// Rotation from the principal frame into the common frame.
    pub principal: Quat,
}

/// Sum masses, shift inertias to the combined center of mass and diagonalize.
pub fn mass_properties<'a>(parts: impl IntoIterator<Item = &'a Part> + Clone) -> MassProps {
    let mut mass = 0.0;
    let mut first = Vec3::ZERO;
    for p in parts.clone() {
        let m = p.effective_mass();
        mass += m;
        first += p.local.position * m;
    }
    if mass <= 0.0 {
        return MassProps {
            mass: 0.0,
            com: Vec3::ZERO,
            inertia: Vec3::ZERO,
            principal: Quat::IDENTITY,
        };
    }
    let com = first / mass;
    let mut tensor = Mat3::ZERO;
    for p in parts {
        let m = p.effective_mass();
        if m <= 0.0 {
            continue;
        }
        let r = Mat3::from_quat(p.local.rotation);
        let local = r * Mat3::from_diagonal(p.shape.unit_inertia(m)) * r.transpose();
        let d = p.local.position - com;
        let shift = Mat3::from_diagonal(Vec3::splat(d.length_squared())) - outer(d, d);
        tensor += local + shift * m;
    }
    let (inertia, principal) = diagonalize(tensor);
    MassProps { mass, com, inertia, principal }
}

fn outer(a: Vec3, b: Vec3) -> Mat3 {
    Mat3::from_cols(a * b.x, a * b.y, a * b.z)
}

/// Jacobi eigen-decomposition of a symmetric 3x3: returns eigenvalues and the
/// rotation whose columns are the eigenvectors.
pub fn diagonalize(m: Mat3) -> (Vec3, Quat) {
    let mut a = m.to_cols_array_2d();
    let mut v = [[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    for _ in 0..24 {
        // largest off-diagonal (a is column-major: a[col][row])
        let (mut p, mut q) = (0usize, 1usize);
        let mut best = a[1][0].abs();
        if a[2][0].abs() > best {
            best = a[2][0].abs();
            p = 0;
            q = 2;
        }
        if a[2][1].abs() > best {
            best = a[2][1].abs();
            p = 1;
            q = 2;
        }
        if best < 1e-9 {
            break;
        }
        let theta = 0.5 * (2.0 * a[q][p]).atan2(a[q][q] - a[p][p]);
        let (s, c) = theta.sin_cos();
        // rotate rows/cols p,q
        for k in 0..3 {
            let akp = a[p][k];
            let akq = a[q][k];
            a[p][k] = c * akp - s * akq;
            a[q][k] = s * akp + c * akq;
        }
        for k in 0..3 {
            let apk = a[k][p];
            let aqk = a[k][q];
            a[k][p] = c * apk - s * aqk;
            a[k][q] = s * apk + c * aqk;
        }
        for row in &mut v {
            let vp = row[p];
            let vq = row[q];
            row[p] = c * vp - s * vq;
            row[q] = s * vp + c * vq;
        }
    }
    let eig = Vec3::new(a[0][0], a[1][1], a[2][2]);
    // v is row-major with eigenvectors in columns
    let mut rot = Mat3::from_cols(
        Vec3::new(v[0][0], v[1][0], v[2][0]),
        Vec3::new(v[0][1], v[1][1], v[2][1]),
        Vec3::new(v[0][2], v[1][2], v[2][2]),
    );
    if rot.determinant() < 0.0 {
        rot.z_axis = -rot.z_axis;
    }
    (eig, Quat::from_mat3(&rot).normalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sphere_mass_props() {
        let parts = [Part::new(Shape::Sphere { radius: 0.5 }, 1.0)];
        let mp = mass_properties(parts.iter());
        assert_eq!(mp.mass, 1.0);
        assert!((mp.inertia - Vec3::splat(0.1)).abs().max_element() < 1e-5);
    }

    #[test]
    fn test_parallel_axis_and_principal_frame() {
        let s = Shape::Sphere { radius: 0.1 };
        let parts = [
            Part::new(s, 1.0).with_local(Pose::from_position(Vec3::new(1.0, 0.0, 0.0))),
            Part::new(s, 1.0).with_local(Pose::from_position(Vec3::new(-1.0, 0.0, 0.0))),
        ];
        let mp = mass_properties(parts.iter());
        assert!(mp.com.length() < 1e-6);
        let world = crate::math::rotate_diag(mp.principal, mp.inertia);
        // about x the point masses contribute nothing beyond the spheres themselves
        assert!((world.x_axis.x - 0.008).abs() < 1e-4);
        assert!((world.y_axis.y - 2.008).abs() < 1e-3);
    }

    #[test]
    fn test_diagonalize_rotated_tensor() {
        let q = Quat::from_rotation_z(0.7) * Quat::from_rotation_x(0.3);
        let m = crate::math::rotate_diag(q, Vec3::new(1.0, 2.0, 3.0));
        let (eig, rot) = diagonalize(m);
        let back = crate::math::rotate_diag(rot, eig);
        for (a, b) in back.to_cols_array().iter().zip(m.to_cols_array().iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_box_bounds_rotated() {
        let b = Shape::Box { half: Vec3::new(1.0, 0.5, 0.5) };
        let quarter = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let aabb = b.bounds(&Pose::new(Vec3::ZERO, quarter));
        assert!((aabb.max.x - 0.5).abs() < 1e-5);
        assert!((aabb.max.y - 1.0).abs() < 1e-5);
        assert!(Shape::Plane.bounds(&Pose::IDENTITY).max.x.is_infinite());
        assert!(Shape::Sphere { radius: -1.0 }.validate().is_err());
    }
}
