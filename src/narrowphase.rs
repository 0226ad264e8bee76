use glam::{Mat3, Vec3};

use crate::api::NarrowphaseApi;
use crate::geometry::{Pose, Shape};

/// Parametric hit along a ray or sweep. `toi` is in units of the direction
/// vector, so a direction carrying the full travel gives `toi` in `[0, 1]`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SweepHit {
    pub toi: f32,
    /// Outward surface normal at the hit; zero if the origin started inside.
    pub normal: Vec3,
    pub contact: Vec3,
}

/// One contact point between two shapes. `normal` points from B into A.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Overlap {
    pub normal: Vec3,
    pub depth: f32,
    pub contact: Vec3,
}

impl Overlap {
    fn flipped(self) -> Overlap {
        Overlap { normal: -self.normal, ..self }
    }
}

/// Upper bound of points produced for one shape pair.
pub const MAX_MANIFOLD: usize = 8;

/// Primitive intersection tests.
pub struct Narrowphase;

impl NarrowphaseApi for Narrowphase {
    fn ray_aabb(origin: Vec3, dir: Vec3, aabb_min: Vec3, aabb_max: Vec3) -> Option<SweepHit> {
        // Slab method with normal tracking; returns earliest t >= 0
        let mut tmin = f32::NEG_INFINITY;
        let mut tmax = f32::INFINITY;
        let mut n_enter = Vec3::ZERO;

        for axis in 0..3 {
            let o = origin[axis];
            let d = dir[axis];
            if d.abs() < f32::EPSILON {
                if o < aabb_min[axis] || o > aabb_max[axis] {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut t1 = (aabb_min[axis] - o) * inv;
            let mut t2 = (aabb_max[axis] - o) * inv;
            let mut sign = -1.0;
            if t1 > t2 {
                core::mem::swap(&mut t1, &mut t2);
                sign = 1.0;
            }
            if t1 > tmin {
                tmin = t1;
                n_enter = Vec3::ZERO;
                n_enter[axis] = sign;
            }
            if t2 < tmax {
                tmax = t2;
            }
            if tmin > tmax || tmax < 0.0 {
                return None;
            }
        }

        // If origin inside, tmin < 0; treat as immediate hit
        let toi = if tmin < 0.0 { 0.0 } else { tmin };
        let normal = if tmin < 0.0 { Vec3::ZERO } else { n_enter };
        Some(SweepHit { toi, normal, contact: origin + dir * toi })
    }

    fn ray_sphere(origin: Vec3, dir: Vec3, center: Vec3, r: f32) -> Option<SweepHit> {
        // Solve ||origin + t*dir - center||^2 = r^2 for t >= 0
        let m = origin - center;
        let a = dir.length_squared();
        if a == 0.0 {
            return None;
        }
        let b = 2.0 * m.dot(dir);
        let c = m.length_squared() - r * r;
        if c <= 0.0 {
            return Some(SweepHit { toi: 0.0, normal: Vec3::ZERO, contact: origin });
        }
        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            return None;
        }
        let t = (-b - disc.sqrt()) / (2.0 * a);
        if t < 0.0 {
            return None;
        }
        let contact = origin + dir * t;
        let normal = (contact - center).normalize_or_zero();
        Some(SweepHit { toi: t, normal, contact })
    }

    fn ray_capsule(origin: Vec3, dir: Vec3, a: Vec3, b: Vec3, r: f32) -> Option<SweepHit> {
        let d = b - a;
        let m = origin - a;
        let dd = d.dot(d);
        let nd = dir.dot(d);
        let md = m.dot(d);
        let nn = dir.dot(dir);
        if nn == 0.0 {
            return None;
        }
        let mut best: Option<SweepHit> = None;
        let consider = |hit: Option<SweepHit>, best: &mut Option<SweepHit>| {
            if let Some(h) = hit {
                if best.is_none_or(|bh| h.toi < bh.toi) {
                    *best = Some(h);
                }
            }
        };

        if dd > 1e-12 {
            let s0 = (md / dd).clamp(0.0, 1.0);
            if (m - d * s0).length_squared() <= r * r {
                return Some(SweepHit { toi: 0.0, normal: Vec3::ZERO, contact: origin });
            }
            let k = m.dot(m) - r * r;
            let qa = dd * nn - nd * nd;
            let qb = dd * m.dot(dir) - nd * md;
            let qc = dd * k - md * md;
            if qa.abs() > 1e-12 {
                let disc = qb * qb - qa * qc;
                if disc >= 0.0 {
                    let t = (-qb - disc.sqrt()) / qa;
                    let s = md + t * nd;
                    if t >= 0.0 && s >= 0.0 && s <= dd {
                        let contact = origin + dir * t;
                        let axis_pt = a + d * (s / dd);
                        let normal = (contact - axis_pt).normalize_or_zero();
                        consider(Some(SweepHit { toi: t, normal, contact }), &mut best);
                    }
                }
            }
        }
        consider(Self::ray_sphere(origin, dir, a, r), &mut best);
        consider(Self::ray_sphere(origin, dir, b, r), &mut best);
        best
    }

    fn ray_obb(origin: Vec3, dir: Vec3, pose: &Pose, half: Vec3) -> Option<SweepHit> {
        let lo = pose.inverse_transform_point(origin);
        let ld = pose.rotation.inverse() * dir;
        let hit = Self::ray_aabb(lo, ld, -half, half)?;
        Some(SweepHit {
            toi: hit.toi,
            normal: pose.rotation * hit.normal,
            contact: origin + dir * hit.toi,
        })
    }

    fn ray_plane(origin: Vec3, dir: Vec3, point: Vec3, normal: Vec3) -> Option<SweepHit> {
        let dist = (origin - point).dot(normal);
        if dist <= 0.0 {
            return Some(SweepHit { toi: 0.0, normal: Vec3::ZERO, contact: origin });
        }
        let denom = dir.dot(normal);
        if denom >= -f32::EPSILON {
            return None;
        }
        let t = -dist / denom;
        Some(SweepHit { toi: t, normal, contact: origin + dir * t })
    }

    fn overlap_sphere_sphere(c0: Vec3, r0: f32, c1: Vec3, r1: f32) -> Option<Overlap> {
        let delta = c0 - c1;
        let dist2 = delta.length_squared();
        let rsum = r0 + r1;
        if dist2 > rsum * rsum {
            return None;
        }
        if dist2 == 0.0 {
            // coincident centers; push A up
            return Some(Overlap { normal: Vec3::Z, depth: rsum, contact: c0 });
        }
        let dist = dist2.sqrt();
        let normal = delta / dist; // from B into A
        let depth = (rsum - dist).max(0.0);
        let contact = c0 - normal * (r0 - depth * 0.5);
        Some(Overlap { normal, depth, contact })
    }

    fn overlap_sphere_box(c: Vec3, r: f32, pose: &Pose, half: Vec3) -> Option<Overlap> {
        let local = pose.inverse_transform_point(c);
        let clamped = local.clamp(-half, half);
        let delta = local - clamped;
        let dist2 = delta.length_squared();
        if dist2 > r * r {
            return None;
        }
        let (n_local, depth, surface) = if dist2 > 1e-12 {
            let dist = dist2.sqrt();
            (delta / dist, r - dist, clamped)
        } else {
            // center inside: exit through the nearest face
            let gap = half - local.abs();
            let axis = if gap.x <= gap.y && gap.x <= gap.z {
                0
            } else if gap.y <= gap.z {
                1
            } else {
                2
            };
            let mut n = Vec3::ZERO;
            n[axis] = if local[axis] >= 0.0 { 1.0 } else { -1.0 };
            let mut s = local;
            s[axis] = half[axis] * n[axis];
            (n, r + gap[axis], s)
        };
        let normal = pose.rotation * n_local;
        let surface = pose.transform_point(surface);
        Some(Overlap { normal, depth, contact: surface - normal * (depth * 0.5) })
    }

    fn overlap_sphere_capsule(c: Vec3, r: f32, a: Vec3, b: Vec3, cr: f32) -> Option<Overlap> {
        let q = closest_on_segment(c, a, b);
        Self::overlap_sphere_sphere(c, r, q, cr)
    }

    fn overlap_capsule_capsule(
        a0: Vec3,
        a1: Vec3,
        ra: f32,
        b0: Vec3,
        b1: Vec3,
        rb: f32,
    ) -> Option<Overlap> {
        let (p, q) = closest_segment_segment(a0, a1, b0, b1);
        Self::overlap_sphere_sphere(p, ra, q, rb)
    }

    fn overlap_point_aabb(p: Vec3, c: Vec3, h: Vec3) -> bool {
        let d = (p - c).abs();
        d.x <= h.x && d.y <= h.y && d.z <= h.z
    }

    fn sweep_sphere_sphere(c0: Vec3, r0: f32, delta: Vec3, c1: Vec3, r1: f32) -> Option<SweepHit> {
        if delta.length_squared() <= f32::EPSILON {
            return None;
        }
        let rsum = r0 + r1;
        let hit = Self::ray_sphere(c0, delta, c1, rsum)?;
        sweep_result(hit, c0, delta, r0)
    }

    fn sweep_sphere_box(c: Vec3, r: f32, delta: Vec3, pose: &Pose, half: Vec3) -> Option<SweepHit> {
        if delta.length_squared() <= f32::EPSILON {
            return None;
        }
        let hit = Self::ray_obb(c, delta, pose, half + Vec3::splat(r))?;
        sweep_result(hit, c, delta, r)
    }

    fn sweep_sphere_capsule(
        c: Vec3,
        r: f32,
        delta: Vec3,
        a: Vec3,
        b: Vec3,
        cr: f32,
    ) -> Option<SweepHit> {
        if delta.length_squared() <= f32::EPSILON {
            return None;
        }
        let hit = Self::ray_capsule(c, delta, a, b, r + cr)?;
        sweep_result(hit, c, delta, r)
    }

    fn sweep_sphere_plane(
        c: Vec3,
        r: f32,
        delta: Vec3,
        point: Vec3,
        normal: Vec3,
    ) -> Option<SweepHit> {
        if delta.length_squared() <= f32::EPSILON {
            return None;
        }
        let hit = Self::ray_plane(c, delta, point + normal * r, normal)?;
        sweep_result(hit, c, delta, r)
    }
}

/// Sweeps ignore starting overlap (discrete contacts cover it) and hits
/// beyond the travel.
fn sweep_result(hit: SweepHit, c: Vec3, delta: Vec3, r: f32) -> Option<SweepHit> {
    if hit.normal == Vec3::ZERO || hit.toi > 1.0 {
        return None;
    }
    let center_at_hit = c + delta * hit.toi;
    Some(SweepHit { toi: hit.toi, normal: hit.normal, contact: center_at_hit - hit.normal * r })
}

pub fn closest_on_segment(p: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let d = b - a;
    let dd = d.length_squared();
    if dd < 1e-12 {
        return a;
    }
    a + d * ((p - a).dot(d) / dd).clamp(0.0, 1.0)
}

/// Closest points between segments `[p1, q1]` and `[p2, q2]`.
pub fn closest_segment_segment(p1: Vec3, q1: Vec3, p2: Vec3, q2: Vec3) -> (Vec3, Vec3) {
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.dot(d1);
    let e = d2.dot(d2);
    let f = d2.dot(r);
    let (s, t);
    if a <= 1e-12 && e <= 1e-12 {
        return (p1, p2);
    }
    if a <= 1e-12 {
        s = 0.0;
        t = (f / e).clamp(0.0, 1.0);
    } else {
        let c = d1.dot(r);
        if e <= 1e-12 {
            t = 0.0;
            s = (-c / a).clamp(0.0, 1.0);
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            let s0 = if denom > 1e-12 { ((b * f - c * e) / denom).clamp(0.0, 1.0) } else { 0.0 };
            let t0 = (b * s0 + f) / e;
            if t0 < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t0 > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            } else {
                t = t0;
                s = s0;
            }
        }
    }
    (p1 + d1 * s, p2 + d2 * t)
}

fn capsule_ends(pose: &Pose, half_height: f32) -> (Vec3, Vec3) {
    let axis = pose.rotation * Vec3::Z * half_height;
    (pose.position - axis, pose.position + axis)
}

fn box_vertices(pose: &Pose, half: Vec3) -> [Vec3; 8] {
    let mut out = [Vec3::ZERO; 8];
    for (i, v) in out.iter_mut().enumerate() {
        let sx = if i & 1 == 0 { -1.0 } else { 1.0 };
        let sy = if i & 2 == 0 { -1.0 } else { 1.0 };
        let sz = if i & 4 == 0 { -1.0 } else { 1.0 };
        *v = pose.transform_point(half * Vec3::new(sx, sy, sz));
    }
    out
}

fn push_unique(out: &mut Vec<Overlap>, o: Overlap) {
    if out.len() >= MAX_MANIFOLD {
        return;
    }
    if out.iter().any(|e| (e.contact - o.contact).length_squared() < 1e-6) {
        return;
    }
    out.push(o);
}

impl Narrowphase {
    /// Ray against a posed shape; `dir` carries the maximum distance.
    pub fn ray_shape(origin: Vec3, dir: Vec3, shape: &Shape, pose: &Pose) -> Option<SweepHit> {
        let hit = match *shape {
            Shape::Sphere { radius } => Self::ray_sphere(origin, dir, pose.position, radius),
            Shape::Box { half } => Self::ray_obb(origin, dir, pose, half),
            Shape::Capsule { radius, half_height } => {
                let (a, b) = capsule_ends(pose, half_height);
                Self::ray_capsule(origin, dir, a, b, radius)
            }
            Shape::Plane => Self::ray_plane(origin, dir, pose.position, pose.rotation * Vec3::Z),
        }?;
        (hit.toi <= 1.0).then_some(hit)
    }

    /// Contact points between shape A and shape B. Normals point from B into
    /// A. Points separated by less than `margin` are reported with negative
    /// depth so the solver can keep resting contacts stable.
    pub fn collide(
        a: &Shape,
        pa: &Pose,
        b: &Shape,
        pb: &Pose,
        margin: f32,
        out: &mut Vec<Overlap>,
    ) {
        use Shape::*;
        let start = out.len();
        match (*a, *b) {
            (Sphere { radius: r0 }, Sphere { radius: r1 }) => {
                let o = Self::overlap_sphere_sphere(pa.position, r0 + margin, pb.position, r1);
                if let Some(o) = o {
                    out.push(Overlap { depth: o.depth - margin, ..o });
                }
            }
            (Sphere { radius }, Box { half }) => {
                if let Some(o) = Self::overlap_sphere_box(pa.position, radius + margin, pb, half) {
                    out.push(Overlap { depth: o.depth - margin, ..o });
                }
            }
            (Sphere { radius }, Capsule { radius: cr, half_height }) => {
                let (s0, s1) = capsule_ends(pb, half_height);
                let o = Self::overlap_sphere_capsule(pa.position, radius + margin, s0, s1, cr);
                if let Some(o) = o {
                    out.push(Overlap { depth: o.depth - margin, ..o });
                }
            }
            (Sphere { radius }, Plane) => {
                sphere_plane(pa.position, radius, pb, margin, out);
            }
            (Capsule { radius, half_height }, Plane) => {
                let (s0, s1) = capsule_ends(pa, half_height);
                sphere_plane(s0, radius, pb, margin, out);
                sphere_plane(s1, radius, pb, margin, out);
            }
            (Capsule { radius: ra, half_height: ha }, Capsule { radius: rb, half_height: hb }) => {
                let (a0, a1) = capsule_ends(pa, ha);
                let (b0, b1) = capsule_ends(pb, hb);
                if let Some(o) = Self::overlap_capsule_capsule(a0, a1, ra + margin, b0, b1, rb) {
                    push_unique(out, Overlap { depth: o.depth - margin, ..o });
                }
                // near-parallel capsules rest on two points
                for end in [a0, a1] {
                    if let Some(o) = Self::overlap_sphere_capsule(end, ra + margin, b0, b1, rb) {
                        push_unique(out, Overlap { depth: o.depth - margin, ..o });
                    }
                }
            }
            (Capsule { radius, half_height }, Box { half }) => {
                let (s0, s1) = capsule_ends(pa, half_height);
                capsule_box(s0, s1, radius, pb, half, margin, out);
            }
            (Box { half }, Plane) => {
                let n = pb.rotation * Vec3::Z;
                for v in box_vertices(pa, half) {
                    let dist = (v - pb.position).dot(n);
                    if dist < margin {
                        let contact = v - n * (dist * 0.5);
                        out.push(Overlap { normal: n, depth: -dist, contact });
                    }
                }
            }
            (Box { half: ha }, Box { half: hb }) => {
                box_box(pa, ha, pb, hb, margin, out);
            }
            (Plane, Plane) => {}
            // remaining pairs are the mirror of a handled one
            (Box { .. }, Sphere { .. })
            | (Capsule { .. }, Sphere { .. })
            | (Plane, _)
            | (Box { .. }, Capsule { .. }) => {
                Self::collide(b, pb, a, pa, margin, out);
                for o in &mut out[start..] {
                    *o = o.flipped();
                }
            }
        }
    }

    /// Swept sphere (center `c`, motion `delta`) against a posed shape.
    pub fn sweep_sphere(
        c: Vec3,
        r: f32,
        delta: Vec3,
        shape: &Shape,
        pose: &Pose,
    ) -> Option<SweepHit> {
        match *shape {
            Shape::Sphere { radius } => {
                Self::sweep_sphere_sphere(c, r, delta, pose.position, radius)
            }
            Shape::Box { half } => Self::sweep_sphere_box(c, r, delta, pose, half),
            Shape::Capsule { radius, half_height } => {
                let (a, b) = capsule_ends(pose, half_height);
                Self::sweep_sphere_capsule(c, r, delta, a, b, radius)
            }
            Shape::Plane => {
                Self::sweep_sphere_plane(c, r, delta, pose.position, pose.rotation * Vec3::Z)
            }
        }
    }
}

fn sphere_plane(c: Vec3, r: f32, plane: &Pose, margin: f32, out: &mut Vec<Overlap>) {
    let n = plane.rotation * Vec3::Z;
    let dist = (c - plane.position).dot(n) - r;
    if dist < margin {
        push_unique(out, Overlap { normal: n, depth: -dist, contact: c - n * (r + dist * 0.5) });
    }
}

fn capsule_box(
    s0: Vec3,
    s1: Vec3,
    r: f32,
    pose: &Pose,
    half: Vec3,
    margin: f32,
    out: &mut Vec<Overlap>,
) {
    // alternate projections converge for segment vs convex box
    let mut t = 0.5f32;
    let d = s1 - s0;
    let dd = d.length_squared();
    for _ in 0..4 {
        let p = s0 + d * t;
        let q = pose.transform_point(pose.inverse_transform_point(p).clamp(-half, half));
        t = if dd > 1e-12 { ((q - s0).dot(d) / dd).clamp(0.0, 1.0) } else { 0.0 };
    }
    for c in [s0, s1, s0 + d * t] {
        if let Some(o) = Narrowphase::overlap_sphere_box(c, r + margin, pose, half) {
            push_unique(out, Overlap { depth: o.depth - margin, ..o });
        }
    }
}

fn box_box(pa: &Pose, ha: Vec3, pb: &Pose, hb: Vec3, margin: f32, out: &mut Vec<Overlap>) {
    let ra_m = Mat3::from_quat(pa.rotation);
    let rb_m = Mat3::from_quat(pb.rotation);
    let a_axes = [ra_m.x_axis, ra_m.y_axis, ra_m.z_axis];
    let b_axes = [rb_m.x_axis, rb_m.y_axis, rb_m.z_axis];
    let t = pb.position - pa.position;

    let extent = |axes: &[Vec3; 3], h: Vec3, l: Vec3| -> f32 {
        h.x * axes[0].dot(l).abs() + h.y * axes[1].dot(l).abs() + h.z * axes[2].dot(l).abs()
    };

    // (overlap, axis, kind): kind 0..3 face of A, 3..6 face of B, 6.. edge pair
    let mut best: Option<(f32, Vec3, usize)> = None;
    let test = |l: Vec3, kind: usize, best: &mut Option<(f32, Vec3, usize)>| -> bool {
        let len = l.length();
        if len < 1e-6 {
            return true;
        }
        let l = l / len;
        let overlap = extent(&a_axes, ha, l) + extent(&b_axes, hb, l) - t.dot(l).abs();
        if overlap < -margin {
            return false;
        }
        // prefer face axes over nearly equal edge axes
        let biased = if kind >= 6 { overlap * 1.05 + 1e-4 } else { overlap };
        if best.is_none_or(|(o, _, k)| biased < if k >= 6 { o * 1.05 + 1e-4 } else { o }) {
            *best = Some((overlap, l, kind));
        }
        true
    };

    for (i, ax) in a_axes.iter().enumerate() {
        if !test(*ax, i, &mut best) {
            return;
        }
    }
    for (i, bx) in b_axes.iter().enumerate() {
        if !test(*bx, 3 + i, &mut best) {
            return;
        }
    }
    for (i, ax) in a_axes.iter().enumerate() {
        for (j, bx) in b_axes.iter().enumerate() {
            if !test(ax.cross(*bx), 6 + i * 3 + j, &mut best) {
                return;
            }
        }
    }
    let Some((overlap, axis, kind)) = best else { return };
    // normal from B into A
    let n = if t.dot(axis) > 0.0 { -axis } else { axis };

    if kind < 6 {
        let ra_n = extent(&a_axes, ha, n);
        let rb_n = extent(&b_axes, hb, n);
        let slack = Vec3::splat(margin + 1e-4);
        for v in box_vertices(pb, hb) {
            let local = pa.inverse_transform_point(v);
            if Narrowphase::overlap_point_aabb(local, Vec3::ZERO, ha + slack) {
                let depth = (ra_n - (v - pa.position).dot(-n)).min(overlap);
                push_unique(out, Overlap { normal: n, depth, contact: v - n * (depth * 0.5) });
            }
        }
        for v in box_vertices(pa, ha) {
            let local = pb.inverse_transform_point(v);
            if Narrowphase::overlap_point_aabb(local, Vec3::ZERO, hb + slack) {
                let depth = (rb_n - (v - pb.position).dot(n)).min(overlap);
                push_unique(out, Overlap { normal: n, depth, contact: v + n * (depth * 0.5) });
            }
        }
        if !out.is_empty() {
            return;
        }
    }

    // edge-edge: supporting edges along the crossed axes
    let (i, j) = if kind >= 6 { ((kind - 6) / 3, (kind - 6) % 3) } else { (0, 0) };
    let mut ca = pa.position;
    for (k, ax) in a_axes.iter().enumerate() {
        if k != i {
            ca += *ax * ha[k] * ax.dot(-n).signum();
        }
    }
    let mut cb = pb.position;
    for (k, bx) in b_axes.iter().enumerate() {
        if k != j {
            cb += *bx * hb[k] * bx.dot(n).signum();
        }
    }
    let ea = a_axes[i] * ha[i];
    let eb = b_axes[j] * hb[j];
    let (p, q) = closest_segment_segment(ca - ea, ca + ea, cb - eb, cb + eb);
    out.push(Overlap { normal: n, depth: overlap, contact: (p + q) * 0.5 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_overlap_sphere_sphere_basic() {
        let o = Narrowphase::overlap_sphere_sphere(Vec3::ZERO, 1.0, Vec3::X, 1.0).unwrap();
        assert!((o.depth - 1.0).abs() < 1e-5);
        // Normal points from B into A
        assert!((o.normal.x + 1.0).abs() < 1e-5);
        let apart = Vec3::new(2.1, 0.0, 0.0);
        assert!(Narrowphase::overlap_sphere_sphere(Vec3::ZERO, 1.0, apart, 1.0).is_none());
    }

    #[test]
    fn test_ray_aabb_hit_and_parallel_miss() {
        let min = Vec3::splat(-1.0);
        let max = Vec3::splat(1.0);
        let hit = Narrowphase::ray_aabb(Vec3::new(-5.0, 0.0, 0.0), Vec3::X, min, max).unwrap();
        assert!((hit.toi - 4.0).abs() < 1e-5);
        assert!((hit.normal.x + 1.0).abs() < 1e-5);
        assert!(Narrowphase::ray_aabb(Vec3::new(-5.0, 2.0, 0.0), Vec3::X, min, max).is_none());
        // pointing away
        assert!(Narrowphase::ray_aabb(Vec3::new(-5.0, 0.0, 0.0), -Vec3::X, min, max).is_none());
    }

    #[test]
    fn test_ray_sphere_and_capsule() {
        let origin = Vec3::new(-3.0, 0.0, 0.0);
        let hit = Narrowphase::ray_sphere(origin, Vec3::X, Vec3::ZERO, 1.0).unwrap();
        assert!((hit.contact.x + 1.0).abs() < 1e-5);
        assert!((hit.normal.x + 1.0).abs() < 1e-5);

        let a = Vec3::new(0.0, 0.0, -1.0);
        let b = Vec3::new(0.0, 0.0, 1.0);
        let side = Narrowphase::ray_capsule(Vec3::new(-3.0, 0.0, 0.5), Vec3::X, a, b, 0.5).unwrap();
        assert!((side.toi - 2.5).abs() < 1e-4);
        assert!((side.normal.x + 1.0).abs() < 1e-4);
        let top = Narrowphase::ray_capsule(Vec3::new(0.0, 0.0, 5.0), -Vec3::Z, a, b, 0.5).unwrap();
        assert!((top.toi - 3.5).abs() < 1e-4);
    }

    #[test]
    fn test_ray_plane_from_above() {
        let hit = Narrowphase::ray_shape(
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(0.0, 0.0, -10.0),
            &Shape::Plane,
            &Pose::IDENTITY,
        )
        .unwrap();
        assert!((hit.toi - 0.4).abs() < 1e-5);
        assert_eq!(hit.normal, Vec3::Z);
        let above = Vec3::new(0.0, 0.0, 4.0);
        assert!(Narrowphase::ray_shape(above, Vec3::Z, &Shape::Plane, &Pose::IDENTITY).is_none());
    }

    #[test]
    fn test_sphere_resting_on_plane() {
        let mut out = Vec::new();
        Narrowphase::collide(
            &Shape::Sphere { radius: 0.5 },
            &Pose::from_position(Vec3::new(0.0, 0.0, 0.49)),
            &Shape::Plane,
            &Pose::IDENTITY,
            0.0,
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert!((out[0].depth - 0.01).abs() < 1e-5);
        assert_eq!(out[0].normal, Vec3::Z);
        // mirrored pair flips the normal
        out.clear();
        Narrowphase::collide(
            &Shape::Plane,
            &Pose::IDENTITY,
            &Shape::Sphere { radius: 0.5 },
            &Pose::from_position(Vec3::new(0.0, 0.0, 0.49)),
            0.0,
            &mut out,
        );
        assert_eq!(out[0].normal, -Vec3::Z);
    }

    #[test]
    fn test_box_on_plane_four_points() {
        let mut out = Vec::new();
        Narrowphase::collide(
            &Shape::Box { half: Vec3::splat(0.5) },
            &Pose::from_position(Vec3::new(0.0, 0.0, 0.45)),
            &Shape::Plane,
            &Pose::IDENTITY,
            0.01,
            &mut out,
        );
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|o| (o.depth - 0.05).abs() < 1e-5));
    }

    #[test]
    fn test_box_stack_contacts() {
        let mut out = Vec::new();
        Narrowphase::collide(
            &Shape::Box { half: Vec3::splat(0.5) },
            &Pose::from_position(Vec3::new(0.0, 0.0, 0.95)),
            &Shape::Box { half: Vec3::new(4.0, 4.0, 0.5) },
            &Pose::IDENTITY,
            0.0,
            &mut out,
        );
        assert_eq!(out.len(), 4);
        for o in &out {
            assert!((o.normal - Vec3::Z).length() < 1e-5);
            assert!((o.depth - 0.05).abs() < 1e-4);
        }
    }

    #[test]
    fn test_box_box_separated() {
        let mut out = Vec::new();
        Narrowphase::collide(
            &Shape::Box { half: Vec3::splat(0.5) },
            &Pose::new(Vec3::new(1.2, 0.0, 0.0), Quat::from_rotation_z(0.3)),
            &Shape::Box { half: Vec3::splat(0.5) },
            &Pose::IDENTITY,
            0.0,
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_sphere_inside_box_exits_nearest_face() {
        let o = Narrowphase::overlap_sphere_box(
            Vec3::new(0.0, 0.0, 0.8),
            0.5,
            &Pose::IDENTITY,
            Vec3::splat(1.0),
        )
        .unwrap();
        assert!((o.normal - Vec3::Z).length() < 1e-5);
        assert!((o.depth - 0.7).abs() < 1e-5);
    }

    #[test]
    fn test_sweep_sphere_head_on() {
        let hit = Narrowphase::sweep_sphere_sphere(
            Vec3::new(-3.0, 0.0, 0.0),
            1.0,
            Vec3::new(5.0, 0.0, 0.0),
            Vec3::ZERO,
            1.0,
        )
        .unwrap();
        assert!((hit.toi - 0.2).abs() < 1e-5);
        assert!((hit.normal.x + 1.0).abs() < 1e-5);
        assert!((hit.contact.x + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sweep_through_thin_plane() {
        let hit = Narrowphase::sweep_sphere(
            Vec3::new(0.0, 0.0, 5.0),
            0.1,
            Vec3::new(0.0, 0.0, -20.0),
            &Shape::Plane,
            &Pose::IDENTITY,
        )
        .unwrap();
        assert!((hit.toi - 4.9 / 20.0).abs() < 1e-5);
        // already overlapping: discrete contacts handle it
        let resting =
            Narrowphase::sweep_sphere(Vec3::ZERO, 0.5, -Vec3::Z, &Shape::Plane, &Pose::IDENTITY);
        assert!(resting.is_none());
    }

    #[test]
    fn test_closest_segments_crossing() {
        let (p, q) = closest_segment_segment(
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, -1.0, 1.0),
            Vec3::new(0.0, 1.0, 1.0),
        );
        assert!(p.length() < 1e-5);
        assert!((q - Vec3::Z).length() < 1e-5);
    }
}
