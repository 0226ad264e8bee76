//! Sequential-impulse contact solver for one island.
//!
//! Normal impulses accumulate and are clamped non-negative; the two friction
//! directions are box-clamped by `friction * normal impulse`. Constraint
//! contacts are bilateral and frictionless.

use glam::Vec3;
use tracing::trace;

use crate::config::SolverConfig;
use crate::contact::{Contact, ContactFlags};
use crate::math::tangent_basis;
use crate::types::EntityId;

/// Access to the bodies of the island being solved.
///
/// Unknown ids and static entities behave as immovable: zero velocity,
/// zero response, impulses ignored.
pub trait IslandBodies {
    fn velocity_at(&self, entity: EntityId, body: u16, p: Vec3) -> Vec3;

    /// Velocity change at `p` along `dir` per unit impulse along `dir` at `p`.
    fn response(&self, entity: EntityId, body: u16, p: Vec3, dir: Vec3) -> f32;

    fn apply_impulse(&mut self, entity: EntityId, body: u16, impulse: Vec3, p: Vec3);
}

#[derive(Copy, Clone, Debug, Default)]
struct Row {
    tangents: [Vec3; 2],
    k_normal: f32,
    k_tangent: [f32; 2],
    target: f32,
    active: bool,
}

/// Per-worker solver workspace.
#[derive(Default)]
pub struct SolverScratch {
    rows: Vec<Row>,
}

fn relative_velocity(bodies: &impl IslandBodies, c: &Contact) -> Vec3 {
    bodies.velocity_at(c.entities[0], c.bodies[0], c.point)
        - bodies.velocity_at(c.entities[1], c.bodies[1], c.point)
}

fn push(bodies: &mut impl IslandBodies, c: &Contact, impulse: Vec3) {
    bodies.apply_impulse(c.entities[0], c.bodies[0], impulse, c.point);
    bodies.apply_impulse(c.entities[1], c.bodies[1], -impulse, c.point);
}

fn effective(bodies: &impl IslandBodies, c: &Contact, dir: Vec3) -> f32 {
    bodies.response(c.entities[0], c.bodies[0], c.point, dir)
        + bodies.response(c.entities[1], c.bodies[1], c.point, dir)
}

/// Solve `contacts` in place over one sub-step of length `h`. Accumulated
/// impulses are left in the contacts.
pub fn solve_contacts(
    contacts: &mut [Contact],
    bodies: &mut impl IslandBodies,
    h: f32,
    cfg: &SolverConfig,
    scratch: &mut SolverScratch,
) {
    if contacts.is_empty() || !(h > 0.0) {
        return;
    }
    let rows = &mut scratch.rows;
    rows.clear();
    rows.reserve(contacts.len());

    for c in contacts.iter_mut() {
        let mut row = Row::default();
        let k = effective(bodies, c, c.normal);
        if !(k > 1e-9) {
            rows.push(row);
            continue;
        }
        row.active = true;
        row.k_normal = k;
        let vn = relative_velocity(bodies, c).dot(c.normal);
        if c.flags.contains(ContactFlags::CONSTRAINT) {
            row.target = c.target_vrel;
        } else {
            let (t0, t1) = tangent_basis(c.normal);
            row.tangents = [t0, t1];
            row.k_tangent = [effective(bodies, c, t0), effective(bodies, c, t1)];
            row.target = if c.depth < 0.0 {
                // speculative: allow closing the gap within this sub-step
                c.depth / h
            } else {
                let mut target = 0.0f32;
                if -vn > cfg.min_bounce_speed && c.bounciness > 0.0 {
                    target = -vn * c.bounciness;
                }
                let excess = c.depth - cfg.allowed_penetration;
                if excess > 0.0 {
                    let mut recovery = cfg.penetration_recovery;
                    if c.flags.contains(ContactFlags::COMPLIANT) {
                        recovery *= 0.5;
                    }
                    target = target.max((recovery * excess / h).min(cfg.max_recovery_speed));
                }
                target.max(c.target_vrel)
            };
        }

        // warm start from the archived impulse
        if c.flags.contains(ContactFlags::PRESERVE_IMPULSE) && c.impulse != 0.0 {
            c.impulse *= cfg.warm_start;
            if !c.flags.contains(ContactFlags::CONSTRAINT) {
                c.impulse = c.impulse.max(0.0);
            }
            push(bodies, c, c.normal * c.impulse);
        } else {
            c.impulse = 0.0;
        }
        c.tangent_impulse = [0.0; 2];
        rows.push(row);
    }

    for _ in 0..cfg.iterations {
        for (c, row) in contacts.iter_mut().zip(rows.iter()) {
            if !row.active {
                continue;
            }
            let vn = relative_velocity(bodies, c).dot(c.normal);
            let mut delta = (row.target - vn) / row.k_normal;
            let old = c.impulse;
            c.impulse = if c.flags.contains(ContactFlags::CONSTRAINT) {
                old + delta
            } else {
                (old + delta).max(0.0)
            };
            delta = c.impulse - old;
            if delta != 0.0 {
                push(bodies, c, c.normal * delta);
            }

            if c.friction <= 0.0 || c.flags.contains(ContactFlags::CONSTRAINT) {
                continue;
            }
            let bound = c.friction * c.impulse;
            for k in 0..2 {
                if !(row.k_tangent[k] > 1e-9) {
                    continue;
                }
                let t = row.tangents[k];
                let vt = relative_velocity(bodies, c).dot(t);
                let old = c.tangent_impulse[k];
                c.tangent_impulse[k] = (old - vt / row.k_tangent[k]).clamp(-bound, bound);
                let d = c.tangent_impulse[k] - old;
                if d != 0.0 {
                    push(bodies, c, t * d);
                }
            }
        }
    }
    trace!(contacts = contacts.len(), iterations = cfg.iterations, "island contacts solved");
}

/// Constraints whose combined impulse exceeded their breaking threshold:
/// `(entity, slot)` pairs, deduplicated.
pub fn broken_constraints(contacts: &[Contact]) -> Vec<(EntityId, u8)> {
    let mut sums: Vec<(EntityId, u8, f32, f32)> = Vec::new();
    for c in contacts {
        let Some(slot) = c.constraint_slot else { continue };
        if !c.flags.contains(ContactFlags::CONSTRAINT) || c.max_impulse <= 0.0 {
            continue;
        }
        match sums.iter_mut().find(|(e, s, _, _)| *e == c.entities[0] && *s == slot) {
            Some(entry) => entry.2 += c.impulse * c.impulse,
            None => sums.push((c.entities[0], slot, c.impulse * c.impulse, c.max_impulse)),
        }
    }
    sums.into_iter().filter(|(_, _, sq, max)| sq.sqrt() > *max).map(|(e, s, _, _)| (e, s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::RigidBody;
    use glam::Quat;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Bodies(HashMap<EntityId, RigidBody>);

    impl IslandBodies for Bodies {
        fn velocity_at(&self, entity: EntityId, _body: u16, p: Vec3) -> Vec3 {
            self.0.get(&entity).map_or(Vec3::ZERO, |b| b.velocity_at(p))
        }

        fn response(&self, entity: EntityId, _body: u16, p: Vec3, dir: Vec3) -> f32 {
            self.0.get(&entity).map_or(0.0, |b| b.response(p, dir))
        }

        fn apply_impulse(&mut self, entity: EntityId, _body: u16, impulse: Vec3, p: Vec3) {
            if let Some(b) = self.0.get_mut(&entity) {
                b.apply_impulse(impulse, p);
            }
        }
    }

    fn falling_ball(v: Vec3) -> Bodies {
        let mut b = RigidBody::new(1.0, Vec3::splat(0.1), Vec3::new(0.0, 0.0, 0.5), Quat::IDENTITY);
        b.set_velocity(v, Vec3::ZERO);
        Bodies(HashMap::from([(1, b)]))
    }

    fn solve(contacts: &mut [Contact], bodies: &mut Bodies) {
        let cfg = SolverConfig::default();
        solve_contacts(contacts, bodies, 0.01, &cfg, &mut SolverScratch::default());
    }

    fn ground_contact(friction: f32, bounciness: f32) -> Contact {
        Contact {
            entities: [1, 2],
            point: Vec3::ZERO,
            normal: Vec3::Z,
            depth: 0.0,
            friction,
            bounciness,
            ..Contact::default()
        }
    }

    #[test]
    fn test_resting_contact_stops_approach() {
        let mut bodies = falling_ball(Vec3::new(0.0, 0.0, -3.0));
        let mut contacts = [ground_contact(0.0, 0.0)];
        solve(&mut contacts, &mut bodies);
        let v = bodies.0[&1].linear_velocity();
        assert!(v.z.abs() < 1e-4, "{v:?}");
        assert!((contacts[0].impulse - 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_bounce_above_threshold_only() {
        let cfg = SolverConfig { min_bounce_speed: 1.0, ..SolverConfig::default() };
        let mut bodies = falling_ball(Vec3::new(0.0, 0.0, -4.0));
        let mut contacts = [ground_contact(0.0, 0.5)];
        solve_contacts(&mut contacts, &mut bodies, 0.01, &cfg, &mut SolverScratch::default());
        assert!((bodies.0[&1].linear_velocity().z - 2.0).abs() < 1e-3);

        let mut slow = falling_ball(Vec3::new(0.0, 0.0, -0.5));
        let mut contacts = [ground_contact(0.0, 0.5)];
        solve_contacts(&mut contacts, &mut slow, 0.01, &cfg, &mut SolverScratch::default());
        assert!(slow.0[&1].linear_velocity().z.abs() < 1e-4);
    }

    #[test]
    fn test_friction_respects_cone() {
        // sliding fast: friction removes at most mu * normal impulse
        let mut bodies = falling_ball(Vec3::new(5.0, 0.0, -1.0));
        let mut contacts = [ground_contact(0.5, 0.0)];
        contacts[0].point = Vec3::ZERO;
        solve(&mut contacts, &mut bodies);
        let c = &contacts[0];
        let t = (c.tangent_impulse[0].powi(2) + c.tangent_impulse[1].powi(2)).sqrt();
        assert!(t <= 0.5 * c.impulse * std::f32::consts::SQRT_2 + 1e-4);
        assert!(bodies.0[&1].linear_velocity().x < 5.0);
        assert!(bodies.0[&1].linear_velocity().x > 0.0);
    }

    #[test]
    fn test_speculative_contact_allows_closing() {
        // 0.1 gap, 5 m/s approach, h = 0.01: may close 0.1 / 0.01 = 10 m/s
        let mut bodies = falling_ball(Vec3::new(0.0, 0.0, -5.0));
        let mut contacts = [Contact { depth: -0.1, ..ground_contact(0.0, 0.0) }];
        solve(&mut contacts, &mut bodies);
        assert_eq!(contacts[0].impulse, 0.0);
        // 30 m/s would tunnel: clamped to the gap speed
        let mut fast = falling_ball(Vec3::new(0.0, 0.0, -30.0));
        let mut contacts = [Contact { depth: -0.1, ..ground_contact(0.0, 0.0) }];
        solve(&mut contacts, &mut fast);
        assert!((fast.0[&1].linear_velocity().z + 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_constraint_rows_are_bilateral_and_break() {
        // ball pulled away from a world pivot
        let mut bodies = falling_ball(Vec3::new(0.0, 0.0, 2.0));
        let mut contacts = [Contact {
            normal: Vec3::Z,
            flags: ContactFlags::CONSTRAINT,
            friction: 0.0,
            max_impulse: 1.0,
            constraint_slot: Some(3),
            ..ground_contact(0.0, 0.0)
        }];
        solve(&mut contacts, &mut bodies);
        assert!(bodies.0[&1].linear_velocity().z.abs() < 1e-4);
        assert!(contacts[0].impulse < 0.0);
        assert_eq!(broken_constraints(&contacts), vec![(1, 3)]);
        contacts[0].max_impulse = 10.0;
        assert!(broken_constraints(&contacts).is_empty());
    }
}
