use glam::Vec3;

use crate::broadphase::RayQuery;
use crate::commands::{Action, EntityParams};
use crate::entity::{EntityDesc, EntityStatus};
use crate::error::PhysResult;
use crate::geometry::Pose;
use crate::narrowphase::{Overlap, SweepHit};
use crate::snapshot::EntitySnapshot;
use crate::types::*;

/// Public API contract of the simulation world.
///
/// Every method takes `&self`: the world synchronizes internally, so one
/// instance can be shared between the stepping thread and gameplay threads.
pub trait PhysicsWorldApi {
    // --- Entity lifecycle --------------------------------------------------

    /// Create an entity and insert it into the grid.
    fn create_entity(&self, desc: EntityDesc) -> PhysResult<EntityId>;

    /// Destroy an entity. Deferred until after the step if it is being stepped.
    fn destroy_entity(&self, id: EntityId) -> PhysResult<()>;

    // --- Parameters and actions ------------------------------------------

    /// Apply a typed parameter block, now or after the running step.
    fn set_params(&self, id: EntityId, params: EntityParams) -> PhysResult<()>;

    /// Read back pose, velocity, class and per-joint state.
    fn get_status(&self, id: EntityId) -> PhysResult<EntityStatus>;

    /// Typed action request (impulse, drive, reset, wake, constraints).
    fn action(&self, id: EntityId, action: Action) -> PhysResult<()>;

    // --- Stepping --------------------------------------------------------

    /// Advance the world by `dt` seconds.
    fn time_step(&self, dt: f32);

    // --- Queries ---------------------------------------------------------

    /// Trace a ray immediately.
    fn ray_query(&self, query: &RayQuery) -> RayResult;

    /// Defer a ray until the next `trace_pending_queries`.
    fn queue_ray_query(&self, query: RayQuery) -> QueryTicket;

    /// Trace every queued ray, in submission order.
    fn trace_pending_queries(&self) -> Vec<(QueryTicket, RayResult)>;

    /// Entities whose grid boxes overlap `[min, max]`, filtered by class.
    fn box_query(&self, min: Vec3, max: Vec3, type_mask: EntityTypeMask) -> Vec<EntityId>;

    // --- State exchange --------------------------------------------------

    fn snapshot(&self, id: EntityId) -> PhysResult<EntitySnapshot>;

    fn restore(&self, id: EntityId, snapshot: &EntitySnapshot) -> PhysResult<()>;

    /// Drain and return the events accumulated since the last call.
    fn drain_events(&self) -> Vec<PhysEvent>;
}

/// Primitive intersection signatures.
pub trait NarrowphaseApi {
    // Rays ------------------------------------------------------------------

    fn ray_aabb(origin: Vec3, dir: Vec3, aabb_min: Vec3, aabb_max: Vec3) -> Option<SweepHit>;
    fn ray_sphere(origin: Vec3, dir: Vec3, center: Vec3, r: f32) -> Option<SweepHit>;
    fn ray_capsule(origin: Vec3, dir: Vec3, a: Vec3, b: Vec3, r: f32) -> Option<SweepHit>;
    fn ray_obb(origin: Vec3, dir: Vec3, pose: &Pose, half: Vec3) -> Option<SweepHit>;
    fn ray_plane(origin: Vec3, dir: Vec3, point: Vec3, normal: Vec3) -> Option<SweepHit>;

    // Overlaps --------------------------------------------------------------

    fn overlap_sphere_sphere(c0: Vec3, r0: f32, c1: Vec3, r1: f32) -> Option<Overlap>;
    fn overlap_sphere_box(c: Vec3, r: f32, pose: &Pose, half: Vec3) -> Option<Overlap>;
    fn overlap_sphere_capsule(c: Vec3, r: f32, a: Vec3, b: Vec3, cr: f32) -> Option<Overlap>;
    fn overlap_capsule_capsule(
        a0: Vec3,
        a1: Vec3,
        ra: f32,
        b0: Vec3,
        b1: Vec3,
        rb: f32,
    ) -> Option<Overlap>;
    fn overlap_point_aabb(p: Vec3, c: Vec3, h: Vec3) -> bool;

    // Sweeps (sphere moving by `delta` against a static target) -------------

    fn sweep_sphere_sphere(c0: Vec3, r0: f32, delta: Vec3, c1: Vec3, r1: f32) -> Option<SweepHit>;
    fn sweep_sphere_box(c: Vec3, r: f32, delta: Vec3, pose: &Pose, half: Vec3) -> Option<SweepHit>;
    fn sweep_sphere_capsule(
        c: Vec3,
        r: f32,
        delta: Vec3,
        a: Vec3,
        b: Vec3,
        cr: f32,
    ) -> Option<SweepHit>;
    fn sweep_sphere_plane(
        c: Vec3,
        r: f32,
        delta: Vec3,
        point: Vec3,
        normal: Vec3,
    ) -> Option<SweepHit>;
}

/// Material lookup consumed by contact generation and ray classification.
pub trait SurfaceTable: Send + Sync {
    fn surface(&self, material: MaterialId) -> SurfaceProps;

    /// Friction of a material pair. Geometric mean by default.
    fn pair_friction(&self, a: MaterialId, b: MaterialId) -> f32 {
        (self.surface(a).friction * self.surface(b).friction).max(0.0).sqrt()
    }

    /// Bounciness of a material pair. The larger value wins by default.
    fn pair_bounciness(&self, a: MaterialId, b: MaterialId) -> f32 {
        let (sa, sb) = (self.surface(a), self.surface(b));
        if sa.flags.contains(SurfaceFlags::NO_BOUNCE)
            || sb.flags.contains(SurfaceFlags::NO_BOUNCE)
        {
            0.0
        } else {
            sa.bounciness.max(sb.bounciness)
        }
    }
}

/// Fixed table indexed by material id; unknown ids get the fallback entry.
#[derive(Clone, Debug, Default)]
pub struct DefaultSurfaceTable {
    pub surfaces: Vec<SurfaceProps>,
    pub fallback: SurfaceProps,
}

impl DefaultSurfaceTable {
    pub fn new(surfaces: Vec<SurfaceProps>) -> Self {
        Self { surfaces, fallback: SurfaceProps::default() }
    }
}

impl SurfaceTable for DefaultSurfaceTable {
    fn surface(&self, material: MaterialId) -> SurfaceProps {
        self.surfaces.get(material as usize).copied().unwrap_or(self.fallback)
    }
}

/// Streams entities for a grid cell the first time a query touches it.
pub trait RegionStreamer: Send + Sync {
    fn populate_cell(&self, ix: u32, iy: u32) -> Vec<EntityDesc>;
}

/// Receives events as they are flushed at the end of a tick.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &PhysEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_combination() {
        let t = DefaultSurfaceTable::new(vec![
            SurfaceProps { friction: 0.25, bounciness: 0.1, ..Default::default() },
            SurfaceProps { friction: 1.0, bounciness: 0.6, ..Default::default() },
            SurfaceProps {
                friction: 1.0,
                bounciness: 0.9,
                flags: SurfaceFlags::NO_BOUNCE,
                ..Default::default()
            },
        ]);
        assert!((t.pair_friction(0, 1) - 0.5).abs() < 1e-6);
        assert!((t.pair_bounciness(0, 1) - 0.6).abs() < 1e-6);
        assert_eq!(t.pair_bounciness(1, 2), 0.0);
        assert_eq!(t.surface(77), SurfaceProps::default());
    }
}
