use bitflags::bitflags;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Stable per-entity id, valid for cross-system references and save/load.
pub type EntityId = u32;

/// Index of a geometry part within its entity.
pub type PartIndex = u16;

/// Surface material id, resolved through a [`crate::api::SurfaceTable`].
pub type MaterialId = u16;

/// Bitmask-based pair filtering between parts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionFilter {
    /// Layer(s) this part belongs to.
    pub layer: u32,
    /// Layers this part wants to collide with.
    pub collides_with: u32,
    /// Extra mask to exclude (applied after `collides_with`).
    pub exclude: u32,
}

impl Default for CollisionFilter {
    fn default() -> Self {
        Self { layer: 1, collides_with: u32::MAX, exclude: 0 }
    }
}

impl CollisionFilter {
    pub fn simple(layer: u32, collides_with: u32) -> Self {
        Self { layer, collides_with, exclude: 0 }
    }

    /// A may hit B iff `(A.collides_with & B.layer) != 0` and `(A.exclude & B.layer) == 0`.
    pub fn allows(self, other: CollisionFilter) -> bool {
        let hit = (self.collides_with & other.layer) != 0;
        let blocked = (self.exclude & other.layer) != 0;
        hit && !blocked
    }

    /// Both sides must consent.
    pub fn mutual(self, other: CollisionFilter) -> bool {
        self.allows(other) && other.allows(self)
    }
}

/// World-space axis-aligned box.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb { min: Vec3::splat(f32::MAX), max: Vec3::splat(f32::MIN) };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half(center: Vec3, half: Vec3) -> Self {
        Self { min: center - half, max: center + half }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    pub fn expanded(&self, margin: f32) -> Aabb {
        Aabb { min: self.min - Vec3::splat(margin), max: self.max + Vec3::splat(margin) }
    }

    /// Box swept along `delta`.
    pub fn swept(&self, delta: Vec3) -> Aabb {
        Aabb {
            min: self.min.min(self.min + delta),
            max: self.max.max(self.max + delta),
        }
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }
}

/// Simulation class of an entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimClass {
    Static,
    Sleeping,
    Awake,
    /// Stepped outside the island solver (placeholders, host-driven proxies).
    Independent,
    Deleted,
}

impl SimClass {
    pub fn type_bit(self) -> EntityTypeMask {
        match self {
            SimClass::Static => EntityTypeMask::STATIC,
            SimClass::Sleeping => EntityTypeMask::SLEEPING,
            SimClass::Awake => EntityTypeMask::AWAKE,
            SimClass::Independent => EntityTypeMask::INDEPENDENT,
            SimClass::Deleted => EntityTypeMask::empty(),
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, SimClass::Sleeping | SimClass::Awake)
    }
}

bitflags! {
    /// Entity-class filter used by box and ray queries.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EntityTypeMask: u8 {
        const STATIC      = 1 << 0;
        const SLEEPING    = 1 << 1;
        const AWAKE       = 1 << 2;
        const INDEPENDENT = 1 << 3;
        const DYNAMIC     = Self::SLEEPING.bits() | Self::AWAKE.bits();
        const ALL         = 0x0f;
    }
}

bitflags! {
    /// Surface behaviour flags carried by [`SurfaceProps`].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SurfaceFlags: u8 {
        /// Piercing hits on this surface are kept ahead of ordinary ones.
        const IMPORTANT = 1 << 0;
        /// Contacts on this surface never bounce.
        const NO_BOUNCE = 1 << 1;
    }
}

/// Per-material surface properties, supplied by the surface table collaborator.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceProps {
    pub friction: f32,
    pub bounciness: f32,
    /// 0 never pierced; higher values are pierced by queries with a lower threshold.
    pub pierceability: u8,
    pub flags: SurfaceFlags,
}

impl Default for SurfaceProps {
    fn default() -> Self {
        Self { friction: 0.5, bounciness: 0.0, pierceability: 0, flags: SurfaceFlags::empty() }
    }
}

/// One ray intersection.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RayHit {
    pub entity: EntityId,
    pub part: PartIndex,
    pub distance: f32,
    pub point: Vec3,
    pub normal: Vec3,
    pub material: MaterialId,
    /// True if the surface let the ray through.
    pub piercing: bool,
}

/// Result of one ray query: the blocking hit (if any) plus piercing hits in
/// front of it, ordered by distance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RayResult {
    pub blocking: Option<RayHit>,
    pub piercing: Vec<RayHit>,
}

impl RayResult {
    pub fn hit_count(&self) -> usize {
        self.piercing.len() + usize::from(self.blocking.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.hit_count() == 0
    }

    /// Closest hit of any kind.
    pub fn first(&self) -> Option<&RayHit> {
        let p = self.piercing.first();
        match (p, self.blocking.as_ref()) {
            (Some(p), Some(b)) if p.distance < b.distance => Some(p),
            (_, Some(b)) => Some(b),
            (p, None) => p,
        }
    }
}

/// Handle returned for a queued ray query.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryTicket(pub u64);

/// Notifications emitted by the world after each tick (and by some API calls).
#[derive(Clone, Debug, PartialEq)]
pub enum PhysEvent {
    Collision {
        entities: [EntityId; 2],
        parts: [PartIndex; 2],
        point: Vec3,
        normal: Vec3,
        impulse: f32,
        materials: [MaterialId; 2],
    },
    SleepChanged { entity: EntityId, sleeping: bool },
    ConstraintBroken { entity: EntityId, constraint_id: u32 },
    EntityCreated { entity: EntityId },
    EntityDeleted { entity: EntityId },
}

/// Counters describing the last completed tick.
#[derive(Copy, Clone, Debug, Default)]
pub struct WorldStats {
    pub entities: usize,
    pub awake: usize,
    pub islands: usize,
    pub contacts: usize,
    pub thunks: usize,
    pub queued_commands: usize,
    pub step_backs: usize,
}

/// Timing breakdown for the last completed tick.
#[derive(Copy, Clone, Debug, Default)]
pub struct WorldTiming {
    pub step_ms: f64,
    pub islands_ms: f64,
    pub solve_ms: f64,
    pub reposition_ms: f64,
    pub replay_ms: f64,
}
