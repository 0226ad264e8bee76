use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use glam::Vec3;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::articulated::{ArticulatedCore, RootMode};
use crate::body::RigidBody;
use crate::config::WorldConfig;
use crate::error::{ensure_finite, ensure_finite_vec, PhysError, PhysResult};
use crate::geometry::{Part, Pose};
use crate::grid::ThunkHandle;
use crate::joint::{JointDesc, JointFlags};
use crate::rigid::{RigidCore, SleepState};
use crate::types::{Aabb, EntityId, SimClass};

/// What an entity is, independent of its current simulation class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Static,
    Rigid,
    Articulated,
    /// Stand-in geometry; queries that hit it report `buddy` instead.
    Placeholder { buddy: EntityId },
}

/// Per-entity simulation tunables.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimParams {
    /// Linear and angular damping rate (1/s).
    pub damping: f32,
    pub gravity_scale: f32,
}

impl Default for SimParams {
    fn default() -> Self {
        Self { damping: 0.0, gravity_scale: 1.0 }
    }
}

impl SimParams {
    pub fn validate(&self) -> PhysResult<()> {
        ensure_finite("sim.damping", self.damping)?;
        ensure_finite("sim.gravity_scale", self.gravity_scale)?;
        if self.damping < 0.0 {
            return Err(PhysError::invalid("sim.damping", "must not be negative"));
        }
        Ok(())
    }
}

/// Everything needed to create an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityDesc {
    pub kind: EntityKind,
    pub pose: Pose,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub velocity: Vec3,
    #[serde(default)]
    pub angular_velocity: Vec3,
    #[serde(default)]
    pub sim: SimParams,
    #[serde(default)]
    pub joints: Vec<JointDesc>,
    #[serde(default = "default_root")]
    pub root: RootMode,
    #[serde(default)]
    pub start_asleep: bool,
}

fn default_root() -> RootMode {
    RootMode::Free
}

impl EntityDesc {
    fn base(kind: EntityKind, pose: Pose, parts: Vec<Part>) -> Self {
        Self {
            kind,
            pose,
            parts,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            sim: SimParams::default(),
            joints: Vec::new(),
            root: RootMode::Free,
            start_asleep: false,
        }
    }

    pub fn rigid(pose: Pose, parts: Vec<Part>) -> Self {
        Self::base(EntityKind::Rigid, pose, parts)
    }

    pub fn static_geometry(pose: Pose, parts: Vec<Part>) -> Self {
        Self::base(EntityKind::Static, pose, parts)
    }

    pub fn articulated(
        pose: Pose,
        parts: Vec<Part>,
        joints: Vec<JointDesc>,
        root: RootMode,
    ) -> Self {
        Self { joints, root, ..Self::base(EntityKind::Articulated, pose, parts) }
    }

    pub fn placeholder(pose: Pose, parts: Vec<Part>, buddy: EntityId) -> Self {
        Self::base(EntityKind::Placeholder { buddy }, pose, parts)
    }

    pub fn with_velocity(mut self, linear: Vec3, angular: Vec3) -> Self {
        self.velocity = linear;
        self.angular_velocity = angular;
        self
    }

    pub fn with_sim(mut self, sim: SimParams) -> Self {
        self.sim = sim;
        self
    }

    pub fn asleep(mut self) -> Self {
        self.start_asleep = true;
        self
    }

    /// Reject malformed descriptors before anything is allocated.
    pub fn validate(&self, id: EntityId) -> PhysResult<()> {
        if !self.pose.is_finite() {
            return Err(PhysError::NonFinite("pose"));
        }
        ensure_finite_vec("velocity", self.velocity)?;
        ensure_finite_vec("angular_velocity", self.angular_velocity)?;
        self.sim.validate()?;
        if self.parts.is_empty() && !matches!(self.kind, EntityKind::Placeholder { .. }) {
            return Err(PhysError::invalid("parts", "entity needs at least one part"));
        }
        let dynamic = matches!(self.kind, EntityKind::Rigid | EntityKind::Articulated);
        for (index, part) in self.parts.iter().enumerate() {
            part.shape.validate()?;
            let bad_mass = !part.mass.is_finite() || part.mass < 0.0;
            if bad_mass || !part.local.is_finite() || (dynamic && part.shape.is_unbounded()) {
                return Err(PhysError::InvalidPart { entity: id, index });
            }
        }
        match self.kind {
            EntityKind::Placeholder { buddy } if buddy == id => {
                Err(PhysError::invalid("buddy", "placeholder cannot stand in for itself"))
            }
            EntityKind::Articulated if self.joints.is_empty() => {
                Err(PhysError::invalid("joints", "articulated entity needs at least one joint"))
            }
            _ => Ok(()),
        }
    }
}

/// Motion state carried by dynamic entities.
#[derive(Clone, Debug)]
pub enum Dynamics {
    None,
    Rigid(RigidCore),
    Articulated(Box<ArticulatedCore>),
}

/// Read-back of one joint.
#[derive(Clone, Debug, PartialEq)]
pub struct JointStatus {
    pub angles: Vec3,
    pub q_dot: Vec3,
    pub flags: JointFlags,
    pub frame: Pose,
}

/// Read-back of one entity.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityStatus {
    pub id: EntityId,
    pub kind: EntityKind,
    pub class: SimClass,
    pub pose: Pose,
    pub bbox: Aabb,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub mass: f32,
    pub kinetic_energy: f32,
    pub contacts: usize,
    pub constraint_mask: u32,
    pub joints: Vec<JointStatus>,
}

pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub class: SimClass,
    pub parts: Vec<Part>,
    /// Entity frame: body frame for rigid entities, placement for grounded
    /// trees, root frame for free trees.
    pub pose: Pose,
    pub bbox: Aabb,
    pub thunk: ThunkHandle,
    pub dynamics: Dynamics,
}

impl Entity {
    pub fn new(id: EntityId, desc: &EntityDesc) -> PhysResult<Self> {
        desc.validate(id)?;
        let dynamics = match desc.kind {
            EntityKind::Static | EntityKind::Placeholder { .. } => Dynamics::None,
            EntityKind::Rigid => {
                let mut core =
                    RigidCore::new(&desc.parts, &desc.pose, desc.velocity, desc.angular_velocity);
                core.damping = desc.sim.damping;
                core.gravity_scale = desc.sim.gravity_scale;
                Dynamics::Rigid(core)
            }
            EntityKind::Articulated => {
                let mut core = ArticulatedCore::new(
                    id,
                    &desc.joints,
                    &desc.parts,
                    desc.pose,
                    desc.root,
                    desc.velocity,
                    desc.angular_velocity,
                )?;
                core.damping = desc.sim.damping;
                Dynamics::Articulated(Box::new(core))
            }
        };
        let class = match desc.kind {
            EntityKind::Static => SimClass::Static,
            EntityKind::Placeholder { .. } => SimClass::Independent,
            _ if desc.start_asleep => SimClass::Sleeping,
            _ => SimClass::Awake,
        };
        let mut entity = Self {
            id,
            kind: desc.kind,
            class,
            parts: desc.parts.clone(),
            pose: desc.pose,
            bbox: Aabb::EMPTY,
            thunk: ThunkHandle::EMPTY,
            dynamics,
        };
        if class == SimClass::Sleeping {
            entity.stop();
        }
        entity.sync_pose();
        Ok(entity)
    }

    pub fn is_dynamic(&self) -> bool {
        !matches!(self.dynamics, Dynamics::None)
    }

    pub fn is_awake(&self) -> bool {
        self.class == SimClass::Awake
    }

    pub fn buddy(&self) -> Option<EntityId> {
        match self.kind {
            EntityKind::Placeholder { buddy } => Some(buddy),
            _ => None,
        }
    }

    pub fn host(&self) -> Option<EntityId> {
        match &self.dynamics {
            Dynamics::Articulated(a) => a.host(),
            _ => None,
        }
    }

    pub fn rigid(&self) -> Option<&RigidCore> {
        match &self.dynamics {
            Dynamics::Rigid(r) => Some(r),
            _ => None,
        }
    }

    pub fn rigid_mut(&mut self) -> Option<&mut RigidCore> {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => Some(r),
            _ => None,
        }
    }

    pub fn articulated(&self) -> Option<&ArticulatedCore> {
        match &self.dynamics {
            Dynamics::Articulated(a) => Some(a),
            _ => None,
        }
    }

    pub fn articulated_mut(&mut self) -> Option<&mut ArticulatedCore> {
        match &mut self.dynamics {
            Dynamics::Articulated(a) => Some(a),
            _ => None,
        }
    }

    /// Body `index` (joint index for articulated entities).
    pub fn body(&self, index: u16) -> Option<&RigidBody> {
        match &self.dynamics {
            Dynamics::Rigid(r) => Some(&r.body),
            Dynamics::Articulated(a) => a.joints.get(index as usize).map(|j| &j.body),
            Dynamics::None => None,
        }
    }

    /// Body a part moves with.
    pub fn body_of_part(&self, part: usize) -> u16 {
        match &self.dynamics {
            Dynamics::Articulated(_) => {
                self.parts.get(part).and_then(|p| p.joint).unwrap_or(0) as u16
            }
            _ => 0,
        }
    }

    pub fn part_pose(&self, index: usize) -> Pose {
        let Some(part) = self.parts.get(index) else { return self.pose };
        match &self.dynamics {
            Dynamics::Articulated(a) => a.part_pose(part),
            _ => self.pose.compose(&part.local),
        }
    }

    /// Re-derive the entity frame from the dynamic state and rebuild the bbox.
    pub fn sync_pose(&mut self) {
        match &self.dynamics {
            Dynamics::Rigid(r) => self.pose = r.entity_pose(),
            Dynamics::Articulated(a) => {
                self.pose = if a.mode == RootMode::Free { a.root_frame() } else { a.placement };
            }
            Dynamics::None => {}
        }
        self.refresh_bbox();
    }

    pub fn refresh_bbox(&mut self) {
        let mut bbox = Aabb::EMPTY;
        for i in 0..self.parts.len() {
            bbox = bbox.union(&self.parts[i].shape.bounds(&self.part_pose(i)));
        }
        if bbox.is_empty() {
            bbox = Aabb::new(self.pose.position, self.pose.position);
        }
        self.bbox = bbox;
    }

    /// Upper bound on the speed of any point of the entity.
    pub fn max_point_speed(&self) -> f32 {
        let extent = self.bbox.half_extents().length() * 2.0;
        let speed = |b: &RigidBody| {
            b.linear_velocity().length() + b.angular_velocity().length() * extent
        };
        match &self.dynamics {
            Dynamics::Rigid(r) => speed(&r.body),
            Dynamics::Articulated(a) => a.joints.iter().map(|j| speed(&j.body)).fold(0.0, f32::max),
            Dynamics::None => 0.0,
        }
    }

    /// Bounding box grown to cover motion over `h`, plus `margin`.
    pub fn swept_bbox(&self, h: f32, margin: f32) -> Aabb {
        if self.bbox.is_empty() {
            return self.bbox;
        }
        self.bbox.expanded(self.max_point_speed() * h + margin)
    }

    pub fn velocity_at(&self, body: u16, p: Vec3) -> Vec3 {
        match &self.dynamics {
            Dynamics::Rigid(r) => r.body.velocity_at(p),
            Dynamics::Articulated(a) => a.velocity_at(body as usize, p),
            Dynamics::None => Vec3::ZERO,
        }
    }

    pub fn response(&self, body: u16, p: Vec3, dir: Vec3) -> f32 {
        match &self.dynamics {
            Dynamics::Rigid(r) => r.body.response(p, dir),
            Dynamics::Articulated(a) => a.response(body as usize, p, dir),
            Dynamics::None => 0.0,
        }
    }

    pub fn apply_impulse(&mut self, body: u16, impulse: Vec3, p: Vec3) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => r.body.apply_impulse(impulse, p),
            Dynamics::Articulated(a) => a.apply_impulse(body as usize, impulse, p),
            Dynamics::None => {}
        }
    }

    /// Queue an impulse for the next velocity update.
    pub fn add_impulse(&mut self, body: u16, impulse: Vec3, at: Option<Vec3>, angular: Vec3) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => {
                let at = at.unwrap_or(r.body.position);
                r.add_impulse(impulse, at);
                r.add_angular_impulse(angular);
            }
            Dynamics::Articulated(a) => {
                let j = (body as usize).min(a.len() - 1);
                let at = at.unwrap_or(a.joints[j].body.position);
                a.add_impulse(j, impulse, at);
            }
            Dynamics::None => {}
        }
    }

    pub fn linear_velocity(&self) -> Vec3 {
        self.body(0).map_or(Vec3::ZERO, RigidBody::linear_velocity)
    }

    pub fn angular_velocity(&self) -> Vec3 {
        self.body(0).map_or(Vec3::ZERO, RigidBody::angular_velocity)
    }

    pub fn mass(&self) -> f32 {
        match &self.dynamics {
            Dynamics::Rigid(r) => r.body.mass(),
            Dynamics::Articulated(a) => a.total_mass(),
            Dynamics::None => 0.0,
        }
    }

    pub fn kinetic_energy(&self) -> f32 {
        match &self.dynamics {
            Dynamics::Rigid(r) => r.body.kinetic_energy(),
            Dynamics::Articulated(a) => a.kinetic_energy(),
            Dynamics::None => 0.0,
        }
    }

    pub fn energy_per_mass(&self) -> f32 {
        match &self.dynamics {
            Dynamics::Rigid(r) => r.energy_per_mass(),
            Dynamics::Articulated(a) => a.energy_per_mass(),
            Dynamics::None => 0.0,
        }
    }

    pub fn sleep_state_mut(&mut self) -> Option<&mut SleepState> {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => Some(&mut r.sleep),
            Dynamics::Articulated(a) => Some(&mut a.sleep),
            Dynamics::None => None,
        }
    }

    pub fn has_buoyancy(&self) -> bool {
        self.rigid().is_some_and(|r| r.buoyancy != Vec3::ZERO)
    }

    pub fn constraint_mask(&self) -> u32 {
        self.rigid().map_or(0, RigidCore::constraint_mask)
    }

    /// Partners of point constraints (world constraints excluded).
    pub fn constraint_partners(&self) -> Vec<EntityId> {
        self.rigid()
            .map(|r| r.constraints.iter().flatten().filter_map(|c| c.other).collect())
            .unwrap_or_default()
    }

    pub fn stop(&mut self) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => r.body.stop(),
            Dynamics::Articulated(a) => a.stop(),
            Dynamics::None => {}
        }
    }

    pub fn set_pose(&mut self, pose: &Pose) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => r.set_entity_pose(pose),
            Dynamics::Articulated(a) => a.set_root_pose(pose),
            Dynamics::None => self.pose = *pose,
        }
        self.sync_pose();
    }

    pub fn set_velocity(&mut self, linear: Vec3, angular: Vec3) -> PhysResult<()> {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => {
                r.body.set_velocity(linear, angular);
                Ok(())
            }
            Dynamics::Articulated(a) => a.set_root_velocity(linear, angular),
            Dynamics::None => Err(PhysError::Unsupported("velocity of a non-dynamic entity")),
        }
    }

    pub fn set_sim(&mut self, sim: &SimParams) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => {
                r.damping = sim.damping;
                r.gravity_scale = sim.gravity_scale;
            }
            Dynamics::Articulated(a) => a.damping = sim.damping,
            Dynamics::None => {}
        }
    }

    /// Velocity integration over `h`, before contacts. `host` is the host
    /// body of a tree grounded on another entity.
    pub fn step_velocity(&mut self, h: f32, cfg: &WorldConfig, host: Option<&RigidBody>) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => {
                r.integrate_velocity(cfg.gravity, h, &cfg.solver);
            }
            Dynamics::Articulated(a) => a.step_velocity(h, cfg.gravity, &cfg.articulation, host),
            Dynamics::None => {}
        }
    }

    /// Position integration over `h`, after contacts.
    pub fn step_position(
        &mut self,
        h: f32,
        cfg: &WorldConfig,
        host_frame: Option<Pose>,
        host: Option<&RigidBody>,
    ) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => {
                r.cap_velocity(&cfg.solver);
                r.integrate_position(h);
            }
            Dynamics::Articulated(a) => {
                a.step_position(h, &cfg.articulation, host_frame, host);
            }
            Dynamics::None => {}
        }
        self.sync_pose();
    }

    pub fn save(&mut self) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => r.save(),
            Dynamics::Articulated(a) => a.save(),
            Dynamics::None => {}
        }
    }

    pub fn restore(&mut self) {
        match &mut self.dynamics {
            Dynamics::Rigid(r) => r.restore(),
            Dynamics::Articulated(a) => a.restore(),
            Dynamics::None => {}
        }
        self.sync_pose();
    }

    pub fn status(&self) -> EntityStatus {
        let joints = self
            .articulated()
            .map(|a| {
                a.joints
                    .iter()
                    .map(|j| JointStatus {
                        angles: j.angles,
                        q_dot: j.q_dot,
                        flags: j.flags,
                        frame: j.frame,
                    })
                    .collect()
            })
            .unwrap_or_default();
        EntityStatus {
            id: self.id,
            kind: self.kind,
            class: self.class,
            pose: self.pose,
            bbox: self.bbox,
            velocity: self.linear_velocity(),
            angular_velocity: self.angular_velocity(),
            mass: self.mass(),
            kinetic_energy: self.kinetic_energy(),
            contacts: 0,
            constraint_mask: self.constraint_mask(),
            joints,
        }
    }
}

/// Table entry: the entity behind its own lock plus step bookkeeping.
pub struct EntitySlot {
    entity: Mutex<Entity>,
    /// Set while the entity belongs to an island being stepped.
    pub in_step: AtomicBool,
    pub pending_delete: AtomicBool,
}

impl EntitySlot {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity: Mutex::new(entity),
            in_step: AtomicBool::new(false),
            pending_delete: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Entity> {
        self.entity.lock()
    }

    pub fn is_in_step(&self) -> bool {
        self.in_step.load(Ordering::Acquire)
    }

    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }
}

/// Id-keyed entity storage.
pub struct EntityTable {
    slots: RwLock<HashMap<EntityId, Arc<EntitySlot>>>,
    next_id: AtomicU32,
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityTable {
    pub fn new() -> Self {
        Self { slots: RwLock::new(HashMap::new()), next_id: AtomicU32::new(1) }
    }

    pub fn allocate_id(&self) -> EntityId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, entity: Entity) -> Arc<EntitySlot> {
        let id = entity.id;
        let slot = Arc::new(EntitySlot::new(entity));
        self.slots.write().insert(id, Arc::clone(&slot));
        slot
    }

    pub fn get(&self, id: EntityId) -> Option<Arc<EntitySlot>> {
        self.slots.read().get(&id).cloned()
    }

    /// Like `get`, but entities awaiting deletion count as gone.
    pub fn live(&self, id: EntityId) -> PhysResult<Arc<EntitySlot>> {
        let slot = self.get(id).ok_or(PhysError::UnknownEntity(id))?;
        if slot.is_pending_delete() {
            return Err(PhysError::EntityDeleted(id));
        }
        Ok(slot)
    }

    pub fn remove(&self, id: EntityId) -> Option<Arc<EntitySlot>> {
        self.slots.write().remove(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All slots, sorted by id.
    pub fn all(&self) -> Vec<(EntityId, Arc<EntitySlot>)> {
        let mut out: Vec<_> =
            self.slots.read().iter().map(|(id, s)| (*id, Arc::clone(s))).collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Shape;
    use crate::joint::JointParams;
    use glam::Quat;

    fn ball(z: f32) -> EntityDesc {
        let parts = vec![Part::new(Shape::Sphere { radius: 0.5 }, 1.0)];
        EntityDesc::rigid(Pose::from_position(Vec3::new(0.0, 0.0, z)), parts)
    }

    #[test]
    fn test_rigid_entity_bbox_and_class() {
        let e = Entity::new(1, &ball(10.0)).unwrap();
        assert_eq!(e.class, SimClass::Awake);
        assert!((e.bbox.min - Vec3::new(-0.5, -0.5, 9.5)).length() < 1e-5);
        assert!((e.bbox.max - Vec3::new(0.5, 0.5, 10.5)).length() < 1e-5);
        let sleeper = ball(3.0).with_velocity(Vec3::X, Vec3::ZERO).asleep();
        let asleep = Entity::new(2, &sleeper).unwrap();
        assert_eq!(asleep.class, SimClass::Sleeping);
        assert_eq!(asleep.linear_velocity(), Vec3::ZERO);
    }

    #[test]
    fn test_descriptor_rejections() {
        let mut bad = ball(1.0);
        bad.parts[0].mass = -1.0;
        assert!(matches!(
            Entity::new(3, &bad),
            Err(PhysError::InvalidPart { entity: 3, index: 0 })
        ));

        let plane_body = EntityDesc::rigid(Pose::IDENTITY, vec![Part::new(Shape::Plane, 0.0)]);
        assert!(matches!(Entity::new(4, &plane_body), Err(PhysError::InvalidPart { .. })));

        let mut nan = ball(1.0);
        nan.velocity = Vec3::new(f32::NAN, 0.0, 0.0);
        assert!(matches!(Entity::new(5, &nan), Err(PhysError::NonFinite(_))));

        let selfish = EntityDesc::placeholder(Pose::IDENTITY, vec![], 6);
        assert!(Entity::new(6, &selfish).is_err());
    }

    #[test]
    fn test_static_plane_is_unbounded() {
        let desc = EntityDesc::static_geometry(Pose::IDENTITY, vec![Part::new(Shape::Plane, 0.0)]);
        let e = Entity::new(1, &desc).unwrap();
        assert!(!e.is_dynamic());
        assert_eq!(e.bbox.max.x, f32::INFINITY);
        assert_eq!(e.response(0, Vec3::ZERO, Vec3::Z), 0.0);
    }

    #[test]
    fn test_articulated_parts_follow_joints() {
        let joints = vec![
            JointDesc::new(None, Vec3::ZERO).with_params(JointParams::hinge(0)),
            JointDesc::new(Some(0), Vec3::new(0.0, 1.0, 0.0)).with_params(JointParams::hinge(0)),
        ];
        let upright = Quat::from_rotation_x(std::f32::consts::FRAC_PI_2);
        let parts = vec![
            Part::new(Shape::Capsule { radius: 0.1, half_height: 0.4 }, 1.0)
                .with_local(Pose::new(Vec3::new(0.0, 0.5, 0.0), upright))
                .on_joint(0),
            Part::new(Shape::Sphere { radius: 0.2 }, 1.0)
                .with_local(Pose::from_position(Vec3::new(0.0, 0.5, 0.0)))
                .on_joint(1),
        ];
        let pose = Pose::from_position(Vec3::new(0.0, 0.0, 5.0));
        let desc = EntityDesc::articulated(pose, parts, joints, RootMode::Fixed);
        let e = Entity::new(9, &desc).unwrap();
        assert_eq!(e.body_of_part(1), 1);
        let p = e.part_pose(1).position;
        assert!((p - Vec3::new(0.0, 1.5, 5.0)).length() < 1e-5, "{p:?}");
        assert_eq!(e.status().joints.len(), 2);
        assert_eq!(e.pose.position, Vec3::new(0.0, 0.0, 5.0));
    }

    #[test]
    fn test_table_ids_and_deletion_flag() {
        let table = EntityTable::new();
        let a = table.allocate_id();
        let b = table.allocate_id();
        assert_ne!(a, b);
        table.insert(Entity::new(a, &ball(1.0)).unwrap());
        let slot = table.insert(Entity::new(b, &ball(2.0)).unwrap());
        assert_eq!(table.all().iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![a, b]);
        slot.pending_delete.store(true, Ordering::Release);
        assert!(matches!(table.live(b), Err(PhysError::EntityDeleted(_))));
        assert!(matches!(table.live(99), Err(PhysError::UnknownEntity(99))));
        assert!(table.remove(a).is_some());
        assert_eq!(table.len(), 1);
    }
}
