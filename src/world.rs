//! The world facade: owns the grid, the entity table, the contact registry and
//! the worker pool, and runs the per-tick pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, debug_span, info, trace, trace_span, warn};

use crate::api::{DefaultSurfaceTable, EventSink, PhysicsWorldApi, RegionStreamer, SurfaceTable};
use crate::articulated::RootMode;
use crate::body::RigidBody;
use crate::broadphase::{
    query_box, trace_ray, HitBuffer, QueryScratch, RayFlags, RayHooks, RayQuery,
};
use crate::commands::{Action, Command, CommandQueue, EntityParams};
use crate::config::WorldConfig;
use crate::contact::{Contact, ContactFlags, ContactKey, ContactRegistry};
use crate::entity::{Entity, EntityDesc, EntitySlot, EntityStatus, EntityTable};
use crate::error::{PhysError, PhysResult};
use crate::geometry::{PartFlags, Pose, Shape};
use crate::grid::SpatialGrid;
use crate::island::{Island, IslandBuilder};
use crate::narrowphase::Narrowphase;
use crate::rigid::PointConstraint;
use crate::scheduler::{StepScheduler, ThreadContext};
use crate::snapshot::EntitySnapshot;
use crate::solver::{broken_constraints, solve_contacts, IslandBodies};
use crate::types::*;

#[derive(Default)]
struct EventLog {
    queue: Vec<PhysEvent>,
    /// Events not yet handed to the sink.
    outbox: Vec<PhysEvent>,
    dropped: usize,
}

/// Multi-threaded rigid and articulated body world.
pub struct PhysicsWorld {
    cfg: WorldConfig,
    grid: RwLock<SpatialGrid>,
    entities: EntityTable,
    contacts: ContactRegistry,
    scheduler: StepScheduler,
    commands: CommandQueue,
    /// Held while a tick clears its in-step flags and replays the queue.
    replay_gate: Mutex<()>,
    events: Mutex<EventLog>,
    surfaces: Arc<dyn SurfaceTable>,
    streamer: Option<Arc<dyn RegionStreamer>>,
    sink: Option<Arc<dyn EventSink>>,
    pending_rays: Mutex<Vec<(QueryTicket, RayQuery)>>,
    next_ticket: AtomicU64,
    stats: Mutex<WorldStats>,
    timing: Mutex<WorldTiming>,
}

impl PhysicsWorld {
    /// Validate `cfg`, start the worker pool and build an empty grid. The
    /// calling thread becomes the one allowed to stream regions in.
    pub fn new(cfg: WorldConfig) -> PhysResult<Self> {
        cfg.validate()?;
        let scheduler = StepScheduler::new(&cfg.threads, cfg.limits.max_candidates)?;
        info!(
            cells_x = cfg.grid.cells_x,
            cells_y = cfg.grid.cells_y,
            cell_size = cfg.grid.cell_size,
            workers = scheduler.workers(),
            "physics world created"
        );
        Ok(Self {
            grid: RwLock::new(SpatialGrid::new(cfg.grid.clone())),
            entities: EntityTable::new(),
            contacts: ContactRegistry::new(cfg.limits.max_contacts),
            scheduler,
            commands: CommandQueue::new(cfg.limits.max_queued_commands),
            replay_gate: Mutex::new(()),
            events: Mutex::new(EventLog::default()),
            surfaces: Arc::new(DefaultSurfaceTable::default()),
            streamer: None,
            sink: None,
            pending_rays: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(1),
            stats: Mutex::new(WorldStats::default()),
            timing: Mutex::new(WorldTiming::default()),
            cfg,
        })
    }

    pub fn with_surfaces(mut self, surfaces: Arc<dyn SurfaceTable>) -> Self {
        self.surfaces = surfaces;
        self
    }

    pub fn with_streamer(mut self, streamer: Arc<dyn RegionStreamer>) -> Self {
        self.streamer = Some(streamer);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &WorldConfig {
        &self.cfg
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Counters from the last completed tick.
    pub fn stats(&self) -> WorldStats {
        *self.stats.lock()
    }

    /// Timing breakdown of the last tick, when `enable_timing` is set.
    pub fn timing(&self) -> Option<WorldTiming> {
        self.cfg.enable_timing.then(|| *self.timing.lock())
    }

    fn push_event(&self, event: PhysEvent) {
        let mut log = self.events.lock();
        if log.queue.len() >= self.cfg.limits.max_events {
            log.dropped += 1;
            if log.dropped == 1 {
                let max = self.cfg.limits.max_events;
                warn!(max, "event queue full; dropping events until drained");
            }
            return;
        }
        if self.sink.is_some() {
            log.outbox.push(event.clone());
        }
        log.queue.push(event);
    }

    fn flush_events(&self) {
        let Some(sink) = &self.sink else { return };
        let outbox = std::mem::take(&mut self.events.lock().outbox);
        for event in &outbox {
            sink.on_event(event);
        }
    }

    fn reposition(&self, e: &mut Entity) {
        e.thunk = self.grid.write().reposition(e.thunk, e.id, &e.bbox, e.class);
    }

    /// Wake a sleeping entity. Awake entities only restart their sleep counter.
    fn wake(&self, e: &mut Entity) {
        if let Some(s) = e.sleep_state_mut() {
            s.wake();
        }
        if e.class != SimClass::Sleeping {
            return;
        }
        e.class = SimClass::Awake;
        self.grid.write().set_class(e.thunk, SimClass::Awake);
        trace!(entity = e.id, "woken");
        self.push_event(PhysEvent::SleepChanged { entity: e.id, sleeping: false });
    }

    /// The replay gate, if `slot` is still inside a step once it is held.
    /// Requests queued under it are replayed by the tick that set the flag.
    fn step_gate(&self, slot: &EntitySlot) -> Option<MutexGuard<'_, ()>> {
        if !slot.is_in_step() {
            return None;
        }
        let gate = self.replay_gate.lock();
        slot.is_in_step().then_some(gate)
    }

    fn defer(&self, cmd: Command) {
        let entity = cmd.entity();
        if self.commands.push(cmd) {
            trace!(entity, "request queued behind running step");
        }
    }

    fn apply_params(&self, slot: &EntitySlot, params: EntityParams) -> PhysResult<()> {
        let mut e = slot.lock();
        let id = e.id;
        let wakes = params.wakes();
        match params {
            EntityParams::Pose(pose) => {
                e.set_pose(&pose);
                self.reposition(&mut e);
            }
            EntityParams::Velocity { linear, angular } => e.set_velocity(linear, angular)?,
            EntityParams::Simulation(sim) => e.set_sim(&sim),
            EntityParams::Joint { index, params } => {
                e.articulated_mut()
                    .ok_or(PhysError::Unsupported("joint parameters on an entity without joints"))?
                    .set_joint_params(id, index, params)?;
            }
            EntityParams::Material { part, material } => {
                let missing = PhysError::InvalidPart { entity: id, index: part };
                e.parts.get_mut(part).ok_or(missing)?.material = material;
            }
            EntityParams::Buoyancy(force) => {
                e.rigid_mut()
                    .ok_or(PhysError::Unsupported("buoyancy on a non-rigid entity"))?
                    .buoyancy = force;
            }
        }
        if wakes {
            self.wake(&mut e);
        }
        Ok(())
    }

    fn apply_action(&self, slot: &EntitySlot, action: Action) -> PhysResult<()> {
        let mut e = slot.lock();
        let id = e.id;
        let wakes = action.wakes();
        match action {
            Action::Impulse { impulse, point, angular, body } => {
                if !e.is_dynamic() {
                    return Err(PhysError::Unsupported("impulse on a non-dynamic entity"));
                }
                e.add_impulse(body, impulse, point, angular);
            }
            Action::SetVelocity { linear, angular } => e.set_velocity(linear, angular)?,
            Action::DriveJoint { joint, rates } => {
                e.articulated_mut()
                    .ok_or(PhysError::Unsupported("joint drive on an entity without joints"))?
                    .drive(id, joint, rates)?;
            }
            Action::Reset => e.stop(),
            Action::Wake => {}
            Action::AddConstraint { id: constraint_id, other, pivot, other_pivot, max_impulse } => {
                if let Some(o) = other {
                    if o == id {
                        let reason = "cannot constrain an entity to itself";
                        return Err(PhysError::invalid("other", reason));
                    }
                    self.entities.live(o)?;
                }
                let core = e
                    .rigid_mut()
                    .ok_or(PhysError::Unsupported("constraints on a non-rigid entity"))?;
                let c =
                    PointConstraint { id: constraint_id, other, pivot, other_pivot, max_impulse };
                if core.add_constraint(c).is_none() {
                    let constraint = constraint_id;
                    warn!(entity = id, constraint, "constraint slots full; constraint dropped");
                }
            }
            Action::RemoveConstraint { id: constraint_id } => {
                if let Some(core) = e.rigid_mut() {
                    core.remove_constraint(constraint_id);
                }
            }
        }
        if wakes {
            self.wake(&mut e);
        }
        Ok(())
    }

    fn apply_restore(&self, slot: &EntitySlot, snapshot: &EntitySnapshot) -> PhysResult<()> {
        let mut e = slot.lock();
        snapshot.apply(&mut e)?;
        if e.is_dynamic() {
            if snapshot.sleeping {
                e.stop();
                e.class = SimClass::Sleeping;
            } else {
                e.class = SimClass::Awake;
                if let Some(s) = e.sleep_state_mut() {
                    s.wake();
                }
            }
        }
        self.reposition(&mut e);
        Ok(())
    }

    fn destroy_now(&self, id: EntityId) {
        let Some(slot) = self.entities.remove(id) else { return };
        let thunk = {
            let mut e = slot.lock();
            e.class = SimClass::Deleted;
            e.thunk
        };
        self.grid.write().remove(thunk);
        self.contacts.release_entity(id);
        for (_, other) in self.entities.all() {
            if let Some(core) = other.lock().rigid_mut() {
                core.forget_partner(id);
            }
        }
        debug!(entity = id, "entity destroyed");
        self.push_event(PhysEvent::EntityDeleted { entity: id });
    }

    fn apply_command(&self, cmd: Command) {
        let entity = cmd.entity();
        let result = match cmd {
            Command::Destroy(id) => {
                self.destroy_now(id);
                Ok(())
            }
            Command::SetParams(id, params) => {
                self.entities.live(id).and_then(|s| self.apply_params(&s, params))
            }
            Command::Action(id, action) => {
                self.entities.live(id).and_then(|s| self.apply_action(&s, action))
            }
            Command::Restore(id, snapshot) => {
                self.entities.live(id).and_then(|s| self.apply_restore(&s, &snapshot))
            }
        };
        if let Err(err) = result {
            debug!(entity, error = %err, "queued request failed on replay");
        }
    }

    /// Apply queued requests in submission order until the queue is empty.
    fn replay_commands(&self) -> usize {
        let mut applied = 0;
        loop {
            let batch = self.commands.drain();
            if batch.is_empty() {
                return applied;
            }
            applied += batch.len();
            for cmd in batch {
                self.apply_command(cmd);
            }
        }
    }

    /// Ask the region streamer for a cell's entities, once per cell. Only the
    /// world's creating thread may stream, and never during a step.
    fn populate_cell(&self, ix: u32, iy: u32) {
        if !self.cfg.grid.physics_on_demand {
            return;
        }
        let Some(streamer) = &self.streamer else { return };
        if self.grid.read().is_populated(ix, iy) {
            return;
        }
        if !self.scheduler.is_pod_thread() || self.scheduler.is_stepping() {
            debug!(ix, iy, "cell population skipped off the streaming thread");
            return;
        }
        {
            let mut grid = self.grid.write();
            if grid.is_populated(ix, iy) {
                return;
            }
            grid.mark_populated(ix, iy);
        }
        for desc in streamer.populate_cell(ix, iy) {
            if let Err(err) = self.create_entity(desc) {
                warn!(ix, iy, error = %err, "streamed entity rejected");
            }
        }
    }

    fn populate_range(&self, min: Vec3, max: Vec3) {
        if !self.cfg.grid.physics_on_demand || self.streamer.is_none() {
            return;
        }
        let range = self.grid.read().cell_range(min, max);
        for (ix, iy) in range.cells() {
            self.populate_cell(ix, iy);
        }
    }

    /// Partition the awake entities. Sleeping dynamic entities reached through
    /// contacts, constraints, hosts or swept-box overlap are woken and joined.
    fn build_islands(&self, dt: f32) -> Vec<Island> {
        let margin = self.cfg.solver.contact_margin;
        let limit = self.cfg.limits.max_candidates;
        let mut builder = IslandBuilder::new();
        let mut work = Vec::new();
        for (id, slot) in self.entities.all() {
            if slot.is_pending_delete() {
                continue;
            }
            let e = slot.lock();
            if e.is_dynamic() && e.is_awake() {
                builder.add(id);
                work.push(id);
            }
        }

        let mut scratch = QueryScratch::with_capacity(64);
        let mut next = 0;
        while next < work.len() {
            let id = work[next];
            next += 1;
            let Some(slot) = self.entities.get(id) else { continue };
            let (swept, mut links) = {
                let e = slot.lock();
                let mut links = e.constraint_partners();
                links.extend(e.host());
                (e.swept_bbox(dt, margin), links)
            };
            links.extend(self.contacts.partners_of(id));
            if !swept.is_empty() {
                let grid = self.grid.read();
                let mask = EntityTypeMask::DYNAMIC;
                query_box(&grid, swept.min, swept.max, mask, limit, &mut scratch);
                links.extend_from_slice(&scratch.candidates);
            }
            for other in links {
                if other == id || other == 0 {
                    continue;
                }
                if builder.contains(other) {
                    builder.link(id, other);
                    continue;
                }
                let Some(other_slot) = self.entities.get(other) else { continue };
                if other_slot.is_pending_delete() {
                    continue;
                }
                let mut oe = other_slot.lock();
                if !oe.is_dynamic() {
                    continue;
                }
                if oe.class == SimClass::Sleeping {
                    self.wake(&mut oe);
                }
                if oe.is_awake() {
                    builder.add(other);
                    builder.link(id, other);
                    work.push(other);
                }
            }
        }
        builder.build()
    }

    fn step_island(
        &self,
        ctx: &mut ThreadContext,
        island: &Island,
        h: f32,
        n_sub: u32,
    ) -> IslandOutcome {
        let len = island.entities.len();
        let _span = trace_span!("island", first = ?island.entities.first(), len).entered();
        let slots: Vec<Arc<EntitySlot>> =
            island.entities.iter().filter_map(|id| self.entities.get(*id)).collect();
        let guards: Vec<MutexGuard<'_, Entity>> = slots.iter().map(|s| s.lock()).collect();
        let dt = h * n_sub as f32;
        let mut stepper = IslandStepper::new(self, guards, ctx, dt);
        stepper.run(ctx, h, n_sub);
        stepper.finish(ctx, dt)
    }

    /// Push the stepped entity's new bbox into the grid. Returns whether it is
    /// still awake.
    fn settle(&self, slot: &EntitySlot) -> bool {
        let mut e = slot.lock();
        if e.class == SimClass::Deleted {
            return false;
        }
        self.reposition(&mut e);
        e.is_awake()
    }
}

fn elapsed_ms(t: Option<Instant>) -> f64 {
    t.map(|t| t.elapsed().as_secs_f64() * 1000.0).unwrap_or(0.0)
}

impl PhysicsWorldApi for PhysicsWorld {
    fn create_entity(&self, desc: EntityDesc) -> PhysResult<EntityId> {
        let id = self.entities.allocate_id();
        let mut entity = Entity::new(id, &desc)
            .inspect_err(|err| debug!(error = %err, "entity descriptor rejected"))?;
        if let Some(host) = entity.host() {
            let slot = self.entities.live(host)?;
            let (frame, body) = {
                let h = slot.lock();
                (h.pose, h.rigid().map(|r| r.body.clone()))
            };
            if let Some(a) = entity.articulated_mut() {
                a.refresh(Some(frame), body.as_ref());
            }
            entity.sync_pose();
        }
        entity.thunk = self.grid.write().insert(id, &entity.bbox, entity.class);
        let kind = entity.kind;
        self.entities.insert(entity);
        debug!(entity = id, ?kind, "entity created");
        self.push_event(PhysEvent::EntityCreated { entity: id });
        Ok(id)
    }

    fn destroy_entity(&self, id: EntityId) -> PhysResult<()> {
        let slot = self.entities.live(id)?;
        if self.scheduler.is_stepping() {
            slot.pending_delete.store(true, Ordering::Release);
            if !self.commands.push(Command::Destroy(id)) {
                slot.pending_delete.store(false, Ordering::Release);
            }
            return Ok(());
        }
        self.destroy_now(id);
        Ok(())
    }

    fn set_params(&self, id: EntityId, params: EntityParams) -> PhysResult<()> {
        params
            .validate()
            .inspect_err(|err| debug!(entity = id, error = %err, "parameters rejected"))?;
        let slot = self.entities.live(id)?;
        if let Some(_gate) = self.step_gate(&slot) {
            self.defer(Command::SetParams(id, params));
            return Ok(());
        }
        self.apply_params(&slot, params)
    }

    fn get_status(&self, id: EntityId) -> PhysResult<EntityStatus> {
        let slot = self.entities.live(id)?;
        let mut status = slot.lock().status();
        status.contacts = self.contacts.contacts_of(id).len();
        Ok(status)
    }

    fn action(&self, id: EntityId, action: Action) -> PhysResult<()> {
        action.validate().inspect_err(|err| debug!(entity = id, error = %err, "action rejected"))?;
        let slot = self.entities.live(id)?;
        if let Some(_gate) = self.step_gate(&slot) {
            self.defer(Command::Action(id, action));
            return Ok(());
        }
        self.apply_action(&slot, action)
    }

    fn time_step(&self, dt: f32) {
        if !(dt.is_finite() && dt > 0.0) {
            warn!(dt, "ignoring non-positive or non-finite time step");
            return;
        }
        let _step = self.scheduler.begin_step();
        let _span = debug_span!("time_step", dt).entered();
        let timed = self.cfg.enable_timing;
        let t_all = timed.then(Instant::now);
        let n_sub = (dt / self.cfg.max_time_step).ceil().max(1.0) as u32;
        let h = dt / n_sub as f32;

        let t0 = timed.then(Instant::now);
        let islands = self.build_islands(dt);
        self.contacts.release_all();
        let stepped: Vec<Arc<EntitySlot>> = islands
            .iter()
            .flat_map(|i| i.entities.iter())
            .filter_map(|id| self.entities.get(*id))
            .collect();
        for slot in &stepped {
            slot.in_step.store(true, Ordering::Release);
        }
        let islands_ms = elapsed_ms(t0);

        let t1 = timed.then(Instant::now);
        let outcomes =
            self.scheduler.run(&islands, |ctx, island| self.step_island(ctx, island, h, n_sub));
        let solve_ms = elapsed_ms(t1);

        let t2 = timed.then(Instant::now);
        let mut step_backs = 0;
        for outcome in outcomes {
            step_backs += outcome.step_backs;
            for event in outcome.events {
                self.push_event(event);
            }
        }
        let awake = stepped.iter().filter(|slot| self.settle(slot)).count();
        let reposition_ms = elapsed_ms(t2);

        let t3 = timed.then(Instant::now);
        let mut replayed = self.replay_commands();
        {
            let _gate = self.replay_gate.lock();
            for slot in &stepped {
                slot.in_step.store(false, Ordering::Release);
            }
            replayed += self.replay_commands();
        }
        let replay_ms = elapsed_ms(t3);

        self.flush_events();
        let stats = WorldStats {
            entities: self.entities.len(),
            awake,
            islands: islands.len(),
            contacts: self.contacts.live_count(),
            thunks: self.grid.read().thunk_count(),
            queued_commands: replayed,
            step_backs,
        };
        debug!(islands = stats.islands, awake, contacts = stats.contacts, n_sub, "tick complete");
        *self.stats.lock() = stats;
        if timed {
            *self.timing.lock() = WorldTiming {
                step_ms: elapsed_ms(t_all),
                islands_ms,
                solve_ms,
                reposition_ms,
                replay_ms,
            };
        }
    }

    fn ray_query(&self, query: &RayQuery) -> RayResult {
        let mut traced = query.clone();
        traced.max_hits = traced.max_hits.clamp(1, self.cfg.limits.max_ray_hits.max(1));
        traced.substitutions.clear();
        let mut hooks = WorldRayHooks { world: self, query, len: query.dir.length() };
        let mut scratch = QueryScratch::with_capacity(64);
        trace_ray(&self.grid, &traced, self.cfg.limits.max_candidates, &mut scratch, &mut hooks)
    }

    fn queue_ray_query(&self, query: RayQuery) -> QueryTicket {
        let ticket = QueryTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        self.pending_rays.lock().push((ticket, query));
        ticket
    }

    fn trace_pending_queries(&self) -> Vec<(QueryTicket, RayResult)> {
        let pending = std::mem::take(&mut *self.pending_rays.lock());
        pending.into_iter().map(|(ticket, q)| (ticket, self.ray_query(&q))).collect()
    }

    fn box_query(&self, min: Vec3, max: Vec3, type_mask: EntityTypeMask) -> Vec<EntityId> {
        if !(min.is_finite() && max.is_finite()) {
            return Vec::new();
        }
        self.populate_range(min, max);
        let mut scratch = QueryScratch::with_capacity(64);
        let limit = self.cfg.limits.max_candidates;
        query_box(&self.grid.read(), min, max, type_mask, limit, &mut scratch);
        scratch
            .candidates
            .retain(|id| self.entities.get(*id).is_some_and(|s| !s.is_pending_delete()));
        scratch.candidates
    }

    fn snapshot(&self, id: EntityId) -> PhysResult<EntitySnapshot> {
        let slot = self.entities.live(id)?;
        let e = slot.lock();
        Ok(EntitySnapshot::capture(&e))
    }

    fn restore(&self, id: EntityId, snapshot: &EntitySnapshot) -> PhysResult<()> {
        let slot = self.entities.live(id)?;
        if let Some(_gate) = self.step_gate(&slot) {
            self.defer(Command::Restore(id, Box::new(snapshot.clone())));
            return Ok(());
        }
        self.apply_restore(&slot, snapshot)
    }

    fn drain_events(&self) -> Vec<PhysEvent> {
        let mut log = self.events.lock();
        log.dropped = 0;
        std::mem::take(&mut log.queue)
    }
}

struct WorldRayHooks<'a> {
    world: &'a PhysicsWorld,
    /// The caller's query, substitutions included.
    query: &'a RayQuery,
    len: f32,
}

impl RayHooks for WorldRayHooks<'_> {
    fn before_cell(&mut self, ix: u32, iy: u32) {
        self.world.populate_cell(ix, iy);
    }

    fn test_entity(&mut self, id: EntityId, buffer: &mut HitBuffer) {
        let Some(slot) = self.world.entities.get(id) else { return };
        if slot.is_pending_delete() {
            return;
        }
        let e = slot.lock();
        let reported = self.query.resolve(e.buddy().unwrap_or(id));
        if self.query.skip.contains(&reported) {
            return;
        }
        let needed = if self.query.flags.contains(RayFlags::COLLIDERS_ONLY) {
            PartFlags::COLLIDE
        } else {
            PartFlags::RAYCAST
        };
        for (index, part) in e.parts.iter().enumerate() {
            if !part.flags.contains(needed) {
                continue;
            }
            let pose = e.part_pose(index);
            let (origin, dir) = (self.query.origin, self.query.dir);
            let traced = Narrowphase::ray_shape(origin, dir, &part.shape, &pose);
            let Some(hit) = traced else { continue };
            let surface = self.world.surfaces.surface(part.material);
            let hit = RayHit {
                entity: reported,
                part: index as PartIndex,
                distance: hit.toi * self.len,
                point: hit.contact,
                normal: hit.normal,
                material: part.material,
                piercing: false,
            };
            buffer.offer(hit, &surface);
        }
    }
}

struct IslandOutcome {
    events: Vec<PhysEvent>,
    step_backs: usize,
}

/// One collidable part, posed for the current sub-step.
#[derive(Copy, Clone, Debug)]
struct PartView {
    entity: EntityId,
    part: PartIndex,
    body: u16,
    shape: Shape,
    pose: Pose,
    bounds: Aabb,
    material: MaterialId,
    filter: CollisionFilter,
}

fn part_views(e: &Entity, out: &mut Vec<PartView>) {
    for (index, part) in e.parts.iter().enumerate() {
        if !part.flags.contains(PartFlags::COLLIDE) {
            continue;
        }
        let pose = e.part_pose(index);
        out.push(PartView {
            entity: e.id,
            part: index as PartIndex,
            body: e.body_of_part(index),
            shape: part.shape,
            pose,
            bounds: part.shape.bounds(&pose),
            material: part.material,
            filter: part.filter,
        });
    }
}

fn pair_contact(surfaces: &dyn SurfaceTable, a: &PartView, b: &PartView) -> Contact {
    Contact {
        entities: [a.entity, b.entity],
        parts: [a.part, b.part],
        bodies: [a.body, b.body],
        materials: [a.material, b.material],
        friction: surfaces.pair_friction(a.material, b.material),
        bounciness: surfaces.pair_bounciness(a.material, b.material),
        ..Contact::default()
    }
}

/// Narrow phase for one part pair. Returns whether any point was produced.
fn push_contacts(
    surfaces: &dyn SurfaceTable,
    out: &mut Vec<Contact>,
    overlaps: &mut Vec<crate::narrowphase::Overlap>,
    a: &PartView,
    b: &PartView,
    margin: f32,
) -> bool {
    if !a.filter.mutual(b.filter) || !a.bounds.expanded(margin).overlaps(&b.bounds) {
        return false;
    }
    overlaps.clear();
    Narrowphase::collide(&a.shape, &a.pose, &b.shape, &b.pose, margin, overlaps);
    if overlaps.is_empty() {
        return false;
    }
    let base = pair_contact(surfaces, a, b);
    for o in overlaps.iter() {
        out.push(Contact { point: o.contact, normal: o.normal, depth: o.depth, ..base });
    }
    true
}

/// Swept-sphere test of a fast part against a static one. A hit becomes a
/// speculative contact that lets the part close the gap but not cross it.
fn push_swept_contact(
    surfaces: &dyn SurfaceTable,
    out: &mut Vec<Contact>,
    a: &PartView,
    b: &PartView,
    motion: Vec3,
) {
    if !a.filter.mutual(b.filter) {
        return;
    }
    let radius = a.shape.min_extent();
    let swept = Narrowphase::sweep_sphere(a.pose.position, radius, motion, &b.shape, &b.pose);
    let Some(hit) = swept else { return };
    let closing = motion.dot(hit.normal);
    if hit.toi > 1.0 || closing >= 0.0 {
        return;
    }
    out.push(Contact {
        point: hit.contact,
        normal: hit.normal,
        depth: hit.toi * closing,
        ..pair_contact(surfaces, a, b)
    });
}

type WarmKey = (ContactKey, bool);

fn warm_key(c: &Contact) -> WarmKey {
    (c.key(), c.flags.contains(ContactFlags::CONSTRAINT))
}

/// The locked entities of one island, addressed by id.
struct IslandSet<'g> {
    guards: Vec<MutexGuard<'g, Entity>>,
    index: HashMap<EntityId, usize>,
}

impl IslandBodies for IslandSet<'_> {
    fn velocity_at(&self, entity: EntityId, body: u16, p: Vec3) -> Vec3 {
        self.index.get(&entity).map_or(Vec3::ZERO, |&i| self.guards[i].velocity_at(body, p))
    }

    fn response(&self, entity: EntityId, body: u16, p: Vec3, dir: Vec3) -> f32 {
        self.index.get(&entity).map_or(0.0, |&i| self.guards[i].response(body, p, dir))
    }

    fn apply_impulse(&mut self, entity: EntityId, body: u16, impulse: Vec3, p: Vec3) {
        if let Some(&i) = self.index.get(&entity) {
            self.guards[i].apply_impulse(body, impulse, p);
        }
    }
}

/// Steps one island through every sub-step of a tick on the current worker.
struct IslandStepper<'w, 'g> {
    world: &'w PhysicsWorld,
    set: IslandSet<'g>,
    /// Rigid entities first, so hosts move before the trees riding them.
    order: Vec<usize>,
    statics: Vec<PartView>,
    /// Poses of hosts and constraint partners outside the island.
    external: HashMap<EntityId, Pose>,
    views: Vec<Vec<PartView>>,
    warm: HashMap<WarmKey, f32>,
    events: Vec<PhysEvent>,
    step_backs: usize,
}

impl<'w, 'g> IslandStepper<'w, 'g> {
    fn new(
        world: &'w PhysicsWorld,
        guards: Vec<MutexGuard<'g, Entity>>,
        ctx: &mut ThreadContext,
        dt: f32,
    ) -> Self {
        let index = guards.iter().enumerate().map(|(i, e)| (e.id, i)).collect();
        let set = IslandSet { guards, index };
        let mut order: Vec<usize> = (0..set.guards.len()).collect();
        order.sort_by_key(|&i| set.guards[i].articulated().is_some());
        let mut stepper = Self {
            world,
            set,
            order,
            statics: Vec::new(),
            external: HashMap::new(),
            views: Vec::new(),
            warm: HashMap::new(),
            events: Vec::new(),
            step_backs: 0,
        };
        stepper.collect_statics(ctx, dt);
        stepper.collect_external();
        stepper
    }

    fn collect_statics(&mut self, ctx: &mut ThreadContext, dt: f32) {
        let world = self.world;
        let margin = world.cfg.solver.contact_margin;
        let reach =
            self.set.guards.iter().fold(Aabb::EMPTY, |b, e| b.union(&e.swept_bbox(dt, margin)));
        if reach.is_empty() {
            return;
        }
        let limit = world.cfg.limits.max_candidates;
        let grid = world.grid.read();
        query_box(&grid, reach.min, reach.max, EntityTypeMask::STATIC, limit, &mut ctx.query);
        drop(grid);
        for &id in &ctx.query.candidates {
            let Some(slot) = world.entities.get(id) else { continue };
            let e = slot.lock();
            if e.class == SimClass::Static {
                part_views(&e, &mut self.statics);
            }
        }
    }

    fn collect_external(&mut self) {
        let mut wanted = Vec::new();
        for e in &self.set.guards {
            wanted.extend(e.host());
            wanted.extend(e.constraint_partners());
        }
        for id in wanted {
            if self.set.index.contains_key(&id) || self.external.contains_key(&id) {
                continue;
            }
            if let Some(slot) = self.world.entities.get(id) {
                let pose = slot.lock().pose;
                self.external.insert(id, pose);
            }
        }
    }

    fn host_index(&self, i: usize) -> Option<usize> {
        self.set.guards[i].host().and_then(|h| self.set.index.get(&h).copied())
    }

    fn host_state(&self, i: usize) -> (Option<Pose>, Option<RigidBody>) {
        let Some(host) = self.set.guards[i].host() else { return (None, None) };
        match self.set.index.get(&host) {
            Some(&k) => {
                let h = &self.set.guards[k];
                (Some(h.pose), h.rigid().map(|r| r.body.clone()))
            }
            None => (self.external.get(&host).copied(), None),
        }
    }

    fn run(&mut self, ctx: &mut ThreadContext, h: f32, n_sub: u32) {
        let max_backs = self.world.cfg.solver.max_step_backs as usize;
        let total = h * n_sub as f32;
        let mut remaining = total;
        let mut sub_h = h;
        while remaining > total * 1e-4 {
            let step = sub_h.min(remaining);
            if self.substep(ctx, step, self.step_backs < max_backs) {
                remaining -= step;
            } else {
                self.step_backs += 1;
                sub_h *= 0.5;
                debug!(h = sub_h, "penetration too deep; island stepped back");
            }
        }
    }

    /// One sub-step. Returns false if it was rolled back.
    fn substep(&mut self, ctx: &mut ThreadContext, h: f32, can_step_back: bool) -> bool {
        let world = self.world;
        if can_step_back {
            for e in self.set.guards.iter_mut() {
                e.save();
            }
        }
        self.integrate_velocities(h);
        self.generate_contacts(ctx, h);
        self.constraint_contacts(ctx, h);
        self.apply_warm_start(ctx);
        solve_contacts(&mut ctx.contacts, &mut self.set, h, &world.cfg.solver, &mut ctx.solver);
        if can_step_back && self.worst_penetration(ctx, h) > world.cfg.solver.step_back_depth {
            for e in self.set.guards.iter_mut() {
                e.restore();
            }
            return false;
        }
        self.record_impulses(ctx);
        self.break_constraints(ctx);
        self.integrate_positions(h);
        true
    }

    fn integrate_velocities(&mut self, h: f32) {
        let cfg = &self.world.cfg;
        for &i in &self.order {
            let host = self.host_index(i);
            let host_body = host.and_then(|k| self.set.guards[k].rigid().map(|r| r.body.clone()));
            self.set.guards[i].step_velocity(h, cfg, host_body.as_ref());
            let (Some(k), Some(mut body)) = (host, host_body) else { continue };
            let Some(tree) = self.set.guards[i].articulated_mut() else { continue };
            let dv = tree.take_host_delta();
            tree.apply_host_delta(&mut body, &dv);
            if let Some(core) = self.set.guards[k].rigid_mut() {
                core.body.set_velocity(body.linear_velocity(), body.angular_velocity());
            }
        }
    }

    fn generate_contacts(&mut self, ctx: &mut ThreadContext, h: f32) {
        let world = self.world;
        let cfg = &world.cfg.solver;
        let surfaces = &*world.surfaces;
        ctx.contacts.clear();
        self.views.clear();
        for e in &self.set.guards {
            let mut views = Vec::with_capacity(e.parts.len());
            part_views(e, &mut views);
            self.views.push(views);
        }
        let speeds: Vec<f32> = self.set.guards.iter().map(|e| e.max_point_speed()).collect();
        let n = self.set.guards.len();
        for i in 0..n {
            let a = &self.set.guards[i];
            let reach = a.bbox.expanded(speeds[i] * h + cfg.contact_margin);
            for j in (i + 1)..n {
                let b = &self.set.guards[j];
                if a.host() == Some(b.id) || b.host() == Some(a.id) {
                    continue;
                }
                if !reach.overlaps(&b.bbox.expanded(speeds[j] * h)) {
                    continue;
                }
                let margin = cfg.contact_margin + (speeds[i] + speeds[j]) * h;
                for pa in &self.views[i] {
                    for pb in &self.views[j] {
                        let (out, scratch) = (&mut ctx.contacts, &mut ctx.overlaps);
                        push_contacts(surfaces, out, scratch, pa, pb, margin);
                    }
                }
            }
            let margin = cfg.contact_margin + speeds[i] * h;
            for pa in &self.views[i] {
                let motion = a.velocity_at(pa.body, pa.pose.position) * h;
                let fast = motion.length() > cfg.fast_ratio * pa.shape.min_extent();
                for s in &self.statics {
                    if !reach.overlaps(&s.bounds) {
                        continue;
                    }
                    let (out, scratch) = (&mut ctx.contacts, &mut ctx.overlaps);
                    let touched = push_contacts(surfaces, out, scratch, pa, s, margin);
                    if fast && !touched {
                        push_swept_contact(surfaces, &mut ctx.contacts, pa, s, motion);
                    }
                }
            }
        }
    }

    /// Three bilateral rows per occupied constraint slot, one per world axis.
    fn constraint_contacts(&mut self, ctx: &mut ThreadContext, h: f32) {
        let cfg = &self.world.cfg.solver;
        for e in &self.set.guards {
            let Some(core) = e.rigid() else { continue };
            for (slot, c) in core.constraints.iter().enumerate() {
                let Some(c) = c else { continue };
                let (other, anchor) = match c.other {
                    None => (0, c.other_pivot),
                    Some(o) => {
                        let pose = match self.set.index.get(&o) {
                            Some(&k) => Some(self.set.guards[k].pose),
                            None => self.external.get(&o).copied(),
                        };
                        let Some(pose) = pose else { continue };
                        (o, pose.transform_point(c.other_pivot))
                    }
                };
                let pivot = e.pose.transform_point(c.pivot);
                let err = pivot - anchor;
                for (axis_index, axis) in [Vec3::X, Vec3::Y, Vec3::Z].into_iter().enumerate() {
                    let target = (-cfg.constraint_recovery * err.dot(axis) / h)
                        .clamp(-cfg.max_recovery_speed, cfg.max_recovery_speed);
                    ctx.contacts.push(Contact {
                        entities: [e.id, other],
                        parts: [slot as PartIndex, axis_index as PartIndex],
                        point: pivot,
                        normal: axis,
                        target_vrel: target,
                        friction: 0.0,
                        flags: ContactFlags::CONSTRAINT,
                        max_impulse: c.max_impulse,
                        constraint_slot: Some(slot as u8),
                        ..Contact::default()
                    });
                }
            }
        }
    }

    /// Seed impulses from the previous sub-step, or from last tick's archive
    /// for geometric contacts seen for the first time this tick. A key's total
    /// is split evenly over its points.
    fn apply_warm_start(&mut self, ctx: &mut ThreadContext) {
        let mut counts: HashMap<WarmKey, u32> = HashMap::new();
        for c in &ctx.contacts {
            *counts.entry(warm_key(c)).or_insert(0) += 1;
        }
        for c in ctx.contacts.iter_mut() {
            let key = warm_key(c);
            let total = match self.warm.get(&key) {
                Some(&t) => Some(t),
                None if !key.1 => self.world.contacts.warm_start(&key.0),
                None => None,
            };
            if let Some(total) = total {
                let n = counts.get(&key).copied().unwrap_or(1).max(1);
                c.impulse = total / n as f32;
                c.flags |= ContactFlags::PRESERVE_IMPULSE;
            }
        }
    }

    fn record_impulses(&mut self, ctx: &ThreadContext) {
        self.warm.clear();
        for c in &ctx.contacts {
            *self.warm.entry(warm_key(c)).or_insert(0.0) += c.impulse;
        }
    }

    /// Deepest penetration any contact will have once positions advance by
    /// `h` with the solved velocities.
    fn worst_penetration(&self, ctx: &ThreadContext, h: f32) -> f32 {
        ctx.contacts
            .iter()
            .filter(|c| !c.flags.contains(ContactFlags::CONSTRAINT))
            .map(|c| {
                let v = self.set.velocity_at(c.entities[0], c.bodies[0], c.point)
                    - self.set.velocity_at(c.entities[1], c.bodies[1], c.point);
                c.depth - v.dot(c.normal) * h
            })
            .fold(0.0, f32::max)
    }

    fn break_constraints(&mut self, ctx: &ThreadContext) {
        for (entity, slot) in broken_constraints(&ctx.contacts) {
            let Some(&i) = self.set.index.get(&entity) else { continue };
            let Some(core) = self.set.guards[i].rigid_mut() else { continue };
            if let Some(c) = core.constraints.get_mut(slot as usize).and_then(Option::take) {
                debug!(entity, constraint = c.id, "constraint broke");
                self.events.push(PhysEvent::ConstraintBroken { entity, constraint_id: c.id });
            }
        }
    }

    fn integrate_positions(&mut self, h: f32) {
        let cfg = &self.world.cfg;
        for &i in &self.order {
            let (frame, host) = self.host_state(i);
            self.set.guards[i].step_position(h, cfg, frame, host.as_ref());
        }
    }

    /// Store the final sub-step's contacts and report first-touch collisions.
    fn commit(&mut self, ctx: &ThreadContext) {
        let registry = &self.world.contacts;
        let mut reported: HashMap<ContactKey, usize> = HashMap::new();
        for c in ctx.contacts.iter().filter(|c| !c.flags.contains(ContactFlags::CONSTRAINT)) {
            // archived with no impulse means last tick only predicted the touch
            let fresh = registry.warm_start(&c.key()).is_none_or(|i| i <= 0.0);
            let stored = Contact { flags: c.flags | ContactFlags::PRESERVE_IMPULSE, ..*c };
            let Some(handle) = registry.allocate(stored) else { break };
            registry.attach(c.entities[0], c.entities[1], handle);
            if !fresh || c.impulse <= 0.0 {
                continue;
            }
            match reported.get(&c.key()) {
                Some(&idx) => {
                    if let Some(PhysEvent::Collision { impulse, .. }) = self.events.get_mut(idx) {
                        *impulse += c.impulse;
                    }
                }
                None => {
                    reported.insert(c.key(), self.events.len());
                    self.events.push(PhysEvent::Collision {
                        entities: c.entities,
                        parts: c.parts,
                        point: c.point,
                        normal: c.normal,
                        impulse: c.impulse,
                        materials: c.materials,
                    });
                }
            }
        }
    }

    /// The island sleeps only when every member qualifies.
    fn update_sleep(&mut self, ctx: &ThreadContext, dt: f32) {
        let cfg = &self.world.cfg;
        let touching: HashSet<EntityId> = ctx
            .contacts
            .iter()
            .filter(|c| !c.flags.contains(ContactFlags::CONSTRAINT))
            .flat_map(|c| c.entities)
            .collect();
        let weightless = cfg.gravity == Vec3::ZERO;
        let mut all = true;
        for e in self.set.guards.iter_mut() {
            let anchored = e.constraint_mask() != 0
                || e.articulated().is_some_and(|a| a.mode != RootMode::Free);
            let can_rest =
                (touching.contains(&e.id) || weightless || anchored) && !e.has_buoyancy();
            let energy = e.energy_per_mass();
            if let Some(s) = e.sleep_state_mut() {
                all &= s.update(energy, can_rest, dt, &cfg.sleep);
            }
        }
        if !all {
            return;
        }
        for e in self.set.guards.iter_mut() {
            e.stop();
            e.class = SimClass::Sleeping;
            self.events.push(PhysEvent::SleepChanged { entity: e.id, sleeping: true });
        }
        debug!(entities = self.set.guards.len(), "island fell asleep");
    }

    fn finish(mut self, ctx: &ThreadContext, dt: f32) -> IslandOutcome {
        self.commit(ctx);
        self.update_sleep(ctx, dt);
        IslandOutcome { events: self.events, step_backs: self.step_backs }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use glam::Vec2;

    use super::*;
    use crate::config::{GridConfig, ThreadConfig};
    use crate::geometry::Part;
    use crate::logging::init_test_logging;

    fn test_config() -> WorldConfig {
        WorldConfig {
            grid: GridConfig {
                cell_size: 4.0,
                cells_x: 32,
                cells_y: 32,
                origin: Vec2::new(-64.0, -64.0),
                z_min: -64.0,
                z_max: 192.0,
                max_thunks: 1 << 14,
                ..GridConfig::default()
            },
            threads: ThreadConfig { workers: 2, ..ThreadConfig::default() },
            ..WorldConfig::default()
        }
    }

    fn world() -> PhysicsWorld {
        init_test_logging();
        PhysicsWorld::new(test_config()).unwrap()
    }

    fn ball_at(p: Vec3) -> EntityDesc {
        let ball = Part::new(Shape::Sphere { radius: 0.5 }, 1.0);
        EntityDesc::rigid(Pose::from_position(p), vec![ball])
    }

    fn ground() -> EntityDesc {
        EntityDesc::static_geometry(Pose::IDENTITY, vec![Part::new(Shape::Plane, 0.0)])
    }

    fn cube_at(p: Vec3) -> EntityDesc {
        let cube = Part::new(Shape::Box { half: Vec3::splat(0.5) }, 0.0);
        EntityDesc::static_geometry(Pose::from_position(p), vec![cube])
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = test_config();
        cfg.max_time_step = 0.0;
        assert!(PhysicsWorld::new(cfg).is_err());
    }

    #[test]
    fn test_create_query_destroy() {
        let w = world();
        let id = w.create_entity(ball_at(Vec3::new(10.0, 10.0, 1.0))).unwrap();
        let (lo, hi) = (Vec3::new(9.0, 9.0, 0.0), Vec3::new(11.0, 11.0, 2.0));
        let found = w.box_query(lo, hi, EntityTypeMask::ALL);
        assert_eq!(found, vec![id]);
        assert!(w.box_query(lo, hi, EntityTypeMask::STATIC).is_empty());

        w.destroy_entity(id).unwrap();
        assert!(w.box_query(lo, hi, EntityTypeMask::ALL).is_empty());
        assert!(matches!(w.get_status(id), Err(PhysError::UnknownEntity(_))));
        assert_eq!(
            w.drain_events(),
            vec![PhysEvent::EntityCreated { entity: id }, PhysEvent::EntityDeleted { entity: id }]
        );
    }

    #[test]
    fn test_requests_for_stepping_entity_are_queued() {
        let mut cfg = test_config();
        cfg.gravity = Vec3::ZERO;
        let w = PhysicsWorld::new(cfg).unwrap();
        let id = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 5.0))).unwrap();
        let slot = w.entities.get(id).unwrap();

        slot.in_step.store(true, Ordering::Release);
        w.action(id, Action::SetVelocity { linear: Vec3::X, angular: Vec3::ZERO }).unwrap();
        let moved = Pose::from_position(Vec3::new(1.0, 0.0, 5.0));
        w.set_params(id, EntityParams::Pose(moved)).unwrap();
        assert_eq!(w.get_status(id).unwrap().velocity, Vec3::ZERO);
        assert_eq!(w.commands.len(), 2);

        slot.in_step.store(false, Ordering::Release);
        assert_eq!(w.replay_commands(), 2);
        let status = w.get_status(id).unwrap();
        assert_eq!(status.velocity, Vec3::X);
        assert!((status.pose.position - Vec3::new(1.0, 0.0, 5.0)).length() < 1e-5);
    }

    #[test]
    fn test_request_racing_the_final_replay_applies_directly() {
        let mut cfg = test_config();
        cfg.gravity = Vec3::ZERO;
        let w = PhysicsWorld::new(cfg).unwrap();
        let id = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 5.0))).unwrap();
        let slot = w.entities.get(id).unwrap();
        slot.in_step.store(true, Ordering::Release);

        let gate = w.replay_gate.lock();
        std::thread::scope(|s| {
            let kick = Action::SetVelocity { linear: Vec3::X, angular: Vec3::ZERO };
            let caller = s.spawn(|| w.action(id, kick));
            std::thread::sleep(std::time::Duration::from_millis(20));
            // the tick clears its flags and replays while holding the gate
            slot.in_step.store(false, Ordering::Release);
            assert_eq!(w.replay_commands(), 0);
            drop(gate);
            caller.join().unwrap().unwrap();
        });
        assert!(w.commands.is_empty());
        assert_eq!(w.get_status(id).unwrap().velocity, Vec3::X);
    }

    #[test]
    fn test_destroy_during_step_is_deferred() {
        let w = world();
        let id = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 5.0))).unwrap();
        {
            let _step = w.scheduler.begin_step();
            w.destroy_entity(id).unwrap();
            assert!(matches!(w.get_status(id), Err(PhysError::EntityDeleted(_))));
            assert!(w.entities.contains(id));
        }
        w.replay_commands();
        assert!(!w.entities.contains(id));
        assert!(matches!(w.destroy_entity(id), Err(PhysError::UnknownEntity(_))));
    }

    #[test]
    fn test_resting_ball_sleeps_and_impulse_wakes() {
        let w = world();
        w.create_entity(ground()).unwrap();
        let id = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 0.5))).unwrap();
        for _ in 0..20 {
            w.time_step(1.0 / 60.0);
        }
        let status = w.get_status(id).unwrap();
        assert_eq!(status.class, SimClass::Sleeping);
        assert!((status.pose.position.z - 0.5).abs() < 0.01, "{:?}", status.pose.position);
        assert!(w.drain_events().contains(&PhysEvent::SleepChanged { entity: id, sleeping: true }));

        w.action(id, Action::impulse(Vec3::new(0.0, 0.0, 2.0))).unwrap();
        assert_eq!(w.get_status(id).unwrap().class, SimClass::Awake);
        assert_eq!(w.drain_events(), vec![PhysEvent::SleepChanged { entity: id, sleeping: false }]);
        w.time_step(1.0 / 60.0);
        assert!(w.get_status(id).unwrap().velocity.z > 1.0);
    }

    #[test]
    fn test_touch_after_predicted_contact_reports_collision() {
        let w = world();
        let ground = w.create_entity(ground()).unwrap();
        let id = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 0.5))).unwrap();
        // last tick's contact for the pair was speculative and carried no impulse
        let predicted = Contact { entities: [id, ground], ..Contact::default() };
        let handle = w.contacts.allocate(predicted).unwrap();
        w.contacts.attach(id, ground, handle);
        let falling = Action::SetVelocity { linear: Vec3::Z * -2.0, angular: Vec3::ZERO };
        w.action(id, falling).unwrap();
        w.drain_events();

        w.time_step(1.0 / 60.0);
        let hits = w
            .drain_events()
            .into_iter()
            .filter(|e| {
                matches!(e, PhysEvent::Collision { entities, .. } if entities.contains(&id))
            })
            .count();
        assert_eq!(hits, 1);

        // resting on the next tick is not a new touch
        w.time_step(1.0 / 60.0);
        assert!(!w.drain_events().iter().any(|e| matches!(e, PhysEvent::Collision { .. })));
    }

    #[test]
    fn test_deep_overlap_steps_back_a_bounded_number_of_times() {
        let mut cfg = test_config();
        cfg.gravity = Vec3::ZERO;
        let max_backs = cfg.solver.max_step_backs as usize;
        let w = PhysicsWorld::new(cfg).unwrap();
        let low = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 5.0))).unwrap();
        let high = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 5.6))).unwrap();

        w.time_step(1.0 / 60.0);
        let backs = w.stats().step_backs;
        assert!(backs > 0);
        assert!(backs <= max_backs, "{backs}");
        // the tick still completes and pushes the pair apart
        let z = |id| w.get_status(id).unwrap().pose.position.z;
        let gap = z(high) - z(low);
        assert!(gap > 0.6, "{gap}");
    }

    #[test]
    fn test_shallow_contact_never_steps_back() {
        let w = world();
        w.create_entity(ground()).unwrap();
        w.create_entity(ball_at(Vec3::new(0.0, 0.0, 0.5))).unwrap();
        for _ in 0..5 {
            w.time_step(1.0 / 60.0);
            assert_eq!(w.stats().step_backs, 0);
        }
    }

    #[test]
    fn test_world_constraint_holds_and_breaks() {
        let w = world();
        let held = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 5.0))).unwrap();
        let weak = w.create_entity(ball_at(Vec3::new(20.0, 0.0, 5.0))).unwrap();
        let pin = |anchor: Vec3, max_impulse: f32| Action::AddConstraint {
            id: 7,
            other: None,
            pivot: Vec3::new(0.0, 0.0, 1.0),
            other_pivot: anchor,
            max_impulse,
        };
        w.action(held, pin(Vec3::new(0.0, 0.0, 6.0), 0.0)).unwrap();
        w.action(weak, pin(Vec3::new(20.0, 0.0, 6.0), 0.01)).unwrap();
        w.drain_events();

        for _ in 0..60 {
            w.time_step(1.0 / 60.0);
        }
        let status = w.get_status(held).unwrap();
        assert!((status.pose.position.z - 5.0).abs() < 0.05, "{:?}", status.pose.position);
        assert_eq!(status.constraint_mask, 1);

        let weak_status = w.get_status(weak).unwrap();
        assert_eq!(weak_status.constraint_mask, 0);
        assert!(weak_status.pose.position.z < 4.0);
        let broken = PhysEvent::ConstraintBroken { entity: weak, constraint_id: 7 };
        assert!(w.drain_events().contains(&broken));
    }

    #[test]
    fn test_ray_reports_placeholder_buddy() {
        let w = world();
        let wall = w.create_entity(cube_at(Vec3::new(5.0, 0.0, 0.5))).unwrap();
        let owner = w.create_entity(ball_at(Vec3::new(40.0, 40.0, 5.0))).unwrap();
        let proxy = EntityDesc::placeholder(
            Pose::from_position(Vec3::new(3.0, 0.0, 0.5)),
            vec![Part::new(Shape::Box { half: Vec3::splat(0.5) }, 0.0)],
            owner,
        );
        w.create_entity(proxy).unwrap();

        let ray = RayQuery::new(Vec3::new(0.0, 0.0, 0.5), Vec3::new(10.0, 0.0, 0.0));
        let hit = w.ray_query(&ray).blocking.unwrap();
        assert_eq!(hit.entity, owner);
        assert!((hit.distance - 2.5).abs() < 1e-4);

        let hit = w.ray_query(&ray.clone().skipping(owner)).blocking.unwrap();
        assert_eq!(hit.entity, wall);
        assert!((hit.distance - 4.5).abs() < 1e-4);

        let remapped = w.ray_query(&ray.skipping(owner).substitute(wall, 99)).blocking.unwrap();
        assert_eq!(remapped.entity, 99);
    }

    #[test]
    fn test_pending_rays_keep_submission_order() {
        let w = world();
        w.create_entity(cube_at(Vec3::new(5.0, 0.0, 0.5))).unwrap();
        let origin = Vec3::new(0.0, 0.0, 0.5);
        let hit = w.queue_ray_query(RayQuery::new(origin, Vec3::new(10.0, 0.0, 0.0)));
        let miss = w.queue_ray_query(RayQuery::new(origin, Vec3::new(0.0, 10.0, 0.0)));
        let results = w.trace_pending_queries();
        assert_eq!(results.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![hit, miss]);
        assert!(results[0].1.blocking.is_some());
        assert!(results[1].1.is_empty());
        assert!(w.trace_pending_queries().is_empty());
    }

    struct CountingStreamer {
        calls: AtomicUsize,
    }

    impl RegionStreamer for CountingStreamer {
        fn populate_cell(&self, ix: u32, iy: u32) -> Vec<EntityDesc> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let at = |i: u32| -64.0 + i as f32 * 4.0 + 2.0;
            let center = Vec3::new(at(ix), at(iy), 0.5);
            vec![cube_at(center)]
        }
    }

    #[test]
    fn test_cells_stream_in_once() {
        let mut cfg = test_config();
        cfg.grid.physics_on_demand = true;
        let streamer = Arc::new(CountingStreamer { calls: AtomicUsize::new(0) });
        let w = PhysicsWorld::new(cfg).unwrap().with_streamer(streamer.clone());

        let (min, max) = (Vec3::new(0.5, 0.5, 0.0), Vec3::new(3.5, 3.5, 1.0));
        assert_eq!(w.box_query(min, max, EntityTypeMask::STATIC).len(), 1);
        assert_eq!(w.box_query(min, max, EntityTypeMask::STATIC).len(), 1);
        assert_eq!(streamer.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot_restore_through_world() {
        let mut cfg = test_config();
        cfg.gravity = Vec3::ZERO;
        let w = PhysicsWorld::new(cfg).unwrap();
        let desc = ball_at(Vec3::new(0.0, 0.0, 5.0)).with_velocity(Vec3::X, Vec3::ZERO);
        let id = w.create_entity(desc).unwrap();
        let snap = w.snapshot(id).unwrap();
        for _ in 0..10 {
            w.time_step(0.1);
        }
        assert!(w.get_status(id).unwrap().pose.position.x > 0.9);
        w.restore(id, &snap).unwrap();
        let status = w.get_status(id).unwrap();
        assert!((status.pose.position - Vec3::new(0.0, 0.0, 5.0)).length() < 1e-5);
        assert_eq!(status.velocity, Vec3::X);
        let (lo, hi) = (Vec3::new(-1.0, -1.0, 4.0), Vec3::new(1.0, 1.0, 6.0));
        let found = w.box_query(lo, hi, EntityTypeMask::AWAKE);
        assert_eq!(found, vec![id]);
    }

    #[test]
    fn test_invalid_requests_leave_state_unchanged() {
        let w = world();
        let id = w.create_entity(ball_at(Vec3::new(0.0, 0.0, 5.0))).unwrap();
        let nan = Vec3::new(f32::NAN, 0.0, 0.0);
        let bad = Action::SetVelocity { linear: nan, angular: Vec3::ZERO };
        assert!(matches!(w.action(id, bad), Err(PhysError::NonFinite(_))));
        assert!(matches!(
            w.set_params(id, EntityParams::Material { part: 4, material: 1 }),
            Err(PhysError::InvalidPart { index: 4, .. })
        ));
        assert!(matches!(
            w.action(id, Action::DriveJoint { joint: 0, rates: None }),
            Err(PhysError::Unsupported(_))
        ));
        assert_eq!(w.get_status(id).unwrap().velocity, Vec3::ZERO);
    }
}
