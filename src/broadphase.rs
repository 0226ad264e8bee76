use std::collections::HashSet;

use bitflags::bitflags;
use glam::{Vec2, Vec3};
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::grid::SpatialGrid;
use crate::types::{Aabb, EntityId, EntityTypeMask, RayHit, RayResult, SurfaceFlags, SurfaceProps};

bitflags! {
    /// Ray behaviour switches.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct RayFlags: u8 {
        /// Every hit blocks, regardless of pierceability.
        const STOP_AT_PIERCEABLE = 1 << 0;
        /// Stop at the first blocking hit found instead of the nearest.
        const ANY_HIT = 1 << 1;
        /// Only parts flagged for collision are tested, not ray-only parts.
        const COLLIDERS_ONLY = 1 << 2;
    }
}

/// A ray request. `dir` carries the maximum distance in its length.
#[derive(Clone, Debug)]
pub struct RayQuery {
    pub origin: Vec3,
    pub dir: Vec3,
    pub max_hits: usize,
    /// Surfaces with pierceability above this let the ray through.
    pub pierceability: u8,
    pub skip: Vec<EntityId>,
    pub type_mask: EntityTypeMask,
    pub flags: RayFlags,
    /// `(from, to)`: a thunk of `from` reports `to` instead.
    pub substitutions: Vec<(EntityId, EntityId)>,
}

impl RayQuery {
    pub fn new(origin: Vec3, dir: Vec3) -> Self {
        Self {
            origin,
            dir,
            max_hits: 1,
            pierceability: 0,
            skip: Vec::new(),
            type_mask: EntityTypeMask::ALL,
            flags: RayFlags::empty(),
            substitutions: Vec::new(),
        }
    }

    pub fn with_max_hits(mut self, n: usize) -> Self {
        self.max_hits = n;
        self
    }

    pub fn with_pierceability(mut self, p: u8) -> Self {
        self.pierceability = p;
        self
    }

    pub fn skipping(mut self, id: EntityId) -> Self {
        self.skip.push(id);
        self
    }

    pub fn with_mask(mut self, mask: EntityTypeMask) -> Self {
        self.type_mask = mask;
        self
    }

    pub fn with_flags(mut self, flags: RayFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn substitute(mut self, from: EntityId, to: EntityId) -> Self {
        self.substitutions.push((from, to));
        self
    }

    pub fn resolve(&self, id: EntityId) -> EntityId {
        self.substitutions.iter().find(|(f, _)| *f == id).map(|(_, t)| *t).unwrap_or(id)
    }
}

/// Reusable candidate storage for one thread.
#[derive(Debug, Default)]
pub struct QueryScratch {
    pub candidates: Vec<EntityId>,
    seen: HashSet<EntityId>,
    truncated: bool,
}

impl QueryScratch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            candidates: Vec::with_capacity(n),
            seen: HashSet::with_capacity(n),
            truncated: false,
        }
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
        self.seen.clear();
        self.truncated = false;
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Record a candidate once. Returns false when the list cannot grow.
    fn push(&mut self, id: EntityId, limit: usize) -> bool {
        if !self.seen.insert(id) {
            return true;
        }
        if self.candidates.len() >= limit || self.candidates.try_reserve(1).is_err() {
            if !self.truncated {
                warn!(limit, "broad-phase candidate list full; result truncated");
                self.truncated = true;
            }
            return false;
        }
        self.candidates.push(id);
        true
    }
}

/// Entities whose grid boxes overlap `[min, max]`, in grid order, deduplicated.
pub fn query_box(
    grid: &SpatialGrid,
    min: Vec3,
    max: Vec3,
    type_mask: EntityTypeMask,
    limit: usize,
    scratch: &mut QueryScratch,
) {
    scratch.clear();
    if !(min.cmple(max).all()) {
        return;
    }
    let mut full = false;
    let range = grid.cell_range(min, max);
    let mut visit = |id: EntityId, _: &crate::types::Aabb| {
        if !full && !scratch.push(id, limit) {
            full = true;
        }
    };
    for (ix, iy) in range.cells() {
        grid.visit_cell(ix, iy, min, max, type_mask, &mut visit);
    }
    if range.outside && grid.config().out_of_bounds_as_result {
        grid.visit_outside(min, max, type_mask, &mut visit);
    }
    grid.visit_global(min, max, type_mask, &mut visit);
}

/// One grid cell crossed by a ray, with the ray parameter interval inside it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CellStep {
    pub ix: u32,
    pub iy: u32,
    pub t_enter: f32,
    pub t_exit: f32,
}

/// 2D DDA over the grid for the segment `origin + dir * t`, `t` in `[0, 1]`.
pub struct CellWalker {
    nx: i64,
    ny: i64,
    cell: (i64, i64),
    step: (i64, i64),
    t_max: Vec2,
    t_delta: Vec2,
    t_curr: f32,
    t_end: f32,
    done: bool,
    /// The segment leaves the grid somewhere.
    pub leaves_grid: bool,
}

impl CellWalker {
    pub fn new(grid: &SpatialGrid, origin: Vec3, dir: Vec3) -> Self {
        let cfg = grid.config();
        let cs = cfg.cell_size;
        let o = origin.truncate();
        let d = dir.truncate();
        let grid_min = cfg.origin;
        let grid_max = cfg.origin + Vec2::new(cfg.cells_x as f32, cfg.cells_y as f32) * cs;

        // clip the segment to the grid rectangle
        let mut t0 = 0.0f32;
        let mut t1 = 1.0f32;
        let mut inside = true;
        for axis in 0..2 {
            if d[axis].abs() < 1e-12 {
                if o[axis] < grid_min[axis] || o[axis] >= grid_max[axis] {
                    inside = false;
                }
                continue;
            }
            let inv = 1.0 / d[axis];
            let mut ta = (grid_min[axis] - o[axis]) * inv;
            let mut tb = (grid_max[axis] - o[axis]) * inv;
            if ta > tb {
                core::mem::swap(&mut ta, &mut tb);
            }
            t0 = t0.max(ta);
            t1 = t1.min(tb);
        }
        if t0 > t1 {
            inside = false;
        }
        let leaves_grid = !inside || t0 > 0.0 || t1 < 1.0;

        let nx = cfg.cells_x as i64;
        let ny = cfg.cells_y as i64;
        let entry = o + d * t0;
        let rel = (entry - grid_min) / cs;
        let cell = (
            (rel.x.floor() as i64).clamp(0, nx - 1),
            (rel.y.floor() as i64).clamp(0, ny - 1),
        );
        let step_x = if d.x > 0.0 { 1 } else if d.x < 0.0 { -1 } else { 0 };
        let step_y = if d.y > 0.0 { 1 } else if d.y < 0.0 { -1 } else { 0 };
        let next_boundary = |c: i64, step: i64, base: f32| -> f32 {
            if step > 0 { base + (c as f32 + 1.0) * cs } else { base + c as f32 * cs }
        };
        let t_max_x = if step_x != 0 {
            (next_boundary(cell.0, step_x, grid_min.x) - o.x) / d.x
        } else {
            f32::INFINITY
        };
        let t_max_y = if step_y != 0 {
            (next_boundary(cell.1, step_y, grid_min.y) - o.y) / d.y
        } else {
            f32::INFINITY
        };
        let t_delta_x = if step_x != 0 { cs / d.x.abs() } else { f32::INFINITY };
        let t_delta_y = if step_y != 0 { cs / d.y.abs() } else { f32::INFINITY };

        Self {
            nx,
            ny,
            cell,
            step: (step_x, step_y),
            t_max: Vec2::new(t_max_x, t_max_y),
            t_delta: Vec2::new(t_delta_x, t_delta_y),
            t_curr: t0,
            t_end: t1,
            done: !inside,
            leaves_grid,
        }
    }
}

impl Iterator for CellWalker {
    type Item = CellStep;

    fn next(&mut self) -> Option<CellStep> {
        if self.done {
            return None;
        }
        let (cx, cy) = self.cell;
        if cx < 0 || cy < 0 || cx >= self.nx || cy >= self.ny || self.t_curr > self.t_end {
            self.done = true;
            return None;
        }
        let t_enter = self.t_curr;
        let t_exit = self.t_max.x.min(self.t_max.y).min(self.t_end);
        // Step to next cell
        if self.t_max.x < self.t_max.y {
            self.cell.0 += self.step.0;
            self.t_curr = self.t_max.x;
            self.t_max.x += self.t_delta.x;
        } else if self.t_max.y.is_finite() {
            self.cell.1 += self.step.1;
            self.t_curr = self.t_max.y;
            self.t_max.y += self.t_delta.y;
        } else {
            // vertical ray: a single cell
            self.done = true;
        }
        if t_exit >= self.t_end {
            self.done = true;
        }
        Some(CellStep { ix: cx as u32, iy: cy as u32, t_enter, t_exit })
    }
}

/// Fixed-capacity hit list shared by blocking and piercing hits.
///
/// Slot 0 holds the blocking hit. The remaining slots are shared: important
/// piercing hits fill from the front, ordinary ones from the back, and when
/// full the farthest ordinary hit is evicted.
#[derive(Debug)]
pub struct HitBuffer {
    blocking: Option<RayHit>,
    slots: Vec<Option<RayHit>>,
    n_important: usize,
    n_ordinary: usize,
    pierceability: u8,
    flags: RayFlags,
}

impl HitBuffer {
    pub fn new(max_hits: usize, pierceability: u8, flags: RayFlags) -> Self {
        let cap = max_hits.max(1) - 1;
        Self {
            blocking: None,
            slots: vec![None; cap],
            n_important: 0,
            n_ordinary: 0,
            pierceability,
            flags,
        }
    }

    /// Distance of the blocking hit, if any.
    pub fn blocking_distance(&self) -> f32 {
        self.blocking.map(|h| h.distance).unwrap_or(f32::INFINITY)
    }

    pub fn has_blocking(&self) -> bool {
        self.blocking.is_some()
    }

    /// Classify and record a hit against `surface`.
    pub fn offer(&mut self, mut hit: RayHit, surface: &SurfaceProps) {
        let piercing = !self.flags.contains(RayFlags::STOP_AT_PIERCEABLE)
            && surface.pierceability > self.pierceability;
        hit.piercing = piercing;
        if !piercing {
            if hit.distance < self.blocking_distance() {
                self.blocking = Some(hit);
                self.drop_beyond(hit.distance);
            }
            return;
        }
        if hit.distance > self.blocking_distance() || self.slots.is_empty() {
            return;
        }
        let important = surface.flags.contains(SurfaceFlags::IMPORTANT);
        let cap = self.slots.len();
        if self.n_important + self.n_ordinary < cap {
            if important {
                self.slots[self.n_important] = Some(hit);
                self.n_important += 1;
            } else {
                self.slots[cap - 1 - self.n_ordinary] = Some(hit);
                self.n_ordinary += 1;
            }
            return;
        }
        // full: evict the farthest ordinary hit
        if self.n_ordinary > 0 {
            let (idx, far) = self.farthest(cap - self.n_ordinary..cap);
            if important {
                self.remove_ordinary(idx);
                self.slots[self.n_important] = Some(hit);
                self.n_important += 1;
            } else if hit.distance < far {
                self.slots[idx] = Some(hit);
            }
        } else if important {
            let (idx, far) = self.farthest(0..self.n_important);
            if hit.distance < far {
                self.slots[idx] = Some(hit);
            }
        }
    }

    fn farthest(&self, range: std::ops::Range<usize>) -> (usize, f32) {
        let mut best = (range.start, f32::NEG_INFINITY);
        for i in range {
            if let Some(h) = self.slots[i] {
                if h.distance > best.1 {
                    best = (i, h.distance);
                }
            }
        }
        best
    }

    fn remove_ordinary(&mut self, idx: usize) {
        let cap = self.slots.len();
        let first = cap - self.n_ordinary;
        // keep the ordinary block contiguous at the back
        self.slots[idx] = self.slots[first];
        self.slots[first] = None;
        self.n_ordinary -= 1;
    }

    fn remove_important(&mut self, idx: usize) {
        let last = self.n_important - 1;
        self.slots[idx] = self.slots[last];
        self.slots[last] = None;
        self.n_important -= 1;
    }

    fn drop_beyond(&mut self, d: f32) {
        let mut i = 0;
        while i < self.n_important {
            if self.slots[i].is_some_and(|h| h.distance > d) {
                self.remove_important(i);
            } else {
                i += 1;
            }
        }
        let cap = self.slots.len();
        let mut i = cap - self.n_ordinary;
        while i < cap {
            if self.slots[i].is_some_and(|h| h.distance > d) {
                self.remove_ordinary(i);
                // the slot now holds a not-yet-checked hit (or is below the block)
                i = i.max(cap - self.n_ordinary);
            } else {
                i += 1;
            }
        }
    }

    pub fn finish(self) -> RayResult {
        let mut piercing: Vec<RayHit> = self.slots.into_iter().flatten().collect();
        piercing.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        RayResult { blocking: self.blocking, piercing }
    }
}

/// Callbacks the ray walker needs from the owner of the entities.
pub trait RayHooks {
    /// Called before a cell's thunks are read.
    fn before_cell(&mut self, _ix: u32, _iy: u32) {}

    /// Intersect the ray with entity `id` and offer hits to `buffer`.
    fn test_entity(&mut self, id: EntityId, buffer: &mut HitBuffer);
}

/// Walk the grid along the ray, testing candidates cell by cell.
///
/// The grid lock is held only while a cell's thunk list is read, never while
/// `hooks.test_entity` runs.
pub fn trace_ray(
    grid: &RwLock<SpatialGrid>,
    q: &RayQuery,
    limit: usize,
    scratch: &mut QueryScratch,
    hooks: &mut impl RayHooks,
) -> RayResult {
    let mut buffer = HitBuffer::new(q.max_hits, q.pierceability, q.flags);
    let len = q.dir.length();
    if !(len > 0.0) || !q.origin.is_finite() || !q.dir.is_finite() {
        return buffer.finish();
    }
    scratch.clear();
    let end = q.origin + q.dir;
    let seg_min = q.origin.min(end);
    let seg_max = q.origin.max(end);

    let mut batch: Vec<EntityId> = Vec::new();
    let gather = |scratch: &mut QueryScratch, batch: &mut Vec<EntityId>, id: EntityId| {
        let id = q.resolve(id);
        if q.skip.contains(&id) {
            return;
        }
        if scratch.seen.contains(&id) {
            return;
        }
        if scratch.push(id, limit) {
            batch.push(id);
        }
    };

    // unbounded entities first, then whatever lives outside the grid
    let walker = {
        let g = grid.read();
        let mut collect = |id, _: &Aabb| gather(scratch, &mut batch, id);
        g.visit_global(seg_min, seg_max, q.type_mask, &mut collect);
        let walker = CellWalker::new(&g, q.origin, q.dir);
        if walker.leaves_grid && g.config().out_of_bounds_as_result {
            g.visit_outside(seg_min, seg_max, q.type_mask, &mut collect);
        }
        walker
    };
    for id in batch.drain(..) {
        hooks.test_entity(id, &mut buffer);
    }

    for step in walker {
        if buffer.blocking_distance() <= step.t_enter * len {
            break;
        }
        hooks.before_cell(step.ix, step.iy);
        let p0 = q.origin + q.dir * step.t_enter;
        let p1 = q.origin + q.dir * step.t_exit;
        let pad = Vec3::splat(1e-4);
        let (cmin, cmax) = (p0.min(p1) - pad, p0.max(p1) + pad);
        {
            let g = grid.read();
            let mut collect = |id, _: &Aabb| gather(scratch, &mut batch, id);
            g.visit_cell(step.ix, step.iy, cmin, cmax, q.type_mask, &mut collect);
        }
        for id in batch.drain(..) {
            hooks.test_entity(id, &mut buffer);
        }
        if buffer.has_blocking()
            && (q.flags.contains(RayFlags::ANY_HIT)
                || buffer.blocking_distance() <= step.t_exit * len)
        {
            trace!(ix = step.ix, iy = step.iy, "ray terminated");
            break;
        }
    }
    buffer.finish()
}
