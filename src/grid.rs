use std::collections::HashMap;

use glam::{Vec2, Vec3};
use tracing::{debug, warn};

use crate::config::GridConfig;
use crate::types::{Aabb, EntityId, EntityTypeMask, SimClass};

const NIL: u32 = u32::MAX;

/// Opaque reference to an entity's thunk chain. Empty when the entity has
/// no footprint (thunk pool exhausted).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThunkHandle(u32);

impl ThunkHandle {
    pub const EMPTY: ThunkHandle = ThunkHandle(NIL);

    pub fn is_empty(self) -> bool {
        self.0 == NIL
    }
}

/// Per-thunk box: x/y quantized to 8 bits inside the cell, z to 16 bits
/// inside the grid's vertical range. Rounding is outward.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct CompressedBox {
    pub x: [u8; 2],
    pub y: [u8; 2],
    pub z: [u16; 2],
}

#[derive(Clone, Debug)]
struct GridThunk {
    entity: EntityId,
    /// Next thunk in the same cell.
    next: u32,
    /// Next thunk of the same entity.
    next_of_entity: u32,
    cell: u32,
    bbox: CompressedBox,
    class: SimClass,
}

/// Uniform 2D cell grid over the XY plane.
///
/// Cells `0..nx*ny` are the grid proper; one extra cell collects footprints
/// outside the grid and one more holds entities too large (or unbounded) to
/// spread over cells. Thunks in those two carry exact boxes.
pub struct SpatialGrid {
    cfg: GridConfig,
    heads: Vec<u32>,
    thunks: Vec<GridThunk>,
    free: u32,
    live: usize,
    /// Exact boxes for thunks in the out-of-bounds and global cells.
    wide: HashMap<u32, Aabb>,
    populated: Vec<bool>,
    warned_full: bool,
}

impl SpatialGrid {
    pub fn new(cfg: GridConfig) -> Self {
        let cells = cfg.cells_x as usize * cfg.cells_y as usize;
        Self {
            heads: vec![NIL; cells + 2],
            thunks: Vec::new(),
            free: NIL,
            live: 0,
            wide: HashMap::new(),
            populated: vec![false; cells],
            warned_full: false,
            cfg,
        }
    }

    pub fn config(&self) -> &GridConfig {
        &self.cfg
    }

    pub fn cell_count(&self) -> usize {
        self.cfg.cells_x as usize * self.cfg.cells_y as usize
    }

    fn oob_cell(&self) -> u32 {
        self.cell_count() as u32
    }

    fn global_cell(&self) -> u32 {
        self.cell_count() as u32 + 1
    }

    pub fn thunk_count(&self) -> usize {
        self.live
    }

    /// World XY of a cell's minimum corner.
    pub fn cell_min(&self, ix: u32, iy: u32) -> Vec2 {
        self.cfg.origin + Vec2::new(ix as f32, iy as f32) * self.cfg.cell_size
    }

    /// Unclamped cell coordinates of a world XY point.
    pub fn cell_coords(&self, p: Vec2) -> (i64, i64) {
        let rel = (p - self.cfg.origin) / self.cfg.cell_size;
        (rel.x.floor() as i64, rel.y.floor() as i64)
    }

    pub fn in_grid(&self, ix: i64, iy: i64) -> bool {
        ix >= 0 && iy >= 0 && ix < self.cfg.cells_x as i64 && iy < self.cfg.cells_y as i64
    }

    /// Cells covered by a box, clamped to the grid, plus whether part of the
    /// box lies outside the grid.
    pub fn cell_range(&self, min: Vec3, max: Vec3) -> CellRange {
        let (x0, y0) = self.cell_coords(min.truncate());
        let (x1, y1) = self.cell_coords(max.truncate());
        let nx = self.cfg.cells_x as i64;
        let ny = self.cfg.cells_y as i64;
        let outside = x0 < 0 || y0 < 0 || x1 >= nx || y1 >= ny;
        let empty = x1 < 0 || y1 < 0 || x0 >= nx || y0 >= ny;
        if empty {
            return CellRange { ix0: 1, iy0: 1, ix1: 0, iy1: 0, outside: true };
        }
        CellRange {
            ix0: x0.clamp(0, nx - 1) as u32,
            iy0: y0.clamp(0, ny - 1) as u32,
            ix1: x1.clamp(0, nx - 1) as u32,
            iy1: y1.clamp(0, ny - 1) as u32,
            outside,
        }
    }

    fn footprint(&self, bbox: &Aabb, out: &mut Vec<u32>) {
        out.clear();
        if !bbox.is_finite() {
            out.push(self.global_cell());
            return;
        }
        let range = self.cell_range(bbox.min, bbox.max);
        let count = range.len() + usize::from(range.outside);
        if count > self.cfg.max_cells_per_entity {
            out.push(self.global_cell());
            return;
        }
        for (ix, iy) in range.cells() {
            out.push(iy * self.cfg.cells_x + ix);
        }
        if range.outside {
            out.push(self.oob_cell());
        }
    }

    fn compress(&self, cell: u32, bbox: &Aabb) -> CompressedBox {
        if cell >= self.oob_cell() {
            return CompressedBox::default();
        }
        let ix = cell % self.cfg.cells_x;
        let iy = cell / self.cfg.cells_x;
        let cmin = self.cell_min(ix, iy);
        let cs = self.cfg.cell_size;
        let q8 = |v: f32, lo: f32, up: bool| -> u8 {
            let s = ((v - lo) / cs).clamp(0.0, 1.0) * 255.0;
            (if up { s.ceil() } else { s.floor() }) as u8
        };
        let range = self.cfg.z_max - self.cfg.z_min;
        let q16 = |v: f32, up: bool| -> u16 {
            let s = ((v - self.cfg.z_min) / range).clamp(0.0, 1.0) * 65535.0;
            (if up { s.ceil() } else { s.floor() }) as u16
        };
        CompressedBox {
            x: [q8(bbox.min.x, cmin.x, false), q8(bbox.max.x, cmin.x, true)],
            y: [q8(bbox.min.y, cmin.y, false), q8(bbox.max.y, cmin.y, true)],
            z: [q16(bbox.min.z, false), q16(bbox.max.z, true)],
        }
    }

    fn decompress(&self, cell: u32, b: &CompressedBox) -> Aabb {
        let ix = cell % self.cfg.cells_x;
        let iy = cell / self.cfg.cells_x;
        let cmin = self.cell_min(ix, iy);
        let cs = self.cfg.cell_size;
        let range = self.cfg.z_max - self.cfg.z_min;
        let z = |q: u16| self.cfg.z_min + q as f32 / 65535.0 * range;
        let xy = |qx: u8, qy: u8| {
            (cmin.x + qx as f32 / 255.0 * cs, cmin.y + qy as f32 / 255.0 * cs)
        };
        let z_lo = if b.z[0] == 0 { f32::NEG_INFINITY } else { z(b.z[0]) };
        let z_hi = if b.z[1] == u16::MAX { f32::INFINITY } else { z(b.z[1]) };
        let (x0, y0) = xy(b.x[0], b.y[0]);
        let (x1, y1) = xy(b.x[1], b.y[1]);
        Aabb::new(Vec3::new(x0, y0, z_lo), Vec3::new(x1, y1, z_hi))
    }

    fn thunk_box(&self, idx: u32) -> Aabb {
        let t = &self.thunks[idx as usize];
        if t.cell >= self.oob_cell() {
            self.wide.get(&idx).copied().unwrap_or(Aabb::EMPTY)
        } else {
            self.decompress(t.cell, &t.bbox)
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        if self.free != NIL {
            let idx = self.free;
            self.free = self.thunks[idx as usize].next;
            return Some(idx);
        }
        if self.thunks.len() >= self.cfg.max_thunks {
            return None;
        }
        self.thunks.push(GridThunk {
            entity: 0,
            next: NIL,
            next_of_entity: NIL,
            cell: 0,
            bbox: CompressedBox::default(),
            class: SimClass::Static,
        });
        Some((self.thunks.len() - 1) as u32)
    }

    /// Add an entity footprint. Cells that cannot get a thunk are dropped
    /// with a warning.
    pub fn insert(&mut self, entity: EntityId, bbox: &Aabb, class: SimClass) -> ThunkHandle {
        let mut cells = Vec::new();
        self.footprint(bbox, &mut cells);
        let mut head = NIL;
        let mut tail = NIL;
        for (n, &cell) in cells.iter().enumerate() {
            let Some(idx) = self.alloc() else {
                if !self.warned_full {
                    warn!(
                        entity,
                        placed = n,
                        wanted = cells.len(),
                        "thunk pool exhausted; footprint truncated"
                    );
                    self.warned_full = true;
                }
                break;
            };
            let bbox_c = self.compress(cell, bbox);
            let t = &mut self.thunks[idx as usize];
            t.entity = entity;
            t.cell = cell;
            t.bbox = bbox_c;
            t.class = class;
            t.next_of_entity = NIL;
            t.next = self.heads[cell as usize];
            self.heads[cell as usize] = idx;
            if cell >= self.oob_cell() {
                self.wide.insert(idx, *bbox);
            }
            if tail == NIL {
                head = idx;
            } else {
                self.thunks[tail as usize].next_of_entity = idx;
            }
            tail = idx;
            self.live += 1;
        }
        ThunkHandle(head)
    }

    /// Unlink and free every thunk of the chain.
    pub fn remove(&mut self, handle: ThunkHandle) {
        let mut idx = handle.0;
        while idx != NIL {
            let next_of_entity = self.thunks[idx as usize].next_of_entity;
            let cell = self.thunks[idx as usize].cell as usize;
            // unlink from the singly-linked cell list
            let mut cur = self.heads[cell];
            let mut prev = NIL;
            while cur != NIL && cur != idx {
                prev = cur;
                cur = self.thunks[cur as usize].next;
            }
            if cur == idx {
                let after = self.thunks[idx as usize].next;
                if prev == NIL {
                    self.heads[cell] = after;
                } else {
                    self.thunks[prev as usize].next = after;
                }
            }
            self.wide.remove(&idx);
            let t = &mut self.thunks[idx as usize];
            t.next = self.free;
            t.next_of_entity = NIL;
            t.class = SimClass::Deleted;
            self.free = idx;
            self.live -= 1;
            idx = next_of_entity;
        }
        if self.warned_full && self.live < self.cfg.max_thunks {
            self.warned_full = false;
        }
    }

    /// Move an entity's footprint. Updates in place when the covered cells
    /// are unchanged; otherwise reinserts and returns the new handle.
    pub fn reposition(
        &mut self,
        handle: ThunkHandle,
        entity: EntityId,
        bbox: &Aabb,
        class: SimClass,
    ) -> ThunkHandle {
        let mut cells = Vec::new();
        self.footprint(bbox, &mut cells);
        let mut same = !handle.is_empty();
        let mut idx = handle.0;
        for &cell in &cells {
            if idx == NIL || self.thunks[idx as usize].cell != cell {
                same = false;
                break;
            }
            idx = self.thunks[idx as usize].next_of_entity;
        }
        if same && idx == NIL {
            let mut idx = handle.0;
            while idx != NIL {
                let cell = self.thunks[idx as usize].cell;
                let bbox_c = self.compress(cell, bbox);
                if cell >= self.oob_cell() {
                    self.wide.insert(idx, *bbox);
                }
                let t = &mut self.thunks[idx as usize];
                t.bbox = bbox_c;
                t.class = class;
                idx = t.next_of_entity;
            }
            return handle;
        }
        self.remove(handle);
        self.insert(entity, bbox, class)
    }

    /// Update only the class tag carried by the thunks.
    pub fn set_class(&mut self, handle: ThunkHandle, class: SimClass) {
        let mut idx = handle.0;
        while idx != NIL {
            let t = &mut self.thunks[idx as usize];
            t.class = class;
            idx = t.next_of_entity;
        }
    }

    /// Visit thunks of one grid cell whose boxes overlap `[min, max]`.
    pub fn visit_cell(
        &self,
        ix: u32,
        iy: u32,
        min: Vec3,
        max: Vec3,
        mask: EntityTypeMask,
        f: &mut impl FnMut(EntityId, &Aabb),
    ) {
        let cell = iy * self.cfg.cells_x + ix;
        self.visit_list(cell, min, max, mask, f);
    }

    /// Visit thunks of the out-of-bounds cell overlapping `[min, max]`.
    pub fn visit_outside(
        &self,
        min: Vec3,
        max: Vec3,
        mask: EntityTypeMask,
        f: &mut impl FnMut(EntityId, &Aabb),
    ) {
        self.visit_list(self.oob_cell(), min, max, mask, f);
    }

    /// Visit the global list (unbounded and oversized entities).
    pub fn visit_global(
        &self,
        min: Vec3,
        max: Vec3,
        mask: EntityTypeMask,
        f: &mut impl FnMut(EntityId, &Aabb),
    ) {
        self.visit_list(self.global_cell(), min, max, mask, f);
    }

    fn visit_list(
        &self,
        cell: u32,
        min: Vec3,
        max: Vec3,
        mask: EntityTypeMask,
        f: &mut impl FnMut(EntityId, &Aabb),
    ) {
        let query = Aabb::new(min, max);
        let mut idx = self.heads[cell as usize];
        while idx != NIL {
            let t = &self.thunks[idx as usize];
            if mask.intersects(t.class.type_bit()) {
                let b = self.thunk_box(idx);
                if b.overlaps(&query) {
                    f(t.entity, &b);
                }
            }
            idx = t.next;
        }
    }

    pub fn is_populated(&self, ix: u32, iy: u32) -> bool {
        self.populated[(iy * self.cfg.cells_x + ix) as usize]
    }

    pub fn mark_populated(&mut self, ix: u32, iy: u32) {
        debug!(ix, iy, "cell populated");
        self.populated[(iy * self.cfg.cells_x + ix) as usize] = true;
    }

    /// Cells the entity chain currently occupies.
    pub fn cells_of(&self, handle: ThunkHandle) -> Vec<u32> {
        let mut out = Vec::new();
        let mut idx = handle.0;
        while idx != NIL {
            out.push(self.thunks[idx as usize].cell);
            idx = self.thunks[idx as usize].next_of_entity;
        }
        out
    }
}

/// Inclusive cell rectangle clamped to the grid.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CellRange {
    pub ix0: u32,
    pub iy0: u32,
    pub ix1: u32,
    pub iy1: u32,
    /// Some of the range lies outside the grid.
    pub outside: bool,
}

impl CellRange {
    pub fn is_empty(&self) -> bool {
        self.ix1 < self.ix0 || self.iy1 < self.iy0
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.ix1 - self.ix0 + 1) as usize * (self.iy1 - self.iy0 + 1) as usize
        }
    }

    pub fn cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let empty = self.is_empty();
        (self.iy0..=self.iy1)
            .flat_map(move |iy| (self.ix0..=self.ix1).map(move |ix| (ix, iy)))
            .filter(move |_| !empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GridConfig {
        GridConfig {
            cell_size: 1.0,
            cells_x: 8,
            cells_y: 8,
            origin: Vec2::ZERO,
            z_min: -10.0,
            z_max: 10.0,
            max_cells_per_entity: 16,
            ..GridConfig::default()
        }
    }

    fn collect(g: &SpatialGrid, min: Vec3, max: Vec3) -> Vec<EntityId> {
        let mut out = Vec::new();
        let range = g.cell_range(min, max);
        for (ix, iy) in range.cells() {
            g.visit_cell(ix, iy, min, max, EntityTypeMask::ALL, &mut |e, _| out.push(e));
        }
        if range.outside {
            g.visit_outside(min, max, EntityTypeMask::ALL, &mut |e, _| out.push(e));
        }
        g.visit_global(min, max, EntityTypeMask::ALL, &mut |e, _| out.push(e));
        out.sort_unstable();
        out.dedup();
        out
    }

    #[test]
    fn test_insert_covers_cells() {
        let mut g = SpatialGrid::new(cfg());
        // straddles the corner of four cells
        let b = Aabb::from_center_half(Vec3::new(2.0, 2.0, 0.0), Vec3::splat(0.5));
        let h = g.insert(7, &b, SimClass::Awake);
        assert_eq!(g.cells_of(h).len(), 4);
        assert_eq!(g.thunk_count(), 4);
        assert_eq!(collect(&g, Vec3::new(1.6, 1.6, -1.0), Vec3::new(1.7, 1.7, 1.0)), vec![7]);
        g.remove(h);
        assert_eq!(g.thunk_count(), 0);
        assert!(collect(&g, b.min, b.max).is_empty());
    }

    #[test]
    fn test_compressed_box_is_conservative() {
        let g = SpatialGrid::new(cfg());
        let b = Aabb::new(Vec3::new(3.123, 4.456, -2.345), Vec3::new(3.789, 4.9, 1.111));
        let cell = 4 * 8 + 3;
        let d = g.decompress(cell, &g.compress(cell, &b));
        assert!(d.min.x <= b.min.x && d.max.x >= b.max.x);
        assert!(d.min.y <= b.min.y && d.max.y >= b.max.y);
        assert!(d.min.z <= b.min.z && d.max.z >= b.max.z);
        assert!(d.max.x - d.min.x < b.max.x - b.min.x + 0.01);
    }

    #[test]
    fn test_thunk_boxes_reject_far_entities() {
        let mut g = SpatialGrid::new(cfg());
        let small = Aabb::new(Vec3::new(0.1, 0.1, 0.0), Vec3::new(0.2, 0.2, 1.0));
        g.insert(1, &small, SimClass::Static);
        // same cell, disjoint sub-box
        assert!(collect(&g, Vec3::new(0.6, 0.6, 0.0), Vec3::new(0.9, 0.9, 1.0)).is_empty());
        // same cell, disjoint in z
        assert!(collect(&g, Vec3::new(0.0, 0.0, 5.0), Vec3::new(1.0, 1.0, 6.0)).is_empty());
    }

    #[test]
    fn test_reposition_in_place_and_across_cells() {
        let mut g = SpatialGrid::new(cfg());
        let at = |x: f32, y: f32| Aabb::from_center_half(Vec3::new(x, y, 0.0), Vec3::splat(0.1));
        let h = g.insert(3, &at(0.5, 0.5), SimClass::Awake);
        let h2 = g.reposition(h, 3, &at(0.4, 0.6), SimClass::Awake);
        assert_eq!(h, h2);
        let h3 = g.reposition(h2, 3, &at(5.5, 5.5), SimClass::Sleeping);
        assert_eq!(g.cells_of(h3), vec![5 * 8 + 5]);
        assert!(collect(&g, Vec3::new(0.0, 0.0, -1.0), Vec3::new(1.0, 1.0, 1.0)).is_empty());
        let mut hits = Vec::new();
        let (lo, hi) = (Vec3::new(5.0, 5.0, -1.0), Vec3::new(6.0, 6.0, 1.0));
        g.visit_cell(5, 5, lo, hi, EntityTypeMask::AWAKE, &mut |e, _| hits.push(e));
        assert!(hits.is_empty(), "class filter must use the repositioned class");
    }

    #[test]
    fn test_unbounded_and_outside() {
        let mut g = SpatialGrid::new(cfg());
        let plane = Aabb::new(Vec3::splat(f32::NEG_INFINITY), Vec3::splat(f32::INFINITY));
        let hp = g.insert(1, &plane, SimClass::Static);
        assert_eq!(g.cells_of(hp), vec![g.global_cell()]);
        let far = Aabb::from_center_half(Vec3::new(-50.0, 3.0, 0.0), Vec3::splat(0.5));
        let hf = g.insert(2, &far, SimClass::Awake);
        assert_eq!(g.cells_of(hf), vec![g.oob_cell()]);
        let around = collect(&g, Vec3::new(-51.0, 2.0, -1.0), Vec3::new(-49.0, 4.0, 1.0));
        assert_eq!(around, vec![1, 2]);
        // huge but finite: global list
        let big = Aabb::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(7.9, 7.9, 1.0));
        let hb = g.insert(3, &big, SimClass::Static);
        assert_eq!(g.cells_of(hb), vec![g.global_cell()]);
    }

    #[test]
    fn test_thunk_pool_exhaustion_truncates() {
        let mut g = SpatialGrid::new(GridConfig { max_thunks: 3, ..cfg() });
        let wide = Aabb::from_center_half(Vec3::new(2.0, 2.0, 0.0), Vec3::splat(0.5));
        let h = g.insert(1, &wide, SimClass::Static);
        assert_eq!(g.cells_of(h).len(), 3);
        let small = Aabb::from_center_half(Vec3::new(5.5, 5.5, 0.0), Vec3::splat(0.1));
        let h2 = g.insert(2, &small, SimClass::Static);
        assert!(h2.is_empty());
        g.remove(h);
        let h3 = g.insert(2, &small, SimClass::Static);
        assert!(!h3.is_empty());
    }
}
