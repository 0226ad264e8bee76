use std::collections::HashMap;

use bitflags::bitflags;
use glam::Vec3;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::types::{EntityId, MaterialId, PartIndex};

const CHUNK: usize = 64;
const NIL: u32 = u32::MAX;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ContactFlags: u8 {
        /// Soft contact: penetration is resolved with reduced stiffness.
        const COMPLIANT        = 1 << 0;
        /// Warm-started from the impulse archived for the same pair last tick.
        const PRESERVE_IMPULSE = 1 << 1;
        /// Generated by a point constraint rather than by geometry.
        const CONSTRAINT       = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContactHandle(u32);

/// One contact point between two (entity, part) references.
///
/// The normal points from side 1 into side 0.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Contact {
    pub entities: [EntityId; 2],
    pub parts: [PartIndex; 2],
    /// Body within each entity (joint index for articulated entities).
    pub bodies: [u16; 2],
    pub materials: [MaterialId; 2],
    pub point: Vec3,
    pub normal: Vec3,
    pub depth: f32,
    /// Desired relative normal velocity after resolution.
    pub target_vrel: f32,
    pub friction: f32,
    pub bounciness: f32,
    pub flags: ContactFlags,
    /// Accumulated normal impulse.
    pub impulse: f32,
    pub tangent_impulse: [f32; 2],
    /// Constraint contacts break above this impulse (0 disables breaking).
    pub max_impulse: f32,
    pub constraint_slot: Option<u8>,
}

impl Default for Contact {
    fn default() -> Self {
        Self {
            entities: [0; 2],
            parts: [0; 2],
            bodies: [0; 2],
            materials: [0; 2],
            point: Vec3::ZERO,
            normal: Vec3::Z,
            depth: 0.0,
            target_vrel: 0.0,
            friction: 0.5,
            bounciness: 0.0,
            flags: ContactFlags::empty(),
            impulse: 0.0,
            tangent_impulse: [0.0; 2],
            max_impulse: 0.0,
            constraint_slot: None,
        }
    }
}

impl Contact {
    /// Archive key, independent of which side is stored first.
    pub fn key(&self) -> ContactKey {
        if self.entities[0] <= self.entities[1] {
            ContactKey { entities: self.entities, parts: self.parts }
        } else {
            ContactKey {
                entities: [self.entities[1], self.entities[0]],
                parts: [self.parts[1], self.parts[0]],
            }
        }
    }

    pub fn involves(&self, entity: EntityId) -> bool {
        self.entities[0] == entity || self.entities[1] == entity
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContactKey {
    pub entities: [EntityId; 2],
    pub parts: [PartIndex; 2],
}

fn pair_key(a: EntityId, b: EntityId) -> (EntityId, EntityId) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Clone, Debug)]
struct Slot {
    contact: Contact,
    live: bool,
    attached: bool,
    /// Next contact in each side's entity list; doubles as the free-list link.
    next: [u32; 2],
}

impl Default for Slot {
    fn default() -> Self {
        Self { contact: Contact::default(), live: false, attached: false, next: [NIL; 2] }
    }
}

#[derive(Default)]
struct ContactPool {
    chunks: Vec<Box<[Slot]>>,
    free: u32,
    live: usize,
    heads: HashMap<EntityId, u32>,
    /// Impulses recorded while releasing this tick's contacts.
    archive: HashMap<ContactKey, f32>,
    pair_totals: HashMap<(EntityId, EntityId), f32>,
    entity_totals: HashMap<EntityId, f32>,
    /// Snapshot of the above from the previous release round.
    prev_archive: HashMap<ContactKey, f32>,
    prev_pair_totals: HashMap<(EntityId, EntityId), f32>,
    prev_entity_totals: HashMap<EntityId, f32>,
    warned_full: bool,
}

impl ContactPool {
    fn slot(&self, idx: u32) -> &Slot {
        &self.chunks[idx as usize / CHUNK][idx as usize % CHUNK]
    }

    fn slot_mut(&mut self, idx: u32) -> &mut Slot {
        &mut self.chunks[idx as usize / CHUNK][idx as usize % CHUNK]
    }

    fn capacity(&self) -> usize {
        self.chunks.len() * CHUNK
    }

    fn grow(&mut self, max_contacts: usize) -> bool {
        if self.capacity() + CHUNK > max_contacts.max(CHUNK) {
            return false;
        }
        let base = self.capacity() as u32;
        let mut chunk = vec![Slot::default(); CHUNK].into_boxed_slice();
        // thread the new slots onto the free list
        for (i, slot) in chunk.iter_mut().enumerate() {
            slot.next[0] = if i + 1 < CHUNK { base + i as u32 + 1 } else { self.free };
        }
        self.chunks.push(chunk);
        self.free = base;
        true
    }

    fn side(&self, idx: u32, entity: EntityId) -> usize {
        let c = &self.slot(idx).contact;
        if c.entities[0] == entity { 0 } else { 1 }
    }

    fn link(&mut self, idx: u32) {
        let entities = self.slot(idx).contact.entities;
        for side in 0..2 {
            if side == 1 && entities[1] == entities[0] {
                break;
            }
            let head = self.heads.get(&entities[side]).copied().unwrap_or(NIL);
            self.slot_mut(idx).next[side] = head;
            self.heads.insert(entities[side], idx);
        }
        self.slot_mut(idx).attached = true;
    }

    fn unlink(&mut self, idx: u32) {
        if !self.slot(idx).attached {
            return;
        }
        let entities = self.slot(idx).contact.entities;
        for side in 0..2 {
            if side == 1 && entities[1] == entities[0] {
                break;
            }
            let entity = entities[side];
            let after = self.slot(idx).next[side];
            let mut cur = self.heads.get(&entity).copied().unwrap_or(NIL);
            let mut prev = NIL;
            while cur != NIL && cur != idx {
                prev = cur;
                let s = self.side(cur, entity);
                cur = self.slot(cur).next[s];
            }
            if cur != idx {
                continue;
            }
            if prev == NIL {
                if after == NIL {
                    self.heads.remove(&entity);
                } else {
                    self.heads.insert(entity, after);
                }
            } else {
                let s = self.side(prev, entity);
                self.slot_mut(prev).next[s] = after;
            }
        }
        let slot = self.slot_mut(idx);
        slot.attached = false;
        slot.next = [NIL; 2];
    }

    fn release(&mut self, idx: u32) {
        self.unlink(idx);
        let free = self.free;
        let slot = self.slot_mut(idx);
        slot.live = false;
        slot.next = [free, NIL];
        self.free = idx;
        self.live -= 1;
    }

    fn archive(&mut self, idx: u32) {
        let c = self.slot(idx).contact;
        let key = c.key();
        *self.archive.entry(key).or_insert(0.0) += c.impulse;
        *self.pair_totals.entry(pair_key(c.entities[0], c.entities[1])).or_insert(0.0) += c.impulse;
        for e in c.entities {
            *self.entity_totals.entry(e).or_insert(0.0) += c.impulse;
        }
    }

    fn list(&self, entity: EntityId) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = self.heads.get(&entity).copied().unwrap_or(NIL);
        while cur != NIL {
            out.push(cur);
            let s = self.side(cur, entity);
            cur = self.slot(cur).next[s];
        }
        out
    }

    fn valid(&self, idx: u32) -> bool {
        (idx as usize) < self.capacity() && self.slot(idx).live
    }
}

/// Pooled contact storage shared by all island workers.
///
/// Records live in 64-entry chunks with the free list threaded through them.
/// Every operation takes the registry mutex, which is a leaf lock.
pub struct ContactRegistry {
    pool: Mutex<ContactPool>,
    max_contacts: usize,
}

impl ContactRegistry {
    pub fn new(max_contacts: usize) -> Self {
        Self { pool: Mutex::new(ContactPool { free: NIL, ..ContactPool::default() }), max_contacts }
    }

    /// Store a new contact. A contact whose (pair, part pair) was archived in
    /// the previous round is flagged `PRESERVE_IMPULSE` and warm-started.
    pub fn allocate(&self, mut contact: Contact) -> Option<ContactHandle> {
        let mut pool = self.pool.lock();
        if pool.free == NIL && !pool.grow(self.max_contacts) {
            if !pool.warned_full {
                warn!(max = self.max_contacts, "contact pool exhausted; contact dropped");
                pool.warned_full = true;
            }
            return None;
        }
        if let Some(&imp) = pool.prev_archive.get(&contact.key()) {
            if !contact.flags.contains(ContactFlags::PRESERVE_IMPULSE) {
                contact.flags |= ContactFlags::PRESERVE_IMPULSE;
                contact.impulse = imp;
            }
        }
        let idx = pool.free;
        pool.free = pool.slot(idx).next[0];
        pool.live += 1;
        let slot = pool.slot_mut(idx);
        slot.contact = contact;
        slot.live = true;
        slot.attached = false;
        slot.next = [NIL; 2];
        Some(ContactHandle(idx))
    }

    pub fn free(&self, handle: ContactHandle) {
        let mut pool = self.pool.lock();
        if pool.valid(handle.0) {
            pool.release(handle.0);
        }
    }

    /// Bind the contact to entities `a` and `b` and link it into both lists.
    pub fn attach(&self, a: EntityId, b: EntityId, handle: ContactHandle) {
        let mut pool = self.pool.lock();
        if !pool.valid(handle.0) {
            return;
        }
        pool.unlink(handle.0);
        pool.slot_mut(handle.0).contact.entities = [a, b];
        pool.link(handle.0);
    }

    pub fn detach(&self, handle: ContactHandle) {
        let mut pool = self.pool.lock();
        if pool.valid(handle.0) {
            pool.unlink(handle.0);
        }
    }

    /// Record the contact's impulse for warm starting, then free it.
    pub fn archive_and_release(&self, handle: ContactHandle) {
        let mut pool = self.pool.lock();
        if pool.valid(handle.0) {
            pool.archive(handle.0);
            pool.release(handle.0);
        }
    }

    /// Archive and free every live contact, then make this round's archive
    /// the one consulted by `allocate`. Returns the number released.
    pub fn release_all(&self) -> usize {
        let mut pool = self.pool.lock();
        let mut n = 0;
        for idx in 0..pool.capacity() as u32 {
            if pool.slot(idx).live {
                pool.archive(idx);
                pool.release(idx);
                n += 1;
            }
        }
        let pool = &mut *pool;
        pool.prev_archive = std::mem::take(&mut pool.archive);
        pool.prev_pair_totals = std::mem::take(&mut pool.pair_totals);
        pool.prev_entity_totals = std::mem::take(&mut pool.entity_totals);
        pool.warned_full = false;
        trace!(released = n, "contacts archived");
        n
    }

    pub fn with<R>(&self, handle: ContactHandle, f: impl FnOnce(&Contact) -> R) -> Option<R> {
        let pool = self.pool.lock();
        pool.valid(handle.0).then(|| f(&pool.slot(handle.0).contact))
    }

    pub fn with_mut<R>(
        &self,
        handle: ContactHandle,
        f: impl FnOnce(&mut Contact) -> R,
    ) -> Option<R> {
        let mut pool = self.pool.lock();
        if !pool.valid(handle.0) {
            return None;
        }
        Some(f(&mut pool.slot_mut(handle.0).contact))
    }

    pub fn contacts_of(&self, entity: EntityId) -> Vec<ContactHandle> {
        self.pool.lock().list(entity).into_iter().map(ContactHandle).collect()
    }

    pub fn has_contacts(&self, entity: EntityId) -> bool {
        self.pool.lock().heads.contains_key(&entity)
    }

    /// Entities sharing a live contact with `entity`.
    pub fn partners_of(&self, entity: EntityId) -> Vec<EntityId> {
        let pool = self.pool.lock();
        let mut out: Vec<EntityId> = pool
            .list(entity)
            .into_iter()
            .map(|idx| {
                let c = &pool.slot(idx).contact;
                if c.entities[0] == entity { c.entities[1] } else { c.entities[0] }
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Free every contact of `entity` without archiving.
    pub fn release_entity(&self, entity: EntityId) {
        let mut pool = self.pool.lock();
        for idx in pool.list(entity) {
            pool.release(idx);
        }
        pool.prev_entity_totals.remove(&entity);
    }

    /// Total normal impulse exchanged by the pair in the last archived round.
    pub fn archived_impulse(&self, a: EntityId, b: EntityId) -> f32 {
        self.pool.lock().prev_pair_totals.get(&pair_key(a, b)).copied().unwrap_or(0.0)
    }

    /// Impulse archived for a specific (pair, part pair) key.
    pub fn warm_start(&self, key: &ContactKey) -> Option<f32> {
        self.pool.lock().prev_archive.get(key).copied()
    }

    /// Total normal impulse `entity` received in the last archived round.
    pub fn last_impulse(&self, entity: EntityId) -> f32 {
        self.pool.lock().prev_entity_totals.get(&entity).copied().unwrap_or(0.0)
    }

    pub fn live_count(&self) -> usize {
        self.pool.lock().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(a: EntityId, b: EntityId) -> Contact {
        Contact { entities: [a, b], ..Contact::default() }
    }

    #[test]
    fn test_allocate_attach_lists() {
        let reg = ContactRegistry::new(1024);
        let h1 = reg.allocate(contact(1, 2)).expect("slot");
        let h2 = reg.allocate(contact(1, 3)).expect("slot");
        reg.attach(1, 2, h1);
        reg.attach(1, 3, h2);
        assert_eq!(reg.contacts_of(1).len(), 2);
        assert_eq!(reg.contacts_of(2), vec![h1]);
        assert_eq!(reg.partners_of(1), vec![2, 3]);
        reg.detach(h1);
        assert_eq!(reg.contacts_of(1), vec![h2]);
        assert!(!reg.has_contacts(2));
        reg.free(h1);
        reg.free(h2);
        assert_eq!(reg.live_count(), 0);
        assert!(!reg.has_contacts(1));
    }

    #[test]
    fn test_chunks_grow_and_reuse() {
        let reg = ContactRegistry::new(4096);
        let handles: Vec<_> = (0..200).filter_map(|i| reg.allocate(contact(i, i + 1))).collect();
        assert_eq!(handles.len(), 200);
        assert_eq!(reg.live_count(), 200);
        for h in &handles[..100] {
            reg.free(*h);
        }
        let again = reg.allocate(contact(7, 8)).expect("slot");
        assert!(handles[..100].contains(&again));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let reg = ContactRegistry::new(64);
        for _ in 0..64 {
            assert!(reg.allocate(contact(1, 2)).is_some());
        }
        assert!(reg.allocate(contact(1, 2)).is_none());
    }

    #[test]
    fn test_archive_warm_starts_matching_key() {
        let reg = ContactRegistry::new(1024);
        let h = reg.allocate(Contact { parts: [0, 2], ..contact(5, 9) }).expect("slot");
        reg.attach(5, 9, h);
        reg.with_mut(h, |c| c.impulse = 1.5);
        assert_eq!(reg.release_all(), 1);
        assert_eq!(reg.archived_impulse(9, 5), 1.5);
        assert_eq!(reg.last_impulse(5), 1.5);

        // same pair stored the other way round still matches
        let h2 = reg.allocate(Contact { parts: [2, 0], ..contact(9, 5) }).expect("slot");
        let c = reg.with(h2, |c| *c).expect("live");
        assert!(c.flags.contains(ContactFlags::PRESERVE_IMPULSE));
        assert_eq!(c.impulse, 1.5);
        let fresh = reg.allocate(Contact { parts: [1, 1], ..contact(5, 9) }).expect("slot");
        assert_eq!(reg.with(fresh, |c| c.flags), Some(ContactFlags::empty()));
    }

    #[test]
    fn test_release_entity_and_stale_handles() {
        let reg = ContactRegistry::new(1024);
        let h = reg.allocate(contact(1, 2)).expect("slot");
        reg.attach(1, 2, h);
        reg.release_entity(2);
        assert!(reg.contacts_of(1).is_empty());
        assert!(reg.with(h, |_| ()).is_none());
        // double free is ignored
        reg.free(h);
        assert_eq!(reg.live_count(), 0);
    }
}
