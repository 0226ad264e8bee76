use std::collections::HashMap;

use crate::types::EntityId;

/// Disjoint-set forest with path halving and union by rank.
#[derive(Clone, Debug, Default)]
pub struct UnionFind {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn push(&mut self) -> usize {
        let i = self.parent.len();
        self.parent.push(i as u32);
        self.rank.push(0);
        i
    }

    pub fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] as usize != i {
            let grand = self.parent[self.parent[i] as usize];
            self.parent[i] = grand;
            i = grand as usize;
        }
        i
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb as u32,
            std::cmp::Ordering::Greater => self.parent[rb] = ra as u32,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra as u32;
                self.rank[ra] += 1;
            }
        }
    }
}

/// One group of entities that must be stepped together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Island {
    /// Sorted ascending; workers lock in this order.
    pub entities: Vec<EntityId>,
}

/// Collects entities and links for one tick, then partitions them.
#[derive(Default)]
pub struct IslandBuilder {
    index: HashMap<EntityId, usize>,
    ids: Vec<EntityId>,
    sets: UnionFind,
}

impl IslandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity. Returns false if it was already present.
    pub fn add(&mut self, id: EntityId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let i = self.sets.push();
        self.index.insert(id, i);
        self.ids.push(id);
        true
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Join the sets of `a` and `b`; ignored unless both were added.
    pub fn link(&mut self, a: EntityId, b: EntityId) {
        if let (Some(&ia), Some(&ib)) = (self.index.get(&a), self.index.get(&b)) {
            self.sets.union(ia, ib);
        }
    }

    /// Islands ordered by their smallest entity id.
    pub fn build(mut self) -> Vec<Island> {
        let mut groups: HashMap<usize, Vec<EntityId>> = HashMap::new();
        for i in 0..self.ids.len() {
            let root = self.sets.find(i);
            groups.entry(root).or_default().push(self.ids[i]);
        }
        let mut islands: Vec<Island> = groups
            .into_values()
            .map(|mut entities| {
                entities.sort_unstable();
                Island { entities }
            })
            .collect();
        islands.sort_unstable_by_key(|i| i.entities[0]);
        islands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chains_merge_and_singletons_stay() {
        let mut b = IslandBuilder::new();
        for id in [5, 1, 9, 3, 7] {
            assert!(b.add(id));
        }
        assert!(!b.add(5));
        b.link(1, 3);
        b.link(3, 9);
        // unknown partner (static or not added): no effect
        b.link(7, 42);
        let islands = b.build();
        assert_eq!(
            islands,
            vec![
                Island { entities: vec![1, 3, 9] },
                Island { entities: vec![5] },
                Island { entities: vec![7] },
            ]
        );
    }

    #[test]
    fn test_union_find_deep_chain() {
        let mut uf = UnionFind::default();
        for _ in 0..1000 {
            uf.push();
        }
        for i in 1..1000 {
            uf.union(i - 1, i);
        }
        let r = uf.find(0);
        assert!((0..1000).all(|i| uf.find(i) == r));
    }
}
