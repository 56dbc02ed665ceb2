// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! A generic bidirectional map: `A` owns the value, `B` is a secondary
//! key into the same value (Design Notes §9 "Bidirectional map"). Insert
//! evicts whichever existing entry collides on either axis, keeping both
//! views mutually consistent (Testable Property 1).

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct BiMap<A, B, V> {
    fwd: HashMap<A, (B, V)>,
    rev: HashMap<B, A>,
}

impl<A, B, V> BiMap<A, B, V>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            fwd: HashMap::new(),
            rev: HashMap::new(),
        }
    }

    /// Inserts `(a, b) -> v`. Any existing entry keyed by `a` or by `b` is
    /// evicted first, so the two views never disagree.
    pub fn insert(&mut self, a: A, b: B, v: V) {
        if let Some((old_b, _)) = self.fwd.remove(&a) {
            self.rev.remove(&old_b);
        }
        if let Some(old_a) = self.rev.remove(&b) {
            self.fwd.remove(&old_a);
        }
        self.fwd.insert(a.clone(), (b.clone(), v));
        self.rev.insert(b, a);
    }

    pub fn get_by_a(&self, a: &A) -> Option<(&B, &V)> {
        self.fwd.get(a).map(|(b, v)| (b, v))
    }

    pub fn get_by_b(&self, b: &B) -> Option<(&A, &V)> {
        let a = self.rev.get(b)?;
        self.fwd.get(a).map(|(_, v)| (a, v))
    }

    pub fn remove_by_a(&mut self, a: &A) -> Option<(B, V)> {
        let (b, v) = self.fwd.remove(a)?;
        self.rev.remove(&b);
        Some((b, v))
    }

    pub fn remove_by_b(&mut self, b: &B) -> Option<(A, V)> {
        let a = self.rev.remove(b)?;
        let (_, v) = self.fwd.remove(&a)?;
        Some((a, v))
    }

    pub fn clear(&mut self) {
        self.fwd.clear();
        self.rev.clear();
    }

    pub fn len(&self) -> usize {
        self.fwd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fwd.is_empty()
    }
}

impl<A, B, V> Default for BiMap<A, B, V>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_both_ways() {
        let mut m: BiMap<u32, String, ()> = BiMap::new();
        m.insert(1, "eth0".to_string(), ());
        assert_eq!(m.get_by_a(&1).unwrap().0, "eth0");
        assert_eq!(*m.get_by_b(&"eth0".to_string()).unwrap().0, 1);
    }

    #[test]
    fn insert_evicts_collision_on_primary_key() {
        let mut m: BiMap<u32, String, ()> = BiMap::new();
        m.insert(1, "eth0".to_string(), ());
        m.insert(1, "eth1".to_string(), ());
        assert_eq!(m.get_by_a(&1).unwrap().0, "eth1");
        assert!(m.get_by_b(&"eth0".to_string()).is_none());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn insert_evicts_collision_on_secondary_key() {
        let mut m: BiMap<u32, String, ()> = BiMap::new();
        m.insert(1, "eth0".to_string(), ());
        m.insert(2, "eth0".to_string(), ());
        assert!(m.get_by_a(&1).is_none());
        assert_eq!(*m.get_by_b(&"eth0".to_string()).unwrap().0, 2);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn remove_by_either_key_keeps_views_coherent() {
        let mut m: BiMap<u32, String, ()> = BiMap::new();
        m.insert(1, "eth0".to_string(), ());
        m.remove_by_a(&1);
        assert!(m.get_by_b(&"eth0".to_string()).is_none());

        m.insert(2, "eth1".to_string(), ());
        m.remove_by_b(&"eth1".to_string());
        assert!(m.get_by_a(&2).is_none());
    }
}
