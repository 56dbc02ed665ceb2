// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Interface cache and provider (C3, §4.3). A bidirectional
//! `ifindex <-> ifname` map seeded by a link dump and kept current by
//! `NEWLINK`/`DELLINK` notifications.

use crate::bimap::BiMap;
use crate::errors::IfaceCacheError;
use std::sync::RwLock;

pub struct IfaceCache {
    map: RwLock<BiMap<u32, String, ()>>,
}

impl IfaceCache {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BiMap::new()),
        }
    }

    pub fn get_iface(&self, ifindex: u32) -> Result<String, IfaceCacheError> {
        self.map
            .read()
            .expect("iface cache lock poisoned")
            .get_by_a(&ifindex)
            .map(|(name, _)| name.clone())
            .ok_or(IfaceCacheError::CacheMiss(ifindex))
    }

    pub fn update(&self, ifindex: u32, ifname: String) {
        self.map.write().expect("iface cache lock poisoned").insert(ifindex, ifname, ());
    }

    pub fn remove_by_name(&self, ifname: &str) {
        self.map
            .write()
            .expect("iface cache lock poisoned")
            .remove_by_b(&ifname.to_string());
    }

    /// Replaces the cache atomically from the reader's perspective: a
    /// concurrent `get_iface` sees either the old full map or the new
    /// one, never a partially-cleared one, since the whole swap happens
    /// under a single write lock.
    pub fn reload(&self, links: impl IntoIterator<Item = (u32, String)>) {
        let mut map = self.map.write().expect("iface cache lock poisoned");
        map.clear();
        for (ifindex, ifname) in links {
            map.insert(ifindex, ifname, ());
        }
    }
}

impl Default for IfaceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_iface_misses_when_empty() {
        let cache = IfaceCache::new();
        assert!(matches!(cache.get_iface(1), Err(IfaceCacheError::CacheMiss(1))));
    }

    #[test]
    fn update_then_lookup_round_trips() {
        let cache = IfaceCache::new();
        cache.update(2, "eth0".to_string());
        assert_eq!(cache.get_iface(2).unwrap(), "eth0");
    }

    #[test]
    fn remove_by_name_clears_the_index_view_too() {
        let cache = IfaceCache::new();
        cache.update(2, "eth0".to_string());
        cache.remove_by_name("eth0");
        assert!(cache.get_iface(2).is_err());
    }

    #[test]
    fn reload_replaces_the_whole_set() {
        let cache = IfaceCache::new();
        cache.update(1, "lo".to_string());
        cache.reload(vec![(2, "eth0".to_string()), (3, "eth1".to_string())]);
        assert!(cache.get_iface(1).is_err());
        assert_eq!(cache.get_iface(2).unwrap(), "eth0");
        assert_eq!(cache.get_iface(3).unwrap(), "eth1");
    }
}
