// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rule cache and provider (C2, §4.2). Keyed by `(table, family, chain,
//! handle)`; `NEWRULE`/`DELRULE` notifications upsert with a fresh
//! `seen_at`, and a TTL sweeper physically drops tombstoned entries once
//! they've aged past `ttl`. Reads are many, writes are exclusive — an
//! `RwLock` rather than a single mutex, since `get_rule_for_trace` is on
//! the hot collector path and refreshes are comparatively rare.
//!
//! A cache miss is not terminal: §4.2 requires a synchronous
//! `NFT_MSG_GETRULE` query against the kernel to populate the entry
//! before giving up, since a ruleset loaded before this process started
//! is never announced over the `NFNLGRP_NFTABLES` multicast group the
//! background rule provider subscribes to. That query is injected as a
//! closure (`query`) rather than a direct netlink dependency, so this
//! module stays free of socket plumbing and the fallback stays easy to
//! exercise with a fake in unit tests.

use crate::cancel::CancellationToken;
use crate::errors::RuleCacheError;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub table: String,
    pub family: u8,
    pub chain: String,
    pub handle: u64,
}

#[derive(Debug, Clone)]
pub struct RuleEntry {
    pub key: RuleKey,
    pub expressions: Vec<u8>,
    pub text: String,
    pub removed: bool,
    pub seen_at: Instant,
}

type RuleQuery = dyn Fn(&RuleKey) -> Result<String> + Send + Sync;

pub struct RuleCache {
    entries: Arc<RwLock<HashMap<RuleKey, RuleEntry>>>,
    ttl: Duration,
    query: Arc<RuleQuery>,
}

impl RuleCache {
    /// `ttl` below 1s is rejected — too aggressive a sweep would purge
    /// tombstones the collector still needs to resolve in-flight traces
    /// against (§4.2 invariant iv). Cache misses are never queried
    /// against the kernel; use [`RuleCache::with_query`] to wire that up.
    pub fn new(ttl: Duration) -> Result<Self> {
        Self::with_query(ttl, |key| {
            Err(anyhow!("no rule query configured for {}/{}#{}", key.table, key.chain, key.handle))
        })
    }

    /// Like [`RuleCache::new`], but a cache miss falls back to `query`
    /// (a synchronous `NFT_MSG_GETRULE` lookup in production, wired up in
    /// `main` against [`crate::providers::rule_provider::query_rule_sync`]).
    pub fn with_query(
        ttl: Duration,
        query: impl Fn(&RuleKey) -> Result<String> + Send + Sync + 'static,
    ) -> Result<Self> {
        if ttl < Duration::from_secs(1) {
            return Err(anyhow!("rule cache ttl must be >= 1s, got {ttl:?}"));
        }
        Ok(Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            query: Arc::new(query),
        })
    }

    /// §4.2: return the cached entry if `!removed` or it was removed no
    /// earlier than the packet was traced; on a miss, issue a
    /// synchronous kernel query, populate the cache, and return that.
    pub fn get_rule_for_trace(&self, key: &RuleKey, traced_at: Instant) -> Result<RuleEntry, RuleCacheError> {
        if let Some(entry) = self.entries.read().expect("rule cache lock poisoned").get(key) {
            if entry.removed && entry.seen_at < traced_at {
                return Err(RuleCacheError::Expired {
                    table: key.table.clone(),
                    chain: key.chain.clone(),
                    handle: key.handle,
                });
            }
            return Ok(entry.clone());
        }

        let text = (self.query)(key).map_err(|e| RuleCacheError::QueryFailed {
            table: key.table.clone(),
            chain: key.chain.clone(),
            handle: key.handle,
            reason: e.to_string(),
        })?;
        self.upsert(key.clone(), Vec::new(), text, false);
        self.entries
            .read()
            .expect("rule cache lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| RuleCacheError::NotFound {
                table: key.table.clone(),
                chain: key.chain.clone(),
                handle: key.handle,
            })
    }

    pub fn upsert(&self, key: RuleKey, expressions: Vec<u8>, text: String, removed: bool) {
        let mut entries = self.entries.write().expect("rule cache lock poisoned");
        entries.insert(
            key.clone(),
            RuleEntry {
                key,
                expressions,
                text,
                removed,
                seen_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("rule cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the TTL sweeper. Wakes early on cancellation via
    /// `CancellationToken::wait_timeout` rather than a plain sleep, so
    /// shutdown isn't delayed by up to a full `ttl` interval.
    pub fn start_cleaner(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        let ttl = self.ttl;
        thread::spawn(move || loop {
            if cancel.wait_timeout(ttl) {
                return;
            }
            let now = Instant::now();
            let mut entries = entries.write().expect("rule cache lock poisoned");
            entries.retain(|_, e| !(e.removed && now.duration_since(e.seen_at) >= ttl));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RuleKey {
        RuleKey { table: "filter".into(), family: 2, chain: "input".into(), handle: 1 }
    }

    #[test]
    fn rejects_sub_second_ttl() {
        assert!(RuleCache::new(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn query_failure_surfaces_when_never_inserted() {
        let cache = RuleCache::new(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            cache.get_rule_for_trace(&key(), Instant::now()),
            Err(RuleCacheError::QueryFailed { .. })
        ));
    }

    #[test]
    fn cache_miss_falls_back_to_synchronous_query_and_populates() {
        let cache = RuleCache::with_query(Duration::from_secs(5), |k| {
            Ok(format!("accept # handle {}", k.handle))
        })
        .unwrap();
        assert_eq!(cache.len(), 0);

        let entry = cache.get_rule_for_trace(&key(), Instant::now()).unwrap();
        assert_eq!(entry.text, "accept # handle 1");
        assert_eq!(cache.len(), 1);

        // second lookup is served from cache, the query is not consulted again
        let entry = cache.get_rule_for_trace(&key(), Instant::now()).unwrap();
        assert_eq!(entry.text, "accept # handle 1");
    }

    #[test]
    fn query_error_is_wrapped_and_does_not_populate_the_cache() {
        let cache = RuleCache::with_query(Duration::from_secs(5), |_| Err(anyhow!("kernel unreachable"))).unwrap();
        assert!(matches!(
            cache.get_rule_for_trace(&key(), Instant::now()),
            Err(RuleCacheError::QueryFailed { .. })
        ));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn expired_when_removed_before_traced_at() {
        let cache = RuleCache::new(Duration::from_secs(5)).unwrap();
        cache.upsert(key(), vec![], "accept".into(), true);
        let traced_at = Instant::now() + Duration::from_millis(10);
        assert!(matches!(
            cache.get_rule_for_trace(&key(), traced_at),
            Err(RuleCacheError::Expired { .. })
        ));
    }

    #[test]
    fn returned_when_removed_after_traced_at() {
        let cache = RuleCache::new(Duration::from_secs(5)).unwrap();
        let traced_at = Instant::now();
        thread::sleep(Duration::from_millis(5));
        cache.upsert(key(), vec![], "accept".into(), true);
        let entry = cache.get_rule_for_trace(&key(), traced_at).unwrap();
        assert!(entry.removed);
    }

    #[test]
    fn returned_when_not_removed() {
        let cache = RuleCache::new(Duration::from_secs(5)).unwrap();
        cache.upsert(key(), vec![], "accept".into(), false);
        assert!(cache.get_rule_for_trace(&key(), Instant::now()).is_ok());
    }
}
