// src/core/resolver.rs

//! Per-map LWW conflict resolvers. A registered resolver is consulted before
//! every LWW merge that finds an existing record; it chooses the survivor or
//! rejects the write outright.

use crate::core::crdt::LwwRecord;
use crate::core::protocol::ResolverStrategy;
use crate::core::query::cmp_values;
use dashmap::DashMap;
use std::cmp::Ordering;

/// The resolver's verdict for one conflicting write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    UseIncoming,
    KeepExisting,
    Rejected,
}

/// Registry of per-map resolver strategies.
#[derive(Debug, Default)]
pub struct ResolverManager {
    resolvers: DashMap<String, ResolverStrategy>,
}

impl ResolverManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, map: &str, strategy: ResolverStrategy) {
        self.resolvers.insert(map.to_string(), strategy);
    }

    pub fn unregister(&self, map: &str) -> bool {
        self.resolvers.remove(map).is_some()
    }

    pub fn get(&self, map: &str) -> Option<ResolverStrategy> {
        self.resolvers.get(map).map(|e| *e.value())
    }

    pub fn list(&self) -> Vec<(String, ResolverStrategy)> {
        self.resolvers
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Decides the survivor between the stored record and an incoming write.
    pub fn resolve(
        &self,
        map: &str,
        existing: &LwwRecord,
        incoming: &LwwRecord,
    ) -> Option<Resolution> {
        let strategy = self.get(map)?;
        Some(match strategy {
            ResolverStrategy::LastWriterWins => {
                if incoming.timestamp > existing.timestamp {
                    Resolution::UseIncoming
                } else {
                    Resolution::KeepExisting
                }
            }
            ResolverStrategy::MinValue => match cmp_values(&incoming.value, &existing.value) {
                Ordering::Less => Resolution::UseIncoming,
                _ => Resolution::KeepExisting,
            },
            ResolverStrategy::MaxValue => match cmp_values(&incoming.value, &existing.value) {
                Ordering::Greater => Resolution::UseIncoming,
                _ => Resolution::KeepExisting,
            },
            ResolverStrategy::RejectOlder => {
                if incoming.timestamp < existing.timestamp {
                    Resolution::Rejected
                } else {
                    Resolution::UseIncoming
                }
            }
        })
    }
}

