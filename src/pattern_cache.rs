// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Interns the stop patterns created by realtime messages. The cache lives
//! next to the working buffer and is only touched under the writer lock, but
//! it outlives individual update batches.

use crate::models::{FeedScopedId, Route};
use crate::pattern::{StopPattern, TripPattern};
use crate::timetable::Timetable;
use ahash::AHashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct TripPatternCache {
    cache: AHashMap<StopPattern, Arc<TripPattern>>,
    patterns_for_route: AHashMap<FeedScopedId, Vec<Arc<TripPattern>>>,
}

impl TripPatternCache {
    pub fn new() -> Self {
        TripPatternCache::default()
    }

    /// Get the pattern interned for this stop pattern, or create one and
    /// register it under the owning route.
    pub fn get_or_create_trip_pattern(
        &mut self,
        stop_pattern: StopPattern,
        route: &Arc<Route>,
    ) -> Arc<TripPattern> {
        if let Some(existing) = self.cache.get(&stop_pattern) {
            return existing.clone();
        }
        let pattern = Arc::new(TripPattern::new(
            route.clone(),
            stop_pattern.clone(),
            Arc::new(Timetable::empty()),
            true,
        ));
        self.cache.insert(stop_pattern, pattern.clone());
        self.patterns_for_route
            .entry(route.id.clone())
            .or_default()
            .push(pattern.clone());
        pattern
    }

    pub fn patterns_for_route(&self, route_id: &FeedScopedId) -> &[Arc<TripPattern>] {
        self.patterns_for_route
            .get(route_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
