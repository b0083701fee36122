// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! The timetable snapshot: both the writer's working buffer and the immutable
//! view handed to routing threads share this shape. Commit freezes a clone
//! that shares unchanged timetables, so snapshotting stays cheap under the
//! publish throttle.

use crate::models::Route;
use crate::pattern::TripPattern;
use crate::timetable::{Timetable, TripTimes};
use ahash::{AHashMap, AHashSet};
use chrono::NaiveDate;
use compact_str::CompactString;
use log::warn;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct TimetableSnapshot {
    /// Realtime overlay timetables per pattern and service date.
    timetables: AHashMap<(u64, NaiveDate), Arc<Timetable>>,
    /// Every pattern that currently backs an overlay.
    patterns: AHashMap<u64, Arc<TripPattern>>,
    /// The pattern of the most recent added/modified trip per id and date.
    last_added_trip_pattern: AHashMap<(CompactString, NaiveDate), Arc<TripPattern>>,
    /// Routes of realtime-created patterns, kept so purging can drop them.
    realtime_pattern_routes: AHashMap<u64, Arc<Route>>,
    dirty: bool,
    read_only: bool,
}

impl TimetableSnapshot {
    pub fn new() -> Self {
        TimetableSnapshot::default()
    }

    /// The empty committed snapshot published before any update arrives.
    pub fn empty_committed() -> Arc<TimetableSnapshot> {
        Arc::new(TimetableSnapshot {
            read_only: true,
            ..TimetableSnapshot::default()
        })
    }

    /// Write one updated row into the overlay for `(pattern, service_date)`,
    /// copying the timetable first so published snapshots never see the edit.
    pub fn update(
        &mut self,
        pattern: &Arc<TripPattern>,
        updated_trip_times: TripTimes,
        service_date: NaiveDate,
    ) -> bool {
        if self.read_only {
            warn!("attempt to modify a committed timetable snapshot");
            return false;
        }
        if !updated_trip_times.times_are_valid() {
            warn!(
                "trip times for trip {} are not monotone or out of range, rejecting update",
                updated_trip_times.trip.id
            );
            return false;
        }

        let key = (pattern.id, service_date);
        let mut timetable = match self.timetables.get(&key) {
            Some(existing) => Timetable::clone(existing),
            None => pattern.scheduled_timetable.copy_for_service_date(service_date),
        };
        let trip_local_id = updated_trip_times.trip.id.local_id.clone();
        timetable.apply_trip_times(updated_trip_times);
        self.timetables.insert(key, Arc::new(timetable));
        self.patterns.insert(pattern.id, pattern.clone());

        if pattern.created_by_realtime {
            self.last_added_trip_pattern
                .insert((trip_local_id, service_date), pattern.clone());
            self.realtime_pattern_routes
                .insert(pattern.id, pattern.route.clone());
        }

        self.dirty = true;
        true
    }

    /// The overlay for the pattern on the date, or its scheduled timetable.
    pub fn resolve(&self, pattern: &TripPattern, service_date: NaiveDate) -> Arc<Timetable> {
        match self.timetables.get(&(pattern.id, service_date)) {
            Some(timetable) => timetable.clone(),
            None => pattern.scheduled_timetable.clone(),
        }
    }

    pub fn last_added_trip_pattern(
        &self,
        trip_local_id: &str,
        service_date: NaiveDate,
    ) -> Option<Arc<TripPattern>> {
        self.last_added_trip_pattern
            .get(&(CompactString::from(trip_local_id), service_date))
            .cloned()
    }

    pub fn route_for_realtime_pattern(&self, pattern_id: u64) -> Option<&Arc<Route>> {
        self.realtime_pattern_routes.get(&pattern_id)
    }

    /// Freeze the current state into an immutable snapshot and reset the
    /// dirty flag. Returns None when there is nothing new and no force.
    pub fn commit(&mut self, force: bool) -> Option<Arc<TimetableSnapshot>> {
        if !force && !self.dirty {
            return None;
        }
        let committed = TimetableSnapshot {
            timetables: self.timetables.clone(),
            patterns: self.patterns.clone(),
            last_added_trip_pattern: self.last_added_trip_pattern.clone(),
            realtime_pattern_routes: self.realtime_pattern_routes.clone(),
            dirty: false,
            read_only: true,
        };
        self.dirty = false;
        Some(Arc::new(committed))
    }

    /// Drop every overlay, used when a full dataset replaces all prior state.
    pub fn clear(&mut self) {
        if self.read_only {
            warn!("attempt to clear a committed timetable snapshot");
            return;
        }
        if self.timetables.is_empty() && self.last_added_trip_pattern.is_empty() {
            return;
        }
        self.timetables.clear();
        self.patterns.clear();
        self.last_added_trip_pattern.clear();
        self.realtime_pattern_routes.clear();
        self.dirty = true;
    }

    /// Drop overlays whose service date lies strictly before the cutoff, and
    /// the realtime pattern/route registrations nothing references anymore.
    pub fn purge_expired_data(&mut self, cutoff: NaiveDate) -> bool {
        if self.read_only {
            warn!("attempt to purge a committed timetable snapshot");
            return false;
        }
        let overlays_before = self.timetables.len();
        let added_before = self.last_added_trip_pattern.len();
        self.timetables.retain(|(_, service_date), _| *service_date >= cutoff);
        self.last_added_trip_pattern
            .retain(|(_, service_date), _| *service_date >= cutoff);

        let live_patterns: AHashSet<u64> = self
            .timetables
            .keys()
            .map(|(pattern_id, _)| *pattern_id)
            .collect();
        self.patterns
            .retain(|pattern_id, _| live_patterns.contains(pattern_id));
        self.realtime_pattern_routes
            .retain(|pattern_id, _| live_patterns.contains(pattern_id));

        let modified = self.timetables.len() < overlays_before
            || self.last_added_trip_pattern.len() < added_before;
        if modified {
            self.dirty = true;
        }
        modified
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_committed(&self) -> bool {
        self.read_only
    }

    /// Number of overlay timetables.
    pub fn len(&self) -> usize {
        self.timetables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timetables.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &Arc<TripPattern>> {
        self.patterns.values()
    }

    pub fn overlays(&self) -> impl Iterator<Item = (&(u64, NaiveDate), &Arc<Timetable>)> {
        self.timetables.iter()
    }
}
