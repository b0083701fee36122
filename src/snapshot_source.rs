// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! The snapshot source: a single writer applies GTFS-rt trip update batches
//! to the working buffer and publishes immutable snapshots for routing
//! threads. Snapshot reads never block; writers queue on a fair lock so a
//! stream of snapshot requests cannot starve the updater.

use crate::error::UpdateError;
use crate::models::{FeedScopedId, PickupDropoff, Route, Stop, StopTime, Trip, ROUTE_TYPE_BUS};
use crate::pattern::{StopPattern, TripPattern};
use crate::pattern_cache::TripPatternCache;
use crate::snapshot::TimetableSnapshot;
use crate::static_graph::{current_service_date, service_date_midnight_epoch, Graph};
use crate::timetable::{TripTimes, MAX_ARRIVAL_DEPARTURE_TIME};
use crate::wire::{self, TripScheduleRelationship};
use arc_swap::ArcSwap;
use chrono::NaiveDate;
use chrono_tz::Tz;
use gtfs_realtime::{TripDescriptor, TripUpdate};
use log::{debug, info, warn};
use parking_lot::FairMutex;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Repairs partial trip descriptors (missing trip ids mostly) before a trip
/// update is interpreted.
pub trait FuzzyTripMatcher: Send + Sync {
    fn match_trip(&self, feed_id: &str, trip: &TripDescriptor) -> Option<TripDescriptor>;
}

#[derive(Clone, Debug)]
pub struct SnapshotSourceConfig {
    /// If a snapshot is requested within this window after the previous one,
    /// the previous snapshot is returned unchanged. Throttles the resource
    /// consuming duplication of the pattern to timetable index.
    pub max_snapshot_frequency: Duration,
    /// Emit an informational line every this many applied updates.
    pub log_frequency: u64,
    /// Whether realtime rows older than the sliding cutoff are dropped at
    /// the end of each batch.
    pub purge_expired_data: bool,
}

impl Default for SnapshotSourceConfig {
    fn default() -> Self {
        SnapshotSourceConfig {
            max_snapshot_frequency: Duration::from_millis(1000),
            log_frequency: 2000,
            purge_expired_data: true,
        }
    }
}

/// Everything the writer mutates, guarded by one fair lock.
struct WriterState {
    buffer: TimetableSnapshot,
    pattern_cache: TripPatternCache,
    last_snapshot_time: Option<Instant>,
    last_purge_date: Option<NaiveDate>,
    applied_block_count: u64,
}

pub struct TimetableSnapshotSource {
    config: SnapshotSourceConfig,
    time_zone: Tz,
    writer: FairMutex<WriterState>,
    snapshot: ArcSwap<TimetableSnapshot>,
    fuzzy_trip_matcher: Option<Box<dyn FuzzyTripMatcher>>,
}

impl TimetableSnapshotSource {
    pub fn new(graph: &Graph) -> Self {
        TimetableSnapshotSource::with_config(graph, SnapshotSourceConfig::default())
    }

    pub fn with_config(graph: &Graph, config: SnapshotSourceConfig) -> Self {
        TimetableSnapshotSource {
            config,
            time_zone: graph.time_zone,
            writer: FairMutex::new(WriterState {
                buffer: TimetableSnapshot::new(),
                pattern_cache: TripPatternCache::new(),
                last_snapshot_time: None,
                last_purge_date: None,
                applied_block_count: 0,
            }),
            snapshot: ArcSwap::from(TimetableSnapshot::empty_committed()),
            fuzzy_trip_matcher: None,
        }
    }

    pub fn with_fuzzy_trip_matcher(mut self, matcher: Box<dyn FuzzyTripMatcher>) -> Self {
        self.fuzzy_trip_matcher = Some(matcher);
        self
    }

    /// An up to date snapshot mapping patterns to timetables. The snapshot
    /// and everything reachable from it never change, so the calling thread
    /// gets a consistent view and only has to drop its reference when done.
    /// Never blocks: when the writer holds the buffer this returns the last
    /// published snapshot unchanged.
    pub fn get_timetable_snapshot(&self) -> Arc<TimetableSnapshot> {
        if let Some(mut state) = self.writer.try_lock() {
            self.commit_if_due(&mut state, false);
        }
        self.snapshot.load_full()
    }

    pub fn applied_block_count(&self) -> u64 {
        self.writer.lock().applied_block_count
    }

    /// Apply a batch of trip updates against the static feed named by
    /// `feed_id`. Updates are applied in order; a failing update is logged
    /// and skipped without aborting the batch. With `full_dataset` the batch
    /// replaces all previously buffered realtime state.
    pub fn apply_trip_updates(
        &self,
        graph: &Graph,
        full_dataset: bool,
        updates: &[TripUpdate],
        feed_id: &str,
    ) {
        let mut state = self.writer.lock();

        if full_dataset {
            state.buffer.clear();
        }

        debug!("message contains {} trip updates", updates.len());
        let mut update_index = 0usize;
        for trip_update in updates {
            let trip_update: Cow<TripUpdate> = match self
                .fuzzy_trip_matcher
                .as_ref()
                .and_then(|matcher| matcher.match_trip(feed_id, &trip_update.trip))
            {
                Some(matched_trip) => Cow::Owned(TripUpdate {
                    trip: matched_trip,
                    ..trip_update.clone()
                }),
                None => Cow::Borrowed(trip_update),
            };

            update_index += 1;
            debug!(
                "trip update #{} ({} stop time updates)",
                update_index,
                trip_update.stop_time_update.len()
            );

            match self.apply_single_trip_update(&mut state, graph, &trip_update, feed_id) {
                Ok(()) => {
                    state.applied_block_count += 1;
                    if state.applied_block_count % self.config.log_frequency == 0 {
                        info!("applied {} trip updates", state.applied_block_count);
                    }
                }
                Err(error) => {
                    warn!(
                        "failed to apply trip update for trip {:?}: {}",
                        trip_update.trip.trip_id, error
                    );
                }
            }
        }
        debug!("end of update message");

        // snapshot in anticipation of incoming requests; purging forces the
        // commit so routing threads cannot see purged rows reappear
        if self.config.purge_expired_data {
            let modified = self.purge_expired_data(&mut state);
            self.commit_if_due(&mut state, modified);
        } else {
            self.commit_if_due(&mut state, false);
        }
    }

    fn apply_single_trip_update(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip_update: &TripUpdate,
        feed_id: &str,
    ) -> Result<(), UpdateError> {
        let explicit_service_date = match trip_update.trip.start_date.as_deref() {
            Some(raw) => Some(
                wire::parse_service_date(raw)
                    .ok_or_else(|| UpdateError::InvalidStartDate(raw.to_string()))?,
            ),
            None => None,
        };
        // without a start date the update is attributed to today in the
        // feed's time zone; a trip departing at 40:00 may land a day off
        let service_date =
            explicit_service_date.unwrap_or_else(|| current_service_date(&self.time_zone));

        match determine_trip_schedule_relationship(trip_update) {
            TripScheduleRelationship::Scheduled => {
                self.handle_scheduled_trip(state, graph, trip_update, service_date)
            }
            TripScheduleRelationship::Added => self.validate_and_handle_added_trip(
                state,
                graph,
                trip_update,
                explicit_service_date,
                feed_id,
            ),
            TripScheduleRelationship::Unscheduled => self.handle_unscheduled_trip(trip_update),
            TripScheduleRelationship::Canceled => {
                self.handle_canceled_trip(state, graph, trip_update, service_date)
            }
            TripScheduleRelationship::Modified => self.validate_and_handle_modified_trip(
                state,
                graph,
                trip_update,
                explicit_service_date,
            ),
        }
    }

    fn handle_scheduled_trip(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip_update: &TripUpdate,
        service_date: NaiveDate,
    ) -> Result<(), UpdateError> {
        let trip_id = trip_update
            .trip
            .trip_id
            .as_deref()
            .ok_or(UpdateError::MissingTripId)?;
        let pattern = pattern_for_trip_id(graph, trip_id)
            .ok_or_else(|| UpdateError::NoPatternForTrip(trip_id.into()))?;
        if trip_update.stop_time_update.is_empty() {
            return Err(UpdateError::NoStopTimeUpdates);
        }

        // apply the update on the scheduled timetable and buffer the result
        let midnight_epoch_seconds = service_date_midnight_epoch(&self.time_zone, service_date);
        let updated_trip_times = pattern.scheduled_timetable.create_updated_trip_times(
            &pattern.stop_pattern,
            trip_update,
            midnight_epoch_seconds,
        )?;
        if state.buffer.update(&pattern, updated_trip_times, service_date) {
            Ok(())
        } else {
            Err(UpdateError::UpdateRejected)
        }
    }

    fn validate_and_handle_added_trip(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip_update: &TripUpdate,
        service_date: Option<NaiveDate>,
        feed_id: &str,
    ) -> Result<(), UpdateError> {
        let trip_id = trip_update
            .trip
            .trip_id
            .as_deref()
            .ok_or(UpdateError::MissingTripId)?;
        if graph.index().trip_for_bare_id(trip_id).is_some() {
            return Err(UpdateError::TripAlreadyExists(trip_id.into()));
        }
        let service_date = service_date.ok_or(UpdateError::MissingStartDate)?;
        if trip_update.stop_time_update.len() < 2 {
            return Err(UpdateError::TooFewStops(trip_update.stop_time_update.len()));
        }
        let stops = check_new_stop_time_updates_and_find_stops(graph, trip_update)?;
        self.handle_added_trip(state, graph, trip_update, stops, feed_id, service_date)
    }

    fn handle_added_trip(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip_update: &TripUpdate,
        stops: Vec<Option<Arc<Stop>>>,
        feed_id: &str,
        service_date: NaiveDate,
    ) -> Result<(), UpdateError> {
        let trip_id = trip_update
            .trip
            .trip_id
            .as_deref()
            .ok_or(UpdateError::MissingTripId)?;

        // this trip id may have been used by a previous ADDED message
        self.cancel_previously_added_trip(state, trip_id, service_date);

        let route = match trip_update
            .trip
            .route_id
            .as_deref()
            .and_then(|route_id| graph.index().route_for_bare_id(route_id))
        {
            Some(route) => route.clone(),
            None => {
                // synthesize a route with a placeholder agency; the type is a
                // guess because the update carries none
                let local_id = trip_update.trip.route_id.as_deref().unwrap_or(trip_id);
                Arc::new(Route {
                    id: FeedScopedId::new(feed_id, local_id),
                    agency_id: "".into(),
                    route_type: ROUTE_TYPE_BUS,
                    short_name: None,
                    long_name: Some(trip_id.to_string()),
                })
            }
        };

        let service_id = graph
            .calendar
            .service_ids_on_date(service_date)
            .and_then(|service_ids| service_ids.iter().next().cloned())
            .ok_or(UpdateError::NoServiceOnDate(service_date))?;

        let trip = Arc::new(Trip {
            id: FeedScopedId::new(feed_id, trip_id),
            route,
            service_id,
            trip_headsign: None,
        });

        self.add_trip_to_buffer(state, graph, trip, trip_update, &stops, service_date)
    }

    /// Build the stop times, intern the pattern and buffer the new trip.
    fn add_trip_to_buffer(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip: Arc<Trip>,
        trip_update: &TripUpdate,
        stops: &[Option<Arc<Stop>>],
        service_date: NaiveDate,
    ) -> Result<(), UpdateError> {
        assert_eq!(
            trip_update.stop_time_update.len(),
            stops.len(),
            "the number of stops should match the number of stop time updates"
        );

        let midnight_epoch_seconds = service_date_midnight_epoch(&self.time_zone, service_date);
        let last_index = trip_update.stop_time_update.len() - 1;
        let mut stop_times: Vec<StopTime> = Vec::with_capacity(stops.len());
        for (index, (stop_time_update, stop)) in
            trip_update.stop_time_update.iter().zip(stops).enumerate()
        {
            // skipped stops leave no stop time behind
            if wire::is_stop_skipped(stop_time_update) {
                continue;
            }
            let Some(stop) = stop else { continue };

            let arrival_time = match stop_time_update.arrival.as_ref().and_then(|event| event.time)
            {
                Some(absolute) => {
                    let since_midnight = absolute - midnight_epoch_seconds;
                    if !(0..=MAX_ARRIVAL_DEPARTURE_TIME as i64).contains(&since_midnight) {
                        return Err(UpdateError::TimeOutOfRange(since_midnight));
                    }
                    Some(since_midnight as i32)
                }
                None => None,
            };
            let departure_time = match stop_time_update
                .departure
                .as_ref()
                .and_then(|event| event.time)
            {
                Some(absolute) => {
                    let since_midnight = absolute - midnight_epoch_seconds;
                    if !(0..=MAX_ARRIVAL_DEPARTURE_TIME as i64).contains(&since_midnight) {
                        return Err(UpdateError::TimeOutOfRange(since_midnight));
                    }
                    Some(since_midnight as i32)
                }
                None => None,
            };

            stop_times.push(StopTime {
                stop: stop.clone(),
                arrival_time,
                departure_time,
                stop_sequence: stop_time_update.stop_sequence.unwrap_or(index as u32),
                // nobody boards at the last stop or alights at the first
                pickup_type: if index == last_index {
                    PickupDropoff::NotAvailable
                } else {
                    PickupDropoff::Regular
                },
                drop_off_type: if index == 0 {
                    PickupDropoff::NotAvailable
                } else {
                    PickupDropoff::Regular
                },
                timepoint: true,
            });
        }

        let stop_pattern = StopPattern::from_stop_times(&stop_times);
        let pattern = state
            .pattern_cache
            .get_or_create_trip_pattern(stop_pattern, &trip.route);

        let service_code = *graph
            .service_codes
            .get(&trip.service_id)
            .ok_or_else(|| UpdateError::UnknownServiceCode(trip.service_id.clone()))?;
        if !pattern.has_service_code(service_code) {
            pattern.add_service_code(service_code);
        }

        let new_trip_times = TripTimes::new(trip, &stop_times, service_code, &graph.deduplicator);
        if state.buffer.update(&pattern, new_trip_times, service_date) {
            Ok(())
        } else {
            Err(UpdateError::UpdateRejected)
        }
    }

    /// Cancel the scheduled instance of the trip in the buffer, if any.
    fn cancel_scheduled_trip(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip_id: &str,
        service_date: NaiveDate,
    ) -> bool {
        let Some(pattern) = pattern_for_trip_id(graph, trip_id) else {
            return false;
        };
        let timetable = pattern.scheduled_timetable.clone();
        let Some(trip_index) = timetable.trip_index(trip_id) else {
            warn!("could not cancel scheduled trip {}", trip_id);
            return false;
        };
        let mut canceled_trip_times = TripTimes::clone(timetable.trip_times(trip_index));
        canceled_trip_times.cancel();
        state.buffer.update(&pattern, canceled_trip_times, service_date)
    }

    /// Cancel a previously added instance of the trip, if one is buffered.
    fn cancel_previously_added_trip(
        &self,
        state: &mut WriterState,
        trip_id: &str,
        service_date: NaiveDate,
    ) -> bool {
        let Some(pattern) = state.buffer.last_added_trip_pattern(trip_id, service_date) else {
            return false;
        };
        let timetable = state.buffer.resolve(&pattern, service_date);
        let Some(trip_index) = timetable.trip_index(trip_id) else {
            warn!("could not cancel previously added trip {}", trip_id);
            return false;
        };
        let mut canceled_trip_times = TripTimes::clone(timetable.trip_times(trip_index));
        canceled_trip_times.cancel();
        state.buffer.update(&pattern, canceled_trip_times, service_date)
    }

    fn handle_canceled_trip(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip_update: &TripUpdate,
        service_date: NaiveDate,
    ) -> Result<(), UpdateError> {
        let trip_id = trip_update
            .trip
            .trip_id
            .as_deref()
            .ok_or(UpdateError::MissingTripId)?;
        let canceled_scheduled = self.cancel_scheduled_trip(state, graph, trip_id, service_date);
        let canceled_added = self.cancel_previously_added_trip(state, trip_id, service_date);
        if canceled_scheduled || canceled_added {
            Ok(())
        } else {
            Err(UpdateError::NoPatternForTrip(trip_id.into()))
        }
    }

    fn handle_unscheduled_trip(&self, _trip_update: &TripUpdate) -> Result<(), UpdateError> {
        Err(UpdateError::UnscheduledTripsUnsupported)
    }

    fn validate_and_handle_modified_trip(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip_update: &TripUpdate,
        service_date: Option<NaiveDate>,
    ) -> Result<(), UpdateError> {
        let trip_id = trip_update
            .trip
            .trip_id
            .as_deref()
            .ok_or(UpdateError::MissingTripId)?;
        let trip = graph
            .index()
            .trip_for_bare_id(trip_id)
            .cloned()
            .ok_or_else(|| UpdateError::TripNotFound(trip_id.into()))?;
        let service_date = service_date.ok_or(UpdateError::MissingStartDate)?;
        let date_is_served = graph
            .calendar
            .service_ids_on_date(service_date)
            .is_some_and(|service_ids| service_ids.contains(trip.service_id.as_str()));
        if !date_is_served {
            return Err(UpdateError::DateNotServedByTrip(trip_id.into(), service_date));
        }
        if trip_update.stop_time_update.len() < 2 {
            return Err(UpdateError::TooFewStops(trip_update.stop_time_update.len()));
        }
        let stops = check_new_stop_time_updates_and_find_stops(graph, trip_update)?;
        self.handle_modified_trip(state, graph, trip, trip_update, stops, service_date)
    }

    fn handle_modified_trip(
        &self,
        state: &mut WriterState,
        graph: &Graph,
        trip: Arc<Trip>,
        trip_update: &TripUpdate,
        stops: Vec<Option<Arc<Stop>>>,
        service_date: NaiveDate,
    ) -> Result<(), UpdateError> {
        let trip_id = trip.id.local_id.clone();
        self.cancel_scheduled_trip(state, graph, &trip_id, service_date);
        self.cancel_previously_added_trip(state, &trip_id, service_date);
        self.add_trip_to_buffer(state, graph, trip, trip_update, &stops, service_date)
    }

    /// Drop realtime rows two or more days in the past. The two day cushion
    /// absorbs time zone skew between the feed and this host.
    fn purge_expired_data(&self, state: &mut WriterState) -> bool {
        let today = current_service_date(&self.time_zone);
        let cutoff = today - chrono::Duration::days(2);
        if state.last_purge_date.is_some_and(|last| last >= cutoff) {
            return false;
        }
        debug!("purging expired realtime data");
        state.last_purge_date = Some(cutoff);
        state.buffer.purge_expired_data(cutoff)
    }

    /// Publish a fresh snapshot when forced or when the throttle window has
    /// passed and the buffer has changes.
    fn commit_if_due(&self, state: &mut WriterState, force: bool) {
        let now = Instant::now();
        let due = force
            || state
                .last_snapshot_time
                .map_or(true, |last| now.duration_since(last) > self.config.max_snapshot_frequency);
        if due {
            if force || state.buffer.is_dirty() {
                debug!("committing timetable snapshot ({} overlays)", state.buffer.len());
                if let Some(committed) = state.buffer.commit(force) {
                    self.snapshot.store(committed);
                }
            } else {
                debug!("buffer was unchanged, keeping old snapshot");
            }
            state.last_snapshot_time = Some(Instant::now());
        } else {
            debug!("snapshot frequency exceeded, reusing the published snapshot");
        }
    }
}

/// Determine how a trip update should be handled. Defaults to SCHEDULED; a
/// SCHEDULED update that skips stops defines a new stop pattern and is
/// promoted to MODIFIED so it flows through the add/modify pipeline. Extend
/// the promotion once a stop level ADDED relationship is defined upstream.
pub fn determine_trip_schedule_relationship(trip_update: &TripUpdate) -> TripScheduleRelationship {
    let mut relationship =
        wire::option_i32_to_trip_schedule_relationship(&trip_update.trip.schedule_relationship)
            .unwrap_or(TripScheduleRelationship::Scheduled);

    if relationship == TripScheduleRelationship::Scheduled {
        let has_modified_stops = trip_update
            .stop_time_update
            .iter()
            .any(wire::is_stop_skipped);
        if has_modified_stops {
            relationship = TripScheduleRelationship::Modified;
        }
    }

    relationship
}

fn pattern_for_trip_id(graph: &Graph, trip_id: &str) -> Option<Arc<TripPattern>> {
    let trip = graph.index().trip_for_bare_id(trip_id)?;
    graph.pattern_for_trip.get(&trip.id).cloned()
}

/// Check the stop time updates of an update that creates a new trip (ADDED
/// or MODIFIED) and resolve its stops. A hole is left where a stop is
/// skipped; every other slot must resolve against the bare id index.
fn check_new_stop_time_updates_and_find_stops(
    graph: &Graph,
    trip_update: &TripUpdate,
) -> Result<Vec<Option<Arc<Stop>>>, UpdateError> {
    let stop_time_updates = &trip_update.stop_time_update;
    let mut previous_stop_sequence: Option<u32> = None;
    let mut previous_time: Option<i64> = None;
    let mut stops = Vec::with_capacity(stop_time_updates.len());

    for (index, stop_time_update) in stop_time_updates.iter().enumerate() {
        let skipped_stop = wire::is_stop_skipped(stop_time_update);

        // the uint32 wire type already rules out negative sequences
        if let Some(stop_sequence) = stop_time_update.stop_sequence {
            if previous_stop_sequence.is_some_and(|previous| previous > stop_sequence) {
                return Err(UpdateError::DecreasingStopSequence);
            }
            previous_stop_sequence = Some(stop_sequence);
        }

        match stop_time_update.stop_id.as_deref() {
            Some(stop_id) => match graph.index().stop_for_bare_id(stop_id) {
                Some(stop) => stops.push(Some(stop.clone())),
                None if skipped_stop => stops.push(None),
                None => return Err(UpdateError::UnknownStop(stop_id.into())),
            },
            None => return Err(UpdateError::MissingStopId),
        }

        // arrival and departure checks only apply to stops actually served
        if skipped_stop {
            continue;
        }

        match stop_time_update.arrival.as_ref().and_then(|event| event.time) {
            Some(time) => {
                if previous_time.is_some_and(|previous| previous > time) {
                    return Err(UpdateError::DecreasingTimes);
                }
                previous_time = Some(time);
            }
            None => {
                // only an all-skipped prefix may precede a missing arrival
                if stop_time_updates[..index]
                    .iter()
                    .any(|earlier| !wire::is_stop_skipped(earlier))
                {
                    return Err(UpdateError::MissingArrivalTime);
                }
            }
        }

        match stop_time_update
            .departure
            .as_ref()
            .and_then(|event| event.time)
        {
            Some(time) => {
                if previous_time.is_some_and(|previous| previous > time) {
                    return Err(UpdateError::DecreasingTimes);
                }
                previous_time = Some(time);
            }
            None => {
                // symmetrically, only an all-skipped suffix may follow a
                // missing departure
                if stop_time_updates[index + 1..]
                    .iter()
                    .any(|later| !wire::is_stop_skipped(later))
                {
                    return Err(UpdateError::MissingDepartureTime);
                }
            }
        }
    }

    Ok(stops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stop;
    use crate::timetable::Timetable;
    use gtfs_realtime::trip_update::{StopTimeEvent, StopTimeUpdate};

    const FEED: &str = "f1";
    const MIDNIGHT: i64 = 1_705_276_800; // 2024-01-15 UTC

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn test_graph() -> (Graph, Arc<TripPattern>) {
        let mut graph = Graph::new(FEED, chrono_tz::UTC);
        let mut stops = Vec::new();
        for stop_id in ["A", "B", "C", "S1", "S2", "S3"] {
            stops.push(graph.add_stop(Stop {
                id: FeedScopedId::new(FEED, stop_id),
                name: Some(stop_id.to_string()),
                latitude: None,
                longitude: None,
            }));
        }
        let route = graph.add_route(Route {
            id: FeedScopedId::new(FEED, "R1"),
            agency_id: "AG".into(),
            route_type: 3,
            short_name: Some("1".into()),
            long_name: Some("Route One".into()),
        });
        let service_code = graph.add_service_code("WK");
        graph.calendar.add_service_date("WK", date());

        let trip = Arc::new(Trip {
            id: FeedScopedId::new(FEED, "T1"),
            route: route.clone(),
            service_id: "WK".into(),
            trip_headsign: None,
        });
        let stop_times = vec![
            base_stop_time(&stops[0], 28800, 28800, 1),
            base_stop_time(&stops[1], 29400, 29460, 2),
            base_stop_time(&stops[2], 30000, 30000, 3),
        ];
        let scheduled_trip_times =
            TripTimes::new(trip.clone(), &stop_times, service_code, &graph.deduplicator);
        let pattern = Arc::new(TripPattern::new(
            route,
            StopPattern::from_stop_times(&stop_times),
            Arc::new(Timetable::new(
                vec![Arc::new(scheduled_trip_times)],
                None,
            )),
            false,
        ));
        pattern.add_service_code(service_code);
        graph.add_trip(trip, &pattern);
        (graph, pattern)
    }

    fn base_stop_time(stop: &Arc<Stop>, arrival: i32, departure: i32, sequence: u32) -> StopTime {
        StopTime {
            stop: stop.clone(),
            arrival_time: Some(arrival),
            departure_time: Some(departure),
            stop_sequence: sequence,
            pickup_type: PickupDropoff::Regular,
            drop_off_type: PickupDropoff::Regular,
            timepoint: true,
        }
    }

    fn eager_source(graph: &Graph) -> TimetableSnapshotSource {
        // a zero throttle publishes at the end of every batch
        TimetableSnapshotSource::with_config(
            graph,
            SnapshotSourceConfig {
                max_snapshot_frequency: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn descriptor(
        trip_id: Option<&str>,
        relationship: Option<i32>,
        start_date: Option<&str>,
    ) -> TripDescriptor {
        TripDescriptor {
            trip_id: trip_id.map(str::to_string),
            schedule_relationship: relationship,
            start_date: start_date.map(str::to_string),
            ..Default::default()
        }
    }

    fn make_trip_update(
        trip: TripDescriptor,
        stop_time_updates: Vec<StopTimeUpdate>,
    ) -> TripUpdate {
        TripUpdate {
            trip,
            stop_time_update: stop_time_updates,
            ..Default::default()
        }
    }

    fn stu_with_times(
        stop_id: &str,
        sequence: u32,
        arrival_epoch: i64,
        departure_epoch: i64,
    ) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_sequence: Some(sequence),
            stop_id: Some(stop_id.to_string()),
            arrival: Some(StopTimeEvent {
                time: Some(arrival_epoch),
                ..Default::default()
            }),
            departure: Some(StopTimeEvent {
                time: Some(departure_epoch),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn stu_skipped(stop_id: &str, sequence: u32) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_sequence: Some(sequence),
            stop_id: Some(stop_id.to_string()),
            schedule_relationship: Some(1),
            ..Default::default()
        }
    }

    fn added_update(trip_id: &str, base_offset: i32) -> TripUpdate {
        make_trip_update(
            descriptor(Some(trip_id), Some(1), Some("20240115")),
            vec![
                stu_with_times(
                    "S1",
                    1,
                    MIDNIGHT + (28800 + base_offset) as i64,
                    MIDNIGHT + (28800 + base_offset) as i64,
                ),
                stu_with_times(
                    "S2",
                    2,
                    MIDNIGHT + (29100 + base_offset) as i64,
                    MIDNIGHT + (29100 + base_offset) as i64,
                ),
                stu_with_times(
                    "S3",
                    3,
                    MIDNIGHT + (29400 + base_offset) as i64,
                    MIDNIGHT + (29400 + base_offset) as i64,
                ),
            ],
        )
    }

    #[test]
    fn classifier_adopts_explicit_relationship() {
        let canceled = make_trip_update(descriptor(Some("T1"), Some(3), None), vec![]);
        assert_eq!(
            determine_trip_schedule_relationship(&canceled),
            TripScheduleRelationship::Canceled
        );
        let default = make_trip_update(descriptor(Some("T1"), None, None), vec![]);
        assert_eq!(
            determine_trip_schedule_relationship(&default),
            TripScheduleRelationship::Scheduled
        );
    }

    #[test]
    fn classifier_promotes_skipped_stops_to_modified() {
        let update = make_trip_update(
            descriptor(Some("T1"), None, None),
            vec![stu_skipped("B", 2)],
        );
        assert_eq!(
            determine_trip_schedule_relationship(&update),
            TripScheduleRelationship::Modified
        );
        // an explicit relationship is not promoted
        let canceled = make_trip_update(
            descriptor(Some("T1"), Some(3), None),
            vec![stu_skipped("B", 2)],
        );
        assert_eq!(
            determine_trip_schedule_relationship(&canceled),
            TripScheduleRelationship::Canceled
        );
    }

    #[test]
    fn scheduled_retime_reaches_the_snapshot() {
        let (graph, pattern) = test_graph();
        let source = eager_source(&graph);
        let update = make_trip_update(
            descriptor(Some("T1"), None, Some("20240115")),
            vec![StopTimeUpdate {
                stop_sequence: Some(2),
                arrival: Some(StopTimeEvent {
                    time: Some(MIDNIGHT + 29520),
                    ..Default::default()
                }),
                ..Default::default()
            }],
        );
        source.apply_trip_updates(&graph, false, &[update], FEED);

        let snapshot = source.get_timetable_snapshot();
        let overlay = snapshot.resolve(&pattern, date());
        let trip_index = overlay.trip_index("T1").unwrap();
        let trip_times = overlay.trip_times(trip_index);
        assert_eq!(trip_times.arrival_time(1), 29520);
        assert!(trip_times.times_are_valid());
        assert_eq!(source.applied_block_count(), 1);
        // the scheduled timetable itself is untouched
        assert_eq!(
            pattern.scheduled_timetable.trip_times(0).arrival_time(1),
            29400
        );
    }

    #[test]
    fn skipped_stop_cancels_the_base_trip_and_interns_a_new_pattern() {
        let (graph, pattern) = test_graph();
        let source = eager_source(&graph);
        let update = make_trip_update(
            descriptor(Some("T1"), None, Some("20240115")),
            vec![
                stu_with_times("A", 1, MIDNIGHT + 28800, MIDNIGHT + 28800),
                stu_skipped("B", 2),
                stu_with_times("C", 3, MIDNIGHT + 30000, MIDNIGHT + 30000),
            ],
        );
        source.apply_trip_updates(&graph, false, &[update], FEED);

        let snapshot = source.get_timetable_snapshot();
        let base_overlay = snapshot.resolve(&pattern, date());
        let base_index = base_overlay.trip_index("T1").unwrap();
        assert!(base_overlay.trip_times(base_index).canceled);

        let new_pattern = snapshot.last_added_trip_pattern("T1", date()).unwrap();
        assert_ne!(new_pattern.id, pattern.id);
        assert!(new_pattern.created_by_realtime);
        assert_eq!(new_pattern.num_stops(), 2);
        assert_eq!(new_pattern.stop_pattern.stops[0].stop.id.local_id, "A");
        assert_eq!(new_pattern.stop_pattern.stops[1].stop.id.local_id, "C");

        let new_overlay = snapshot.resolve(&new_pattern, date());
        let new_index = new_overlay.trip_index("T1").unwrap();
        assert!(!new_overlay.trip_times(new_index).canceled);
        assert_eq!(new_overlay.trip_times(new_index).arrival_time(1), 30000);
    }

    #[test]
    fn added_trip_synthesizes_route_and_policies() {
        let (graph, _) = test_graph();
        let source = eager_source(&graph);
        source.apply_trip_updates(&graph, false, &[added_update("NEW", 0)], FEED);

        let snapshot = source.get_timetable_snapshot();
        let pattern = snapshot.last_added_trip_pattern("NEW", date()).unwrap();
        assert_eq!(pattern.route.id.local_id, "NEW");
        assert_eq!(pattern.route.long_name.as_deref(), Some("NEW"));
        assert_eq!(pattern.route.route_type, ROUTE_TYPE_BUS);
        assert_eq!(
            pattern.stop_pattern.stops[0].drop_off_type,
            PickupDropoff::NotAvailable
        );
        assert_eq!(
            pattern.stop_pattern.stops[2].pickup_type,
            PickupDropoff::NotAvailable
        );
        assert_eq!(
            pattern.stop_pattern.stops[1].pickup_type,
            PickupDropoff::Regular
        );
        assert!(pattern.has_service_code(0));
        assert!(snapshot.route_for_realtime_pattern(pattern.id).is_some());

        let overlay = snapshot.resolve(&pattern, date());
        let trip_index = overlay.trip_index("NEW").unwrap();
        let trip_times = overlay.trip_times(trip_index);
        assert_eq!(trip_times.arrival_time(0), 28800);
        assert_eq!(trip_times.departure_time(2), 29400);
        assert_eq!(trip_times.trip.service_id, "WK");
    }

    #[test]
    fn added_trip_replaces_a_prior_added_instance() {
        let (graph, _) = test_graph();
        let source = eager_source(&graph);
        source.apply_trip_updates(&graph, false, &[added_update("NEW", 0)], FEED);
        source.apply_trip_updates(&graph, false, &[added_update("NEW", 600)], FEED);

        let snapshot = source.get_timetable_snapshot();
        let pattern = snapshot.last_added_trip_pattern("NEW", date()).unwrap();
        let overlay = snapshot.resolve(&pattern, date());
        // one live row with the second set of times, not a cancelled relic
        assert_eq!(overlay.trip_times.len(), 1);
        let trip_times = overlay.trip_times(overlay.trip_index("NEW").unwrap());
        assert!(!trip_times.canceled);
        assert_eq!(trip_times.arrival_time(0), 29400);
    }

    #[test]
    fn canceled_trip_is_idempotent() {
        let (graph, pattern) = test_graph();
        let source = eager_source(&graph);
        let cancel = make_trip_update(descriptor(Some("T1"), Some(3), Some("20240115")), vec![]);
        source.apply_trip_updates(&graph, false, &[cancel.clone()], FEED);

        let first = source.get_timetable_snapshot();
        let overlay = first.resolve(&pattern, date());
        assert!(overlay.trip_times(overlay.trip_index("T1").unwrap()).canceled);

        source.apply_trip_updates(&graph, false, &[cancel], FEED);
        let second = source.get_timetable_snapshot();
        let overlay = second.resolve(&pattern, date());
        assert_eq!(overlay.trip_times.len(), 1);
        assert!(overlay.trip_times(overlay.trip_index("T1").unwrap()).canceled);
        assert_eq!(source.applied_block_count(), 2);
    }

    #[test]
    fn invalid_update_does_not_poison_the_batch() {
        let (graph, pattern) = test_graph();
        let source = eager_source(&graph);
        // arrivals run 08:10, 08:05, 08:20
        let bad_added = make_trip_update(
            descriptor(Some("BAD"), Some(1), Some("20240115")),
            vec![
                stu_with_times("S1", 1, MIDNIGHT + 29400, MIDNIGHT + 29400),
                stu_with_times("S2", 2, MIDNIGHT + 29100, MIDNIGHT + 29100),
                stu_with_times("S3", 3, MIDNIGHT + 30000, MIDNIGHT + 30000),
            ],
        );
        let cancel = make_trip_update(descriptor(Some("T1"), Some(3), Some("20240115")), vec![]);
        source.apply_trip_updates(&graph, false, &[bad_added, cancel], FEED);

        let snapshot = source.get_timetable_snapshot();
        assert!(snapshot.last_added_trip_pattern("BAD", date()).is_none());
        let overlay = snapshot.resolve(&pattern, date());
        assert!(overlay.trip_times(overlay.trip_index("T1").unwrap()).canceled);
        assert_eq!(source.applied_block_count(), 1);
    }

    #[test]
    fn added_trip_preconditions_are_enforced() {
        let (graph, _) = test_graph();
        let source = eager_source(&graph);
        // T1 already exists in the graph
        let existing = added_update("T1", 0);
        // no service runs on this date
        let mut wrong_date = added_update("NEW", 0);
        wrong_date.trip.start_date = Some("20240116".into());
        for stop_time_update in &mut wrong_date.stop_time_update {
            if let Some(arrival) = &mut stop_time_update.arrival {
                arrival.time = arrival.time.map(|time| time + 86_400);
            }
            if let Some(departure) = &mut stop_time_update.departure {
                departure.time = departure.time.map(|time| time + 86_400);
            }
        }
        // no start date at all
        let mut no_date = added_update("NEW2", 0);
        no_date.trip.start_date = None;

        source.apply_trip_updates(&graph, false, &[existing, wrong_date, no_date], FEED);
        let snapshot = source.get_timetable_snapshot();
        assert!(snapshot.last_added_trip_pattern("T1", date()).is_none());
        assert!(snapshot.last_added_trip_pattern("NEW", date()).is_none());
        assert_eq!(source.applied_block_count(), 0);
    }

    #[test]
    fn modified_trip_requires_a_known_trip() {
        let (graph, _) = test_graph();
        let source = eager_source(&graph);
        let update = make_trip_update(
            descriptor(Some("GHOST"), Some(5), Some("20240115")),
            vec![
                stu_with_times("A", 1, MIDNIGHT + 28800, MIDNIGHT + 28800),
                stu_with_times("C", 3, MIDNIGHT + 30000, MIDNIGHT + 30000),
            ],
        );
        source.apply_trip_updates(&graph, false, &[update], FEED);
        assert_eq!(source.applied_block_count(), 0);
    }

    #[test]
    fn unscheduled_trips_are_skipped() {
        let (graph, pattern) = test_graph();
        let source = eager_source(&graph);
        let update = make_trip_update(descriptor(Some("T1"), Some(2), Some("20240115")), vec![]);
        source.apply_trip_updates(&graph, false, &[update], FEED);
        let snapshot = source.get_timetable_snapshot();
        assert!(Arc::ptr_eq(
            &snapshot.resolve(&pattern, date()),
            &pattern.scheduled_timetable
        ));
        assert_eq!(source.applied_block_count(), 0);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let (graph, _) = test_graph();
        let source = TimetableSnapshotSource::new(&graph);
        let initial = source.get_timetable_snapshot();
        source.apply_trip_updates(&graph, false, &[], FEED);
        let after = source.get_timetable_snapshot();
        assert!(Arc::ptr_eq(&initial, &after));
    }

    #[test]
    fn invalid_only_batch_keeps_the_snapshot() {
        let (graph, _) = test_graph();
        let source = eager_source(&graph);
        let initial = source.get_timetable_snapshot();
        let garbage = make_trip_update(descriptor(None, None, None), vec![]);
        let bad_date = make_trip_update(descriptor(Some("T1"), Some(3), Some("not-a-date")), vec![]);
        source.apply_trip_updates(&graph, false, &[garbage, bad_date], FEED);
        // even with a zero throttle there is nothing to publish
        let after = source.get_timetable_snapshot();
        assert!(Arc::ptr_eq(&initial, &after));
        assert_eq!(source.applied_block_count(), 0);
    }

    #[test]
    fn snapshot_requests_inside_the_throttle_window_share_the_snapshot() {
        let (graph, _) = test_graph();
        let source = TimetableSnapshotSource::new(&graph);
        source.apply_trip_updates(&graph, false, &[added_update("NEW", 0)], FEED);
        let first = source.get_timetable_snapshot();
        let second = source.get_timetable_snapshot();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn full_dataset_replaces_previous_overlays() {
        let (graph, _) = test_graph();
        let source = eager_source(&graph);
        source.apply_trip_updates(&graph, false, &[added_update("NEW", 0)], FEED);
        assert!(source
            .get_timetable_snapshot()
            .last_added_trip_pattern("NEW", date())
            .is_some());

        source.apply_trip_updates(&graph, true, &[], FEED);
        let snapshot = source.get_timetable_snapshot();
        assert!(snapshot.last_added_trip_pattern("NEW", date()).is_none());
        assert!(snapshot.is_empty());
    }

    struct FillInTripId;

    impl FuzzyTripMatcher for FillInTripId {
        fn match_trip(&self, _feed_id: &str, trip: &TripDescriptor) -> Option<TripDescriptor> {
            if trip.trip_id.is_some() {
                return None;
            }
            Some(TripDescriptor {
                trip_id: Some("T1".into()),
                ..trip.clone()
            })
        }
    }

    #[test]
    fn fuzzy_matcher_repairs_missing_trip_ids() {
        let (graph, pattern) = test_graph();
        let source = eager_source(&graph).with_fuzzy_trip_matcher(Box::new(FillInTripId));
        let cancel = make_trip_update(descriptor(None, Some(3), Some("20240115")), vec![]);
        source.apply_trip_updates(&graph, false, &[cancel], FEED);

        let snapshot = source.get_timetable_snapshot();
        let overlay = snapshot.resolve(&pattern, date());
        assert!(overlay.trip_times(overlay.trip_index("T1").unwrap()).canceled);
    }

    #[test]
    fn validator_rejects_structural_violations() {
        let (graph, _) = test_graph();
        // decreasing stop sequence
        let decreasing_sequence = make_trip_update(
            descriptor(Some("NEW"), Some(1), Some("20240115")),
            vec![
                stu_with_times("S1", 2, MIDNIGHT + 28800, MIDNIGHT + 28800),
                stu_with_times("S2", 1, MIDNIGHT + 29100, MIDNIGHT + 29100),
            ],
        );
        assert_eq!(
            check_new_stop_time_updates_and_find_stops(&graph, &decreasing_sequence),
            Err(UpdateError::DecreasingStopSequence)
        );

        // unknown stop id
        let unknown_stop = make_trip_update(
            descriptor(Some("NEW"), Some(1), Some("20240115")),
            vec![
                stu_with_times("S1", 1, MIDNIGHT + 28800, MIDNIGHT + 28800),
                stu_with_times("S9", 2, MIDNIGHT + 29100, MIDNIGHT + 29100),
            ],
        );
        assert_eq!(
            check_new_stop_time_updates_and_find_stops(&graph, &unknown_stop),
            Err(UpdateError::UnknownStop("S9".into()))
        );

        // a skipped stop may carry an unresolvable id
        let skipped_unknown = make_trip_update(
            descriptor(Some("NEW"), Some(1), Some("20240115")),
            vec![
                stu_with_times("S1", 1, MIDNIGHT + 28800, MIDNIGHT + 28800),
                stu_skipped("S9", 2),
                stu_with_times("S3", 3, MIDNIGHT + 29100, MIDNIGHT + 29100),
            ],
        );
        let stops = check_new_stop_time_updates_and_find_stops(&graph, &skipped_unknown).unwrap();
        assert_eq!(stops.len(), 3);
        assert!(stops[0].is_some());
        assert!(stops[1].is_none());

        // a missing arrival in the middle of the run
        let missing_arrival = make_trip_update(
            descriptor(Some("NEW"), Some(1), Some("20240115")),
            vec![
                stu_with_times("S1", 1, MIDNIGHT + 28800, MIDNIGHT + 28800),
                StopTimeUpdate {
                    stop_sequence: Some(2),
                    stop_id: Some("S2".into()),
                    departure: Some(StopTimeEvent {
                        time: Some(MIDNIGHT + 29100),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
        );
        assert_eq!(
            check_new_stop_time_updates_and_find_stops(&graph, &missing_arrival),
            Err(UpdateError::MissingArrivalTime)
        );

        // a missing departure anywhere but the end of the run
        let missing_departure = make_trip_update(
            descriptor(Some("NEW"), Some(1), Some("20240115")),
            vec![
                StopTimeUpdate {
                    stop_sequence: Some(1),
                    stop_id: Some("S1".into()),
                    arrival: Some(StopTimeEvent {
                        time: Some(MIDNIGHT + 28800),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                stu_with_times("S2", 2, MIDNIGHT + 29100, MIDNIGHT + 29100),
            ],
        );
        assert_eq!(
            check_new_stop_time_updates_and_find_stops(&graph, &missing_departure),
            Err(UpdateError::MissingDepartureTime)
        );

        // the first stop may miss its arrival and the last its departure
        let edge_times = make_trip_update(
            descriptor(Some("NEW"), Some(1), Some("20240115")),
            vec![
                StopTimeUpdate {
                    stop_sequence: Some(1),
                    stop_id: Some("S1".into()),
                    departure: Some(StopTimeEvent {
                        time: Some(MIDNIGHT + 28800),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                StopTimeUpdate {
                    stop_sequence: Some(2),
                    stop_id: Some("S2".into()),
                    arrival: Some(StopTimeEvent {
                        time: Some(MIDNIGHT + 29100),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
        );
        assert!(check_new_stop_time_updates_and_find_stops(&graph, &edge_times).is_ok());
    }

    #[test]
    fn added_trip_rejects_out_of_range_times() {
        let (graph, _) = test_graph();
        let source = eager_source(&graph);
        let mut update = added_update("NEW", 0);
        // push the last stop past the 48 hour ceiling
        if let Some(departure) = &mut update.stop_time_update[2].departure {
            departure.time = Some(MIDNIGHT + (MAX_ARRIVAL_DEPARTURE_TIME as i64) + 1);
        }
        if let Some(arrival) = &mut update.stop_time_update[2].arrival {
            arrival.time = Some(MIDNIGHT + (MAX_ARRIVAL_DEPARTURE_TIME as i64) + 1);
        }
        source.apply_trip_updates(&graph, false, &[update], FEED);
        assert!(source
            .get_timetable_snapshot()
            .last_added_trip_pattern("NEW", date())
            .is_none());
        assert_eq!(source.applied_block_count(), 0);
    }
}
