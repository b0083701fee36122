// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Per-trip time rows and the timetables that hold them. A timetable is
//! either the scheduled one owned by a pattern or a realtime overlay for one
//! service date.

use crate::error::UpdateError;
use crate::models::{StopTime, Trip};
use crate::pattern::StopPattern;
use crate::static_graph::Deduplicator;
use crate::wire::{self, StopTimeScheduleRelationship};
use chrono::NaiveDate;
use gtfs_realtime::trip_update::StopTimeUpdate;
use gtfs_realtime::TripUpdate;
use itertools::Itertools;
use std::sync::Arc;

/// Maximum time in seconds since midnight for arrivals and departures.
pub const MAX_ARRIVAL_DEPARTURE_TIME: i32 = 48 * 60 * 60;

/// Arrival and departure times of one trip along its pattern. The scheduled
/// arrays are interned through the deduplicator and shared; the realtime
/// arrays start as a copy of them, which is what marks a row as realtime.
#[derive(Clone, Debug, PartialEq)]
pub struct TripTimes {
    pub trip: Arc<Trip>,
    scheduled_arrivals: Arc<[i32]>,
    scheduled_departures: Arc<[i32]>,
    arrivals: Vec<i32>,
    departures: Vec<i32>,
    stop_sequences: Vec<u32>,
    pub service_code: usize,
    pub canceled: bool,
}

impl TripTimes {
    pub fn new(
        trip: Arc<Trip>,
        stop_times: &[StopTime],
        service_code: usize,
        deduplicator: &Deduplicator,
    ) -> Self {
        let mut arrivals = Vec::with_capacity(stop_times.len());
        let mut departures = Vec::with_capacity(stop_times.len());
        let mut stop_sequences = Vec::with_capacity(stop_times.len());
        let mut previous_departure = 0;
        for stop_time in stop_times {
            let arrival = stop_time
                .arrival_time
                .or(stop_time.departure_time)
                .unwrap_or(previous_departure);
            let departure = stop_time.departure_time.or(stop_time.arrival_time).unwrap_or(arrival);
            arrivals.push(arrival);
            departures.push(departure);
            stop_sequences.push(stop_time.stop_sequence);
            previous_departure = departure;
        }
        let scheduled_arrivals = deduplicator.int_array(&arrivals);
        let scheduled_departures = deduplicator.int_array(&departures);
        TripTimes {
            trip,
            scheduled_arrivals,
            scheduled_departures,
            arrivals,
            departures,
            stop_sequences,
            service_code,
            canceled: false,
        }
    }

    /// A fresh row whose realtime times are reset to the schedule, the
    /// starting point for layering a retime update.
    pub fn scheduled_baseline(&self) -> TripTimes {
        TripTimes {
            arrivals: self.scheduled_arrivals.to_vec(),
            departures: self.scheduled_departures.to_vec(),
            canceled: false,
            ..self.clone()
        }
    }

    pub fn num_stops(&self) -> usize {
        self.arrivals.len()
    }

    pub fn arrival_time(&self, stop_index: usize) -> i32 {
        self.arrivals[stop_index]
    }

    pub fn departure_time(&self, stop_index: usize) -> i32 {
        self.departures[stop_index]
    }

    pub fn scheduled_arrival_time(&self, stop_index: usize) -> i32 {
        self.scheduled_arrivals[stop_index]
    }

    pub fn scheduled_departure_time(&self, stop_index: usize) -> i32 {
        self.scheduled_departures[stop_index]
    }

    pub fn stop_sequence(&self, stop_index: usize) -> u32 {
        self.stop_sequences[stop_index]
    }

    pub fn update_arrival_time(&mut self, stop_index: usize, time: i32) {
        self.arrivals[stop_index] = time;
    }

    pub fn update_departure_time(&mut self, stop_index: usize, time: i32) {
        self.departures[stop_index] = time;
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    /// One shared cursor runs over arrival/departure pairs, so a departure
    /// earlier than its own arrival also fails.
    pub fn times_are_monotone(&self) -> bool {
        self.arrivals
            .iter()
            .zip(self.departures.iter())
            .flat_map(|(arrival, departure)| [*arrival, *departure])
            .tuple_windows()
            .all(|(earlier, later)| earlier <= later)
    }

    pub fn times_are_in_range(&self) -> bool {
        self.arrivals
            .iter()
            .chain(self.departures.iter())
            .all(|time| (0..=MAX_ARRIVAL_DEPARTURE_TIME).contains(time))
    }

    pub fn times_are_valid(&self) -> bool {
        self.times_are_monotone() && self.times_are_in_range()
    }
}

#[derive(Clone, Debug)]
pub struct Timetable {
    pub trip_times: Vec<Arc<TripTimes>>,
    /// None for the scheduled timetable, the overlay date otherwise.
    pub service_date: Option<NaiveDate>,
}

impl Timetable {
    pub fn empty() -> Self {
        Timetable {
            trip_times: Vec::new(),
            service_date: None,
        }
    }

    pub fn new(trip_times: Vec<Arc<TripTimes>>, service_date: Option<NaiveDate>) -> Self {
        Timetable {
            trip_times,
            service_date,
        }
    }

    pub fn trip_index(&self, trip_local_id: &str) -> Option<usize> {
        self.trip_times
            .iter()
            .position(|trip_times| trip_times.trip.id.local_id == trip_local_id)
    }

    pub fn trip_times(&self, trip_index: usize) -> &Arc<TripTimes> {
        &self.trip_times[trip_index]
    }

    pub(crate) fn copy_for_service_date(&self, service_date: NaiveDate) -> Timetable {
        Timetable {
            trip_times: self.trip_times.clone(),
            service_date: Some(service_date),
        }
    }

    /// Replace the row for the updated trip, or append one for a trip the
    /// timetable does not contain yet.
    pub(crate) fn apply_trip_times(&mut self, updated_trip_times: TripTimes) {
        match self.trip_index(&updated_trip_times.trip.id.local_id) {
            Some(trip_index) => self.trip_times[trip_index] = Arc::new(updated_trip_times),
            None => self.trip_times.push(Arc::new(updated_trip_times)),
        }
    }

    /// Layer the per-stop deltas of a retime update onto the scheduled
    /// baseline of the trip it names. Stops the update does not mention
    /// inherit the running delay; an update that cannot be matched against
    /// the pattern declines the whole retime.
    pub fn create_updated_trip_times(
        &self,
        stop_pattern: &StopPattern,
        trip_update: &TripUpdate,
        midnight_epoch_seconds: i64,
    ) -> Result<TripTimes, UpdateError> {
        let trip_id = trip_update
            .trip
            .trip_id
            .as_deref()
            .ok_or(UpdateError::MissingTripId)?;
        let trip_index = self
            .trip_index(trip_id)
            .ok_or_else(|| UpdateError::TripNotFoundInPattern(trip_id.into()))?;
        let mut new_times = self.trip_times[trip_index].scheduled_baseline();

        let mut updates = trip_update.stop_time_update.iter().peekable();
        let mut delay: i32 = 0;
        for stop_index in 0..new_times.num_stops() {
            let matched = updates.peek().is_some_and(|stop_time_update| {
                stop_time_update_matches(stop_time_update, &new_times, stop_pattern, stop_index)
            });
            if !matched {
                let scheduled_arrival = new_times.scheduled_arrival_time(stop_index);
                let scheduled_departure = new_times.scheduled_departure_time(stop_index);
                new_times.update_arrival_time(stop_index, scheduled_arrival + delay);
                new_times.update_departure_time(stop_index, scheduled_departure + delay);
                continue;
            }
            let stop_time_update = updates.next().unwrap();
            match wire::option_i32_to_stop_time_schedule_relationship(
                &stop_time_update.schedule_relationship,
            ) {
                Some(StopTimeScheduleRelationship::Skipped) => {
                    return Err(UpdateError::SkippedStopInRetime);
                }
                Some(StopTimeScheduleRelationship::NoData) => {
                    // no realtime information here, fall back to the schedule
                    delay = 0;
                }
                _ => {
                    let scheduled_arrival = new_times.scheduled_arrival_time(stop_index);
                    match stop_time_update.arrival.as_ref().and_then(|event| event.time) {
                        Some(absolute) => {
                            let since_midnight = absolute - midnight_epoch_seconds;
                            let since_midnight = i32::try_from(since_midnight)
                                .map_err(|_| UpdateError::TimeOutOfRange(since_midnight))?;
                            new_times.update_arrival_time(stop_index, since_midnight);
                            delay = since_midnight - scheduled_arrival;
                        }
                        None => {
                            if let Some(event_delay) =
                                stop_time_update.arrival.as_ref().and_then(|event| event.delay)
                            {
                                delay = event_delay;
                            }
                            new_times.update_arrival_time(stop_index, scheduled_arrival + delay);
                        }
                    }
                    let scheduled_departure = new_times.scheduled_departure_time(stop_index);
                    match stop_time_update
                        .departure
                        .as_ref()
                        .and_then(|event| event.time)
                    {
                        Some(absolute) => {
                            let since_midnight = absolute - midnight_epoch_seconds;
                            let since_midnight = i32::try_from(since_midnight)
                                .map_err(|_| UpdateError::TimeOutOfRange(since_midnight))?;
                            new_times.update_departure_time(stop_index, since_midnight);
                            delay = since_midnight - scheduled_departure;
                        }
                        None => {
                            if let Some(event_delay) = stop_time_update
                                .departure
                                .as_ref()
                                .and_then(|event| event.delay)
                            {
                                delay = event_delay;
                            }
                            new_times.update_departure_time(stop_index, scheduled_departure + delay);
                        }
                    }
                }
            }
        }

        if updates.next().is_some() {
            return Err(UpdateError::UnmatchedStopTimeUpdate);
        }
        if !new_times.times_are_valid() {
            return Err(UpdateError::InvalidTripTimes);
        }
        Ok(new_times)
    }
}

fn stop_time_update_matches(
    stop_time_update: &StopTimeUpdate,
    trip_times: &TripTimes,
    stop_pattern: &StopPattern,
    stop_index: usize,
) -> bool {
    if let Some(stop_sequence) = stop_time_update.stop_sequence {
        return trip_times.stop_sequence(stop_index) == stop_sequence;
    }
    if let Some(stop_id) = stop_time_update.stop_id.as_deref() {
        return stop_pattern.stops[stop_index].stop.id.local_id == stop_id;
    }
    false
}
