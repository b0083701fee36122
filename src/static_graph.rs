// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! The static side of the timetable: base entities loaded from a GTFS feed,
//! the calendar, service codes and the time array deduplicator. The graph is
//! immutable once loaded; realtime code only reads it.

use crate::id_index::IdIndex;
use crate::models::{FeedScopedId, Route, Stop, Trip};
use crate::pattern::TripPattern;
use ahash::AHashMap;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use compact_str::CompactString;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

/// Which service ids run on which service dates.
#[derive(Debug, Default)]
pub struct CalendarService {
    running_services: AHashMap<NaiveDate, BTreeSet<CompactString>>,
}

impl CalendarService {
    pub fn new() -> Self {
        CalendarService {
            running_services: AHashMap::new(),
        }
    }

    pub fn add_service_date(
        &mut self,
        service_id: impl Into<CompactString>,
        service_date: NaiveDate,
    ) {
        self.running_services
            .entry(service_date)
            .or_default()
            .insert(service_id.into());
    }

    /// The set is ordered, so `iter().next()` is a reproducible pick.
    pub fn service_ids_on_date(&self, service_date: NaiveDate) -> Option<&BTreeSet<CompactString>> {
        self.running_services.get(&service_date)
    }
}

/// Interns identical time arrays so that the thousands of trips sharing a
/// schedule share one allocation.
#[derive(Debug, Default)]
pub struct Deduplicator {
    int_arrays: Mutex<AHashMap<Vec<i32>, Arc<[i32]>>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Deduplicator {
            int_arrays: Mutex::new(AHashMap::new()),
        }
    }

    pub fn int_array(&self, values: &[i32]) -> Arc<[i32]> {
        let mut int_arrays = self.int_arrays.lock();
        if let Some(existing) = int_arrays.get(values) {
            return existing.clone();
        }
        let interned: Arc<[i32]> = Arc::from(values);
        int_arrays.insert(values.to_vec(), interned.clone());
        interned
    }
}

pub struct Graph {
    pub feed_id: CompactString,
    pub time_zone: Tz,
    pub stops: AHashMap<FeedScopedId, Arc<Stop>>,
    pub routes: AHashMap<FeedScopedId, Arc<Route>>,
    pub trips: AHashMap<FeedScopedId, Arc<Trip>>,
    pub pattern_for_trip: AHashMap<FeedScopedId, Arc<TripPattern>>,
    pub calendar: CalendarService,
    pub service_codes: AHashMap<CompactString, usize>,
    pub deduplicator: Deduplicator,
    bare_id_index: OnceLock<IdIndex>,
}

impl Graph {
    pub fn new(feed_id: impl Into<CompactString>, time_zone: Tz) -> Self {
        Graph {
            feed_id: feed_id.into(),
            time_zone,
            stops: AHashMap::new(),
            routes: AHashMap::new(),
            trips: AHashMap::new(),
            pattern_for_trip: AHashMap::new(),
            calendar: CalendarService::new(),
            service_codes: AHashMap::new(),
            deduplicator: Deduplicator::new(),
            bare_id_index: OnceLock::new(),
        }
    }

    pub fn add_stop(&mut self, stop: Stop) -> Arc<Stop> {
        let stop = Arc::new(stop);
        self.stops.insert(stop.id.clone(), stop.clone());
        stop
    }

    pub fn add_route(&mut self, route: Route) -> Arc<Route> {
        let route = Arc::new(route);
        self.routes.insert(route.id.clone(), route.clone());
        route
    }

    pub fn add_trip(&mut self, trip: Arc<Trip>, pattern: &Arc<TripPattern>) -> Arc<Trip> {
        self.trips.insert(trip.id.clone(), trip.clone());
        self.pattern_for_trip.insert(trip.id.clone(), pattern.clone());
        trip
    }

    /// Assign (or look up) the compact service code for a service id.
    pub fn add_service_code(&mut self, service_id: impl Into<CompactString>) -> usize {
        let next_code = self.service_codes.len();
        *self.service_codes.entry(service_id.into()).or_insert(next_code)
    }

    /// The bare-id secondary index, built on first request and stable for the
    /// lifetime of the graph.
    pub fn index(&self) -> &IdIndex {
        self.bare_id_index.get_or_init(|| IdIndex::build(self))
    }
}

pub fn current_service_date(time_zone: &Tz) -> NaiveDate {
    let now = Utc::now();
    time_zone.from_utc_datetime(&now.naive_utc()).date_naive()
}

/// Seconds since the Unix epoch at the GTFS reference time of the service
/// date: noon minus twelve hours, which differs from civil midnight on days
/// with a daylight saving transition.
pub fn service_date_midnight_epoch(time_zone: &Tz, service_date: NaiveDate) -> i64 {
    let reference_time_noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
    let noon_on_service_date = NaiveDateTime::new(service_date, reference_time_noon);
    let noon_with_tz = time_zone.from_local_datetime(&noon_on_service_date).unwrap();
    (noon_with_tz - Duration::hours(12)).timestamp()
}
