// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Stop patterns and trip patterns. A stop pattern is the ordered list of
//! stops with boarding policies and uniquely identifies a trip's geometry;
//! structural equality makes it the interning key for trip patterns.

use crate::models::{pickup_dropoff_to_i16, PickupDropoff, Route, Stop, StopTime};
use crate::timetable::Timetable;
use ahash::AHashSet;
use arc_swap::ArcSwap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct PatternStop {
    pub stop: Arc<Stop>,
    pub pickup_type: PickupDropoff,
    pub drop_off_type: PickupDropoff,
}

impl PartialEq for PatternStop {
    fn eq(&self, other: &Self) -> bool {
        self.stop.id == other.stop.id
            && self.pickup_type == other.pickup_type
            && self.drop_off_type == other.drop_off_type
    }
}

impl Eq for PatternStop {}

impl Hash for PatternStop {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stop.id.hash(state);
        self.pickup_type.hash(state);
        self.drop_off_type.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StopPattern {
    pub stops: Vec<PatternStop>,
}

impl StopPattern {
    pub fn from_stop_times(stop_times: &[StopTime]) -> Self {
        StopPattern {
            stops: stop_times
                .iter()
                .map(|stop_time| PatternStop {
                    stop: stop_time.stop.clone(),
                    pickup_type: stop_time.pickup_type,
                    drop_off_type: stop_time.drop_off_type,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }
}

pub fn calculate_pattern_id(route: &Route, stop_pattern: &StopPattern) -> u64 {
    let mut hash_input: Vec<String> = Vec::new();

    hash_input.push(route.id.to_string());

    for pattern_stop in &stop_pattern.stops {
        hash_input.push(format!(
            "{}/{}/{}",
            pattern_stop.stop.id.local_id,
            pickup_dropoff_to_i16(&pattern_stop.pickup_type),
            pickup_dropoff_to_i16(&pattern_stop.drop_off_type)
        ));
    }

    let convert_to_bytes =
        bincode::encode_to_vec(&hash_input, bincode::config::standard()).unwrap();

    seahash::hash(&convert_to_bytes)
}

/// A route's journey over one stop pattern. Owns the scheduled timetable
/// (empty for patterns created by realtime) and the set of service codes on
/// which the pattern runs. The service code set grows copy-on-write because
/// routing threads may be traversing it while an added trip lands.
pub struct TripPattern {
    pub id: u64,
    pub route: Arc<Route>,
    pub stop_pattern: StopPattern,
    pub scheduled_timetable: Arc<Timetable>,
    services: ArcSwap<AHashSet<usize>>,
    pub created_by_realtime: bool,
}

impl TripPattern {
    pub fn new(
        route: Arc<Route>,
        stop_pattern: StopPattern,
        scheduled_timetable: Arc<Timetable>,
        created_by_realtime: bool,
    ) -> Self {
        let id = calculate_pattern_id(&route, &stop_pattern);
        TripPattern {
            id,
            route,
            stop_pattern,
            scheduled_timetable,
            services: ArcSwap::from_pointee(AHashSet::new()),
            created_by_realtime,
        }
    }

    pub fn num_stops(&self) -> usize {
        self.stop_pattern.len()
    }

    pub fn services(&self) -> Arc<AHashSet<usize>> {
        self.services.load_full()
    }

    pub fn has_service_code(&self, service_code: usize) -> bool {
        self.services.load().contains(&service_code)
    }

    /// Replace the service code set by a grown clone. Readers that already
    /// loaded the old set keep it.
    pub fn add_service_code(&self, service_code: usize) {
        let current = self.services.load_full();
        if current.contains(&service_code) {
            return;
        }
        let mut grown = (*current).clone();
        grown.insert(service_code);
        self.services.store(Arc::new(grown));
    }
}

impl fmt::Debug for TripPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TripPattern")
            .field("id", &self.id)
            .field("route", &self.route.id)
            .field("num_stops", &self.num_stops())
            .field("created_by_realtime", &self.created_by_realtime)
            .finish()
    }
}
