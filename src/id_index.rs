// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Secondary indices over stops, routes and trips keyed by the bare local id.
//! Stopgap measure assuming no cross-feed id conflicts; realtime feeds name
//! entities without the feed qualifier. When a duplicate bare id shows up the
//! last occurrence wins and a warning is logged.

use crate::models::{Route, Stop, Trip};
use crate::static_graph::Graph;
use ahash::AHashMap;
use compact_str::CompactString;
use log::warn;
use std::sync::Arc;

pub struct IdIndex {
    stops: AHashMap<CompactString, Arc<Stop>>,
    routes: AHashMap<CompactString, Arc<Route>>,
    trips: AHashMap<CompactString, Arc<Trip>>,
}

impl IdIndex {
    pub(crate) fn build(graph: &Graph) -> Self {
        let mut stops = AHashMap::with_capacity(graph.stops.len());
        for stop in graph.stops.values() {
            if stops.insert(stop.id.local_id.clone(), stop.clone()).is_some() {
                warn!(
                    "duplicate stop id {} detected when the feed qualifier is ignored for realtime updates",
                    stop.id.local_id
                );
            }
        }

        let mut routes = AHashMap::with_capacity(graph.routes.len());
        for route in graph.routes.values() {
            if routes
                .insert(route.id.local_id.clone(), route.clone())
                .is_some()
            {
                warn!(
                    "duplicate route id {} detected when the feed qualifier is ignored for realtime updates",
                    route.id.local_id
                );
            }
        }

        let mut trips = AHashMap::with_capacity(graph.trips.len());
        for trip in graph.trips.values() {
            if trips.insert(trip.id.local_id.clone(), trip.clone()).is_some() {
                warn!(
                    "duplicate trip id {} detected when the feed qualifier is ignored for realtime updates",
                    trip.id.local_id
                );
            }
        }

        IdIndex {
            stops,
            routes,
            trips,
        }
    }

    pub fn stop_for_bare_id(&self, stop_id: &str) -> Option<&Arc<Stop>> {
        self.stops.get(stop_id)
    }

    pub fn route_for_bare_id(&self, route_id: &str) -> Option<&Arc<Route>> {
        self.routes.get(route_id)
    }

    pub fn trip_for_bare_id(&self, trip_id: &str) -> Option<&Arc<Trip>> {
        self.trips.get(trip_id)
    }
}
