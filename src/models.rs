// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use compact_str::CompactString;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A feed-qualified entity identifier. Realtime lookups currently ignore the
/// feed qualifier and match on the bare local id, see [`crate::id_index`].
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedScopedId {
    pub feed_id: CompactString,
    pub local_id: CompactString,
}

impl FeedScopedId {
    pub fn new(feed_id: impl Into<CompactString>, local_id: impl Into<CompactString>) -> Self {
        FeedScopedId {
            feed_id: feed_id.into(),
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for FeedScopedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.feed_id, self.local_id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: FeedScopedId,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Used for short- and long-distance bus routes. Routes synthesized for added
/// trips are tagged with this type because the feed gives no better hint.
pub const ROUTE_TYPE_BUS: i16 = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: FeedScopedId,
    pub agency_id: CompactString,
    pub route_type: i16,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trip {
    pub id: FeedScopedId,
    pub route: Arc<Route>,
    pub service_id: CompactString,
    pub trip_headsign: Option<String>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum PickupDropoff {
    Regular,
    NotAvailable,
    Phone,
    CoordinateWithDriver,
}

pub fn pickup_dropoff_to_i16(pickup_dropoff: &PickupDropoff) -> i16 {
    match pickup_dropoff {
        PickupDropoff::Regular => 0,
        PickupDropoff::NotAvailable => 1,
        PickupDropoff::Phone => 2,
        PickupDropoff::CoordinateWithDriver => 3,
    }
}

/// One row of a trip's stop time list, expressed in seconds since midnight of
/// the service date. Either time may be missing on the first / last stop, the
/// construction of [`crate::timetable::TripTimes`] falls back to the other.
#[derive(Clone, Debug)]
pub struct StopTime {
    pub stop: Arc<Stop>,
    pub arrival_time: Option<i32>,
    pub departure_time: Option<i32>,
    pub stop_sequence: u32,
    pub pickup_type: PickupDropoff,
    pub drop_off_type: PickupDropoff,
    pub timepoint: bool,
}
