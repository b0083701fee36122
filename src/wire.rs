// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Interpretation of the GTFS-rt wire enums into the strict internal model.

use chrono::NaiveDate;
use gtfs_realtime::trip_update::StopTimeUpdate;
use serde::Deserialize;
use serde::Serialize;

/// How a trip update relates to the static schedule. Wire value 5 (the
/// replacement slot) is interpreted as a modified trip: it retimes the base
/// trip onto a new stop pattern.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum TripScheduleRelationship {
    Scheduled,
    Added,
    Unscheduled,
    Canceled,
    Modified,
}

pub fn option_i32_to_trip_schedule_relationship(
    schedule_relationship: &Option<i32>,
) -> Option<TripScheduleRelationship> {
    match schedule_relationship {
        Some(status) => match status {
            0 => Some(TripScheduleRelationship::Scheduled),
            1 => Some(TripScheduleRelationship::Added),
            2 => Some(TripScheduleRelationship::Unscheduled),
            3 => Some(TripScheduleRelationship::Canceled),
            5 => Some(TripScheduleRelationship::Modified),
            _ => None,
        },
        None => None,
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum StopTimeScheduleRelationship {
    Scheduled,
    Skipped,
    NoData,
    Unscheduled,
}

pub fn option_i32_to_stop_time_schedule_relationship(
    schedule_relationship: &Option<i32>,
) -> Option<StopTimeScheduleRelationship> {
    match schedule_relationship {
        Some(status) => match status {
            0 => Some(StopTimeScheduleRelationship::Scheduled),
            1 => Some(StopTimeScheduleRelationship::Skipped),
            2 => Some(StopTimeScheduleRelationship::NoData),
            3 => Some(StopTimeScheduleRelationship::Unscheduled),
            _ => None,
        },
        None => None,
    }
}

pub fn is_stop_skipped(stop_time_update: &StopTimeUpdate) -> bool {
    option_i32_to_stop_time_schedule_relationship(&stop_time_update.schedule_relationship)
        == Some(StopTimeScheduleRelationship::Skipped)
}

/// Parse a YYYYMMDD service date from a trip descriptor.
pub fn parse_service_date(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y%m%d").ok()
}
