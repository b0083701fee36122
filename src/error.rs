// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use chrono::NaiveDate;
use compact_str::CompactString;
use thiserror::Error;

/// Why a single trip update could not be applied. Every variant is local to
/// one update: the batch logs it and moves on, the buffer is untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("trip update has no trip id")]
    MissingTripId,
    #[error("failed to parse start date {0:?}")]
    InvalidStartDate(String),
    #[error("trip update has no start date")]
    MissingStartDate,
    #[error("no pattern found for trip id {0}")]
    NoPatternForTrip(CompactString),
    #[error("trip update contains no stop time updates")]
    NoStopTimeUpdates,
    #[error("added trip has fewer than two stop time updates ({0})")]
    TooFewStops(usize),
    #[error("graph already contains trip id {0} of added trip")]
    TripAlreadyExists(CompactString),
    #[error("graph does not contain trip id {0} of modified trip")]
    TripNotFound(CompactString),
    #[error("stop time update misses a stop id")]
    MissingStopId,
    #[error("graph does not contain stop id {0} of trip update")]
    UnknownStop(CompactString),
    #[error("trip update contains a decreasing stop sequence")]
    DecreasingStopSequence,
    #[error("trip update contains decreasing times")]
    DecreasingTimes,
    #[error("trip update misses an arrival time")]
    MissingArrivalTime,
    #[error("trip update misses a departure time")]
    MissingDepartureTime,
    #[error("time {0}s from service date midnight is outside the valid range")]
    TimeOutOfRange(i64),
    #[error("no service id is available on {0}")]
    NoServiceOnDate(NaiveDate),
    #[error("service date {1} is not served by trip {0}")]
    DateNotServedByTrip(CompactString, NaiveDate),
    #[error("no service code is known for service id {0}")]
    UnknownServiceCode(CompactString),
    #[error("unscheduled trips are not supported")]
    UnscheduledTripsUnsupported,
    #[error("timetable does not contain trip id {0}")]
    TripNotFoundInPattern(CompactString),
    #[error("stop time update could not be matched against the pattern")]
    UnmatchedStopTimeUpdate,
    #[error("a skipped stop cannot be applied as a retime")]
    SkippedStopInRetime,
    #[error("updated trip times are not monotone or out of range")]
    InvalidTripTimes,
    #[error("the buffer rejected the update")]
    UpdateRejected,
}
