/// Copyright: Kyler Chin <kyler@catenarymaps.org>
/// Catenary Transit Initiatives
/// Removal of the attribution is not allowed, as covered under the AGPL license
///
/// Realtime timetable snapshot engine. A single writer ingests batches of
/// GTFS-rt TripUpdate messages and overlays them onto an immutable base
/// timetable. Routing threads read committed snapshots and never observe a
/// partially applied batch.

pub mod error;
pub mod id_index;
pub mod models;
pub mod pattern;
pub mod pattern_cache;
pub mod snapshot;
pub mod snapshot_source;
pub mod static_graph;
pub mod timetable;
pub mod wire;

pub use error::UpdateError;
pub use snapshot::TimetableSnapshot;
pub use snapshot_source::{FuzzyTripMatcher, SnapshotSourceConfig, TimetableSnapshotSource};
pub use static_graph::Graph;
