//! Route resolution over immutable, atomically swapped snapshots.

pub mod registry;

pub use registry::{join_paths, MatchMode, RouteEntry, RouteMatch, RouteRegistry, RouteView};
