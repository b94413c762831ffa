pub mod stats;

pub use stats::{StatsService, StatsSnapshot};
