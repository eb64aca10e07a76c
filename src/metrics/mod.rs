pub mod history;
pub mod registry;
pub mod stats;

pub use history::{mask_key, HistoryEntry, HistoryKind, HistoryRing};
pub use registry::Metrics;
pub use stats::{StatsRegistry, UpstreamStats};
