pub mod stalled_counts;
pub mod tally_runner;
pub mod tie_break;

pub use tally_runner::TallyRunner;
pub use tie_break::{PendingTie, TieBreakCoordinator};
