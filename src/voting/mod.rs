pub mod ranked;
pub mod report;
pub mod threshold;
pub mod validate;

pub use ranked::{Progress, RankedInput, RankedTally, Tie};
pub use report::render;
pub use threshold::calculate_results;
pub use validate::{SubmittedMark, validate_ballot};
