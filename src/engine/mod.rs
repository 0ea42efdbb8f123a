//! The race engine: candidate expansion, staggering, outcome classification
//! and the concurrent executor that ties them together.

mod expand;
mod outcome;
mod race;
mod stagger;

pub use expand::expand;
pub use outcome::{classify, reject_reason};
pub use race::RaceExecutor;
pub use stagger::StaggerPolicy;
