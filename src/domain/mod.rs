pub mod cadence;
pub mod funding;
pub mod report;

pub use cadence::*;
pub use funding::*;
pub use report::*;
