//! Domain model: capability facts, outcomes, stage results, branch context.

pub mod capability;
pub mod context;
pub mod error;
pub mod outcome;
pub mod result;

pub use capability::{CapabilityFact, CapabilityFacts};
pub use context::BranchContext;
pub use error::{GantryError, Result};
pub use outcome::{BuildOutcome, StageOutcome};
pub use result::{RunLog, StageResult};
