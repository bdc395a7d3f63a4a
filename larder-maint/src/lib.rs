//! larder-maint library interface
//!
//! Staged maintenance for a Mealie recipe service: duplicate merges for
//! reference entities, structured ingredient parsing, taxonomy and cookbook
//! reconciliation. Exposed as a library for the binary and integration tests.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod parser;
pub mod planner;
pub mod report;
pub mod stages;

pub use crate::client::{HttpRecipeService, RecipeService};
pub use crate::config::{MaintConfig, RunOverrides};
pub use crate::error::{ServiceError, StageError};
pub use crate::orchestrator::Pipeline;
pub use crate::planner::Mode;
pub use crate::report::{PipelineState, RunReport, StageStatus};
pub use crate::stages::StageName;
