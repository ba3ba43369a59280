//! prcov CI - coverage-agent dispatch
//!
//! Provides the pipeline orchestrator that:
//! - Builds one work item per (source, test) association
//! - Runs the external coverage agent for each, concurrently and bounded
//! - Aggregates the outcomes and reports them to the pull request

pub mod dispatcher;
pub mod fakes;
pub mod pipeline;
pub mod runner;
pub mod work;

// Re-export key types
pub use dispatcher::{Dispatcher, CANCELLED_BEFORE_START};
pub use pipeline::{CoveragePipeline, PipelineResult};
pub use runner::{AgentOutput, AgentRunner, CoverAgentRunner};
pub use work::WorkItem;
