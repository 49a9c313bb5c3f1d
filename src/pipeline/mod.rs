//! Pipeline Protocols
//!
//! A concrete protocol kind declared in YAML: an ordered list of external
//! programs with their inputs, result files and approval gates.

pub mod kind;
pub mod model;
pub mod parser;

pub use kind::{PipelineProtocol, PIPELINE_CLASS};
pub use model::{Pipeline, PipelineStep};
pub use parser::{load_pipeline, parse_pipeline, validate_pipeline};
