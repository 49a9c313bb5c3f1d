//! protorun - Resumable Protocol Engine
//!
//! Runs protocols (ordered plans of steps) whose progress is stored in a
//! generic SQLite object store, so an interrupted, failed or parked run
//! picks up where it stopped instead of redoing finished work.
//!
//! # Architecture
//!
//! - [`object`]: generic object trees and the class registry
//! - [`mapper`]: persistence of object trees in a single SQLite table
//! - [`protocol`]: steps, the resumable engine and executor backends
//! - [`project`]: project directories holding the store and run folders
//! - [`pipeline`]: protocols declared as YAML lists of external programs
//! - [`monitoring`]: step observers for timelines and progress events
//!
//! # Example
//!
//! ```rust,no_run
//! use protorun::{EngineConfig, PipelineProtocol, Project};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut project = Project::open("analysis", EngineConfig::load_default())?;
//!
//!     let kind = PipelineProtocol::from_file("pipeline.yaml")?;
//!     let mut protocol = project.new_protocol(kind);
//!     protocol.set_threads(4);
//!
//!     let status = project.launch_protocol(&mut protocol)?;
//!     println!("{} finished with status {}", protocol.run_name(), status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod mapper;
pub mod monitoring;
pub mod object;
pub mod paths;
pub mod pipeline;
pub mod project;
pub mod protocol;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ConfigError, ExecutionError, MapperError, PipelineError, ProtocolError};
pub use mapper::{Criteria, Mapper, SqliteMapper};
pub use object::{ClassRegistry, Node, ObjectId};
pub use pipeline::{load_pipeline, Pipeline, PipelineProtocol, PIPELINE_CLASS};
pub use project::Project;
pub use protocol::{Protocol, ProtocolKind, RunMode, Step, StepStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "protorun";
