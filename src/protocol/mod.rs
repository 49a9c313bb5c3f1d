//! Protocol Execution
//!
//! Step lifecycle, the resumable protocol engine and the backends used to
//! parallelize work inside a step.
//!
//! - [`step`]: one unit of work and its status lifecycle
//! - [`kind`]: what a concrete protocol declares and executes
//! - [`protocol`]: snapshot / declare / reconcile / prepare / execute
//! - [`executor`]: sequential, thread-pool and process-group backends
//! - [`process`]: external program invocation
//! - [`observer`]: step lifecycle notifications

pub mod executor;
pub mod kind;
pub mod observer;
pub mod process;
#[allow(clippy::module_inception)]
pub mod protocol;
pub mod step;

pub use executor::{select_executor, Executor, ProcessGroupExecutor, SequentialExecutor, Task, ThreadPoolExecutor};
pub use kind::{Form, Params, ProtocolKind, StepContext, StepPlan};
pub use observer::{NoopObserver, StepObserver};
pub use process::{build_command, run_external_program, Parallelism};
pub use protocol::{Protocol, RunMode, StopHandle};
pub use step::{Step, StepStatus, RUN_JOB_FUNCTION};
