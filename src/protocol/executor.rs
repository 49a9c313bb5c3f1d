//! Executor Backends
//!
//! Strategies for fanning out work *inside* a single step. Steps themselves
//! always run one after another; an executor only decides how the tasks or
//! external programs of the current step are run, and always joins them
//! before returning.
//!
//! # Selection
//!
//! - processes > 1: [`ProcessGroupExecutor`]
//! - threads > 1: [`ThreadPoolExecutor`] (rayon)
//! - otherwise: [`SequentialExecutor`]

use std::path::Path;

use log::{debug, warn};
use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::error::ExecutionError;

use super::process::{run_external_program, Parallelism};

/// Unit of in-process work submitted to an executor.
pub type Task = Box<dyn FnOnce() -> Result<(), ExecutionError> + Send>;

/// Strategy for running the work of one step.
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Degree of parallelism offered.
    fn workers(&self) -> usize;

    /// Runs every task and waits for all of them. Returns the first error.
    fn run_all(&self, tasks: Vec<Task>) -> Result<(), ExecutionError>;

    /// Parallelism handed to external programs.
    fn parallelism(&self) -> Parallelism;

    fn run_program(
        &self,
        program: &str,
        args: &str,
        background: bool,
        working_dir: Option<&Path>,
    ) -> Result<(), ExecutionError> {
        run_external_program(program, args, &self.parallelism(), background, working_dir)
    }
}

/// Runs everything on the calling thread.
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor;

impl Executor for SequentialExecutor {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn workers(&self) -> usize {
        1
    }

    fn run_all(&self, tasks: Vec<Task>) -> Result<(), ExecutionError> {
        tasks.into_iter().try_for_each(|task| task())
    }

    fn parallelism(&self) -> Parallelism {
        Parallelism::sequential()
    }
}

/// Runs tasks on a dedicated rayon pool.
#[derive(Debug)]
pub struct ThreadPoolExecutor {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl ThreadPoolExecutor {
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("protorun-worker-{}", i))
            .build()?;
        Ok(Self { pool, threads })
    }
}

impl Executor for ThreadPoolExecutor {
    fn name(&self) -> &'static str {
        "thread-pool"
    }

    fn workers(&self) -> usize {
        self.threads
    }

    fn run_all(&self, tasks: Vec<Task>) -> Result<(), ExecutionError> {
        debug!("Running {} tasks on {} threads", tasks.len(), self.threads);
        // Every task runs to completion even when a sibling fails.
        let results: Vec<Result<(), ExecutionError>> = self
            .pool
            .install(|| tasks.into_par_iter().map(|task| task()).collect());
        results.into_iter().collect()
    }

    fn parallelism(&self) -> Parallelism {
        Parallelism {
            threads: self.threads,
            ..Parallelism::sequential()
        }
    }
}

/// Wraps external programs in the configured process-group launcher.
///
/// In-process tasks run on the calling thread.
#[derive(Debug, Clone)]
pub struct ProcessGroupExecutor {
    processes: usize,
    threads: usize,
    launcher: String,
}

impl ProcessGroupExecutor {
    pub fn new(processes: usize, threads: usize, launcher: impl Into<String>) -> Self {
        Self {
            processes,
            threads: threads.max(1),
            launcher: launcher.into(),
        }
    }
}

impl Executor for ProcessGroupExecutor {
    fn name(&self) -> &'static str {
        "process-group"
    }

    fn workers(&self) -> usize {
        self.processes
    }

    fn run_all(&self, tasks: Vec<Task>) -> Result<(), ExecutionError> {
        tasks.into_iter().try_for_each(|task| task())
    }

    fn parallelism(&self) -> Parallelism {
        Parallelism::new(self.processes, self.threads, self.launcher.clone())
    }
}

/// Picks the backend for a protocol's declared thread and process counts.
pub fn select_executor(threads: usize, processes: usize, config: &EngineConfig) -> Box<dyn Executor> {
    if processes > 1 {
        debug!("Using process-group executor with {} processes", processes);
        return Box::new(ProcessGroupExecutor::new(
            processes,
            config.cap_threads(threads),
            config.launcher.clone(),
        ));
    }

    let threads = config.cap_threads(threads);
    if threads > 1 {
        match ThreadPoolExecutor::new(threads) {
            Ok(executor) => {
                debug!("Using thread-pool executor with {} threads", threads);
                return Box::new(executor);
            }
            Err(e) => warn!("Failed to build thread pool, running sequentially: {}", e),
        }
    }

    Box::new(SequentialExecutor)
}
