//! Protocol Engine
//!
//! Runs the ordered step plan of a [`ProtocolKind`] and keeps it durable
//! so an interrupted or failed run can be resumed without repeating
//! completed work.
//!
//! # Run Phases
//!
//! 1. Snapshot: the previously stored plan is set aside
//! 2. Declare: the kind builds the full plan from the current parameters
//! 3. Reconcile: the plans are compared to find the resume index; stored
//!    steps from that index on are deleted, earlier ones are kept
//! 4. Prepare: the working directory and its `extra/` and `tmp/` folders
//!    are created (wiped first on restart)
//! 5. Execute: remaining steps run in order, each stored and committed as
//!    soon as it terminates

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{ExecutionError, ProtocolError};
use crate::mapper::Mapper;
use crate::object::{item_key, item_position, BuiltinClass, Node, ObjectId};
use crate::paths::{self, clean_path, make_path};

use super::executor::{select_executor, Executor};
use super::kind::{empty_outputs, Form, Params, ProtocolKind, StepContext, StepPlan, OUTPUTS_KEY};
use super::observer::StepObserver;
use super::step::{timestamp, Step, StepStatus};

const STEPS_KEY: &str = "steps";

/// How a run treats the previously stored plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Skip the unchanged, finished prefix of the stored plan.
    Resume,
    /// Discard everything and run from the first step.
    Restart,
    /// Resume after an approval.
    Continue,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Restart => "restart",
            Self::Continue => "continue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "resume" => Some(Self::Resume),
            "restart" => Some(Self::Restart),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cooperative stop request, honored between steps.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A protocol instance: kind, stored state and its step plan.
pub struct Protocol<K: ProtocolKind> {
    kind: K,
    node: Node,
    /// Plan entries; stored ones carry their ids.
    steps: Vec<Step>,
    /// Number of plan entries known to have terminated in this run.
    cursor: usize,
    stop: StopHandle,
    observers: Vec<Box<dyn StepObserver>>,
    config: EngineConfig,
}

impl<K: ProtocolKind> Protocol<K> {
    /// Creates a fresh, unstored protocol with default parameters.
    pub fn new(kind: K, config: EngineConfig) -> Self {
        let mut node = Node::new(kind.class_name());
        for (key, field) in base_fields() {
            node.set_field(key, field);
        }

        let mut form = Form::new();
        kind.define_params(&mut form);
        for (key, field) in form.into_fields() {
            node.set_field(key, field);
        }

        Self {
            kind,
            node,
            steps: Vec::new(),
            cursor: 0,
            stop: StopHandle::default(),
            observers: Vec::new(),
            config,
        }
    }

    /// Rehydrates a protocol from its stored node.
    ///
    /// Fields or parameters missing from the stored object get their
    /// defaults; the stored plan becomes the snapshot for the next run.
    pub fn from_node(kind: K, mut node: Node, config: EngineConfig) -> Result<Self, ProtocolError> {
        if node.class_name() != kind.class_name() {
            return Err(ProtocolError::Invalid(format!(
                "object {} has class '{}', expected '{}'",
                node.str_id(),
                node.class_name(),
                kind.class_name()
            )));
        }

        for (key, field) in base_fields() {
            if !node.has_field(&key) {
                node.set_field(key, field);
            }
        }
        let mut form = Form::new();
        kind.define_params(&mut form);
        for (key, field) in form.into_fields() {
            if !node.has_field(&key) {
                node.set_field(key, field);
            }
        }

        let items = match node.field_mut(STEPS_KEY) {
            Some(list) => list.take_items(),
            None => Vec::new(),
        };
        let mut positioned = Vec::with_capacity(items.len());
        for (key, item) in items {
            let position = item_position(&key).ok_or_else(|| {
                ProtocolError::Invalid(format!("step list entry with key '{}'", key))
            })?;
            let mut step = Step::from_node(item)?;
            step.set_index(position);
            positioned.push(step);
        }
        positioned.sort_by_key(Step::index);

        let cursor = positioned
            .iter()
            .take_while(|s| s.status().is_terminal())
            .count();

        Ok(Self {
            kind,
            node,
            steps: positioned,
            cursor,
            stop: StopHandle::default(),
            observers: Vec::new(),
            config,
        })
    }

    /// Loads a stored protocol by id.
    pub fn load(kind: K, mapper: &dyn Mapper, id: ObjectId, config: EngineConfig) -> Result<Self, ProtocolError> {
        let node = mapper.get(id)?;
        Self::from_node(kind, node, config)
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.node.id()
    }

    pub fn class_name(&self) -> &str {
        self.node.class_name()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.node.field(key).and_then(Node::as_str)
    }

    fn set_text(&mut self, key: &str, value: Option<String>) {
        if let Some(field) = self.node.field_mut(key) {
            field.set_value(value);
        }
    }

    pub fn status(&self) -> StepStatus {
        self.text("status")
            .and_then(StepStatus::parse)
            .unwrap_or(StepStatus::Created)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.text("error")
    }

    pub fn started_at(&self) -> Option<&str> {
        self.text("initTime")
    }

    pub fn ended_at(&self) -> Option<&str> {
        self.text("endTime")
    }

    pub fn mode(&self) -> RunMode {
        self.text("mode")
            .and_then(RunMode::parse)
            .unwrap_or(RunMode::Resume)
    }

    pub fn set_mode(&mut self, mode: RunMode) {
        self.set_text("mode", Some(mode.as_str().to_string()));
    }

    pub fn working_dir(&self) -> PathBuf {
        PathBuf::from(self.text("workingDir").unwrap_or("."))
    }

    pub fn set_working_dir(&mut self, dir: impl AsRef<Path>) {
        self.set_text("workingDir", Some(dir.as_ref().display().to_string()));
    }

    pub fn threads(&self) -> usize {
        self.integer("numberOfThreads")
    }

    pub fn set_threads(&mut self, threads: usize) {
        self.set_text("numberOfThreads", Some(threads.max(1).to_string()));
    }

    pub fn processes(&self) -> usize {
        self.integer("numberOfMpi")
    }

    pub fn set_processes(&mut self, processes: usize) {
        self.set_text("numberOfMpi", Some(processes.max(1).to_string()));
    }

    fn integer(&self, key: &str) -> usize {
        self.node
            .field(key)
            .and_then(Node::as_i64)
            .map(|v| v.max(1) as usize)
            .unwrap_or(1)
    }

    pub fn params(&self) -> Params<'_> {
        Params::new(&self.node)
    }

    /// Sets the value of a declared scalar parameter.
    pub fn set_param(&mut self, name: &str, value: impl ToString) -> Result<(), ProtocolError> {
        let field = self
            .node
            .field_mut(name)
            .filter(|f| !f.is_pointer())
            .ok_or_else(|| ProtocolError::Invalid(format!("unknown parameter '{}'", name)))?;
        field.set_string(value.to_string());
        Ok(())
    }

    /// Points an input parameter at a stored object.
    pub fn set_input(&mut self, name: &str, target: &Node) -> Result<(), ProtocolError> {
        if target.id().is_none() {
            return Err(ProtocolError::Invalid(format!(
                "input '{}' must reference a stored object",
                name
            )));
        }
        let field = self
            .node
            .field_mut(name)
            .filter(|f| f.is_pointer())
            .ok_or_else(|| ProtocolError::Invalid(format!("unknown input '{}'", name)))?;
        field.set_target(target.clone());
        Ok(())
    }

    /// Published outputs, in the order they were first defined.
    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.node
            .field(OUTPUTS_KEY)
            .into_iter()
            .flat_map(|o| o.fields())
    }

    pub fn output(&self, name: &str) -> Option<&Node> {
        self.node.field(OUTPUTS_KEY).and_then(|o| o.field(name))
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn add_observer(&mut self, observer: Box<dyn StepObserver>) {
        self.observers.push(observer);
    }

    /// Run name assigned by the project, e.g. `PipelineProtocol12`.
    pub fn run_name(&self) -> &str {
        self.node.name()
    }

    pub(crate) fn set_run_name(&mut self, name: impl Into<String>) {
        self.node.set_name(name);
    }

    /// Fresh, unstored copy with the same parameter values and settings.
    pub fn duplicate(&self) -> Self
    where
        K: Clone,
    {
        let mut copy = Self::new(self.kind.clone(), self.config.clone());

        let mut form = Form::new();
        self.kind.define_params(&mut form);
        for name in form.names() {
            let (Some(source), Some(target)) = (self.node.field(name), copy.node.field_mut(name)) else {
                continue;
            };
            match source.target() {
                Some(referenced) if source.is_pointer() => target.set_target(referenced.clone()),
                _ => target.set_value(source.value().map(str::to_string)),
            }
        }

        copy.set_threads(self.threads());
        copy.set_processes(self.processes());
        copy
    }

    /// Stores the protocol node (not the steps) and commits.
    pub fn store(&mut self, mapper: &mut dyn Mapper) -> Result<ObjectId, ProtocolError> {
        let id = mapper.store(&mut self.node)?;
        mapper.commit()?;
        Ok(id)
    }

    /// Runs the protocol and returns its final status.
    ///
    /// `Finished` when every step finished, `WaitingApproval` when an
    /// interactive step parked the run. A failed step, an unmet
    /// precondition or a stop request return an error after the protocol
    /// has been stored as failed.
    ///
    /// A stop requested before the call is honored before the first step;
    /// the request is cleared once the run returns.
    pub fn run(&mut self, mapper: &mut dyn Mapper) -> Result<StepStatus, ProtocolError> {
        self.set_text("initTime", Some(timestamp()));
        self.set_text("endTime", None);
        self.set_text("error", None);
        self.set_text("status", Some(StepStatus::Running.as_str().to_string()));
        info!("Running protocol {} ({})", self.class_name(), self.mode());

        let result = self.run_phases(mapper);
        self.stop.reset();

        let status = match &result {
            Ok(status) => *status,
            Err(e) => {
                error!("Protocol {} failed: {}", self.class_name(), e);
                self.set_text("error", Some(e.to_string()));
                StepStatus::Failed
            }
        };
        self.set_text("status", Some(status.as_str().to_string()));
        self.set_text("endTime", Some(timestamp()));

        match (result, self.store(mapper)) {
            (Ok(status), Ok(_)) => {
                info!("Protocol {} {}", self.class_name(), status);
                Ok(status)
            }
            (Ok(_), Err(store_err)) => Err(store_err),
            (Err(e), Err(store_err)) => {
                warn!("Could not record failure of {}: {}", self.class_name(), store_err);
                Err(e)
            }
            (Err(e), Ok(_)) => Err(e),
        }
    }

    /// Approves the step waiting for approval and resumes the run.
    pub fn continue_run(&mut self, mapper: &mut dyn Mapper) -> Result<StepStatus, ProtocolError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.status() == StepStatus::WaitingApproval)
            .ok_or(ProtocolError::NoWaitingStep)?;

        step.approve();
        info!("Step {} ('{}') approved", step.index(), step.label());
        if step.node().id().is_some() {
            mapper.update(step.node_mut())?;
            mapper.commit()?;
        }

        self.set_mode(RunMode::Continue);
        self.run(mapper)
    }

    fn run_phases(&mut self, mapper: &mut dyn Mapper) -> Result<StepStatus, ProtocolError> {
        let previous = std::mem::take(&mut self.steps);

        let mut plan = StepPlan::new();
        self.kind.define_steps(&Params::new(&self.node), &mut plan);
        let declared = plan.into_steps();

        let start = self.resume_index(&declared, &previous);
        debug!(
            "Plan of {} steps, {} stored, resuming at step {}",
            declared.len(),
            previous.len(),
            start + 1
        );
        self.reconcile(mapper, start, declared, previous)?;

        self.store(mapper)?;
        self.prepare_paths()?;

        self.execute_from(mapper, start)
    }

    /// First plan position that must run again.
    fn resume_index(&self, declared: &[Step], previous: &[Step]) -> usize {
        if self.mode() == RunMode::Restart {
            return 0;
        }

        let n = declared.len().min(previous.len());
        (0..n)
            .find(|&i| {
                let (new, old) = (&declared[i], &previous[i]);
                !new.same_declaration(old)
                    || old.status() != StepStatus::Finished
                    || !old.postconditions()
            })
            .unwrap_or(n)
    }

    /// Deletes stale stored steps and keeps the unchanged head.
    fn reconcile(
        &mut self,
        mapper: &mut dyn Mapper,
        start: usize,
        declared: Vec<Step>,
        previous: Vec<Step>,
    ) -> Result<(), ProtocolError> {
        let mut head = Vec::with_capacity(declared.len());
        for (i, old) in previous.into_iter().enumerate() {
            if i < start {
                head.push(old);
            } else if old.node().id().is_some() {
                debug!("Deleting stored step {} ('{}')", old.index(), old.label());
                mapper.delete(old.node())?;
            }
        }

        head.extend(declared.into_iter().skip(start));
        for (i, step) in head.iter_mut().enumerate() {
            step.set_index(i + 1);
        }
        self.steps = head;
        self.cursor = start;
        Ok(())
    }

    fn prepare_paths(&self) -> Result<(), ProtocolError> {
        let working_dir = self.working_dir();
        let paths = [
            working_dir.clone(),
            working_dir.join("extra"),
            working_dir.join("tmp"),
        ];

        if self.mode() == RunMode::Restart {
            clean_path(&paths)?;
        }
        make_path(&paths)?;
        Ok(())
    }

    fn execute_from(&mut self, mapper: &mut dyn Mapper, start: usize) -> Result<StepStatus, ProtocolError> {
        let working_dir = self.working_dir();
        let executor = select_executor(self.threads(), self.processes(), &self.config);
        debug!("Executor: {} ({} workers)", executor.name(), executor.workers());

        for i in start..self.steps.len() {
            let position = i + 1;
            if self.stop.is_requested() {
                info!("Stop requested before step {}", position);
                return Err(ProtocolError::Stopped(position));
            }

            let missing = self.steps[i].missing_requirements();
            if !missing.is_empty() {
                return Err(ProtocolError::Validation {
                    index: position,
                    step: self.steps[i].label(),
                    reason: format!("missing {}", missing.join(" ")),
                });
            }

            info!("STARTED: {} ({}/{})", self.steps[i].label(), position, self.steps.len());

            let (outcome, outputs) = {
                let kind = &self.kind;
                let step = &mut self.steps[i];
                let mut ctx = StepContext::new(
                    &working_dir,
                    Params::new(&self.node),
                    &*executor,
                    position,
                );
                let outcome = step.run(&mut self.observers, |s| dispatch(kind, s, &mut ctx));
                (outcome, ctx.into_outputs())
            };

            self.persist_step(mapper, i)?;
            self.cursor = position;

            if outcome.is_ok() {
                self.attach_outputs(mapper, outputs)?;
            }

            let step = &self.steps[i];
            match outcome {
                Err(source) => {
                    return Err(ProtocolError::Execution {
                        index: position,
                        step: step.label(),
                        source,
                    });
                }
                Ok(()) if step.status() == StepStatus::WaitingApproval => {
                    info!("WAITING: {} needs approval", step.label());
                    return Ok(StepStatus::WaitingApproval);
                }
                Ok(()) => info!("FINISHED: {}", step.label()),
            }
        }

        Ok(StepStatus::Finished)
    }

    /// Stores one terminated step at its plan position and commits.
    fn persist_step(&mut self, mapper: &mut dyn Mapper, i: usize) -> Result<(), ProtocolError> {
        let list = self
            .node
            .field(STEPS_KEY)
            .ok_or_else(|| ProtocolError::Invalid("protocol has no step list".to_string()))?;
        let step = &mut self.steps[i];

        if step.node().id().is_some() {
            mapper.update(step.node_mut())?;
        } else {
            mapper.insert_child(list, &item_key(i + 1), step.node_mut())?;
        }
        mapper.commit()?;
        Ok(())
    }

    /// Replaces published outputs with the ones defined by a step.
    fn attach_outputs(&mut self, mapper: &mut dyn Mapper, outputs: Vec<(String, Node)>) -> Result<(), ProtocolError> {
        if outputs.is_empty() {
            return Ok(());
        }
        let holder = self
            .node
            .field_mut(OUTPUTS_KEY)
            .ok_or_else(|| ProtocolError::Invalid("protocol has no outputs holder".to_string()))?;

        for (name, output) in outputs {
            if let Some(old) = holder.field(&name) {
                if old.id().is_some() {
                    mapper.delete(old)?;
                }
            }
            holder.set_field(name, output);
        }

        self.store(mapper)?;
        Ok(())
    }
}

/// Fields shared by every protocol, before the kind's parameters.
fn base_fields() -> Vec<(String, Node)> {
    vec![
        ("status".into(), Node::string(StepStatus::Created.as_str())),
        ("initTime".into(), Node::null(BuiltinClass::String)),
        ("endTime".into(), Node::null(BuiltinClass::String)),
        ("error".into(), Node::null(BuiltinClass::String)),
        ("mode".into(), Node::string(RunMode::Resume.as_str())),
        ("workingDir".into(), Node::string(".")),
        ("numberOfThreads".into(), Node::integer(1)),
        ("numberOfMpi".into(), Node::integer(1)),
        (STEPS_KEY.into(), Node::list()),
        (OUTPUTS_KEY.into(), empty_outputs()),
    ]
}

/// Runs the work of one step and resolves its result files.
fn dispatch<K: ProtocolKind>(
    kind: &K,
    step: &Step,
    ctx: &mut StepContext<'_>,
) -> Result<Vec<String>, ExecutionError> {
    let args = step.args()?;

    let files = if step.is_run_job() {
        let (program, arguments) = run_job_args(step, &args)?;
        ctx.run_program(program, arguments)?;
        step.declared_results().to_vec()
    } else {
        kind.execute(step.func_name(), &args, ctx)?
    };

    Ok(files
        .iter()
        .map(|f| paths::resolve(ctx.working_dir(), f).display().to_string())
        .collect())
}

fn run_job_args<'a>(step: &Step, args: &'a [Value]) -> Result<(&'a str, &'a str), ExecutionError> {
    match args {
        [Value::String(program), Value::String(arguments)] => Ok((program, arguments)),
        _ => Err(ExecutionError::InvalidArguments {
            function: step.func_name().to_string(),
            reason: "expected [program, arguments]".to_string(),
        }),
    }
}
