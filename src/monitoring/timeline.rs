//! Execution Timeline
//!
//! Tracks step start/end times for generating run reports and Gantt
//! charts. The timeline is a [`StepObserver`]; share it with a protocol
//! through `Arc<Mutex<_>>` to read it back after the run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::protocol::{Step, StepObserver, StepStatus};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Step finished its work and waits for approval
    Waiting,
}

impl EventType {
    /// Event recorded when a step leaves the running state.
    pub fn from_status(status: StepStatus) -> Self {
        match status {
            StepStatus::Finished => EventType::Completed,
            StepStatus::WaitingApproval => EventType::Waiting,
            StepStatus::Created | StepStatus::Running | StepStatus::Failed => EventType::Failed,
        }
    }

    fn ends_step(self) -> bool {
        self != EventType::Started
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Step key, `<index>:<label>`
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a protocol run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Creates a timeline that can be handed to a protocol and read later.
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: String, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id,
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Number of steps that ended with the given event.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut sorted_steps: Vec<_> = self.step_times().into_iter().collect();
        sorted_steps.sort_by_key(|(_, (start, _))| *start);

        for (step_id, (start, end)) in sorted_steps {
            let Some(end) = end else {
                continue;
            };
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:16} |{}| ({} ms)\n",
                truncate(&step_id, 16),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.step_times()
            .into_iter()
            .filter_map(|(step_id, (start, end))| end.map(|end| (step_id, end - start)))
            .collect()
    }

    /// Start and end offsets of every step, in milliseconds.
    fn step_times(&self) -> HashMap<String, (u128, Option<u128>)> {
        let mut times: HashMap<String, (u128, Option<u128>)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.ends_step() {
                if let Some(entry) = times.get_mut(&event.step_id) {
                    entry.1 = Some(elapsed);
                }
            } else {
                times.insert(event.step_id.clone(), (elapsed, None));
            }
        }

        times
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeline key of a step.
pub fn step_key(step: &Step) -> String {
    format!("{}:{}", step.index(), step.label())
}

impl StepObserver for ExecutionTimeline {
    fn step_started(&mut self, step: &Step) {
        self.add_event(step_key(step), EventType::Started);
    }

    fn step_finished(&mut self, step: &Step) {
        self.add_event(step_key(step), EventType::from_status(step.status()));
    }
}

impl StepObserver for Arc<Mutex<ExecutionTimeline>> {
    fn step_started(&mut self, step: &Step) {
        if let Ok(mut timeline) = self.lock() {
            timeline.step_started(step);
        }
    }

    fn step_finished(&mut self, step: &Step) {
        if let Ok(mut timeline) = self.lock() {
            timeline.step_finished(step);
        }
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
