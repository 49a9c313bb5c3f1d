//! Step event stream.
//!
//! Forwards step lifecycle notifications over a channel so another
//! thread can report progress while a protocol runs.

use std::sync::mpsc::{channel, Receiver, Sender};

use chrono::{DateTime, Local};
use log::debug;

use crate::protocol::{Step, StepObserver, StepStatus};

/// Snapshot of a step at a lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEvent {
    pub index: usize,
    pub label: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub at: DateTime<Local>,
}

impl StepEvent {
    pub fn from_step(step: &Step) -> Self {
        Self {
            index: step.index(),
            label: step.label(),
            status: step.status(),
            error: step.error_message().map(str::to_string),
            at: Local::now(),
        }
    }
}

/// Observer sending a [`StepEvent`] for every transition.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<StepEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<StepEvent>) -> Self {
        Self { sender }
    }

    /// Observer plus the receiving end of its channel.
    pub fn channel() -> (Self, Receiver<StepEvent>) {
        let (tx, rx) = channel();
        (Self::new(tx), rx)
    }

    fn send(&self, step: &Step) {
        // The run goes on when nobody listens anymore
        if let Err(e) = self.sender.send(StepEvent::from_step(step)) {
            debug!("Step event dropped: {}", e);
        }
    }
}

impl StepObserver for ChannelObserver {
    fn step_started(&mut self, step: &Step) {
        self.send(step);
    }

    fn step_finished(&mut self, step: &Step) {
        self.send(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_follow_transitions() {
        let (mut observer, rx) = ChannelObserver::channel();
        let mut step = Step::function("compute", Vec::new());
        step.set_index(3);

        step.set_status(StepStatus::Running);
        observer.step_started(&step);
        step.set_status(StepStatus::Finished);
        observer.step_finished(&step);

        let events: Vec<StepEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].index, 3);
        assert_eq!(events[0].label, "compute");
        assert_eq!(events[0].status, StepStatus::Running);
        assert_eq!(events[1].status, StepStatus::Finished);
        assert!(events[0].at <= events[1].at);
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (mut observer, rx) = ChannelObserver::channel();
        drop(rx);
        observer.step_started(&Step::function("compute", Vec::new()));
    }
}
