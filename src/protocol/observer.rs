//! Step lifecycle observers.

use super::step::Step;

/// Receives step lifecycle notifications.
///
/// `step_finished` fires on every exit path of a run, failures included.
pub trait StepObserver {
    fn step_started(&mut self, _step: &Step) {}

    fn step_finished(&mut self, _step: &Step) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StepObserver for NoopObserver {}

impl StepObserver for Vec<Box<dyn StepObserver>> {
    fn step_started(&mut self, step: &Step) {
        for observer in self.iter_mut() {
            observer.step_started(step);
        }
    }

    fn step_finished(&mut self, step: &Step) {
        for observer in self.iter_mut() {
            observer.step_finished(step);
        }
    }
}
