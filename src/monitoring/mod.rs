//! Run Monitoring Module
//!
//! Step observers that report on a protocol run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts
//! - [`ChannelObserver`]: Streams [`StepEvent`]s to another thread

pub mod events;
pub mod timeline;

pub use events::{ChannelObserver, StepEvent};
pub use timeline::{step_key, EventType, ExecutionTimeline, TimelineEvent};
