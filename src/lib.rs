//! Tracks remote multi-module scan tasks from creation to a terminal state,
//! over a server-push stream when one is available and adaptive polling
//! otherwise.

pub mod core;
pub mod logging;
pub mod transport;

pub use crate::core::error::TrackerError;
pub use crate::core::events::TrackerEvent;
pub use crate::core::model::{TaskStatus, TaskView};
pub use crate::core::tracker::{Tracker, TrackingSession};
