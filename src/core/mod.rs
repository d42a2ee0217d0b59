pub mod aggregator;
pub mod error;
pub mod events;
pub mod gate;
pub mod model;
pub mod poller;
pub mod retry;
pub mod tracker;
