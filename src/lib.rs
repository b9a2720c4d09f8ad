pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod job;
pub mod monitor;
pub mod relay;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{RelayError, Result};
