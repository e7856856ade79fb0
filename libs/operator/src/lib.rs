pub mod controller;
pub mod crd;
pub mod echo;
pub mod error;
pub mod fsm;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod resource;
pub mod telemetry;

pub use error::{Error, Result};
