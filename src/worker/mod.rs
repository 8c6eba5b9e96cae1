//! Worker process: handlers and the claim loop.

pub mod handler;
pub mod runner;

pub use handler::{ErasedHandler, Handler, HandlerError, HandlerWrapper, UnitContext};
pub use runner::{Worker, WorkerBuilder, WorkerError};
