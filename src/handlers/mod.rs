//! Handlers shipped with the worker process.

pub mod retention;
pub mod webhook;

pub use retention::{PurgeHandler, PurgeReport, PurgeRequest};
pub use webhook::{WebhookDelivery, WebhookHandler, WebhookRequest};
