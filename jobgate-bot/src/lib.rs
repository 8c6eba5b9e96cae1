//! Telegram bot for a jobgate deployment.
//!
//! The bot reads the shared store through the same schema gate as every other
//! process. Replies are built by the pure functions in [`render`], so they can
//! be tested without Telegram.

pub mod command;
pub mod render;
mod router;

pub use command::Command;
pub use router::{run_polling, BotState};
