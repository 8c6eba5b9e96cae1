//! Polling loop and message dispatch.

use std::sync::Arc;
use std::time::Duration;

use jobgate::config::BotSettings;
use jobgate::{SqliteWorkStore, UnitId, WorkStore};
use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::render;

/// Shared state for message handlers.
pub struct BotState {
    pub store: SqliteWorkStore,
    /// Telegram user ids allowed to talk to the bot. Empty allows everyone.
    pub allowed_users: Vec<i64>,
}

impl BotState {
    pub fn is_allowed(&self, user_id: Option<i64>) -> bool {
        if self.allowed_users.is_empty() {
            return true;
        }
        user_id.is_some_and(|id| self.allowed_users.contains(&id))
    }

    /// Reply for a parsed command.
    pub async fn reply(&self, command: Command) -> String {
        match command {
            Command::Start => render::welcome(),
            Command::Help => render::help(),
            Command::Unknown(name) => render::unknown(&name),
            Command::Unit(None) => render::unit_usage(),
            Command::Stats => match self.store.stats().await {
                Ok(counts) => render::stats(&counts),
                Err(e) => {
                    tracing::warn!(error = %e, "stats lookup failed");
                    render::store_unavailable()
                }
            },
            Command::Unit(Some(id)) => self.unit_reply(id).await,
        }
    }

    async fn unit_reply(&self, id: i64) -> String {
        let unit = match self.store.get(UnitId(id)).await {
            Ok(Some(unit)) => unit,
            Ok(None) => return render::not_found(id),
            Err(e) => {
                tracing::warn!(unit_id = id, error = %e, "unit lookup failed");
                return render::store_unavailable();
            }
        };
        match self.store.attempts(unit.id).await {
            Ok(attempts) => render::unit(&unit, &attempts),
            Err(e) => {
                tracing::warn!(unit_id = id, error = %e, "attempt lookup failed");
                render::unit(&unit, &[])
            }
        }
    }
}

/// Long-poll Telegram until `shutdown` is cancelled.
pub async fn run_polling(
    settings: &BotSettings,
    store: SqliteWorkStore,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let token = settings
        .token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("BOT_TOKEN is required to run the bot"))?;
    let bot = Bot::new(token);

    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "bot started"),
        Err(e) => return Err(anyhow::anyhow!("telegram rejected the bot token: {e}")),
    }
    tracing::info!(allowed_users = settings.allowed_users.len(), "bot allowlist loaded");

    let state = Arc::new(BotState {
        store,
        allowed_users: settings.allowed_users.clone(),
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build();

    let stopper = dispatcher.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        // The dispatcher may not be running yet; retry until it is.
        loop {
            match stopper.shutdown() {
                Ok(done) => {
                    done.await;
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    });

    dispatcher.dispatch().await;
    tracing::info!("bot stopped");
    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(command) = msg.text().and_then(Command::parse) else {
        return Ok(());
    };

    let user_id = msg.from().map(|u| u.id.0 as i64);
    let reply = if state.is_allowed(user_id) {
        tracing::debug!(chat_id = msg.chat.id.0, ?command, "command received");
        state.reply(command).await
    } else {
        tracing::warn!(chat_id = msg.chat.id.0, ?user_id, "rejected user outside allowlist");
        render::not_allowed()
    };

    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}
