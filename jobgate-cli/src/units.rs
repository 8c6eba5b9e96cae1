//! `jobgate units ...`

use anyhow::{bail, Context};
use jobgate::queue::RequeueOutcome;
use jobgate::{gate, Role, Settings, SqliteWorkStore, UnitFilter, UnitId, UnitState, WorkStore};
use serde_json::json;

use crate::cli::UnitsAction;

pub async fn run(action: UnitsAction) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let pool = gate::open(Role::Operator, &settings).await?;
    let store = SqliteWorkStore::new(pool.clone());

    let result = execute(&store, action).await;
    pool.close().await;
    result
}

async fn execute(store: &SqliteWorkStore, action: UnitsAction) -> anyhow::Result<()> {
    match action {
        UnitsAction::Stats => {
            let counts = store.stats().await?;
            for state in UnitState::ALL {
                let n = match state {
                    UnitState::Pending => counts.pending,
                    UnitState::Claimed => counts.claimed,
                    UnitState::Completed => counts.completed,
                    UnitState::FailedTerminal => counts.failed_terminal,
                };
                println!("{:<16}{n}", state.as_str());
            }
            println!("{:<16}{}", "total", counts.total());
        }
        UnitsAction::Show { id } => {
            let id = UnitId(id);
            let unit = store
                .get(id)
                .await?
                .with_context(|| format!("unit {id} not found"))?;
            let attempts = store.attempts(id).await?;
            let out = json!({ "unit": unit, "attempts": attempts });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        UnitsAction::List { state, kind, limit } => {
            let state = state
                .map(|s| s.parse::<UnitState>())
                .transpose()
                .context("unknown state; use pending, claimed, completed or failed_terminal")?;
            let filter = UnitFilter {
                state,
                kind,
                limit: limit.max(1),
            };
            let units = store.list(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&units)?);
        }
        UnitsAction::Requeue { id } => match store.requeue(UnitId(id)).await? {
            RequeueOutcome::Requeued => println!("unit {id} requeued"),
            RequeueOutcome::NotFound => bail!("unit {id} not found"),
            RequeueOutcome::NotFailed(state) => {
                bail!("unit {id} is {state}; only failed units can be requeued")
            }
            RequeueOutcome::DuplicateOutstanding => {
                bail!("another outstanding unit shares the dedupe key of unit {id}")
            }
        },
    }
    Ok(())
}
