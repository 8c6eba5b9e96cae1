//! Reply text for each command.

use chrono::{DateTime, Utc};
use jobgate::queue::{AttemptRecord, StateCounts};
use jobgate::WorkUnit;

const MAX_ERROR_CHARS: usize = 300;

pub fn welcome() -> String {
    format!("jobgate bot is running.\n\n{}", help())
}

pub fn help() -> String {
    [
        "Commands:",
        "/stats - unit counts per state",
        "/unit <id> - details and attempts of one unit",
        "/help - this message",
    ]
    .join("\n")
}

pub fn unknown(command: &str) -> String {
    format!("Unknown command /{command}. Send /help for the list.")
}

pub fn unit_usage() -> String {
    "Usage: /unit <id>".to_string()
}

pub fn not_allowed() -> String {
    "You are not allowed to use this bot.".to_string()
}

pub fn store_unavailable() -> String {
    "The store is unavailable right now. Try again shortly.".to_string()
}

pub fn not_found(id: i64) -> String {
    format!("Unit {id} not found.")
}

pub fn stats(counts: &StateCounts) -> String {
    format!(
        "Units: {total}\npending: {pending}\nclaimed: {claimed}\ncompleted: {completed}\nfailed: {failed}",
        total = counts.total(),
        pending = counts.pending,
        claimed = counts.claimed,
        completed = counts.completed,
        failed = counts.failed_terminal,
    )
}

/// Unit summary followed by its attempts, oldest first.
pub fn unit(unit: &WorkUnit, attempts: &[AttemptRecord]) -> String {
    let mut lines = vec![
        format!("Unit {} ({})", unit.id, unit.kind),
        format!("state: {}", unit.state),
        format!("attempts: {}/{}", unit.attempts, unit.max_attempts),
        format!("created: {}", timestamp(&unit.created_at)),
    ];

    if let Some(worker) = &unit.claimed_by {
        let until = unit
            .lease_expires_at
            .as_ref()
            .map(timestamp)
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!("claimed by: {worker} until {until}"));
    }
    if unit.available_at > unit.updated_at && unit.state.is_outstanding() {
        lines.push(format!("next try: {}", timestamp(&unit.available_at)));
    }
    if let Some(done) = &unit.completed_at {
        lines.push(format!("completed: {}", timestamp(done)));
    }
    if let Some(error) = &unit.last_error {
        lines.push(format!("last error: {}", truncate(error)));
    }

    if !attempts.is_empty() {
        lines.push(String::new());
        lines.push("Attempts:".to_string());
        for a in attempts {
            let outcome = a.outcome.map(|o| o.as_str()).unwrap_or("running");
            let mut line = format!("#{} {} on {}", a.attempt, outcome, a.worker_id);
            if let Some(error) = &a.error {
                line.push_str(&format!(": {}", truncate(error)));
            }
            lines.push(line);
        }
    }

    lines.join("\n")
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_ERROR_CHARS).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_errors_on_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_CHARS + 10);
        let out = truncate(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), MAX_ERROR_CHARS + 3);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn help_lists_every_command() {
        let text = help();
        for cmd in ["/stats", "/unit", "/help"] {
            assert!(text.contains(cmd));
        }
        assert!(welcome().contains("/stats"));
    }
}
