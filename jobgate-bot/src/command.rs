//! Command parsing.

/// A command the bot understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Stats,
    /// `/unit <id>`; `None` when the argument is missing or not a number.
    Unit(Option<i64>),
    Unknown(String),
}

impl Command {
    /// Parse a message text. Returns `None` for text that is not a command.
    ///
    /// Telegram may send `/cmd@botname arg`, so the bot suffix is ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }

        let mut parts = text.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default().trim();

        let name = first
            .trim_start_matches('/')
            .split('@')
            .next()
            .unwrap_or_default()
            .to_lowercase();

        Some(match name.as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "stats" => Self::Stats,
            "unit" => Self::Unit(rest.trim_start_matches('#').parse().ok()),
            _ => Self::Unknown(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("  /HELP "), Some(Command::Help));
        assert_eq!(Command::parse("/stats@jobgate_bot"), Some(Command::Stats));
        assert_eq!(Command::parse("/unit 42"), Some(Command::Unit(Some(42))));
        assert_eq!(Command::parse("/unit #7"), Some(Command::Unit(Some(7))));
    }

    #[test]
    fn bad_arguments_and_unknown_commands() {
        assert_eq!(Command::parse("/unit"), Some(Command::Unit(None)));
        assert_eq!(Command::parse("/unit abc"), Some(Command::Unit(None)));
        assert_eq!(
            Command::parse("/deploy now"),
            Some(Command::Unknown("deploy".to_string()))
        );
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse(""), None);
    }
}
