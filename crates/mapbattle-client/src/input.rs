use mapbattle_common::model::CountryCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    // Global
    Quit,
    Help,
    Status,

    // Lobby
    Create,
    Join(String),
    Leave,
    Ready(bool),
    Start(Option<CountryCode>),

    // Game
    Guess(CountryCode),
    Timeout,
    Surrender,
}

pub const HELP: &str = "\
commands:
  create              create a room and print its join code
  join <code>         join a room by code
  ready | unready     toggle readiness in the lobby
  start [country]     host only: start the game
  guess <country>     answer the current question (g <country>)
  timeout             give up on the current question
  surrender           leave the race, keeping your seat
  status              show the room
  leave               leave the room
  quit                leave and exit";

pub fn parse_command(line: &str) -> Result<Action, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Err("empty command".into());
    };
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments for '{}'", command));
    }

    let action = match (command.to_ascii_lowercase().as_str(), arg) {
        ("quit" | "exit" | "q", None) => Action::Quit,
        ("help" | "?", None) => Action::Help,
        ("status" | "s", None) => Action::Status,

        ("create", None) => Action::Create,
        ("join" | "j", Some(code)) => Action::Join(code.to_string()),
        ("join" | "j", None) => return Err("usage: join <code>".into()),
        ("leave", None) => Action::Leave,
        ("ready", None) => Action::Ready(true),
        ("unready", None) => Action::Ready(false),
        ("start", country) => Action::Start(country.map(country_code).transpose()?),

        ("guess" | "g", Some(country)) => Action::Guess(country_code(country)?),
        ("guess" | "g", None) => return Err("usage: guess <country>".into()),
        ("timeout", None) => Action::Timeout,
        ("surrender", None) => Action::Surrender,

        (other, Some(_)) if is_known(other) => {
            return Err(format!("'{}' takes no argument", other))
        }
        (other, _) => return Err(format!("unknown command '{}' (try 'help')", other)),
    };
    Ok(action)
}

fn is_known(command: &str) -> bool {
    matches!(
        command,
        "quit" | "exit" | "q" | "help" | "?" | "status" | "s" | "create" | "leave" | "ready"
            | "unready" | "timeout" | "surrender"
    )
}

/// Country codes are three ASCII letters.
fn country_code(raw: &str) -> Result<CountryCode, String> {
    if raw.len() == 3 && raw.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(CountryCode::new(raw))
    } else {
        Err(format!("'{}' is not a country code", raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lobby_commands() {
        assert_eq!(parse_command("create"), Ok(Action::Create));
        assert_eq!(parse_command("  join abc123 "), Ok(Action::Join("abc123".into())));
        assert_eq!(parse_command("ready"), Ok(Action::Ready(true)));
        assert_eq!(parse_command("unready"), Ok(Action::Ready(false)));
        assert_eq!(parse_command("start"), Ok(Action::Start(None)));
        assert_eq!(parse_command("START fra"), Ok(Action::Start(Some(CountryCode::new("FRA")))));
    }

    #[test]
    fn test_game_commands() {
        assert_eq!(parse_command("g ita"), Ok(Action::Guess(CountryCode::new("ITA"))));
        assert_eq!(parse_command("guess Deu"), Ok(Action::Guess(CountryCode::new("DEU"))));
        assert_eq!(parse_command("timeout"), Ok(Action::Timeout));
        assert_eq!(parse_command("surrender"), Ok(Action::Surrender));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_command("").is_err());
        assert!(parse_command("join").is_err());
        assert!(parse_command("guess").is_err());
        assert!(parse_command("guess france").is_err());
        assert!(parse_command("guess F1").is_err());
        assert!(parse_command("guess de").is_err());
        assert!(parse_command("ready now").unwrap_err().contains("takes no argument"));
        assert!(parse_command("dance").unwrap_err().contains("unknown command"));
        assert!(parse_command("join a b").unwrap_err().contains("too many"));
    }
}
