use std::str::FromStr;

use crate::error::CommandError;
use crate::server_config::ConfigPatch;

/// A free-text command received on a server's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    Start,
    Stop,
    Restart,
    Pause,
    DeleteWorld,
    Console(String),
    GetMessages,
    Set(ConfigPatch),
}

impl FromStr for ServerCommand {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let (verb, rest) = match input.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (input, ""),
        };
        match verb {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "pause" => Ok(Self::Pause),
            "deleteWorld" => Ok(Self::DeleteWorld),
            "getMessages" => Ok(Self::GetMessages),
            "command" if rest.is_empty() => Err(CommandError::MissingArgument("command")),
            "command" => Ok(Self::Console(rest.to_string())),
            "set" if rest.is_empty() => Err(CommandError::MissingArgument("set")),
            "set" => Ok(Self::Set(serde_json::from_str(rest)?)),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_config::IdlePolicy;

    #[test]
    fn parses_lifecycle_verbs() {
        assert_eq!("start".parse::<ServerCommand>().unwrap(), ServerCommand::Start);
        assert_eq!("deleteWorld".parse::<ServerCommand>().unwrap(), ServerCommand::DeleteWorld);
        assert_eq!(" pause ".parse::<ServerCommand>().unwrap(), ServerCommand::Pause);
    }

    #[test]
    fn console_command_keeps_its_spaces() {
        assert_eq!(
            "command say hello  world".parse::<ServerCommand>().unwrap(),
            ServerCommand::Console("say hello  world".to_string())
        );
    }

    #[test]
    fn set_carries_a_patch() {
        let command: ServerCommand =
            r#"set {"autostart": true, "pauseOnIdle": {"enabled": false, "timeoutSeconds": 60}}"#
                .parse()
                .unwrap();
        let ServerCommand::Set(patch) = command else {
            panic!("expected set");
        };
        assert_eq!(patch.autostart, Some(true));
        assert_eq!(
            patch.pause_on_idle,
            Some(IdlePolicy {
                enabled: false,
                timeout_seconds: 60
            })
        );
    }

    #[test]
    fn rejects_unknown_and_incomplete_commands() {
        assert!(matches!("launch".parse::<ServerCommand>(), Err(CommandError::Unknown(_))));
        assert!(matches!("command".parse::<ServerCommand>(), Err(CommandError::MissingArgument(_))));
        assert!(matches!("set {oops".parse::<ServerCommand>(), Err(CommandError::InvalidPatch(_))));
    }
}
