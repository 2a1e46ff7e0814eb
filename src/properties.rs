use std::path::Path;

use anyhow::Context;
use serde::Serialize;

pub const PROPERTIES_FILE: &str = "server.properties";

/// The subset of `server.properties` the agent cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProperties {
    pub server_port: u16,
    pub level_name: String,
    pub motd: String,
    pub max_players: u32,
    pub online_mode: bool,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            server_port: 25565,
            level_name: "world".to_string(),
            motd: String::new(),
            max_players: 20,
            online_mode: true,
        }
    }
}

impl ServerProperties {
    pub fn parse(content: &str) -> Self {
        let mut props = Self::default();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "server-port" => {
                    if let Ok(port) = value.parse::<u16>() {
                        props.server_port = port;
                    }
                }
                "level-name" if !value.is_empty() => props.level_name = value.to_string(),
                "motd" => props.motd = value.replace("\\u00A7", "§").replace("\\u00a7", "§"),
                "max-players" => {
                    if let Ok(max) = value.parse::<u32>() {
                        props.max_players = max;
                    }
                }
                "online-mode" => props.online_mode = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        props
    }

    pub async fn load(server_root: &Path) -> anyhow::Result<Self> {
        let path = server_root.join(PROPERTIES_FILE);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::parse(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relevant_keys_and_ignores_the_rest() {
        let props = ServerProperties::parse(
            "#Minecraft server properties\n\
             server-port=25570\n\
             level-name=survival\n\
             motd=\\u00A76Gold Server\n\
             max-players=8\n\
             online-mode=false\n\
             pvp=true\n",
        );
        assert_eq!(props.server_port, 25570);
        assert_eq!(props.level_name, "survival");
        assert_eq!(props.motd, "§6Gold Server");
        assert_eq!(props.max_players, 8);
        assert!(!props.online_mode);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let props = ServerProperties::parse("server-port=abc\nlevel-name=\nmax-players=-1\n");
        assert_eq!(props, ServerProperties::default());
    }
}
