use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Account option that lets messages queue while the account is offline.
pub const OFFLINE_MESSAGES: &str = "offline-messages";

/// Static accounts and channels served for the lifetime of the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

impl DirectoryConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse directory config")
    }
}

impl AccountConfig {
    pub fn new(name: &str, password: &str) -> Self {
        Self {
            name: name.to_string(),
            password: password.to_string(),
            permissions: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, option: &str) -> Self {
        self.options.push(option.to_string());
        self
    }
}

impl ChannelConfig {
    pub fn new(name: &str, members: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            members: members.iter().map(|member| member.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let config = DirectoryConfig::from_json(
            r#"{
                "accounts": [
                    {"name": "alice", "password": "pw", "permissions": ["kill"], "options": ["offline-messages"]},
                    {"name": "bob", "password": "hunter2"}
                ],
                "channels": [{"name": "general", "members": ["alice", "bob"]}]
            }"#,
        )
        .expect("valid config");

        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].permissions, vec!["kill".to_string()]);
        assert_eq!(config.accounts[0].options, vec![OFFLINE_MESSAGES.to_string()]);
        assert!(config.accounts[1].options.is_empty());
        assert_eq!(config.channels[0], ChannelConfig::new("general", &["alice", "bob"]));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let config = DirectoryConfig::from_json("{}").expect("valid config");
        assert_eq!(config, DirectoryConfig::default());
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = DirectoryConfig::from_json(r#"{"guilds": []}"#);
        assert!(result.is_err());
    }
}
