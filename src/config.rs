//! Immutable runtime configuration, loaded once at startup from a TOML file.
//!
//! No component mutates configuration after load; the only latched runtime
//! flags (backfill bookkeeping) live on [`crate::cursor::MailboxCursor`].

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Default incremental search: UIDs above the cursor that are still unseen.
pub const DEFAULT_SEARCH: &str = "(UID ${lastUID}:* UNSEEN)";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mail: MailConfig,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Seconds between poll cycles.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    /// Re-poll immediately instead of sleeping between cycles.
    #[serde(default)]
    pub push_mode: bool,
    /// Log out after every poll instead of keeping the session open.
    #[serde(default)]
    pub disconnect_after_poll: bool,
    #[serde(default = "default_folder")]
    pub folder: String,
    /// UID search template; `${lastUID}` is substituted with the cursor floor.
    #[serde(default = "default_search")]
    pub search: String,
    /// Store `\Seen` on messages after a successful fetch.
    #[serde(default)]
    pub mark_as_read: bool,
    /// Character budget for the forwarded body text.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Process pre-existing mail once before switching to incremental mode.
    #[serde(default)]
    pub read_old_mails: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub forward_to_chat_id: i64,
    #[serde(default = "default_true")]
    pub prefer_html: bool,
    /// Markdown dialect for plain-escaped messages: 1 or 2.
    #[serde(default = "default_markdown_version")]
    pub markdown_version: u8,
    #[serde(default = "default_true")]
    pub forward_mail_content: bool,
    #[serde(default = "default_true")]
    pub forward_attachment: bool,
    #[serde(default = "default_true")]
    pub forward_embedded_images: bool,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|error| Error::Config(format!("cannot read '{}': {error}", path.display())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|error| Error::Config(format!("cannot parse '{}': {error}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mail.server.trim().is_empty() {
            return Err(Error::Config("mail.server must not be empty".into()));
        }
        if self.telegram.bot_token.trim().is_empty() {
            return Err(Error::Config("telegram.bot_token must not be empty".into()));
        }
        if !matches!(self.telegram.markdown_version, 1 | 2) {
            return Err(Error::Config(format!(
                "telegram.markdown_version must be 1 or 2, got {}",
                self.telegram.markdown_version
            )));
        }
        if self.mail.max_length == 0 {
            return Err(Error::Config("mail.max_length must be positive".into()));
        }
        Ok(())
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_refresh_secs() -> u64 {
    10
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_search() -> String {
    DEFAULT_SEARCH.to_string()
}

fn default_max_length() -> usize {
    2000
}

fn default_markdown_version() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn parse(raw: &str) -> Config {
        toml::from_str(raw).expect("config parses")
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(indoc! {r#"
            [mail]
            server = "imap.example.com"
            user = "bot@example.com"
            password = "hunter2"

            [telegram]
            bot_token = "123:abc"
            forward_to_chat_id = -1000123
        "#});

        assert_eq!(config.mail.port, 993);
        assert_eq!(config.mail.folder, "INBOX");
        assert_eq!(config.mail.search, DEFAULT_SEARCH);
        assert_eq!(config.mail.max_length, 2000);
        assert!(!config.mail.read_old_mails);
        assert!(config.telegram.prefer_html);
        assert_eq!(config.telegram.markdown_version, 2);
        assert!(config.telegram.forward_embedded_images);
    }

    #[test]
    fn invalid_markdown_version_is_rejected() {
        let config = parse(indoc! {r#"
            [mail]
            server = "imap.example.com"
            user = "bot@example.com"
            password = "hunter2"

            [telegram]
            bot_token = "123:abc"
            forward_to_chat_id = 7
            markdown_version = 3
        "#});

        assert!(config.validate().is_err());
    }
}
