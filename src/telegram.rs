//! Telegram transport: the thin seam between the dispatcher and the bot API.
//!
//! The [`ChatTransport`] trait exists so delivery logic can be tested against
//! an in-memory fake; [`TelegramTransport`] is the only production
//! implementation and maps straight onto teloxide requests.

use crate::config::TelegramConfig;
use crate::{Attachment, RenderMode};
use anyhow::Context as _;
use async_trait::async_trait;
use teloxide::Bot;
use teloxide::payloads::setters::*;
use teloxide::requests::{Request, Requester};
use teloxide::types::{ChatId, InputFile, ParseMode};

/// Everything the dispatcher needs from a chat backend.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Human-readable name of the destination chat, for startup logging.
    async fn destination_name(&self) -> Option<String>;

    async fn send_text(&self, text: &str, mode: RenderMode) -> anyhow::Result<()>;

    /// Upload an image and return the backend's file id for it, so later
    /// references can reuse the upload instead of sending the bytes again.
    async fn send_image(
        &self,
        image: &Attachment,
        caption: &str,
        mode: RenderMode,
    ) -> anyhow::Result<String>;

    async fn send_document(
        &self,
        attachment: &Attachment,
        caption: &str,
        mode: RenderMode,
    ) -> anyhow::Result<()>;
}

pub struct TelegramTransport {
    bot: Bot,
    chat_id: ChatId,
    markdown_version: u8,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot: Bot::new(config.bot_token.clone()),
            chat_id: ChatId(config.forward_to_chat_id),
            markdown_version: config.markdown_version,
        }
    }

    fn parse_mode(&self, mode: RenderMode) -> ParseMode {
        match mode {
            RenderMode::RestrictedHtml => ParseMode::Html,
            RenderMode::PlainEscaped if self.markdown_version == 1 => ParseMode::Markdown,
            RenderMode::PlainEscaped => ParseMode::MarkdownV2,
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn destination_name(&self) -> Option<String> {
        match self.bot.get_chat(self.chat_id).send().await {
            Ok(chat) => chat.title().map(str::to_string),
            Err(error) => {
                tracing::debug!(%error, "cannot resolve destination chat info");
                None
            }
        }
    }

    async fn send_text(&self, text: &str, mode: RenderMode) -> anyhow::Result<()> {
        self.bot
            .send_message(self.chat_id, text)
            .parse_mode(self.parse_mode(mode))
            .send()
            .await
            .context("failed to send telegram message")?;
        Ok(())
    }

    async fn send_image(
        &self,
        image: &Attachment,
        caption: &str,
        mode: RenderMode,
    ) -> anyhow::Result<String> {
        let file_name = if image.name.is_empty() {
            "image".to_string()
        } else {
            image.name.clone()
        };
        let input_file = InputFile::memory(image.payload.clone()).file_name(file_name);

        let sent = self
            .bot
            .send_photo(self.chat_id, input_file)
            .caption(caption)
            .parse_mode(self.parse_mode(mode))
            .send()
            .await
            .context("failed to send telegram photo")?;

        // The largest size carries the canonical file id.
        let file_id = sent
            .photo()
            .and_then(|sizes| sizes.last())
            .map(|size| size.file.id.to_string())
            .unwrap_or_default();
        Ok(file_id)
    }

    async fn send_document(
        &self,
        attachment: &Attachment,
        caption: &str,
        mode: RenderMode,
    ) -> anyhow::Result<()> {
        let file_name = if attachment.name.is_empty() {
            "attachment".to_string()
        } else {
            attachment.name.clone()
        };
        let input_file = InputFile::memory(attachment.payload.clone()).file_name(file_name);

        self.bot
            .send_document(self.chat_id, input_file)
            .caption(caption)
            .parse_mode(self.parse_mode(mode))
            .send()
            .await
            .context("failed to send telegram document")?;
        Ok(())
    }
}

/// Escape every character the given Telegram markdown dialect treats as
/// significant. Version 1 only knows four special characters; version 2
/// reserves most ASCII punctuation.
pub fn escape_markdown(text: &str, version: u8) -> String {
    let specials: &[char] = if version == 1 {
        &['_', '*', '`', '[']
    } else {
        &[
            '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}',
            '.', '!',
        ]
    };

    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        if specials.contains(&character) {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_escapes_reserved_punctuation() {
        assert_eq!(
            escape_markdown("a_b*c[d](e)~f`g>h#i+j-k=l|m{n}o.p!q", 2),
            r"a\_b\*c\[d\]\(e\)\~f\`g\>h\#i\+j\-k\=l\|m\{n\}o\.p\!q"
        );
    }

    #[test]
    fn v2_escapes_backslashes_too() {
        assert_eq!(escape_markdown(r"a\b", 2), r"a\\b");
    }

    #[test]
    fn v1_only_escapes_its_four_specials() {
        assert_eq!(escape_markdown("a_b*c`d[e].f!", 1), r"a\_b\*c\`d\[e].f!");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(escape_markdown("hello world", 2), "hello world");
    }
}
