//! Delivery of one composed message to the destination chat.
//!
//! A message fans out into up to three kinds of sub-items: inline image
//! uploads, the summary text and one document per attachment. Sub-items are
//! delivered independently; a failed upload is logged, reported to the chat
//! and never blocks the remaining items. The caller decides what to do with
//! the aggregate [`DeliveryReport`].

use crate::config::TelegramConfig;
use crate::telegram::{ChatTransport, escape_markdown};
use crate::{DeliveryFailure, DeliveryReport, OutboundMessage, RenderMode};
use regex::{Captures, Regex};
use std::sync::LazyLock;

const PICTOGRAPH: char = '\u{1F5BC}';

/// External image references the sanitizer turned into link tokens.
static IMG_LINK_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{img-link:([^|}]*)\|([^}]*)\}").expect("hardcoded regex"));

pub struct Dispatcher<T: ChatTransport> {
    transport: T,
    config: TelegramConfig,
}

impl<T: ChatTransport> Dispatcher<T> {
    pub fn new(transport: T, config: TelegramConfig) -> Self {
        Self { transport, config }
    }

    /// Log the resolved destination chat once, at startup.
    pub async fn announce_destination(&self) {
        match self.transport.destination_name().await {
            Some(name) => tracing::info!(
                chat_id = self.config.forward_to_chat_id,
                chat = %name,
                "forwarding to chat"
            ),
            None => tracing::info!(
                chat_id = self.config.forward_to_chat_id,
                "forwarding to chat"
            ),
        }
    }

    /// Deliver one composed message. Successfully uploaded inline images get
    /// their `remote_file_id` filled in on `message`.
    pub async fn deliver(&self, message: &mut OutboundMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mode = message.render_mode;

        // The summary is skipped only when content forwarding is off AND
        // attachments go out on their own.
        if self.config.forward_mail_content || !self.config.forward_attachment {
            let mut text = message.text.clone();

            for (position, image) in message.images.iter_mut().enumerate() {
                let mut title = image.title().to_string();

                if self.config.forward_embedded_images {
                    let caption = format!("{}. {}: {}", position + 1, message.subject, title);
                    match self.transport.send_image(image, &caption, mode).await {
                        Ok(file_id) => {
                            if !file_id.is_empty() {
                                image.remote_file_id = Some(file_id);
                            }
                            // The placeholder echoes the upload caption so
                            // readers can match text to picture.
                            title = caption;
                            report.delivered += 1;
                        }
                        Err(error) => {
                            let item = format!("inline image '{}'", image.title());
                            self.record_failure(&mut report, item, message.mail_uid, &error)
                                .await;
                        }
                    }
                }

                if let Some(cid) = image.content_id.as_deref() {
                    text = text
                        .replace(&format!("${{file:{cid}}}"), &format!("{PICTOGRAPH} {title}"));
                }
            }

            text = resolve_image_links(&text, mode);

            match self.transport.send_text(&text, mode).await {
                Ok(()) => {
                    tracing::info!(
                        uid = message.mail_uid,
                        subject = %message.subject,
                        "mail summary sent"
                    );
                    report.delivered += 1;
                }
                Err(error) => {
                    self.record_failure(&mut report, "summary text".to_string(), message.mail_uid, &error)
                        .await;
                }
            }
        }

        if self.config.forward_attachment {
            for attachment in &message.attachments {
                let caption = match mode {
                    RenderMode::RestrictedHtml => {
                        format!("<b>{}</b>:\n{}", message.subject, attachment.name)
                    }
                    RenderMode::PlainEscaped => format!(
                        "*{}*:\n{}",
                        message.subject,
                        escape_markdown(&attachment.name, self.config.markdown_version)
                    ),
                };

                match self.transport.send_document(attachment, &caption, mode).await {
                    Ok(()) => {
                        tracing::info!(
                            uid = message.mail_uid,
                            name = %attachment.name,
                            "attachment sent"
                        );
                        report.delivered += 1;
                    }
                    Err(error) => {
                        let item = format!("attachment '{}'", attachment.name);
                        self.record_failure(&mut report, item, message.mail_uid, &error)
                            .await;
                    }
                }
            }
        }

        report
    }

    /// Log the failure, push it onto the report and try to tell the chat.
    /// The notice itself is best-effort; a second failure is only logged.
    async fn record_failure(
        &self,
        report: &mut DeliveryReport,
        item: String,
        uid: u32,
        error: &anyhow::Error,
    ) {
        tracing::error!(uid, item = %item, %error, "delivery failed");

        let notice = format!(
            "\u{274C} Failed to send Telegram message (UID: {uid}) to '{}': {error:#}",
            self.config.forward_to_chat_id
        );
        let escaped = escape_markdown(&notice, self.config.markdown_version);
        if let Err(notice_error) = self
            .transport
            .send_text(&escaped, RenderMode::PlainEscaped)
            .await
        {
            tracing::debug!(%notice_error, "error notice could not be delivered");
        }

        let reason = error.to_string();
        report.failures.push(DeliveryFailure {
            item: item.clone(),
            error: crate::Error::Delivery { item, reason },
        });
    }
}

/// Turn `${img-link:url|alt}` tokens into a clickable pictograph (HTML) or
/// a pictograph with the URL in parentheses (plain).
fn resolve_image_links(text: &str, mode: RenderMode) -> String {
    IMG_LINK_TOKEN
        .replace_all(text, |caps: &Captures<'_>| {
            let url = &caps[1];
            let alt = &caps[2];
            match mode {
                RenderMode::RestrictedHtml => {
                    format!(r#"<a href="{url}">{PICTOGRAPH} {alt}</a>"#)
                }
                RenderMode::PlainEscaped => format!("{PICTOGRAPH} {alt} ({url})"),
            }
        })
        .into_owned()
}
