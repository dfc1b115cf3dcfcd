//! Renders one decoded mail into the outbound summary message.
//!
//! The summary is a `From:`/`Subject:` header, a separator line, the body
//! content trimmed to the configured length budget and an attachment list.
//! Which markup dialect the body uses depends on `prefer_html` and on which
//! bodies the mail actually carries; everything else in the pipeline treats
//! the result as opaque text plus upload lists.

use crate::config::Config;
use crate::sanitize;
use crate::telegram::escape_markdown;
use crate::{Attachment, DecodedMail, OutboundMessage, RenderMode};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// `[cid:...]` markers some clients leave in the plain-text body.
static CID_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\[cid:([^\]]*)\]").expect("hardcoded regex"));
/// Placeholder tokens that must survive markdown escaping untouched.
static PLACEHOLDER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(?:file|img-link):[^}]*\}").expect("hardcoded regex"));
/// Runs of blank lines; at most one empty line is kept.
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\s*\r?\n){2,}").expect("hardcoded regex"));
/// Closing anchors, optionally followed by an escaped `>` mail-address
/// marker. Spacing after them keeps link lists tappable on touch screens.
static ANCHOR_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(</a>(\s*&gt;)?)\s*").expect("hardcoded regex"));
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("hardcoded regex"));

/// Build the outbound message for one mail. Infallible: a mail with no
/// usable body still yields a header-only summary.
pub fn compose(mail: &DecodedMail, config: &Config) -> OutboundMessage {
    let tg = &config.telegram;
    let mut images = mail.inline_images.clone();
    let mut render_mode = RenderMode::PlainEscaped;
    let mut content = String::new();

    if tg.forward_mail_content {
        let plain = mail.plain_body.as_deref().map(|text| {
            // Empty bracket pairs are leftovers from stripped link markup.
            let cleaned = text.replace("()", "").replace("[]", "").trim().to_string();
            if tg.forward_embedded_images {
                rewrite_inline_markers(&cleaned, &images)
            } else {
                cleaned
            }
        });

        match (tg.prefer_html, &mail.html_body, plain) {
            (true, Some(html), _) | (false, Some(html), None) => {
                render_mode = RenderMode::RestrictedHtml;
                let sanitized = sanitize::sanitize(html, &images);
                for (cid, alt) in &sanitized.image_alts {
                    if let Some(image) = images
                        .iter_mut()
                        .find(|image| image.content_id.as_deref() == Some(cid.as_str()))
                        && image.alt.is_none()
                    {
                        image.alt = Some(alt.clone());
                    }
                }
                content = sanitized.text;
            }
            (_, _, Some(plain)) => {
                content = escape_markdown_keeping_tokens(&plain, tg.markdown_version);
            }
            _ => {}
        }
    }

    if !content.is_empty() {
        content = BLANK_LINES.replace_all(&content, "\n\n").into_owned();
        if render_mode == RenderMode::RestrictedHtml {
            content = ANCHOR_END.replace_all(&content, "${1}\n\n").into_owned();
        }
        content = content.trim().to_string();
        content = enforce_length_budget(content, render_mode, config.mail.max_length);
    }

    let attachment_summary = attachment_summary(&mail.attachments, render_mode, tg.markdown_version);

    let separator = if tg.forward_mail_content {
        "\n=============================\n"
    } else {
        "\n"
    };

    let (subject, text) = match render_mode {
        RenderMode::RestrictedHtml => {
            let from = sanitize::escape_text(&mail.from);
            let subject = sanitize::escape_text(&mail.subject);
            let text = format!(
                "<b>From:</b> {from}\n<b>Subject:</b> {subject}{separator}{content} {attachment_summary}"
            );
            (subject, text)
        }
        RenderMode::PlainEscaped => {
            let from = escape_markdown(&mail.from, tg.markdown_version);
            let subject = escape_markdown(&mail.subject, tg.markdown_version);
            let separator = escape_markdown(separator, tg.markdown_version);
            let text = format!(
                "*From:* {from}\n*Subject:* {subject}{separator}{content} {attachment_summary}"
            );
            (subject, text)
        }
    };

    OutboundMessage {
        mail_uid: mail.uid,
        render_mode,
        subject,
        text,
        images,
        attachments: mail.attachments.clone(),
    }
}

/// Replace `[cid:...]` markers whose content-id matches a decoded inline
/// image with the upload placeholder. Unknown markers stay as written.
fn rewrite_inline_markers(text: &str, images: &[Attachment]) -> String {
    CID_MARKER
        .replace_all(text, |caps: &Captures<'_>| {
            let cid = caps[1].trim();
            if images
                .iter()
                .any(|image| image.content_id.as_deref() == Some(cid))
            {
                format!("${{file:{cid}}}")
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Escape markdown significant characters while leaving `${file:...}` and
/// `${img-link:...}` tokens intact for the dispatcher to resolve.
fn escape_markdown_keeping_tokens(text: &str, version: u8) -> String {
    let mut escaped = String::with_capacity(text.len());
    let mut last = 0;
    for token in PLACEHOLDER_TOKEN.find_iter(text) {
        escaped.push_str(&escape_markdown(&text[last..token.start()], version));
        escaped.push_str(token.as_str());
        last = token.end();
    }
    escaped.push_str(&escape_markdown(&text[last..], version));
    escaped
}

/// Truncate the content to the character budget and append a marker naming
/// the effective budget. HTML content gets a larger budget in proportion to
/// its markup overhead so the visible text is not punished for the tags.
fn enforce_length_budget(mut content: String, render_mode: RenderMode, max_length: usize) -> String {
    let mut max_len = max_length;
    let content_len = content.chars().count();

    if render_mode == RenderMode::RestrictedHtml && content_len > 0 {
        let stripped_len = HTML_TAG.replace_all(&content, "").chars().count();
        let plain_factor = stripped_len as f64 / content_len as f64 + 1.0;
        max_len = (max_length as f64 * plain_factor) as usize;
    }

    if content_len > max_len {
        content = content.chars().take(max_len).collect();
        match render_mode {
            RenderMode::RestrictedHtml => {
                // The cut may land inside a tag; drop the incomplete tail.
                if let Some(open) = content.rfind('<')
                    && !content[open..].contains('>')
                {
                    content.truncate(open);
                }
            }
            RenderMode::PlainEscaped => {
                // The cut may land between an escape backslash and its char.
                while content.ends_with('\\') {
                    content.pop();
                }
            }
        }
        content.push_str(&format!("... (first {max_len} characters)"));
    }

    content
}

fn attachment_summary(
    attachments: &[Attachment],
    render_mode: RenderMode,
    markdown_version: u8,
) -> String {
    if attachments.is_empty() {
        return String::new();
    }

    let count = attachments.len();
    let mut summary = match render_mode {
        RenderMode::RestrictedHtml => format!("\n\n\u{2795} <b>{count} attachments:</b>\n"),
        RenderMode::PlainEscaped => format!("\n\n\u{2795} *{count} attachments:*\n"),
    };
    for attachment in attachments {
        let name = match render_mode {
            RenderMode::RestrictedHtml => attachment.name.clone(),
            RenderMode::PlainEscaped => escape_markdown(&attachment.name, markdown_version),
        };
        summary.push_str(&format!("\n {}: {}", attachment.index, name));
    }
    summary
}
