//! MIME decomposition of a raw fetched message.
//!
//! Walks leaf parts depth-first and classifies each one as plain text, HTML,
//! calendar invite, inline image or generic attachment. Charset handling and
//! RFC 2047 header word reassembly are delegated to `mailparse`, which falls
//! back to utf-8 with replacement when a part declares nothing usable.

use crate::{Attachment, AttachmentKind, DecodedMail, Error};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

/// Decode one raw RFC 822 message into its forwardable pieces.
pub fn decode(uid: u32, raw: &[u8]) -> Result<DecodedMail, Error> {
    let parsed = mailparse::parse_mail(raw).map_err(|error| Error::Parse {
        uid,
        reason: error.to_string(),
    })?;

    let mut walk = PartWalk::default();
    walk.visit(&parsed);

    let from = parsed
        .headers
        .get_first_value("From")
        .unwrap_or_default()
        .trim()
        .to_string();
    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default()
        .trim()
        .to_string();

    Ok(DecodedMail {
        uid,
        from,
        subject,
        plain_body: walk.plain_body,
        html_body: walk.html_body,
        inline_images: walk.inline_images,
        attachments: walk.attachments,
    })
}

/// Accumulates classified leaf parts; `index` is shared between attachments
/// and inline images so captions keep the source ordering.
#[derive(Default)]
struct PartWalk {
    plain_body: Option<String>,
    html_body: Option<String>,
    inline_images: Vec<Attachment>,
    attachments: Vec<Attachment>,
    index: usize,
}

impl PartWalk {
    fn visit(&mut self, part: &ParsedMail<'_>) {
        if !part.subparts.is_empty() {
            // Container parts are never classified themselves.
            for subpart in &part.subparts {
                self.visit(subpart);
            }
            return;
        }

        let mime_type = part.ctype.mimetype.to_ascii_lowercase();

        if mime_type.starts_with("message/") {
            // Nested messages are not recursed into.
            return;
        }

        if mime_type == "text/plain" {
            self.plain_body = decoded_text(part);
            return;
        }

        if mime_type == "text/html" {
            self.html_body = decoded_text(part);
            return;
        }

        if mime_type == "text/calendar" {
            if let Some(payload) = decoded_payload(part) {
                self.index += 1;
                self.attachments.push(Attachment {
                    index: self.index,
                    kind: AttachmentKind::Binary,
                    name: "invite.ics".to_string(),
                    content_id: None,
                    alt: None,
                    payload,
                    remote_file_id: None,
                });
            }
            return;
        }

        if part.ctype.params.contains_key("charset") {
            return;
        }

        let disposition = part.get_content_disposition();
        match disposition.disposition {
            DispositionType::Attachment => {
                let Some(payload) = decoded_payload(part) else {
                    return;
                };
                self.index += 1;
                self.attachments.push(Attachment {
                    index: self.index,
                    kind: AttachmentKind::Binary,
                    name: part_filename(part).unwrap_or_else(|| "attachment".to_string()),
                    content_id: None,
                    alt: None,
                    payload,
                    remote_file_id: None,
                });
            }
            DispositionType::Inline if mime_type.starts_with("image/") => {
                let Some(payload) = decoded_payload(part) else {
                    return;
                };
                let name = part_filename(part).unwrap_or_default();
                let content_id = part
                    .headers
                    .get_first_value("Content-ID")
                    .map(|value| normalize_content_id(&value))
                    .filter(|value| !value.is_empty())
                    .or_else(|| (!name.is_empty()).then(|| name.clone()));

                // Content-ids are unique within one mail; duplicates are dropped.
                if let Some(cid) = &content_id
                    && self
                        .inline_images
                        .iter()
                        .any(|image| image.content_id.as_deref() == Some(cid))
                {
                    tracing::debug!(cid, "duplicate inline image content-id, skipping part");
                    return;
                }

                self.index += 1;
                self.inline_images.push(Attachment {
                    index: self.index,
                    kind: AttachmentKind::Image,
                    name,
                    content_id,
                    alt: None,
                    payload,
                    remote_file_id: None,
                });
            }
            _ => {}
        }
    }
}

fn decoded_text(part: &ParsedMail<'_>) -> Option<String> {
    match part.get_body() {
        Ok(body) => {
            let body = body.trim().to_string();
            (!body.is_empty()).then_some(body)
        }
        Err(error) => {
            tracing::warn!(%error, mime = %part.ctype.mimetype, "cannot decode text part");
            None
        }
    }
}

fn decoded_payload(part: &ParsedMail<'_>) -> Option<Vec<u8>> {
    match part.get_body_raw() {
        Ok(payload) => Some(payload),
        Err(error) => {
            tracing::warn!(%error, mime = %part.ctype.mimetype, "cannot decode part payload");
            None
        }
    }
}

/// Filename from the disposition parameters, falling back to the
/// content-type `name` parameter.
fn part_filename(part: &ParsedMail<'_>) -> Option<String> {
    part.get_content_disposition()
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
        .filter(|name| !name.trim().is_empty())
}

/// Strip the angle brackets mail clients wrap around content-ids.
pub fn normalize_content_id(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}
