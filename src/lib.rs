//! mailgram — watch an IMAP mailbox and forward new mail to a Telegram chat.
//!
//! The pipeline per poll cycle: [`session::SessionManager`] ensures a live
//! IMAP session, [`cursor::MailboxCursor`] builds the incremental search,
//! [`decoder`] decomposes each fetched message, [`compose`] renders it into
//! Telegram-ready text and [`dispatch::Dispatcher`] delivers it one item at a
//! time.

pub mod compose;
pub mod config;
pub mod cursor;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod forwarder;
pub mod sanitize;
pub mod session;
pub mod telegram;

pub use error::{ConnectError, Error, Result};

/// What kind of payload an attachment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Binary,
    Image,
}

/// A decoded MIME part destined for upload: a generic attachment or an
/// inline image referenced from the mail body.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// 1-based position among the message's attachments, preserving source order.
    pub index: usize,
    pub kind: AttachmentKind,
    /// Decoded display name (RFC 2047 words reassembled).
    pub name: String,
    /// Normalized content-id for inline images (angle brackets stripped).
    pub content_id: Option<String>,
    /// Alt/title text harvested from the `<img>` element that referenced this part.
    pub alt: Option<String>,
    pub payload: Vec<u8>,
    /// Transport-assigned file id, populated after a successful upload.
    pub remote_file_id: Option<String>,
}

impl Attachment {
    /// Caption text for this item: alt text wins, then the filename, then
    /// the content-id. Never empty.
    pub fn title(&self) -> &str {
        if let Some(alt) = &self.alt
            && !alt.is_empty()
        {
            return alt;
        }
        if !self.name.is_empty() {
            return &self.name;
        }
        if let Some(cid) = &self.content_id
            && !cid.is_empty()
        {
            return cid;
        }
        "image"
    }
}

/// One fetched mail after MIME decomposition. Immutable once built.
#[derive(Debug, Clone)]
pub struct DecodedMail {
    pub uid: u32,
    pub from: String,
    pub subject: String,
    pub plain_body: Option<String>,
    pub html_body: Option<String>,
    /// Inline images in source order; content-ids are unique within a mail.
    pub inline_images: Vec<Attachment>,
    pub attachments: Vec<Attachment>,
}

/// Which restricted markup dialect the outbound text uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Markdown with every significant character escaped.
    PlainEscaped,
    /// The small HTML subset Telegram accepts.
    RestrictedHtml,
}

/// The composed payload for one mail, consumed by the dispatcher.
/// `render_mode` is `RestrictedHtml` only when an HTML body was selected.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub mail_uid: u32,
    pub render_mode: RenderMode,
    pub subject: String,
    /// Full summary text, possibly containing unresolved placeholder tokens.
    pub text: String,
    pub images: Vec<Attachment>,
    pub attachments: Vec<Attachment>,
}

/// Per-sub-item outcome of delivering one outbound message.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A single failed sub-item; the rest of the message still went out.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub item: String,
    pub error: Error,
}
