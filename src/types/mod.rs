//! Message model for the email dispatcher.
//!
//! This module provides:
//! - Address types with validation
//! - The composed [`Message`] and its attachments
//! - Send result types

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mime::Mime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{MailError, MailErrorKind, MailResult};
use crate::mime::{classify, resolve_content_type};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "EatSmart Assistant").
    pub name: Option<String>,
    /// Email address (e.g., "bot@eatsmart.app").
    pub email: String,
}

impl Address {
    /// Creates a recipient address with just an email.
    pub fn new(email: impl Into<String>) -> MailResult<Self> {
        let email = email.into();
        validate_email(&email, MailErrorKind::InvalidRecipientAddress)?;
        Ok(Self { name: None, email })
    }

    /// Creates a sender address with display name and email.
    pub fn sender(name: impl Into<String>, email: impl Into<String>) -> MailResult<Self> {
        let email = email.into();
        validate_email(&email, MailErrorKind::InvalidFromAddress)?;
        let name = name.into();
        Ok(Self {
            name: (!name.is_empty()).then_some(name),
            email,
        })
    }

    /// Parses a recipient such as `bob@example.com` or `Bob <bob@example.com>`.
    pub fn parse(s: &str) -> MailResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                validate_email(email, MailErrorKind::InvalidRecipientAddress)?;
                return Ok(Self {
                    name: (!name.is_empty()).then(|| name.to_string()),
                    email: email.to_string(),
                });
            }
        }

        Self::new(s)
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Formats the address for MAIL FROM / RCPT TO.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for message headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) if name.contains(['"', ',', ';', ':', '<', '>', '@', '(', ')']) => {
                let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\" <{}>", escaped, self.email)
            }
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

fn validate_email(email: &str, kind: MailErrorKind) -> MailResult<()> {
    let fail = |reason: &str| Err(MailError::invalid_argument(kind, format!("{reason}: {email:?}")));

    if email.is_empty() {
        return fail("Email address cannot be empty");
    }
    if email.len() > 254 {
        return fail("Email address too long (max 254 characters)");
    }
    if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return fail("Email address cannot contain whitespace or control characters");
    }

    let Some((local, domain)) = email.split_once('@') else {
        return fail("Email address must contain exactly one @");
    };
    if domain.contains('@') {
        return fail("Email address must contain exactly one @");
    }
    if local.is_empty() || local.len() > 64 {
        return fail("Local part must be 1-64 characters");
    }
    if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
        return fail("Invalid domain");
    }

    Ok(())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header())
    }
}

impl TryFrom<&str> for Address {
    type Error = MailError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = MailError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// Body text subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodySubtype {
    /// `text/html`.
    #[default]
    Html,
    /// `text/plain`.
    Plain,
}

impl BodySubtype {
    /// Returns the MIME subtype name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BodySubtype::Html => "html",
            BodySubtype::Plain => "plain",
        }
    }
}

impl fmt::Display for BodySubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an attachment is embedded in the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// `image/*` part shown inline, addressable by Content-ID.
    InlineImage,
    /// Any other content, offered for download.
    Binary,
}

/// File content embedded in a message.
///
/// Only constructed by reading an existing file, so every attachment in a
/// [`Message`] refers to bytes that were present at attach time.
#[derive(Debug, Clone)]
pub struct Attachment {
    filename: String,
    source: PathBuf,
    content_type: Mime,
    kind: AttachmentKind,
    data: Vec<u8>,
}

impl Attachment {
    /// Reads `path` and resolves its content type from the extension.
    pub async fn load(filename: impl Into<String>, path: impl AsRef<Path>) -> MailResult<Self> {
        let path = path.as_ref();
        let filename = filename.into();

        let is_file = tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(MailError::new(
                MailErrorKind::AttachmentNotFound,
                format!("Attachment not found: {}", path.display()),
            ));
        }

        let data = tokio::fs::read(path).await.map_err(|e| {
            MailError::new(
                MailErrorKind::AttachmentUnreadable,
                format!("Cannot read attachment {}", path.display()),
            )
            .with_cause(e)
        })?;

        let content_type = resolve_content_type(path);
        let kind = classify(&content_type);
        debug!(
            filename = %filename,
            content_type = %content_type,
            size = data.len(),
            "Loaded attachment"
        );

        Ok(Self {
            filename,
            source: path.to_path_buf(),
            content_type,
            kind,
            data,
        })
    }

    /// Display filename.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Path the content was read from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Resolved content type.
    pub fn content_type(&self) -> &Mime {
        &self.content_type
    }

    /// Part kind.
    pub fn kind(&self) -> AttachmentKind {
        self.kind
    }

    /// Raw content.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Attachment request: display filename plus source path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSpec {
    /// Name shown to recipients.
    pub filename: String,
    /// File to read.
    pub path: PathBuf,
}

impl AttachmentSpec {
    /// Creates a spec with an explicit display filename.
    pub fn new(filename: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
        }
    }

    /// Creates a spec named after the path's final component.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { filename, path }
    }
}

impl<F, P> From<(F, P)> for AttachmentSpec
where
    F: Into<String>,
    P: Into<PathBuf>,
{
    fn from((filename, path): (F, P)) -> Self {
        Self::new(filename, path)
    }
}

/// A composed email ready for transmission.
#[derive(Debug, Clone)]
pub struct Message {
    /// Sender.
    pub from: Address,
    /// Recipients, in order. Duplicates are kept.
    pub to: Vec<Address>,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// Body subtype.
    pub subtype: BodySubtype,
    attachments: Vec<Attachment>,
}

impl Message {
    /// Creates a message without attachments.
    pub fn new(
        from: Address,
        to: Vec<Address>,
        subject: impl Into<String>,
        body: impl Into<String>,
        subtype: BodySubtype,
    ) -> MailResult<Self> {
        if to.is_empty() {
            return Err(MailError::invalid_argument(
                MailErrorKind::NoRecipients,
                "At least one recipient is required",
            ));
        }
        let subject = subject.into();
        if subject.contains(['\r', '\n']) {
            return Err(MailError::invalid_argument(
                MailErrorKind::InvalidHeader,
                "Subject cannot contain line breaks",
            ));
        }

        Ok(Self {
            from,
            to,
            subject,
            body: body.into(),
            subtype,
            attachments: Vec::new(),
        })
    }

    /// Reads `path` and appends it as an attachment named `filename`.
    ///
    /// On error the message is left unchanged.
    pub async fn attach(
        &mut self,
        filename: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> MailResult<&Attachment> {
        let attachment = Attachment::load(filename, path).await?;
        self.attachments.push(attachment);
        Ok(&self.attachments[self.attachments.len() - 1])
    }

    /// Attachments in the order they were added.
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Returns true if the message has attachments.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Result of one transmission.
#[derive(Debug, Clone)]
pub struct SendResult {
    /// Message-ID header value.
    pub message_id: String,
    /// Recipients accepted by the server.
    pub accepted: Vec<Address>,
    /// Recipients refused by the server.
    pub rejected: Vec<RejectedRecipient>,
    /// Final server response text.
    pub response: String,
    /// Time spent in the SMTP session.
    pub duration: Duration,
}

impl SendResult {
    /// Returns true if all recipients were accepted.
    pub fn is_complete_success(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// A recipient that was rejected by the server.
#[derive(Debug, Clone)]
pub struct RejectedRecipient {
    /// The rejected address.
    pub address: Address,
    /// SMTP status code.
    pub code: u16,
    /// Error message from server.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn recipient(email: &str) -> Address {
        Address::new(email).unwrap()
    }

    fn sample_message() -> Message {
        Message::new(
            Address::sender("EatSmart Assistant", "bot@eatsmart.app").unwrap(),
            vec![recipient("a@example.com")],
            "Weekly report",
            "<p>Hi</p>",
            BodySubtype::Html,
        )
        .unwrap()
    }

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("test@example.com").unwrap();
        assert_eq!(addr.email, "test@example.com");
        assert!(addr.name.is_none());

        let addr = Address::parse("Jane Doe <jane@example.com>").unwrap();
        assert_eq!(addr.email, "jane@example.com");
        assert_eq!(addr.name.as_deref(), Some("Jane Doe"));

        let addr = Address::parse("\"Doe, Jane\" <jane@example.com>").unwrap();
        assert_eq!(addr.name.as_deref(), Some("Doe, Jane"));
        assert_eq!(addr.to_header(), "\"Doe, Jane\" <jane@example.com>");
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::new("test.name@sub.example.com").is_ok());

        for bad in ["", "no-at-sign", "two@@signs.com", "@no-local.com", "no-domain@", "a b@c.d"] {
            let err = Address::new(bad).unwrap_err();
            assert_eq!(err.kind(), MailErrorKind::InvalidRecipientAddress, "{bad}");
        }

        let err = Address::sender("Bot", "not-an-address").unwrap_err();
        assert_eq!(err.kind(), MailErrorKind::InvalidFromAddress);
    }

    #[test]
    fn test_sender_header() {
        let from = Address::sender("EatSmart Assistant", "no-reply@eatsmart.local").unwrap();
        assert_eq!(from.to_header(), "EatSmart Assistant <no-reply@eatsmart.local>");

        let bare = Address::sender("", "bot@eatsmart.app").unwrap();
        assert_eq!(bare.to_header(), "bot@eatsmart.app");
    }

    #[test]
    fn test_message_requires_recipients() {
        let from = Address::sender("Bot", "bot@eatsmart.app").unwrap();
        let err = Message::new(from, vec![], "s", "b", BodySubtype::Html).unwrap_err();
        assert_eq!(err.kind(), MailErrorKind::NoRecipients);
    }

    #[test]
    fn test_subject_rejects_line_breaks() {
        let from = Address::sender("Bot", "bot@eatsmart.app").unwrap();
        let err = Message::new(
            from,
            vec![recipient("a@example.com")],
            "hi\r\nBcc: x@example.com",
            "b",
            BodySubtype::Plain,
        )
        .unwrap_err();
        assert_eq!(err.kind(), MailErrorKind::InvalidHeader);
    }

    #[test]
    fn test_attachment_spec_from_path() {
        let spec = AttachmentSpec::from_path("/tmp/reports/photo.jpg");
        assert_eq!(spec.filename, "photo.jpg");
        assert_eq!(spec.path, PathBuf::from("/tmp/reports/photo.jpg"));

        let spec: AttachmentSpec = ("menu.pdf", "/srv/menu-v2.pdf").into();
        assert_eq!(spec, AttachmentSpec::new("menu.pdf", "/srv/menu-v2.pdf"));
    }

    #[tokio::test]
    async fn test_attach_loads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.pdf");
        std::fs::File::create(&path).unwrap().write_all(b"%PDF-1.4").unwrap();

        let mut message = sample_message();
        let attachment = message.attach("meal-plan.pdf", &path).await.unwrap();
        assert_eq!(attachment.filename(), "meal-plan.pdf");
        assert_eq!(attachment.kind(), AttachmentKind::Binary);
        assert_eq!(attachment.content_type().essence_str(), "application/pdf");
        assert_eq!(attachment.data(), b"%PDF-1.4");
        assert_eq!(message.attachments().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_missing_file_leaves_message_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut message = sample_message();

        let err = message
            .attach("ghost.png", dir.path().join("ghost.png"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), MailErrorKind::AttachmentNotFound);
        assert!(err.message().contains("ghost.png"));
        assert!(!message.has_attachments());

        // A directory is not a regular file.
        let err = message.attach("dir", dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), MailErrorKind::AttachmentNotFound);
        assert!(message.attachments().is_empty());
    }
}
