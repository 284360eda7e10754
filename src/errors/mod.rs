//! Error types for the email dispatcher.
//!
//! Every failure is classified by a [`MailErrorKind`], and every kind belongs
//! to exactly one [`ErrorCategory`] so callers can branch on the broad class
//! (bad input, missing attachment, transport failure) without matching on
//! every individual kind.

use std::fmt;
use thiserror::Error;

/// Result type for dispatcher operations.
pub type MailResult<T> = Result<T, MailError>;

/// Broad classes of dispatcher failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Settings handed to the dispatcher are unusable.
    Configuration,
    /// Caller input was rejected before a message was assembled.
    InvalidArgument,
    /// An attachment could not be loaded; no network I/O happened.
    Attachment,
    /// DNS, connect, TLS, authentication or submission failed.
    Transport,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::InvalidArgument => write!(f, "invalid argument"),
            ErrorCategory::Attachment => write!(f, "attachment"),
            ErrorCategory::Transport => write!(f, "transport"),
        }
    }
}

/// Dispatcher error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailErrorKind {
    // Configuration
    /// Email settings are invalid.
    ConfigurationInvalid,

    // Invalid arguments
    /// Recipient list is empty.
    NoRecipients,
    /// A recipient address is malformed.
    InvalidRecipientAddress,
    /// The sender address is malformed.
    InvalidFromAddress,
    /// A header name or value cannot be encoded.
    InvalidHeader,

    // Attachments
    /// Attachment source file does not exist.
    AttachmentNotFound,
    /// Attachment source file exists but could not be read.
    AttachmentUnreadable,

    // Connection
    /// DNS resolution failed.
    DnsResolution,
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset or closed by the server.
    ConnectionReset,
    /// Connect timed out.
    ConnectTimeout,
    /// Read timed out.
    ReadTimeout,
    /// Write timed out.
    WriteTimeout,

    // TLS
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// Server refused STARTTLS.
    StarttlsRejected,

    // Authentication
    /// Credentials were rejected.
    CredentialsInvalid,
    /// Server offers no mechanism usable with our credentials.
    AuthMethodNotSupported,
    /// Server requires authentication.
    AuthenticationRequired,

    // Protocol
    /// Response could not be parsed.
    InvalidResponse,
    /// Server answered with an unexpected code.
    UnexpectedResponse,
    /// Server is shutting down (421).
    ServerShutdown,
    /// Server refused the envelope sender.
    SenderRejected,
    /// Server refused every recipient.
    RecipientsRejected,
    /// Message exceeds the server's advertised size limit.
    MessageTooLarge,
}

impl MailErrorKind {
    /// Returns the category this kind belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MailErrorKind::ConfigurationInvalid => ErrorCategory::Configuration,

            MailErrorKind::NoRecipients
            | MailErrorKind::InvalidRecipientAddress
            | MailErrorKind::InvalidFromAddress
            | MailErrorKind::InvalidHeader => ErrorCategory::InvalidArgument,

            MailErrorKind::AttachmentNotFound | MailErrorKind::AttachmentUnreadable => {
                ErrorCategory::Attachment
            }

            MailErrorKind::DnsResolution
            | MailErrorKind::ConnectionRefused
            | MailErrorKind::ConnectionReset
            | MailErrorKind::ConnectTimeout
            | MailErrorKind::ReadTimeout
            | MailErrorKind::WriteTimeout
            | MailErrorKind::TlsHandshakeFailed
            | MailErrorKind::StarttlsRejected
            | MailErrorKind::CredentialsInvalid
            | MailErrorKind::AuthMethodNotSupported
            | MailErrorKind::AuthenticationRequired
            | MailErrorKind::InvalidResponse
            | MailErrorKind::UnexpectedResponse
            | MailErrorKind::ServerShutdown
            | MailErrorKind::SenderRejected
            | MailErrorKind::RecipientsRejected
            | MailErrorKind::MessageTooLarge => ErrorCategory::Transport,
        }
    }
}

impl fmt::Display for MailErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MailErrorKind::ConfigurationInvalid => "Invalid configuration",
            MailErrorKind::NoRecipients => "No recipients",
            MailErrorKind::InvalidRecipientAddress => "Invalid recipient address",
            MailErrorKind::InvalidFromAddress => "Invalid sender address",
            MailErrorKind::InvalidHeader => "Invalid header",
            MailErrorKind::AttachmentNotFound => "Attachment not found",
            MailErrorKind::AttachmentUnreadable => "Attachment unreadable",
            MailErrorKind::DnsResolution => "DNS resolution failed",
            MailErrorKind::ConnectionRefused => "Connection refused",
            MailErrorKind::ConnectionReset => "Connection reset",
            MailErrorKind::ConnectTimeout => "Connect timeout",
            MailErrorKind::ReadTimeout => "Read timeout",
            MailErrorKind::WriteTimeout => "Write timeout",
            MailErrorKind::TlsHandshakeFailed => "TLS handshake failed",
            MailErrorKind::StarttlsRejected => "STARTTLS rejected",
            MailErrorKind::CredentialsInvalid => "Invalid credentials",
            MailErrorKind::AuthMethodNotSupported => "Auth method not supported",
            MailErrorKind::AuthenticationRequired => "Authentication required",
            MailErrorKind::InvalidResponse => "Invalid server response",
            MailErrorKind::UnexpectedResponse => "Unexpected response",
            MailErrorKind::ServerShutdown => "Server shutting down",
            MailErrorKind::SenderRejected => "Sender rejected",
            MailErrorKind::RecipientsRejected => "Recipients rejected",
            MailErrorKind::MessageTooLarge => "Message too large",
        };
        f.write_str(text)
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code such as `5.1.1`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(2..=5).contains(&class) {
            return None;
        }
        Some(Self { class, subject, detail })
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Dispatcher error with kind, context message and optional SMTP details.
#[derive(Error, Debug)]
pub struct MailError {
    kind: MailErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MailError {
    /// Creates a new error.
    pub fn new(kind: MailErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> MailErrorKind {
        self.kind
    }

    /// Returns the error category.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the context message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if the server produced one.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if the server produced one.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true for DNS/connect/TLS/auth/submission failures.
    pub fn is_transport(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::ConfigurationInvalid, message)
    }

    /// Creates an invalid-argument error of the given kind.
    pub fn invalid_argument(kind: MailErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::ConnectionRefused, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::InvalidResponse, message)
    }

    /// Creates an error from an SMTP reply code.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => MailErrorKind::ServerShutdown,
            500..=504 => MailErrorKind::InvalidResponse,
            530 => MailErrorKind::AuthenticationRequired,
            534 | 535 => MailErrorKind::CredentialsInvalid,
            550 | 551 | 553 => MailErrorKind::RecipientsRejected,
            552 => MailErrorKind::MessageTooLarge,
            _ => MailErrorKind::UnexpectedResponse,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_categories() {
        assert_eq!(MailErrorKind::NoRecipients.category(), ErrorCategory::InvalidArgument);
        assert_eq!(MailErrorKind::AttachmentNotFound.category(), ErrorCategory::Attachment);
        assert_eq!(MailErrorKind::TlsHandshakeFailed.category(), ErrorCategory::Transport);
        assert_eq!(MailErrorKind::CredentialsInvalid.category(), ErrorCategory::Transport);
        assert_eq!(
            MailErrorKind::ConfigurationInvalid.category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);

        assert!(EnhancedStatusCode::parse("mx.example.com").is_none());
        assert!(EnhancedStatusCode::parse("1.2.3").is_none());
        assert!(EnhancedStatusCode::parse("5.1.1.1").is_none());
    }

    #[test]
    fn test_error_from_smtp_response() {
        let err = MailError::from_smtp_response(535, "Authentication failed");
        assert_eq!(err.kind(), MailErrorKind::CredentialsInvalid);
        assert_eq!(err.smtp_code(), Some(535));
        assert!(err.is_transport());

        let err = MailError::from_smtp_response(421, "Service unavailable");
        assert_eq!(err.kind(), MailErrorKind::ServerShutdown);
    }

    #[test]
    fn test_display_includes_codes() {
        let err = MailError::from_smtp_response(550, "User unknown")
            .with_enhanced_code(EnhancedStatusCode::parse("5.1.1").unwrap());
        let text = err.to_string();
        assert!(text.contains("User unknown"));
        assert!(text.contains("SMTP 550"));
        assert!(text.contains("[5.1.1]"));
    }
}
