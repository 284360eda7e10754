//! # EatSmart core
//!
//! Application settings and outbound email notifications for EatSmart:
//! - Layered settings (defaults, settings file, `.env`, process environment)
//!   with fail-fast validation
//! - Logging setup with JSON output and size-based log rotation
//! - SMTP delivery with STARTTLS and PLAIN, LOGIN or CRAM-MD5 authentication
//! - Multipart MIME messages with inline images and file attachments
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use eatsmart_core::{EmailDispatcher, LoggingConfig, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Arc::new(Settings::load()?);
//!     LoggingConfig::from_settings(&settings)?.init()?;
//!
//!     let dispatcher = EmailDispatcher::new(Arc::clone(&settings))?;
//!     dispatcher
//!         .send_with_pdf(
//!             "Your weekly meal plan",
//!             "<p>Plan attached.</p>",
//!             &["user@example.com"],
//!             "/tmp/meal-plan.pdf",
//!         )
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// MIME encoding
pub mod mime;

// Observability
pub mod observability;

// Dispatcher
pub mod client;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, Credentials};
pub use client::EmailDispatcher;
pub use config::{ConfigurationError, EmailSettings, Settings, SettingsLoader};
pub use errors::{ErrorCategory, MailError, MailErrorKind, MailResult};
pub use observability::{DispatchMetrics, LogFormat, LogLevel, LoggingConfig, MetricsSnapshot};
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use transport::{Connector, SmtpTransport, TcpConnector, TcpTransport};
pub use types::{
    Address, Attachment, AttachmentKind, AttachmentSpec, BodySubtype, Message, RejectedRecipient,
    SendResult,
};
