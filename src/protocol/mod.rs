//! SMTP commands, replies and server capabilities (RFC 5321).

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, MailError, MailResult};

/// SMTP commands issued by the dispatcher.
#[derive(Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// Continuation line of a SASL exchange.
    AuthResponse(String),
    /// MAIL FROM command.
    MailFrom {
        /// Sender address, in angle brackets.
        address: String,
        /// SIZE parameter (optional).
        size: Option<usize>,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address, in angle brackets.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command as sent on the wire, without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(response),
            } => format!("AUTH {} {}", mechanism, response),
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {}", mechanism),
            SmtpCommand::AuthResponse(response) => response.clone(),
            SmtpCommand::MailFrom { address, size } => match size {
                Some(size) => format!("MAIL FROM:{} SIZE={}", address, size),
                None => format!("MAIL FROM:{}", address),
            },
            SmtpCommand::RcptTo { address } => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns the command verb, e.g. `MAIL` or `RCPT`.
    pub fn verb(&self) -> &'static str {
        match self {
            SmtpCommand::Ehlo(_) => "EHLO",
            SmtpCommand::Helo(_) => "HELO",
            SmtpCommand::StartTls => "STARTTLS",
            SmtpCommand::Auth { .. } | SmtpCommand::AuthResponse(_) => "AUTH",
            SmtpCommand::MailFrom { .. } => "MAIL",
            SmtpCommand::RcptTo { .. } => "RCPT",
            SmtpCommand::Data => "DATA",
            SmtpCommand::Rset => "RSET",
            SmtpCommand::Quit => "QUIT",
        }
    }
}

/// Log-safe rendering: SASL payloads are replaced by `<redacted>`.
impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => write!(f, "AUTH {} <redacted>", mechanism),
            SmtpCommand::AuthResponse(_) => f.write_str("<redacted>"),
            other => f.write_str(&other.to_smtp_string()),
        }
    }
}

impl fmt::Debug for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SmtpCommand({})", self)
    }
}

/// SMTP response from server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
    /// Whether this is a multiline response.
    pub is_multiline: bool,
}

impl SmtpResponse {
    /// Creates a single-line response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
            is_multiline: false,
        }
    }

    /// Parses a response from raw lines, CRLF already stripped.
    pub fn parse(lines: &[String]) -> MailResult<Self> {
        if lines.is_empty() {
            return Err(MailError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| MailError::protocol(format!("Invalid status line: {:?}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(MailError::protocol("Inconsistent status codes in multiline response"));
            }

            let text = line.get(4..).unwrap_or("");
            let text = match (i, parse_enhanced_code(text)) {
                (0, Some((esc, rest))) => {
                    enhanced_code = Some(esc);
                    rest.trim().to_string()
                }
                _ => text.to_string(),
            };
            messages.push(text);
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            is_multiline: lines.len() > 1,
        })
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts the reply into an error.
    pub fn to_error(&self) -> MailError {
        let mut err = MailError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

/// Splits a leading `X.Y.Z` enhanced status code off a reply text.
fn parse_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
    let (first, rest) = text.split_once(' ').unwrap_or((text, ""));
    EnhancedStatusCode::parse(first).map(|code| (code, rest))
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size, if the server declared one.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the
    /// server greeting and is skipped.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (capability, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match capability {
                "SIZE" => caps.size = params.trim().parse().ok().filter(|size| *size > 0),
                "AUTH" => caps.auth_mechanisms.extend(
                    params
                        .split_whitespace()
                        .filter_map(AuthMethod::from_capability),
                ),
                "STARTTLS" => caps.starttls = true,
                _ => {
                    // Legacy form advertised by some servers: AUTH=LOGIN
                    if let Some(mechanisms) = capability.strip_prefix("AUTH=") {
                        caps.auth_mechanisms.extend(
                            std::iter::once(mechanisms)
                                .chain(params.split_whitespace())
                                .filter_map(AuthMethod::from_capability),
                        );
                    }
                }
            }
        }

        caps
    }

    /// Returns the highest-priority advertised method among `compatible`.
    pub fn best_auth_method(&self, compatible: &[AuthMethod]) -> Option<AuthMethod> {
        self.auth_mechanisms
            .iter()
            .filter(|m| compatible.contains(m))
            .copied()
            .max_by_key(|m| m.priority())
    }
}

/// SMTP session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, server greeting received.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// TLS established and client re-greeted.
    Secured,
    /// Authenticated.
    Authenticated,
    /// Mail transaction open (after MAIL FROM).
    InTransaction,
    /// Connection closed.
    Closed,
}

impl SessionState {
    /// Returns true if authentication is allowed in this state.
    pub fn can_authenticate(&self) -> bool {
        matches!(self, SessionState::Greeted | SessionState::Secured)
    }

    /// Returns true if MAIL FROM is allowed in this state.
    pub fn can_start_mail(&self) -> bool {
        matches!(
            self,
            SessionState::Greeted | SessionState::Secured | SessionState::Authenticated
        )
    }
}

/// Reply codes used by the session.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_formatting() {
        assert_eq!(SmtpCommand::Ehlo("localhost".to_string()).to_smtp_string(), "EHLO localhost");
        assert_eq!(SmtpCommand::StartTls.to_smtp_string(), "STARTTLS");
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "<bot@eatsmart.app>".to_string(),
                size: Some(1024),
            }
            .to_smtp_string(),
            "MAIL FROM:<bot@eatsmart.app> SIZE=1024"
        );
        assert_eq!(
            SmtpCommand::RcptTo { address: "<a@example.com>".to_string() }.to_smtp_string(),
            "RCPT TO:<a@example.com>"
        );
    }

    #[test]
    fn test_auth_is_redacted_in_display() {
        let auth = SmtpCommand::Auth {
            mechanism: "PLAIN".to_string(),
            initial_response: Some("AGJvdABodW50ZXIy".to_string()),
        };
        assert_eq!(auth.to_smtp_string(), "AUTH PLAIN AGJvdABodW50ZXIy");
        assert_eq!(auth.to_string(), "AUTH PLAIN <redacted>");
        assert!(!format!("{:?}", auth).contains("AGJv"));

        let cont = SmtpCommand::AuthResponse("aHVudGVyMg==".to_string());
        assert_eq!(cont.to_string(), "<redacted>");
        assert_eq!(cont.verb(), "AUTH");
    }

    #[test]
    fn test_response_parse() {
        let response = SmtpResponse::parse(&["250 OK".to_string()]).unwrap();
        assert_eq!(response.code, 250);
        assert!(response.is_success());
        assert_eq!(response.first_message(), "OK");

        let lines = vec![
            "250-smtp.example.com Hello".to_string(),
            "250-SIZE 10485760".to_string(),
            "250 STARTTLS".to_string(),
        ];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert!(response.is_multiline);
        assert_eq!(response.message.len(), 3);

        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&["xx".to_string()]).is_err());
        assert!(SmtpResponse::parse(&["250-a".to_string(), "251 b".to_string()]).is_err());
    }

    #[test]
    fn test_response_with_enhanced_code() {
        let response = SmtpResponse::parse(&["550 5.1.1 User unknown".to_string()]).unwrap();
        let esc = response.enhanced_code.clone().unwrap();
        assert_eq!((esc.class, esc.subject, esc.detail), (5, 1, 1));
        assert_eq!(response.first_message(), "User unknown");

        let err = response.to_error();
        assert_eq!(err.smtp_code(), Some(550));
        assert!(err.enhanced_code().is_some());
    }

    #[test]
    fn test_capabilities_parse() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec![
                "smtp.example.com greets you".to_string(),
                "SIZE 10485760".to_string(),
                "AUTH PLAIN LOGIN CRAM-MD5".to_string(),
                "STARTTLS".to_string(),
                "8BITMIME".to_string(),
            ],
            is_multiline: true,
        };

        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert_eq!(caps.size, Some(10_485_760));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::CramMd5));
        assert!(caps.starttls);
        assert_eq!(
            caps.best_auth_method(&[AuthMethod::Plain, AuthMethod::Login]),
            Some(AuthMethod::Plain)
        );
        assert_eq!(caps.best_auth_method(&AuthMethod::all()), Some(AuthMethod::CramMd5));
    }

    #[test]
    fn test_legacy_auth_capability() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec!["mx.local".to_string(), "AUTH=LOGIN".to_string()],
            is_multiline: true,
        };
        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert!(!caps.starttls);
        assert_eq!(caps.size, None);
    }

    #[test]
    fn test_session_state() {
        assert!(SessionState::Greeted.can_authenticate());
        assert!(SessionState::Secured.can_authenticate());
        assert!(!SessionState::InTransaction.can_authenticate());
        assert!(SessionState::Authenticated.can_start_mail());
        assert!(!SessionState::Closed.can_start_mail());
    }
}
