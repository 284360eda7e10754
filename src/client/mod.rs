//! Email dispatcher.
//!
//! [`EmailDispatcher`] composes messages with the configured sender, loads
//! attachments from disk and delivers each message over its own SMTP
//! session. Attachments are read before any connection is opened, so a
//! missing file never costs a round trip.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{EmailSettings, Settings};
use crate::errors::{MailError, MailErrorKind, MailResult};
use crate::mime::MimeEncoder;
use crate::observability::{DispatchMetrics, Timer};
use crate::protocol::{codes, EsmtpCapabilities, SessionState, SmtpCommand, SmtpResponse};
use crate::transport::{Connector, SmtpTransport, TcpConnector};
use crate::types::{Address, AttachmentSpec, BodySubtype, Message, RejectedRecipient, SendResult};

/// Sends notification emails through the configured SMTP server.
#[derive(Debug)]
pub struct EmailDispatcher<C: Connector = TcpConnector> {
    /// Process settings; only the email section is read.
    settings: Arc<Settings>,
    /// Opens one session per send.
    connector: C,
    /// From header and envelope sender.
    sender: Address,
    /// Login, when both username and password are configured.
    credentials: Option<Credentials>,
    /// Metrics collector.
    metrics: Arc<DispatchMetrics>,
}

impl EmailDispatcher<TcpConnector> {
    /// Creates a dispatcher that connects over TCP.
    pub fn new(settings: Arc<Settings>) -> MailResult<Self> {
        Self::with_connector(settings, TcpConnector)
    }
}

impl<C: Connector> EmailDispatcher<C> {
    /// Creates a dispatcher using `connector` to open sessions.
    ///
    /// Fails with `InvalidFromAddress` if the configured username cannot be
    /// used as a sender address.
    pub fn with_connector(settings: Arc<Settings>, connector: C) -> MailResult<Self> {
        let email = &settings.email;
        let sender = Address::sender(email.sender_name(), email.sender_address())?;
        let credentials = Credentials::from_settings(email);

        Ok(Self {
            settings,
            connector,
            sender,
            credentials,
            metrics: Arc::new(DispatchMetrics::new()),
        })
    }

    /// Returns the email settings.
    pub fn settings(&self) -> &EmailSettings {
        &self.settings.email
    }

    /// Returns the sender used for every message.
    pub fn sender(&self) -> &Address {
        &self.sender
    }

    /// Returns the connector.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the dispatch counters.
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Builds a message from the configured sender to `recipients`, in the
    /// order given.
    pub fn compose<R: AsRef<str>>(
        &self,
        subject: &str,
        body: &str,
        recipients: &[R],
        subtype: BodySubtype,
    ) -> MailResult<Message> {
        let to = recipients
            .iter()
            .map(|recipient| Address::parse(recipient.as_ref()))
            .collect::<MailResult<Vec<_>>>()?;

        Message::new(self.sender.clone(), to, subject, body, subtype)
    }

    /// Sends an HTML message with the given attachments.
    pub async fn send<R: AsRef<str>>(
        &self,
        subject: &str,
        body: &str,
        recipients: &[R],
        attachments: &[AttachmentSpec],
    ) -> MailResult<()> {
        let message = match self.assemble(subject, body, recipients, attachments).await {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_send(false);
                warn!(error = %e, kind = %e.kind(), "Email not sent");
                return Err(e);
            }
        };

        self.transmit(&message).await.map(|_| ())
    }

    /// Same as [`send`](Self::send); the attachment list is part of the call.
    pub async fn send_with_attachments<R: AsRef<str>>(
        &self,
        subject: &str,
        body: &str,
        recipients: &[R],
        attachments: &[AttachmentSpec],
    ) -> MailResult<()> {
        self.send(subject, body, recipients, attachments).await
    }

    /// Sends one image, named after the file.
    pub async fn send_with_image<R: AsRef<str>>(
        &self,
        subject: &str,
        body: &str,
        recipients: &[R],
        path: impl Into<PathBuf>,
    ) -> MailResult<()> {
        self.send_single(subject, body, recipients, path.into()).await
    }

    /// Sends one PDF document, named after the file.
    pub async fn send_with_pdf<R: AsRef<str>>(
        &self,
        subject: &str,
        body: &str,
        recipients: &[R],
        path: impl Into<PathBuf>,
    ) -> MailResult<()> {
        self.send_single(subject, body, recipients, path.into()).await
    }

    /// Sends one spreadsheet, named after the file.
    pub async fn send_with_excel<R: AsRef<str>>(
        &self,
        subject: &str,
        body: &str,
        recipients: &[R],
        path: impl Into<PathBuf>,
    ) -> MailResult<()> {
        self.send_single(subject, body, recipients, path.into()).await
    }

    /// Delivers a composed message over a new SMTP session.
    ///
    /// The session is closed whether or not delivery succeeds. Recipients
    /// refused by the server are reported in the result; the call fails only
    /// when every recipient is refused.
    pub async fn transmit(&self, message: &Message) -> MailResult<SendResult> {
        let timer = Timer::start("smtp_session");
        let result = self.deliver(message).await;
        let duration = timer.stop();
        self.metrics.record_send(result.is_ok());

        match result {
            Ok(mut sent) => {
                sent.duration = duration;
                info!(
                    message_id = %sent.message_id,
                    accepted = sent.accepted.len(),
                    rejected = sent.rejected.len(),
                    attachments = message.attachments().len(),
                    duration_ms = duration.as_millis() as u64,
                    "Email sent"
                );
                Ok(sent)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    kind = %e.kind(),
                    server = %self.settings().address(),
                    "Email delivery failed"
                );
                Err(e)
            }
        }
    }

    async fn send_single<R: AsRef<str>>(
        &self,
        subject: &str,
        body: &str,
        recipients: &[R],
        path: PathBuf,
    ) -> MailResult<()> {
        self.send(subject, body, recipients, &[AttachmentSpec::from_path(path)])
            .await
    }

    async fn assemble<R: AsRef<str>>(
        &self,
        subject: &str,
        body: &str,
        recipients: &[R],
        attachments: &[AttachmentSpec],
    ) -> MailResult<Message> {
        let mut message = self.compose(subject, body, recipients, BodySubtype::Html)?;
        for spec in attachments {
            let attachment = message.attach(spec.filename.clone(), &spec.path).await?;
            debug!(
                filename = attachment.filename(),
                content_type = %attachment.content_type(),
                bytes = attachment.data().len(),
                "Attachment loaded"
            );
        }
        self.metrics.record_attachments(attachments.len());
        Ok(message)
    }

    async fn deliver(&self, message: &Message) -> MailResult<SendResult> {
        let encoder = MimeEncoder::new(sender_domain(&self.sender));
        let message_id = encoder.generate_message_id();
        let data = MimeEncoder::prepare_data_content(&encoder.encode(message, &message_id)?);

        let mut transport = self.connector.connect(self.settings()).await?;
        self.metrics.record_session();

        let result = self.converse(&mut transport, message, &message_id, &data).await;

        if let Err(e) = transport.close().await {
            warn!(error = %e, "SMTP session did not close cleanly");
        }
        result
    }

    async fn converse(
        &self,
        transport: &mut C::Transport,
        message: &Message,
        message_id: &str,
        data: &[u8],
    ) -> MailResult<SendResult> {
        let mut capabilities = self.greet(transport).await?;

        if self.settings().smtp_use_tls {
            capabilities = self.start_tls(transport, &capabilities).await?;
        }

        if let Some(credentials) = &self.credentials {
            self.authenticate(transport, &capabilities, credentials).await?;
        }

        if let Some(limit) = capabilities.size {
            if data.len() > limit {
                return Err(MailError::new(
                    MailErrorKind::MessageTooLarge,
                    format!("Message is {} bytes, server accepts at most {}", data.len(), limit),
                ));
            }
        }

        if !transport.state().can_start_mail() {
            return Err(MailError::protocol(format!(
                "Cannot start a mail transaction in state {:?}",
                transport.state()
            )));
        }
        let mail_from = SmtpCommand::MailFrom {
            address: message.from.to_smtp(),
            size: capabilities.size.map(|_| data.len()),
        };
        let response = transport.send_command(&mail_from).await?;
        if !response.is_success() {
            return Err(MailError::new(
                MailErrorKind::SenderRejected,
                format!("Sender {} rejected: {}", message.from.email(), response),
            )
            .with_smtp_code(response.code));
        }
        transport.set_state(SessionState::InTransaction);

        let (accepted, rejected) = self.add_recipients(transport, message).await?;

        let response = transport.send_command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            return Err(response.to_error());
        }
        transport.send_data(data).await?;

        let response = transport.read_response().await?;
        if !response.is_success() {
            return Err(response.to_error());
        }

        Ok(SendResult {
            message_id: message_id.to_string(),
            accepted,
            rejected,
            response: response.full_message(),
            duration: std::time::Duration::ZERO,
        })
    }

    /// EHLO, falling back to HELO for servers without ESMTP.
    async fn greet(&self, transport: &mut C::Transport) -> MailResult<EsmtpCapabilities> {
        let client_id = self.settings().helo_name().to_string();

        let response = transport.send_command(&SmtpCommand::Ehlo(client_id.clone())).await?;
        let capabilities = if response.is_success() {
            EsmtpCapabilities::from_ehlo_response(&response)
        } else {
            debug!(code = response.code, "EHLO refused, falling back to HELO");
            let response = transport.send_command(&SmtpCommand::Helo(client_id)).await?;
            if !response.is_success() {
                return Err(response.to_error());
            }
            EsmtpCapabilities::default()
        };

        transport.set_state(SessionState::Greeted);
        Ok(capabilities)
    }

    async fn start_tls(
        &self,
        transport: &mut C::Transport,
        capabilities: &EsmtpCapabilities,
    ) -> MailResult<EsmtpCapabilities> {
        if !capabilities.starttls {
            return Err(MailError::new(
                MailErrorKind::StarttlsRejected,
                format!("{} does not advertise STARTTLS", self.settings().address()),
            ));
        }

        let response = transport.send_command(&SmtpCommand::StartTls).await?;
        if response.code != codes::SERVICE_READY {
            return Err(MailError::new(
                MailErrorKind::StarttlsRejected,
                format!("STARTTLS refused: {}", response),
            )
            .with_smtp_code(response.code));
        }

        transport.upgrade_tls(&self.settings().smtp_server).await?;
        self.metrics.record_tls_upgrade();

        // Capabilities announced before the handshake are discarded.
        let capabilities = self.greet(transport).await?;
        transport.set_state(SessionState::Secured);
        Ok(capabilities)
    }

    async fn authenticate(
        &self,
        transport: &mut C::Transport,
        capabilities: &EsmtpCapabilities,
        credentials: &Credentials,
    ) -> MailResult<()> {
        if !transport.state().can_authenticate() {
            return Err(MailError::protocol(format!(
                "Cannot authenticate in state {:?}",
                transport.state()
            )));
        }
        let method = capabilities
            .best_auth_method(&AuthMethod::all())
            .ok_or_else(|| {
                MailError::new(
                    MailErrorKind::AuthMethodNotSupported,
                    format!(
                        "{} advertises no supported authentication mechanism",
                        self.settings().address()
                    ),
                )
            })?;

        if method.exposes_password() && !transport.is_tls() {
            warn!(method = %method, "Sending credentials over an unencrypted connection");
        }
        debug!(method = %method, username = credentials.username(), "Authenticating");

        let result = match method {
            AuthMethod::Plain => auth_plain(transport, credentials).await,
            AuthMethod::Login => auth_login(transport, credentials).await,
            AuthMethod::CramMd5 => auth_cram_md5(transport, credentials).await,
        };
        self.metrics.record_auth_attempt(result.is_ok());
        result?;

        transport.set_state(SessionState::Authenticated);
        Ok(())
    }

    async fn add_recipients(
        &self,
        transport: &mut C::Transport,
        message: &Message,
    ) -> MailResult<(Vec<Address>, Vec<RejectedRecipient>)> {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for recipient in &message.to {
            let rcpt_to = SmtpCommand::RcptTo {
                address: recipient.to_smtp(),
            };
            let response = transport.send_command(&rcpt_to).await?;
            if response.is_success() {
                accepted.push(recipient.clone());
            } else {
                rejected.push(RejectedRecipient {
                    address: recipient.clone(),
                    code: response.code,
                    message: response.full_message(),
                });
            }
        }

        self.metrics.record_rejected_recipients(rejected.len());

        if accepted.is_empty() {
            if let Err(e) = transport.send_command(&SmtpCommand::Rset).await {
                debug!(error = %e, "RSET failed");
            }
            let mut error = MailError::new(
                MailErrorKind::RecipientsRejected,
                format!("All {} recipients were rejected", rejected.len()),
            );
            if let Some(first) = rejected.first() {
                error = error.with_smtp_code(first.code);
            }
            return Err(error);
        }

        for refused in &rejected {
            warn!(
                recipient = refused.address.email(),
                code = refused.code,
                reason = %refused.message,
                "Recipient refused"
            );
        }

        Ok((accepted, rejected))
    }
}

async fn auth_plain<T: SmtpTransport>(transport: &mut T, credentials: &Credentials) -> MailResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::Plain.mechanism_name().to_string(),
        initial_response: Some(Authenticator::plain_initial_response(credentials)),
    };
    let response = transport.send_command(&command).await?;
    expect_code(response, codes::AUTH_SUCCESS).map(|_| ())
}

async fn auth_login<T: SmtpTransport>(transport: &mut T, credentials: &Credentials) -> MailResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::Login.mechanism_name().to_string(),
        initial_response: None,
    };
    let response = transport.send_command(&command).await?;
    expect_code(response, codes::AUTH_CONTINUE)?;

    let username = SmtpCommand::AuthResponse(Authenticator::login_username(credentials));
    let response = transport.send_command(&username).await?;
    expect_code(response, codes::AUTH_CONTINUE)?;

    let password = SmtpCommand::AuthResponse(Authenticator::login_password(credentials));
    let response = transport.send_command(&password).await?;
    expect_code(response, codes::AUTH_SUCCESS).map(|_| ())
}

async fn auth_cram_md5<T: SmtpTransport>(transport: &mut T, credentials: &Credentials) -> MailResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::CramMd5.mechanism_name().to_string(),
        initial_response: None,
    };
    let response = transport.send_command(&command).await?;
    let challenge = expect_code(response, codes::AUTH_CONTINUE)?;

    let answer = Authenticator::cram_md5_response(challenge.first_message(), credentials)?;
    let response = transport.send_command(&SmtpCommand::AuthResponse(answer)).await?;
    expect_code(response, codes::AUTH_SUCCESS).map(|_| ())
}

fn expect_code(response: SmtpResponse, code: u16) -> MailResult<SmtpResponse> {
    if response.code == code {
        Ok(response)
    } else {
        Err(response.to_error())
    }
}

fn sender_domain(sender: &Address) -> &str {
    sender
        .email()
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or("localhost")
}
