//! Mock transports for exercising the dispatcher without a network.
//!
//! [`MockConnector`] hands out [`MockTransport`]s that share one recorder,
//! so a test can inspect every session after the dispatcher has closed it.
//! Replies default to a well-behaved server; individual replies can be
//! overridden per command or per recipient.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::EmailSettings;
use crate::errors::{MailError, MailResult};
use crate::protocol::{codes, SessionState, SmtpCommand, SmtpResponse};
use crate::transport::{Connector, SmtpTransport};

#[derive(Debug)]
struct Recorder {
    commands: Vec<SmtpCommand>,
    data: Vec<Vec<u8>>,
    queued: VecDeque<SmtpResponse>,
    rcpt_replies: HashMap<String, SmtpResponse>,
    verb_replies: HashMap<&'static str, SmtpResponse>,
    ehlo_reply: SmtpResponse,
    fail_next: Option<MailError>,
    connect_error: Option<MailError>,
    sasl_steps: u8,
    tls_upgrades: usize,
    connects: usize,
    closes: usize,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            data: Vec::new(),
            queued: VecDeque::new(),
            rcpt_replies: HashMap::new(),
            verb_replies: HashMap::new(),
            ehlo_reply: ehlo_response(),
            fail_next: None,
            connect_error: None,
            sasl_steps: 0,
            tls_upgrades: 0,
            connects: 0,
            closes: 0,
        }
    }
}

impl Recorder {
    fn reply_to(&mut self, command: &SmtpCommand) -> SmtpResponse {
        if let Some(queued) = self.queued.pop_front() {
            return queued;
        }
        if let Some(reply) = self.verb_replies.get(command.verb()) {
            return reply.clone();
        }

        match command {
            SmtpCommand::Ehlo(_) => self.ehlo_reply.clone(),
            SmtpCommand::StartTls => SmtpResponse::new(codes::SERVICE_READY, "2.0.0 Ready to start TLS"),
            SmtpCommand::Auth {
                initial_response: Some(_),
                ..
            } => auth_success_response(),
            SmtpCommand::Auth { mechanism, .. } => {
                if mechanism == "LOGIN" {
                    self.sasl_steps = 1;
                    auth_continue_response("VXNlcm5hbWU6")
                } else {
                    self.sasl_steps = 0;
                    // base64("<12345.67890@mock.test>")
                    auth_continue_response("PDEyMzQ1LjY3ODkwQG1vY2sudGVzdD4=")
                }
            }
            SmtpCommand::AuthResponse(_) if self.sasl_steps > 0 => {
                self.sasl_steps -= 1;
                auth_continue_response("UGFzc3dvcmQ6")
            }
            SmtpCommand::AuthResponse(_) => auth_success_response(),
            SmtpCommand::RcptTo { address } => {
                let email = address.trim_start_matches('<').trim_end_matches('>');
                self.rcpt_replies
                    .get(email)
                    .cloned()
                    .unwrap_or_else(|| SmtpResponse::new(codes::OK, "2.1.5 Ok"))
            }
            SmtpCommand::Data => data_ready_response(),
            SmtpCommand::Quit => SmtpResponse::new(codes::SERVICE_CLOSING, "2.0.0 Bye"),
            SmtpCommand::Helo(_) | SmtpCommand::MailFrom { .. } | SmtpCommand::Rset => {
                SmtpResponse::new(codes::OK, "2.0.0 Ok")
            }
        }
    }
}

/// Mock SMTP transport recording everything sent through it.
#[derive(Debug, Clone)]
pub struct MockTransport {
    recorder: Arc<Mutex<Recorder>>,
    state: SessionState,
    tls_enabled: bool,
}

impl MockTransport {
    /// Creates a transport in the `Connected` state.
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Mutex::new(Recorder::default())),
            state: SessionState::Connected,
            tls_enabled: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a fresh session sharing this transport's recorder.
    fn session(&self) -> Self {
        Self {
            recorder: Arc::clone(&self.recorder),
            state: SessionState::Connected,
            tls_enabled: false,
        }
    }

    /// Queues a reply for the next command or read, ahead of the defaults.
    pub fn queue_response(&self, response: SmtpResponse) -> &Self {
        self.lock().queued.push_back(response);
        self
    }

    /// Queues an error reply.
    pub fn queue_error(&self, code: u16, message: &str) -> &Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Replaces the EHLO reply (and so the advertised capabilities).
    pub fn set_ehlo_response(&self, response: SmtpResponse) -> &Self {
        self.lock().ehlo_reply = response;
        self
    }

    /// Answers every command with the given verb (`MAIL`, `DATA`, ...) with
    /// `code`, replacing the default reply.
    pub fn set_reply(&self, verb: &'static str, code: u16, message: &str) -> &Self {
        self.lock()
            .verb_replies
            .insert(verb, SmtpResponse::new(code, message));
        self
    }

    /// Makes RCPT TO for `email` answer with `code`.
    pub fn reject_recipient(&self, email: &str, code: u16, message: &str) -> &Self {
        self.lock()
            .rcpt_replies
            .insert(email.to_string(), SmtpResponse::new(code, message));
        self
    }

    /// Makes the next transport operation fail with `error`.
    pub fn fail_next_with(&self, error: MailError) -> &Self {
        self.lock().fail_next = Some(error);
        self
    }

    /// Returns recorded commands across all sessions.
    pub fn recorded_commands(&self) -> Vec<SmtpCommand> {
        self.lock().commands.clone()
    }

    /// Returns the recorded command verbs, in order.
    pub fn recorded_verbs(&self) -> Vec<&'static str> {
        self.lock().commands.iter().map(SmtpCommand::verb).collect()
    }

    /// Returns raw data payloads received.
    pub fn received_data(&self) -> Vec<Vec<u8>> {
        self.lock().data.clone()
    }

    /// Number of TLS upgrades performed.
    pub fn tls_upgrades(&self) -> usize {
        self.lock().tls_upgrades
    }

    /// Number of sessions closed.
    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    /// Clears recordings and overrides.
    pub fn clear(&self) {
        *self.lock() = Recorder::default();
    }

    fn take_failure(&self) -> MailResult<()> {
        match self.lock().fail_next.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> MailResult<SmtpResponse> {
        self.take_failure()?;
        let mut recorder = self.lock();
        recorder.commands.push(command.clone());
        Ok(recorder.reply_to(command))
    }

    async fn send_data(&mut self, data: &[u8]) -> MailResult<()> {
        self.take_failure()?;
        self.lock().data.push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> MailResult<SmtpResponse> {
        self.take_failure()?;
        let queued = self.lock().queued.pop_front();
        Ok(queued.unwrap_or_else(|| SmtpResponse::new(codes::OK, "2.0.0 Ok: queued as MOCK1")))
    }

    async fn upgrade_tls(&mut self, _host: &str) -> MailResult<()> {
        self.take_failure()?;
        self.lock().tls_upgrades += 1;
        self.tls_enabled = true;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> MailResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        let mut recorder = self.lock();
        recorder.commands.push(SmtpCommand::Quit);
        recorder.closes += 1;
        Ok(())
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }
}

/// Connector producing [`MockTransport`] sessions that share one recorder.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    transport: MockTransport,
}

impl MockConnector {
    /// Creates a connector with default replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared transport, for scripting replies and inspecting
    /// what was sent.
    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Makes the next connect attempt fail with `error`.
    pub fn fail_connect_with(&self, error: MailError) -> &Self {
        self.transport.lock().connect_error = Some(error);
        self
    }

    /// Number of connect attempts.
    pub fn connects(&self) -> usize {
        self.transport.lock().connects
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, _settings: &EmailSettings) -> MailResult<MockTransport> {
        let mut recorder = self.transport.lock();
        recorder.connects += 1;
        if let Some(error) = recorder.connect_error.take() {
            return Err(error);
        }
        drop(recorder);
        Ok(self.transport.session())
    }
}

/// EHLO reply advertising STARTTLS, SIZE and AUTH PLAIN LOGIN.
pub fn ehlo_response() -> SmtpResponse {
    SmtpResponse {
        code: codes::OK,
        enhanced_code: None,
        message: vec![
            "mock.test Hello".to_string(),
            "SIZE 10485760".to_string(),
            "AUTH PLAIN LOGIN".to_string(),
            "STARTTLS".to_string(),
            "8BITMIME".to_string(),
        ],
        is_multiline: true,
    }
}

/// Authentication success reply.
pub fn auth_success_response() -> SmtpResponse {
    SmtpResponse::new(codes::AUTH_SUCCESS, "2.7.0 Authentication successful")
}

/// DATA ready reply.
pub fn data_ready_response() -> SmtpResponse {
    SmtpResponse::new(codes::START_MAIL_INPUT, "End data with <CR><LF>.<CR><LF>")
}

/// AUTH continuation reply carrying `challenge`.
pub fn auth_continue_response(challenge: &str) -> SmtpResponse {
    SmtpResponse::new(codes::AUTH_CONTINUE, challenge)
}
