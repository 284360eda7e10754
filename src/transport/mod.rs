//! Transport layer for SMTP sessions.
//!
//! A [`Connector`] opens one [`SmtpTransport`] per send. [`TcpTransport`] is
//! the production implementation: tokio TCP, upgraded in place with STARTTLS.
//! Every connect, read and write is bounded by `email.smtp_timeout`.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::mem;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::EmailSettings;
use crate::errors::{MailError, MailErrorKind, MailResult};
use crate::protocol::{codes, SessionState, SmtpCommand, SmtpResponse};

/// One SMTP session's byte channel.
#[async_trait]
pub trait SmtpTransport: Send + fmt::Debug {
    /// Sends a command and reads the reply.
    async fn send_command(&mut self, command: &SmtpCommand) -> MailResult<SmtpResponse>;

    /// Sends raw bytes (the dot-stuffed DATA payload).
    async fn send_data(&mut self, data: &[u8]) -> MailResult<()>;

    /// Reads one (possibly multiline) reply.
    async fn read_response(&mut self) -> MailResult<SmtpResponse>;

    /// Performs the TLS handshake after a successful STARTTLS.
    async fn upgrade_tls(&mut self, host: &str) -> MailResult<()>;

    /// Returns true once TLS is established.
    fn is_tls(&self) -> bool;

    /// Sends QUIT and releases the connection. Idempotent.
    async fn close(&mut self) -> MailResult<()>;

    /// Returns the session state.
    fn state(&self) -> SessionState;

    /// Sets the session state.
    fn set_state(&mut self, state: SessionState);
}

/// Opens transports. One call per send; connections are never reused.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Transport produced by this connector.
    type Transport: SmtpTransport;

    /// Connects to the configured server and consumes its greeting.
    async fn connect(&self, settings: &EmailSettings) -> MailResult<Self::Transport>;
}

/// Connector for [`TcpTransport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self, settings: &EmailSettings) -> MailResult<TcpTransport> {
        TcpTransport::connect(settings).await
    }
}

trait SessionIo: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> SessionIo for T {}

enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
    #[cfg(feature = "native-tls")]
    NativeTls(Box<BufReader<tokio_native_tls::TlsStream<TcpStream>>>),
    /// Taken out for a handshake that did not complete, or closed.
    Detached,
}

/// TCP connection with optional STARTTLS upgrade.
pub struct TcpTransport {
    stream: TransportStream,
    timeout: Duration,
    state: SessionState,
    address: String,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .field("tls", &self.is_tls())
            .field("state", &self.state)
            .finish()
    }
}

impl TcpTransport {
    /// Connects to `smtp_server:smtp_port` and reads the 220 greeting.
    pub async fn connect(settings: &EmailSettings) -> MailResult<Self> {
        let address = settings.address();
        let limit = settings.smtp_timeout;

        let candidates: Vec<_> = timeout(
            limit,
            tokio::net::lookup_host((settings.smtp_server.as_str(), settings.smtp_port)),
        )
        .await
        .map_err(|_| {
            MailError::new(MailErrorKind::ConnectTimeout, format!("Resolving {} timed out", address))
        })?
        .map_err(|e| {
            MailError::new(MailErrorKind::DnsResolution, format!("Cannot resolve {}", address))
                .with_cause(e)
        })?
        .collect();

        let mut last_error = MailError::new(
            MailErrorKind::DnsResolution,
            format!("No addresses found for {}", address),
        );
        let mut connected = None;
        for candidate in candidates {
            match timeout(limit, TcpStream::connect(candidate)).await {
                Ok(Ok(stream)) => {
                    connected = Some(stream);
                    break;
                }
                Ok(Err(e)) => last_error = map_io_error(e, &address),
                Err(_) => {
                    last_error = MailError::new(
                        MailErrorKind::ConnectTimeout,
                        format!("Connecting to {} timed out after {:?}", address, limit),
                    )
                }
            }
        }
        let stream = connected.ok_or(last_error)?;
        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            timeout: limit,
            state: SessionState::Connected,
            address,
        };

        let greeting = transport.read_response().await?;
        if greeting.code != codes::SERVICE_READY {
            transport.state = SessionState::Closed;
            return Err(greeting.to_error());
        }
        debug!(address = %transport.address, banner = %greeting.first_message(), "Connected to SMTP server");

        Ok(transport)
    }

    fn io(&mut self) -> MailResult<&mut dyn SessionIo> {
        match &mut self.stream {
            TransportStream::Plain(stream) => Ok(stream),
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => Ok(stream.as_mut()),
            #[cfg(feature = "native-tls")]
            TransportStream::NativeTls(stream) => Ok(stream.as_mut()),
            TransportStream::Detached => Err(MailError::new(
                MailErrorKind::ConnectionReset,
                format!("Connection to {} is no longer usable", self.address),
            )),
        }
    }

    /// Takes the plain TCP stream out for a TLS handshake.
    #[cfg(any(feature = "rustls-tls", feature = "native-tls"))]
    fn take_plain(&mut self) -> MailResult<TcpStream> {
        match mem::replace(&mut self.stream, TransportStream::Detached) {
            TransportStream::Plain(reader) if reader.buffer().is_empty() => Ok(reader.into_inner()),
            TransportStream::Plain(_) => Err(MailError::tls(
                "Server sent data after STARTTLS before the handshake",
            )),
            other => {
                self.stream = other;
                Err(MailError::tls("Connection is already using TLS"))
            }
        }
    }
}

fn map_io_error(error: io::Error, address: &str) -> MailError {
    let kind = match error.kind() {
        io::ErrorKind::ConnectionRefused => MailErrorKind::ConnectionRefused,
        io::ErrorKind::TimedOut => MailErrorKind::ConnectTimeout,
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => MailErrorKind::ConnectionReset,
        _ => MailErrorKind::ConnectionRefused,
    };
    MailError::new(kind, format!("Cannot connect to {}", address)).with_cause(error)
}

/// Longest accepted reply line, CRLF included. RFC 5321 allows 512 octets.
const MAX_REPLY_LINE: usize = 1024;

/// Reads lines until a reply without a continuation marker.
async fn read_reply<R>(reader: &mut R, limit: Duration) -> MailResult<SmtpResponse>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut lines = Vec::new();

    loop {
        let mut line = String::new();
        let mut bounded = (&mut *reader).take(MAX_REPLY_LINE as u64 + 1);
        let read = timeout(limit, bounded.read_line(&mut line))
            .await
            .map_err(|_| MailError::new(MailErrorKind::ReadTimeout, "Read timed out"))?
            .map_err(|e| MailError::new(MailErrorKind::ConnectionReset, "Read failed").with_cause(e))?;

        if read == 0 {
            return Err(MailError::new(
                MailErrorKind::ConnectionReset,
                "Server closed connection",
            ));
        }

        if line.len() > MAX_REPLY_LINE {
            return Err(MailError::new(
                MailErrorKind::InvalidResponse,
                format!("Reply line exceeds {} bytes", MAX_REPLY_LINE),
            ));
        }

        let line = line.trim_end_matches(['\r', '\n']).to_string();
        let is_continuation = line.as_bytes().get(3) == Some(&b'-');
        lines.push(line);

        if !is_continuation {
            break;
        }
    }

    SmtpResponse::parse(&lines)
}

async fn write_all<W>(writer: &mut W, data: &[u8], limit: Duration) -> MailResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    timeout(limit, writer.write_all(data))
        .await
        .map_err(|_| MailError::new(MailErrorKind::WriteTimeout, "Write timed out"))?
        .map_err(|e| MailError::new(MailErrorKind::ConnectionReset, "Write failed").with_cause(e))?;

    timeout(limit, writer.flush())
        .await
        .map_err(|_| MailError::new(MailErrorKind::WriteTimeout, "Flush timed out"))?
        .map_err(|e| MailError::new(MailErrorKind::ConnectionReset, "Flush failed").with_cause(e))?;

    Ok(())
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> MailResult<SmtpResponse> {
        debug!(command = %command, "Sending SMTP command");
        let line = format!("{}\r\n", command.to_smtp_string());
        let limit = self.timeout;
        write_all(self.io()?, line.as_bytes(), limit).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> MailResult<()> {
        debug!(bytes = data.len(), "Sending message data");
        let limit = self.timeout;
        write_all(self.io()?, data, limit).await
    }

    async fn read_response(&mut self) -> MailResult<SmtpResponse> {
        let limit = self.timeout;
        let response = read_reply(self.io()?, limit).await?;
        debug!(code = response.code, message = %response.first_message(), "Received SMTP response");
        Ok(response)
    }

    async fn upgrade_tls(&mut self, host: &str) -> MailResult<()> {
        if self.is_tls() {
            return Ok(());
        }

        #[cfg(feature = "rustls-tls")]
        {
            use rustls::pki_types::ServerName;
            use std::sync::Arc;

            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| MailError::tls(format!("Invalid server name: {}", host)))?;

            let tcp = self.take_plain()?;
            let tls = timeout(self.timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| MailError::new(MailErrorKind::ConnectTimeout, "TLS handshake timed out"))?
                .map_err(|e| MailError::tls(format!("TLS handshake with {} failed", host)).with_cause(e))?;

            self.stream = TransportStream::Tls(Box::new(BufReader::new(tls)));
            debug!(host = %host, "TLS established");
            Ok(())
        }

        #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
        {
            let connector = native_tls::TlsConnector::new()
                .map_err(|e| MailError::tls("Failed to build TLS connector").with_cause(e))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);

            let tcp = self.take_plain()?;
            let tls = timeout(self.timeout, connector.connect(host, tcp))
                .await
                .map_err(|_| MailError::new(MailErrorKind::ConnectTimeout, "TLS handshake timed out"))?
                .map_err(|e| MailError::tls(format!("TLS handshake with {} failed", host)).with_cause(e))?;

            self.stream = TransportStream::NativeTls(Box::new(BufReader::new(tls)));
            debug!(host = %host, "TLS established");
            Ok(())
        }

        #[cfg(not(any(feature = "rustls-tls", feature = "native-tls")))]
        {
            let _ = host;
            Err(MailError::configuration(
                "smtp_use_tls is set but no TLS backend was compiled in",
            ))
        }
    }

    fn is_tls(&self) -> bool {
        match self.stream {
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(_) => true,
            #[cfg(feature = "native-tls")]
            TransportStream::NativeTls(_) => true,
            _ => false,
        }
    }

    async fn close(&mut self) -> MailResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        if matches!(self.stream, TransportStream::Detached) {
            return Ok(());
        }

        let quit = self.send_command(&SmtpCommand::Quit).await;
        let _ = mem::replace(&mut self.stream, TransportStream::Detached);
        quit.map(|_| ())
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }
}
