use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::debug;

use crate::backend::tls;
use crate::backend::traits::BoxedReadAndWrite;
use crate::config::{Config, Network};
use crate::error::SpamdError;
use crate::protocol::codec::StatusCode;
use crate::protocol::commands::{MessageClass, RequestFrame, SpamdCommand, TellAction};
use crate::protocol::reply::{parse_reply, SpamdReply};

const COPY_CHUNK: usize = 8192;

/// Message body handed to a command, blocking flavour.
pub enum Body {
    Bytes(Bytes),
    File(std::fs::File),
    Sized {
        len: u64,
        reader: Box<dyn Read + Send>,
    },
    Unsized(Box<dyn Read + Send>),
}

impl Body {
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Body> {
        Ok(Body::File(std::fs::File::open(path)?))
    }

    fn content_length(&self) -> Result<u64, SpamdError> {
        match self {
            Body::Bytes(bytes) => Ok(bytes.len() as u64),
            Body::File(file) => Ok(file.metadata()?.len()),
            Body::Sized { len, .. } => Ok(*len),
            Body::Unsized(_) => Err(SpamdError::NoSize),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Body {
        Body::Bytes(bytes.into())
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Body {
        Body::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Body {
    fn from(message: &str) -> Body {
        Body::Bytes(Bytes::copy_from_slice(message.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(message: String) -> Body {
        Body::Bytes(Bytes::from(message.into_bytes()))
    }
}

impl From<std::fs::File> for Body {
    fn from(file: std::fs::File) -> Body {
        Body::File(file)
    }
}

/// Blocking spamd client with the same surface as the async one. Each
/// command dials a fresh connection and releases it before returning.
pub struct SyncClient {
    config: Config,
}

impl SyncClient {
    /// Create a client for the given endpoint. Empty network and address
    /// select the default unix socket.
    pub fn new(
        network: &str,
        address: &str,
        user: &str,
        use_compression: bool,
    ) -> Result<SyncClient, SpamdError> {
        Ok(SyncClient {
            config: Config::for_endpoint(network, address, user, use_compression)?,
        })
    }

    pub fn with_config(config: Config) -> Result<SyncClient, SpamdError> {
        config.validate()?;
        Ok(SyncClient { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Check a message with a CHECK request.
    pub fn check(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Check, Some(message.into()), None)
    }

    /// Check a message with a HEADERS request.
    pub fn headers(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Headers, Some(message.into()), None)
    }

    /// Ping the server; true when it answered with EX_OK.
    pub fn ping(&self) -> Result<bool, SpamdError> {
        let reply = self.cmd(SpamdCommand::Ping, None, None)?;
        Ok(reply.status_code == StatusCode::ExOk)
    }

    /// Check a message with a PROCESS request.
    pub fn process(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Process, Some(message.into()), None)
    }

    /// Check a message with a REPORT request.
    pub fn report(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Report, Some(message.into()), None)
    }

    /// Check a message with a REPORT_IFSPAM request.
    pub fn report_if_spam(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::ReportIfSpam, Some(message.into()), None)
    }

    /// Check a message with a SYMBOLS request.
    pub fn symbols(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Symbols, Some(message.into()), None)
    }

    /// Ask the server to act on a message with a TELL request.
    pub fn tell(
        &self,
        message: impl Into<Body>,
        class: MessageClass,
        action: TellAction,
    ) -> Result<SpamdReply, SpamdError> {
        if !class.is_set() {
            return Err(SpamdError::Config("Set the correct learn type".to_string()));
        }
        self.cmd(SpamdCommand::Tell, Some(message.into()), Some((action, class)))
    }

    /// Have the server learn tokens from a message.
    pub fn learn(
        &self,
        message: impl Into<Body>,
        class: MessageClass,
    ) -> Result<SpamdReply, SpamdError> {
        self.tell(message, class, TellAction::Learn)
    }

    /// Have the server revoke tokens learned from a message.
    pub fn revoke(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.tell(message, MessageClass::Ham, TellAction::Revoke)
    }

    fn cmd(
        &self,
        command: SpamdCommand,
        body: Option<Body>,
        tell: Option<(TellAction, MessageClass)>,
    ) -> Result<SpamdReply, SpamdError> {
        let content_length = match &body {
            Some(body) => Some(body.content_length()?),
            None => None,
        };
        let frame = RequestFrame {
            command,
            content_length,
            user: self.config.user.as_deref(),
            compress: self.config.use_compression,
            tell,
        };
        let head = frame.encode();
        let compress = frame.compresses();

        debug!(
            command = %command,
            network = %self.config.network,
            address = %self.config.address,
            "sending spamd request"
        );
        let mut stream = self.dial()?;

        stream.write_all(&head)?;
        if let Some(body) = body {
            send_body(&mut stream, body, compress)?;
        }
        stream.flush()?;
        // Half-close so the server sees EOF on its read path.
        stream.close_write()?;

        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;

        parse_reply(command, &data, self.config.return_raw_body)
    }

    /// Dial the configured endpoint, retrying timed-out attempts up to the
    /// configured number of times.
    fn dial(&self) -> Result<BoxedReadAndWrite, SpamdError> {
        let mut attempt = 0;
        loop {
            match self.connect() {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if !is_timeout(&err) || attempt >= self.config.connect_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    debug!(
                        attempt,
                        address = %self.config.address,
                        "connect timed out, retrying"
                    );
                    std::thread::sleep(self.config.connect_sleep);
                }
            }
        }
    }

    fn connect(&self) -> Result<BoxedReadAndWrite, SpamdError> {
        match self.config.network {
            // No SOCK_SEQPACKET support in std; unixpacket degrades to a
            // stream connect.
            Network::Unix | Network::UnixPacket => {
                let stream = UnixStream::connect(&self.config.address)?;
                self.apply_command_timeouts(
                    |t| stream.set_read_timeout(t),
                    |t| stream.set_write_timeout(t),
                )?;
                Ok(Box::new(stream))
            }
            network => {
                let stream = self.connect_tcp(network)?;
                stream.set_nodelay(true)?;
                self.apply_command_timeouts(
                    |t| stream.set_read_timeout(t),
                    |t| stream.set_write_timeout(t),
                )?;
                if self.config.use_tls {
                    Ok(Box::new(self.wrap_tls(stream)?))
                } else {
                    Ok(Box::new(stream))
                }
            }
        }
    }

    fn connect_tcp(&self, network: Network) -> Result<TcpStream, SpamdError> {
        let timeout = self.config.connect_timeout;
        let mut last_err = None;
        for addr in self.config.address.to_socket_addrs()? {
            if network == Network::Tcp4 && !addr.is_ipv4() {
                continue;
            }
            if network == Network::Tcp6 && !addr.is_ipv6() {
                continue;
            }
            let connected = if timeout > Duration::ZERO {
                TcpStream::connect_timeout(&addr, timeout)
            } else {
                TcpStream::connect(addr)
            };
            match connected {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(SpamdError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no usable address for {}", self.config.address),
            )
        })))
    }

    fn wrap_tls(&self, stream: TcpStream) -> Result<native_tls::TlsStream<TcpStream>, SpamdError> {
        let connector = tls::native::build_connector(&self.config)?;
        let host = tls::extract_host(&self.config.address).to_string();
        let mut handshake = connector.connect(&host, stream);
        loop {
            match handshake {
                Ok(stream) => return Ok(stream),
                Err(native_tls::HandshakeError::WouldBlock(mid)) => {
                    handshake = mid.handshake();
                }
                Err(native_tls::HandshakeError::Failure(err)) => {
                    return Err(SpamdError::Tls(err.to_string()));
                }
            }
        }
    }

    /// std sockets have no absolute deadline; approximate the command
    /// timeout with per-operation read/write timeouts.
    fn apply_command_timeouts(
        &self,
        set_read: impl Fn(Option<Duration>) -> std::io::Result<()>,
        set_write: impl Fn(Option<Duration>) -> std::io::Result<()>,
    ) -> Result<(), SpamdError> {
        let timeout = self.config.command_timeout;
        if timeout > Duration::ZERO {
            set_read(Some(timeout))?;
            set_write(Some(timeout))?;
        }
        Ok(())
    }
}

/// Stream the body onto the socket, through the zlib encoder when
/// compression applies, followed by the trailing CRLF.
fn send_body(
    stream: &mut BoxedReadAndWrite,
    body: Body,
    compress: bool,
) -> Result<(), SpamdError> {
    if compress {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(COPY_CHUNK), Compression::default());
        match body {
            Body::Bytes(bytes) => encoder.write_all(&bytes)?,
            Body::File(mut file) => copy_compressed(stream, &mut file, &mut encoder)?,
            Body::Sized { mut reader, .. } => copy_compressed(stream, &mut reader, &mut encoder)?,
            Body::Unsized(_) => return Err(SpamdError::NoSize),
        }
        let tail = encoder.finish()?;
        stream.write_all(&tail)?;
    } else {
        match body {
            Body::Bytes(bytes) => stream.write_all(&bytes)?,
            Body::File(mut file) => {
                std::io::copy(&mut file, stream)?;
            }
            Body::Sized { mut reader, .. } => {
                std::io::copy(&mut reader, stream)?;
            }
            Body::Unsized(_) => return Err(SpamdError::NoSize),
        }
    }
    stream.write_all(b"\r\n")?;
    Ok(())
}

fn copy_compressed<R>(
    stream: &mut BoxedReadAndWrite,
    reader: &mut R,
    encoder: &mut ZlibEncoder<Vec<u8>>,
) -> Result<(), SpamdError>
where
    R: Read + ?Sized,
{
    let mut chunk = [0u8; COPY_CHUNK];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        encoder.write_all(&chunk[..n])?;
        if encoder.get_ref().len() >= COPY_CHUNK {
            let compressed = std::mem::take(encoder.get_mut());
            stream.write_all(&compressed)?;
        }
    }
}

fn is_timeout(err: &SpamdError) -> bool {
    matches!(
        err,
        SpamdError::Io(io_err) if matches!(
            io_err.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        )
    )
}
