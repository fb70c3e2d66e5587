use std::io::Write;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UnixStream};
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::backend::tls;
use crate::backend::traits::BoxedAsyncReadAndWrite;
use crate::config::{Config, Network};
use crate::error::SpamdError;
use crate::protocol::codec::StatusCode;
use crate::protocol::commands::{MessageClass, RequestFrame, SpamdCommand, TellAction};
use crate::protocol::reply::{parse_reply, SpamdReply};

const COPY_CHUNK: usize = 8192;

/// Message body handed to a command. The content length must be derivable
/// without consuming the reader, so unsized streams are rejected when the
/// request is framed.
pub enum Body {
    Bytes(Bytes),
    File(tokio::fs::File),
    Sized {
        len: u64,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    },
    Unsized(Box<dyn AsyncRead + Send + Unpin>),
}

impl Body {
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Body> {
        Ok(Body::File(tokio::fs::File::open(path).await?))
    }

    async fn content_length(&self) -> Result<u64, SpamdError> {
        match self {
            Body::Bytes(bytes) => Ok(bytes.len() as u64),
            Body::File(file) => Ok(file.metadata().await?.len()),
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

impl From<tokio::fs::File> for Body {
    fn from(file: tokio::fs::File) -> Body {
        Body::File(file)
    }
}

/// Asynchronous spamd client. Each command dials a fresh connection and
/// releases it before returning; the handle itself holds no socket state.
pub struct AsyncClient {
    config: Config,
}

impl AsyncClient {
    /// Create a client for the given endpoint. Empty network and address
    /// select the default unix socket.
    pub fn new(
        network: &str,
        address: &str,
        user: &str,
        use_compression: bool,
    ) -> Result<AsyncClient, SpamdError> {
        Ok(AsyncClient {
            config: Config::for_endpoint(network, address, user, use_compression)?,
        })
    }

    pub fn with_config(config: Config) -> Result<AsyncClient, SpamdError> {
        config.validate()?;
        Ok(AsyncClient { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable access to the client policy (compression, TLS, timeouts, ...).
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Check a message with a CHECK request.
    pub async fn check(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Check, Some(message.into()), None).await
    }

    /// Check a message with a HEADERS request, returning the rewritten
    /// message headers.
    pub async fn headers(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Headers, Some(message.into()), None)
            .await
    }

    /// Ping the server; true when it answered with EX_OK.
    pub async fn ping(&self) -> Result<bool, SpamdError> {
        let reply = self.cmd(SpamdCommand::Ping, None, None).await?;
        Ok(reply.status_code == StatusCode::ExOk)
    }

    /// Check a message with a PROCESS request, returning the rewritten
    /// message.
    pub async fn process(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Process, Some(message.into()), None)
            .await
    }

    /// Check a message with a REPORT request, returning the scored rules.
    pub async fn report(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Report, Some(message.into()), None)
            .await
    }

    /// Check a message with a REPORT_IFSPAM request; the report body is only
    /// present when the message scored as spam.
    pub async fn report_if_spam(
        &self,
        message: impl Into<Body>,
    ) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::ReportIfSpam, Some(message.into()), None)
            .await
    }

    /// Check a message with a SYMBOLS request, returning the matched rule
    /// names.
    pub async fn symbols(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.cmd(SpamdCommand::Symbols, Some(message.into()), None)
            .await
    }

    /// Ask the server to act on a message with a TELL request. The message
    /// class must be set to ham or spam before any bytes are written.
    pub async fn tell(
        &self,
        message: impl Into<Body>,
        class: MessageClass,
        action: TellAction,
    ) -> Result<SpamdReply, SpamdError> {
        if !class.is_set() {
            return Err(SpamdError::Config("Set the correct learn type".to_string()));
        }
        self.cmd(SpamdCommand::Tell, Some(message.into()), Some((action, class)))
            .await
    }

    /// Have the server learn tokens from a message.
    pub async fn learn(
        &self,
        message: impl Into<Body>,
        class: MessageClass,
    ) -> Result<SpamdReply, SpamdError> {
        self.tell(message, class, TellAction::Learn).await
    }

    /// Have the server revoke tokens learned from a message.
    pub async fn revoke(&self, message: impl Into<Body>) -> Result<SpamdReply, SpamdError> {
        self.tell(message, MessageClass::Ham, TellAction::Revoke).await
    }

    async fn cmd(
        &self,
        command: SpamdCommand,
        body: Option<Body>,
        tell: Option<(TellAction, MessageClass)>,
    ) -> Result<SpamdReply, SpamdError> {
        let content_length = match &body {
            Some(body) => Some(body.content_length().await?),
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
        let mut stream = self.dial().await?;

        let exchange = async {
            stream.write_all(&head).await?;
            if let Some(body) = body {
                send_body(&mut stream, body, compress).await?;
            }
            // Half-close so the server sees EOF on its read path.
            stream.shutdown().await?;

            let mut data = Vec::new();
            stream.read_to_end(&mut data).await?;
            Ok::<Vec<u8>, SpamdError>(data)
        };

        let command_timeout = self.config.command_timeout;
        let data = if command_timeout > Duration::ZERO {
            timeout(command_timeout, exchange)
                .await
                .map_err(|_| SpamdError::CommandTimeout(command_timeout))??
        } else {
            exchange.await?
        };

        parse_reply(command, &data, self.config.return_raw_body)
    }

    /// Dial the configured endpoint, retrying timed-out attempts up to the
    /// configured number of times. Any other error terminates immediately.
    async fn dial(&self) -> Result<BoxedAsyncReadAndWrite, SpamdError> {
        let connect_timeout = self.config.connect_timeout;
        let mut attempt = 0;
        loop {
            let result = if connect_timeout > Duration::ZERO {
                timeout(connect_timeout, self.connect()).await
            } else {
                Ok(self.connect().await)
            };
            let err = match result {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => {
                    if !is_timeout(&err) {
                        return Err(err);
                    }
                    err
                }
                Err(_) => SpamdError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", self.config.address),
                )),
            };
            if attempt >= self.config.connect_retries {
                return Err(err);
            }
            attempt += 1;
            debug!(
                attempt,
                address = %self.config.address,
                "connect timed out, retrying"
            );
            sleep(self.config.connect_sleep).await;
        }
    }

    async fn connect(&self) -> Result<BoxedAsyncReadAndWrite, SpamdError> {
        match self.config.network {
            // No SOCK_SEQPACKET support in tokio; unixpacket degrades to a
            // stream connect.
            Network::Unix | Network::UnixPacket => {
                let stream = UnixStream::connect(&self.config.address).await?;
                Ok(Box::new(stream))
            }
            network => {
                let stream = self.connect_tcp(network).await?;
                if self.config.use_tls {
                    let connector = tls::rustls::build_connector(&self.config)?;
                    let name = tls::rustls::server_name(&self.config.address)?;
                    let stream = connector
                        .connect(name, stream)
                        .await
                        .map_err(|e| SpamdError::Tls(e.to_string()))?;
                    Ok(Box::new(stream))
                } else {
                    Ok(Box::new(stream))
                }
            }
        }
    }

    async fn connect_tcp(&self, network: Network) -> Result<TcpStream, SpamdError> {
        let mut last_err = None;
        for addr in lookup_host(&self.config.address).await? {
            if network == Network::Tcp4 && !addr.is_ipv4() {
                continue;
            }
            if network == Network::Tcp6 && !addr.is_ipv6() {
                continue;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
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
}

/// Stream the body onto the socket, through the zlib encoder when
/// compression applies, followed by the trailing CRLF. The advertised
/// Content-length always refers to the uncompressed bytes.
async fn send_body(
    stream: &mut BoxedAsyncReadAndWrite,
    body: Body,
    compress: bool,
) -> Result<(), SpamdError> {
    if compress {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(COPY_CHUNK), Compression::default());
        match body {
            Body::Bytes(bytes) => encoder.write_all(&bytes)?,
            Body::File(mut file) => copy_compressed(stream, &mut file, &mut encoder).await?,
            Body::Sized { mut reader, .. } => {
                copy_compressed(stream, &mut reader, &mut encoder).await?
            }
            Body::Unsized(_) => return Err(SpamdError::NoSize),
        }
        let tail = encoder.finish()?;
        stream.write_all(&tail).await?;
    } else {
        match body {
            Body::Bytes(bytes) => stream.write_all(&bytes).await?,
            Body::File(mut file) => {
                tokio::io::copy(&mut file, stream).await?;
            }
            Body::Sized { mut reader, .. } => {
                tokio::io::copy(&mut reader, stream).await?;
            }
            Body::Unsized(_) => return Err(SpamdError::NoSize),
        }
    }
    stream.write_all(b"\r\n").await?;
    Ok(())
}

/// Feed the reader through the encoder in chunks, draining the compressed
/// output to the socket as it accumulates.
async fn copy_compressed<R>(
    stream: &mut BoxedAsyncReadAndWrite,
    reader: &mut R,
    encoder: &mut ZlibEncoder<Vec<u8>>,
) -> Result<(), SpamdError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut chunk = [0u8; COPY_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        encoder.write_all(&chunk[..n])?;
        if encoder.get_ref().len() >= COPY_CHUNK {
            let compressed = std::mem::take(encoder.get_mut());
            stream.write_all(&compressed).await?;
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
