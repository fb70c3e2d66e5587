//! Stream-object seams the protocol engine writes to and reads from.
//!
//! The SPAMC exchange ends with a half-close of the write side, so the
//! abstractions here carry that operation explicitly where the std traits
//! have no seam for it.

#[cfg(feature = "async")]
mod non_blocking {
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::{TcpStream, UnixStream};
    use tokio_rustls::client::TlsStream;

    /// A duplex async stream the protocol engine can drive. Half-close is
    /// `AsyncWriteExt::shutdown`, which every transport maps to a write-side
    /// shutdown (with a TLS close_notify first where applicable).
    pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}

    impl AsyncReadAndWrite for TcpStream {}
    impl AsyncReadAndWrite for UnixStream {}
    impl AsyncReadAndWrite for TlsStream<TcpStream> {}

    pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;
}

#[cfg(feature = "async")]
pub use non_blocking::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};

#[cfg(feature = "sync")]
mod blocking {
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::os::unix::net::UnixStream;

    /// A duplex blocking stream with an explicit half-close.
    pub trait ReadAndWrite: Read + Write + Send {
        /// Shut the write side down so the server sees EOF while the read
        /// side stays open.
        fn close_write(&mut self) -> std::io::Result<()>;
    }

    impl ReadAndWrite for TcpStream {
        fn close_write(&mut self) -> std::io::Result<()> {
            self.shutdown(Shutdown::Write)
        }
    }

    impl ReadAndWrite for UnixStream {
        fn close_write(&mut self) -> std::io::Result<()> {
            self.shutdown(Shutdown::Write)
        }
    }

    impl ReadAndWrite for native_tls::TlsStream<TcpStream> {
        fn close_write(&mut self) -> std::io::Result<()> {
            // Sends close_notify, then shuts the transport write side down.
            self.shutdown()?;
            self.get_mut().shutdown(Shutdown::Write)
        }
    }

    pub type BoxedReadAndWrite = Box<dyn ReadAndWrite>;
}

#[cfg(feature = "sync")]
pub use blocking::{BoxedReadAndWrite, ReadAndWrite};
