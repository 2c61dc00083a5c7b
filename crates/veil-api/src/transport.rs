//! Byte-stream transport over the platform IPC endpoint.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::ipc::IpcEndpoint;

/// A connected IPC byte stream, usable as an HTTP or WebSocket carrier.
#[derive(Debug)]
pub enum IpcStream {
    /// Unix domain socket connection.
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    /// Named pipe client connection.
    #[cfg(windows)]
    Pipe(tokio::net::windows::named_pipe::NamedPipeClient),
}

/// Dial the endpoint, failing fast when the transport does not exist on the
/// current platform.
///
/// # Errors
/// Fails when the endpoint cannot be dialed or is not supported here.
pub async fn connect(endpoint: &IpcEndpoint) -> io::Result<IpcStream> {
    match endpoint {
        #[cfg(unix)]
        IpcEndpoint::Unix(path) => Ok(IpcStream::Unix(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(windows)]
        IpcEndpoint::Pipe(name) => connect_pipe(name).await,
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("endpoint {endpoint} is not supported on this platform"),
        )),
    }
}

/// Named pipes report busy while the server's accept queue is full, so the
/// dial retries briefly instead of failing outright.
#[cfg(windows)]
async fn connect_pipe(name: &str) -> io::Result<IpcStream> {
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;
    const ATTEMPTS: u32 = 5;

    let mut last = None;
    for _ in 0..ATTEMPTS {
        match ClientOptions::new().open(name) {
            Ok(client) => return Ok(IpcStream::Pipe(client)),
            Err(error) if error.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                last = Some(error);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            Err(error) => return Err(error),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "named pipe busy")))
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        context: &mut Context<'_>,
        buffer: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_read(context, buffer),
            #[cfg(windows)]
            Self::Pipe(stream) => Pin::new(stream).poll_read(context, buffer),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        context: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_write(context, data),
            #[cfg(windows)]
            Self::Pipe(stream) => Pin::new(stream).poll_write(context, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_flush(context),
            #[cfg(windows)]
            Self::Pipe(stream) => Pin::new(stream).poll_flush(context),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(context),
            #[cfg(windows)]
            Self::Pipe(stream) => Pin::new(stream).poll_shutdown(context),
        }
    }
}
