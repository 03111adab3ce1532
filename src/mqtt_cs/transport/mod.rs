// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Byte-stream transports the session engine runs over.
//!
//! The engine only needs an ordered, reliable byte stream. [`TcpTransport`] is
//! provided; TLS, WebSocket or in-memory streams plug in by implementing
//! [`TransportOps`].

mod tcp;

pub use tcp::TcpTransport;

use std::future::Future;
use std::io::IoSlice;
use std::pin::Pin;
use tokio::time::Duration;

/// Errors raised by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport not connected")]
    NotConnected,
}

/// Operations the protocol task performs on its transport.
///
/// All three are driven from the single protocol task, never concurrently.
///
/// # Examples
///
/// ```rust
/// use mqtt_session_tokio::mqtt_cs::transport::{TransportError, TransportOps};
/// use std::future::Future;
/// use std::io::IoSlice;
/// use std::pin::Pin;
/// use tokio::time::Duration;
///
/// /// Discards everything written and never receives.
/// struct Sink;
///
/// impl TransportOps for Sink {
///     fn send<'a>(
///         &'a mut self,
///         _buffers: &'a [IoSlice<'a>],
///     ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
///         Box::pin(async move { Ok(()) })
///     }
///
///     fn recv<'a>(
///         &'a mut self,
///         _buffer: &'a mut [u8],
///     ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
///         Box::pin(std::future::pending())
///     }
///
///     fn shutdown<'a>(&'a mut self, _timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
///         Box::pin(async move {})
///     }
/// }
/// ```
pub trait TransportOps {
    /// Write every byte of `buffers`, in order.
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Read available bytes into `buffer`. `Ok(0)` means the peer closed the stream.
    ///
    /// Must be cancel safe: the protocol task drops a pending `recv` whenever
    /// another event wins its `select!`.
    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>>;

    /// Close the stream, forcibly once `timeout` expires.
    fn shutdown<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

impl TransportOps for Box<dyn TransportOps + Send> {
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        (**self).send(buffers)
    }

    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
        (**self).recv(buffer)
    }

    fn shutdown<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        (**self).shutdown(timeout)
    }
}
