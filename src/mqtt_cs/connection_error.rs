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

use std::sync::Arc;

use crate::mqtt_cs::codec::CodecError;
use crate::mqtt_cs::packet::v5_0::{Suback, Unsuback};
use crate::mqtt_cs::topic::TopicError;
use crate::mqtt_cs::transport::TransportError;

/// Error type of every session operation.
///
/// # Error Hierarchy
///
/// ```text
/// ConnectionError
/// ├── ProtocolViolation(String) - peer broke the protocol, session torn down
/// ├── SubAckError(Suback)       - every filter of a SUBSCRIBE was refused
/// ├── UnsubAckError(Unsuback)   - every filter of an UNSUBSCRIBE was refused
/// ├── Transport(TransportError) - I/O failure on the byte stream
/// ├── Codec(CodecError)         - packet could not be encoded or decoded
/// ├── TopicFilter(TopicError)   - a request carried an invalid topic filter
/// ├── NotConnected              - no transport attached
/// ├── AlreadyConnected          - a transport is already attached
/// ├── ChannelClosed             - the protocol task is gone
/// └── SessionClosed             - the session was closed by a protocol violation
/// ```
///
/// Only `ProtocolViolation` is fatal to the session. Every other variant
/// affects the single request it is returned for.
///
/// The error is `Clone` so one failure can be handed to every waiting caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// The peer violated the protocol, e.g. acknowledged an unknown packet
    /// identifier or returned the wrong number of reason codes. The session
    /// sends DISCONNECT with reason code 0x82 and stops.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// SUBACK containing only error reason codes.
    #[error("SUBACK contains only error codes: {:?}", .0.reason_codes())]
    SubAckError(Suback),

    /// UNSUBACK containing only error reason codes.
    #[error("UNSUBACK contains only error codes: {:?}", .0.reason_codes())]
    UnsubAckError(Unsuback),

    #[error("transport error: {0}")]
    Transport(Arc<TransportError>),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Rejected before anything was sent.
    #[error("invalid topic filter: {0}")]
    TopicFilter(#[from] TopicError),

    /// The operation needs an attached transport.
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    /// The protocol task has stopped, or a result was requested twice.
    #[error("internal channel closed")]
    ChannelClosed,

    #[error("session closed")]
    SessionClosed,
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        ConnectionError::Transport(Arc::new(e))
    }
}
