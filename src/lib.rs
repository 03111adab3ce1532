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

//! # MQTT Session Tokio
//!
//! Client-side MQTT v5.0 session engine for tokio. It sits between an
//! established MQTT connection and application code, and owns the parts of a
//! session that outlive single packets:
//!
//! - a bounded window of SUBSCRIBE/UNSUBSCRIBE exchanges with FIFO overflow
//! - QoS 1/2 publish exchanges, stored until fully acknowledged and resent
//!   after a reconnect
//! - demand-gated delivery of inbound publishes to per-subscription flows
//! - acknowledgement of inbound QoS 1/2 publishes once they are delivered
//!
//! All protocol state lives in one tokio task. Application callbacks run on
//! worker threads, so a slow subscriber never stalls the protocol.
//!
//! ## Quick Start
//!
//! ```ignore
//! use mqtt_session_tokio::mqtt_cs;
//!
//! let endpoint = mqtt_cs::Endpoint::new(mqtt_cs::SessionOption::default());
//! // CONNECT/CONNACK already exchanged on `stream`
//! endpoint.attach(mqtt_cs::TcpTransport::from_stream(stream)).await?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let opts = mqtt_cs::packet::SubOpts::new().set_qos(mqtt_cs::packet::Qos::AtLeastOnce);
//! let subscribe = mqtt_cs::packet::v5_0::Subscribe::builder()
//!     .packet_id(1) // replaced by the session
//!     .entries(vec![mqtt_cs::packet::SubEntry::new("sensors/+/temp", opts)?])
//!     .build()?;
//! let mut subscription = endpoint.subscribe(subscribe, tx)?;
//! subscription.suback().await?;
//! subscription.request(10);
//! while let Some(mqtt_cs::FlowEvent::Item(publish)) = rx.recv().await {
//!     println!("{}: {:?}", publish.topic_name(), publish.payload().as_slice());
//!     subscription.request(1);
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`mqtt_cs::endpoint`]: the protocol task and its async API
//! - [`mqtt_cs::delivery_flow`]: subscription handles and subscriber callbacks
//! - [`mqtt_cs::session_option`]: configuration
//! - [`mqtt_cs::packet`]: MQTT v5.0 packets from `mqtt-protocol-core`
//! - [`mqtt_cs::codec`]: framing and size rules applied to those packets
//! - [`mqtt_cs::transport`]: transport trait and TCP implementation
//! - [`mqtt_cs::connection_error`]: error type of every operation

pub mod mqtt_cs;
