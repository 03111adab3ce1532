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

use std::collections::HashSet;

use derive_builder::Builder;
use getset::{CopyGetters, Getters};

use crate::mqtt_cs::qos_store::QosRecord;

/// Session configuration.
///
/// Most values mirror what the server advertised in its CONNACK; the rest size
/// the queues between the protocol task, the transport and the callback
/// workers.
///
/// ```
/// use mqtt_session_tokio::mqtt_cs::SessionOption;
///
/// let option = SessionOption::builder()
///     .subscribe_window(2u16)
///     .receive_maximum(20u16)
///     .subscription_identifier_maximum(100u32)
///     .build()
///     .unwrap();
/// assert_eq!(option.publish_id_max(), 20);
/// assert_eq!(option.worker_count(), 1);
/// ```
#[derive(Debug, Clone, Builder, Getters, CopyGetters)]
#[builder(
    derive(Debug),
    pattern = "owned",
    setter(into),
    build_fn(validate = "Self::validate")
)]
pub struct SessionOption {
    /// Maximum number of SUBSCRIBE/UNSUBSCRIBE exchanges in flight at once.
    ///
    /// # Default
    /// 10
    #[builder(default = "10")]
    #[getset(get_copy = "pub")]
    subscribe_window: u16,

    /// Receive Maximum advertised by the server. Bounds the number of QoS 1/2
    /// publishes in flight.
    ///
    /// # Default
    /// 65535
    #[builder(default = "u16::MAX")]
    #[getset(get_copy = "pub")]
    receive_maximum: u16,

    /// Subscription Identifier range advertised as available by the server.
    /// 0 sends no subscription identifiers.
    ///
    /// # Default
    /// 0
    #[builder(default = "0")]
    #[getset(get_copy = "pub")]
    subscription_identifier_maximum: u32,

    /// Maximum Packet Size advertised by the server.
    ///
    /// # Default
    /// None (unlimited)
    #[builder(default, setter(into, strip_option))]
    #[getset(get_copy = "pub")]
    maximum_packet_size: Option<u32>,

    /// Largest inbound packet accepted from the server. A larger frame is
    /// refused from its fixed header and the session disconnects with
    /// reason code 0x95.
    ///
    /// # Default
    /// 1048576
    #[builder(default = "1_048_576")]
    #[getset(get_copy = "pub")]
    receive_maximum_packet_size: u32,

    /// Number of workers running application callbacks.
    ///
    /// # Default
    /// 1
    #[builder(default = "1")]
    #[getset(get_copy = "pub")]
    worker_count: usize,

    /// Capacity of each worker's queue. The protocol task waits when full.
    ///
    /// # Default
    /// 1024
    #[builder(default = "1024")]
    #[getset(get_copy = "pub")]
    worker_queue_capacity: usize,

    /// Inbound publishes held while waiting for demand. QoS 0 publishes
    /// arriving once this many are queued are dropped. QoS 1/2 publishes are
    /// always queued since their acknowledgements are withheld.
    ///
    /// # Default
    /// 64
    #[builder(default = "64")]
    #[getset(get_copy = "pub")]
    incoming_queue_capacity: usize,

    /// # Default
    /// 4096
    #[builder(default = "4096")]
    #[getset(get_copy = "pub")]
    recv_buffer_size: usize,

    /// Graceful transport shutdown timeout in milliseconds.
    ///
    /// # Default
    /// 5000
    #[builder(default = "5000")]
    #[getset(get_copy = "pub")]
    shutdown_timeout_ms: u64,

    /// Unacknowledged outgoing exchanges saved by an earlier session,
    /// retransmitted on the next attach.
    #[builder(default)]
    #[getset(get = "pub")]
    restore_records: Vec<QosRecord>,

    /// Inbound QoS 2 packet ids already acknowledged with PUBREC by an earlier
    /// session.
    #[builder(default)]
    #[getset(get = "pub")]
    restore_qos2_received: HashSet<u16>,
}

impl SessionOption {
    pub fn builder() -> SessionOptionBuilder {
        SessionOptionBuilder::default()
    }

    /// Highest packet id used for QoS 1/2 publishes. Ids above it, up to
    /// `publish_id_max() + subscribe_window`, belong to SUBSCRIBE/UNSUBSCRIBE.
    pub fn publish_id_max(&self) -> u16 {
        self.receive_maximum
            .min(u16::MAX - self.subscribe_window)
    }

    /// Split off the restore data, leaving it empty in `self`.
    pub(crate) fn take_restore_data(&mut self) -> (Vec<QosRecord>, HashSet<u16>) {
        (
            std::mem::take(&mut self.restore_records),
            std::mem::take(&mut self.restore_qos2_received),
        )
    }
}

impl SessionOptionBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.subscribe_window == Some(0) {
            return Err("subscribe_window must be at least 1".into());
        }
        if self.subscribe_window == Some(u16::MAX) {
            return Err("subscribe_window must leave room for publish ids".into());
        }
        if self.receive_maximum == Some(0) {
            return Err("receive_maximum must be at least 1".into());
        }
        if self.subscription_identifier_maximum > Some(268_435_455) {
            return Err("subscription_identifier_maximum exceeds 268435455".into());
        }
        if matches!(self.receive_maximum_packet_size, Some(size) if size < 2) {
            return Err("receive_maximum_packet_size must be at least 2".into());
        }
        for (name, value) in [
            ("worker_count", self.worker_count),
            ("worker_queue_capacity", self.worker_queue_capacity),
            ("incoming_queue_capacity", self.incoming_queue_capacity),
            ("recv_buffer_size", self.recv_buffer_size),
        ] {
            if value == Some(0) {
                return Err(format!("{name} must be at least 1"));
            }
        }
        Ok(())
    }
}

impl Default for SessionOption {
    fn default() -> Self {
        Self {
            subscribe_window: 10,
            receive_maximum: u16::MAX,
            subscription_identifier_maximum: 0,
            maximum_packet_size: None,
            receive_maximum_packet_size: 1_048_576,
            worker_count: 1,
            worker_queue_capacity: 1024,
            incoming_queue_capacity: 64,
            recv_buffer_size: 4096,
            shutdown_timeout_ms: 5000,
            restore_records: Vec::new(),
            restore_qos2_received: HashSet::new(),
        }
    }
}
