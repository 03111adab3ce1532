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

// Re-export mqtt-protocol-core types

// Packet module with traits and types
pub mod packet {
    // Essential traits
    pub use mqtt_protocol_core::mqtt::packet::{GenericPacketTrait, IsPacketId};

    // Generic packet types
    pub use mqtt_protocol_core::mqtt::packet::{
        GenericPacket, MqttString, Packet, PacketType, Properties, Property, Qos, ReasonString,
        RetainHandling, SubEntry, SubOpts, SubscriptionIdentifier, UserProperty,
    };

    // The session speaks MQTT v5.0 only
    pub mod v5_0 {
        pub use mqtt_protocol_core::mqtt::packet::v5_0::*;
    }
}

pub mod common {
    pub use mqtt_protocol_core::mqtt::common::{ArcPayload, Cursor, IntoPayload};
}

// Result code module
pub mod result_code {
    pub use mqtt_protocol_core::mqtt::result_code::*;
}

// Our own modules
pub mod codec;
pub mod connection_error;
pub mod delivery_flow;
pub mod endpoint;
pub mod id_allocator;
pub mod id_map;
pub mod qos_store;
pub mod session;
pub mod session_option;
pub mod topic;
pub mod transport;

mod flow_registry;
mod incoming;
mod pending_window;
mod request_response;
mod worker;

pub use codec::{CodecError, Decoder};
pub use connection_error::ConnectionError;
pub use delivery_flow::{FlowEvent, FlowId, FlowState, FlowSubscriber, Subscription};
pub use endpoint::Endpoint;
pub use qos_store::{QosMessage, QosRecord};
pub use session::PublishOutcome;
pub use session_option::{SessionOption, SessionOptionBuilder};
pub use topic::{TopicError, TopicFilter};
pub use transport::{TcpTransport, TransportError, TransportOps};
