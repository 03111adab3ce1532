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

//! Session-level framing rules on top of the `mqtt-protocol-core` v5.0
//! packets.
//!
//! [`Decoder`] splits the inbound byte stream into packets and refuses frames
//! above the receive limit before their body is buffered. [`fit`] applies the
//! server's Maximum Packet Size to outgoing packets. The remaining helpers
//! rebuild application packets with the packet identifiers the session owns.

use std::fmt;

use mqtt_protocol_core::mqtt::common::Cursor;
use mqtt_protocol_core::mqtt::connection::{PacketBuildResult, PacketBuilder, PacketData, RawPacket};

use crate::mqtt_cs::packet::{
    v5_0, GenericPacketTrait, Packet, Properties, Property, ReasonString, SubscriptionIdentifier,
};
use crate::mqtt_cs::result_code::{
    DisconnectReasonCode, MqttError, PubackReasonCode, PubcompReasonCode, PubrecReasonCode,
    PubrelReasonCode,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Rejected by the packet layer: malformed input, a frame above the
    /// receive limit, or a packet that cannot be built.
    #[error("invalid packet: {0}")]
    Invalid(#[from] MqttError),
    #[error("packet of {size} bytes exceeds maximum packet size {maximum}")]
    PacketTooLarge { size: usize, maximum: u32 },
}

impl CodecError {
    /// Reason code of the DISCONNECT sent when inbound data is rejected.
    pub fn disconnect_reason_code(&self) -> DisconnectReasonCode {
        match self {
            Self::Invalid(MqttError::PacketTooLarge) | Self::PacketTooLarge { .. } => {
                DisconnectReasonCode::PacketTooLarge
            }
            Self::Invalid(MqttError::ProtocolError) => DisconnectReasonCode::ProtocolError,
            Self::Invalid(_) => DisconnectReasonCode::MalformedPacket,
        }
    }
}

/// Incremental decoder of the inbound byte stream.
///
/// Partial packets are kept across calls, so the caller may hand over reads of
/// any size.
pub struct Decoder {
    builder: PacketBuilder,
    maximum_packet_size: u32,
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("maximum_packet_size", &self.maximum_packet_size)
            .finish()
    }
}

impl Decoder {
    /// `maximum_packet_size` bounds a whole frame, fixed header included.
    pub fn new(maximum_packet_size: u32) -> Self {
        Self {
            builder: PacketBuilder::with_maximum_packet_size(maximum_packet_size),
            maximum_packet_size,
        }
    }

    /// Forget any partial packet.
    pub fn reset(&mut self) {
        self.builder.reset();
    }

    /// Decode the next packet from `cursor`.
    ///
    /// `Ok(None)` once the cursor is exhausted without completing a packet.
    /// After an error the stream is unusable and the decoder should be reset
    /// together with the transport.
    pub fn decode(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<Option<Packet>, CodecError> {
        match self.builder.feed(cursor) {
            PacketBuildResult::Complete(raw) => parse(&raw).map(Some),
            PacketBuildResult::Incomplete => Ok(None),
            PacketBuildResult::Error(error) => Err(error.into()),
        }
    }
}

fn parse(raw: &RawPacket) -> Result<Packet, CodecError> {
    let packet_type = raw.packet_type();
    let flags = raw.flags();
    let reserved_flags = match packet_type {
        3 => flags,
        6 | 8 | 10 => 0x02,
        _ => 0x00,
    };
    if flags != reserved_flags {
        return Err(MqttError::MalformedPacket.into());
    }
    let packet = match packet_type {
        1 => Packet::V5_0Connect(raw.parse_exact(v5_0::Connect::parse)?),
        2 => Packet::V5_0Connack(raw.parse_exact(v5_0::Connack::parse)?),
        3 => match &raw.data {
            PacketData::Publish(data) => Packet::V5_0Publish(v5_0::Publish::parse(flags, data.clone())?.0),
            PacketData::Normal(_) => return Err(MqttError::MalformedPacket.into()),
        },
        4 => Packet::V5_0Puback(raw.parse_exact(v5_0::Puback::parse)?),
        5 => Packet::V5_0Pubrec(raw.parse_exact(v5_0::Pubrec::parse)?),
        6 => Packet::V5_0Pubrel(raw.parse_exact(v5_0::Pubrel::parse)?),
        7 => Packet::V5_0Pubcomp(raw.parse_exact(v5_0::Pubcomp::parse)?),
        8 => Packet::V5_0Subscribe(raw.parse_exact(v5_0::Subscribe::parse)?),
        9 => Packet::V5_0Suback(raw.parse_exact(v5_0::Suback::parse)?),
        10 => Packet::V5_0Unsubscribe(raw.parse_exact(v5_0::Unsubscribe::parse)?),
        11 => Packet::V5_0Unsuback(raw.parse_exact(v5_0::Unsuback::parse)?),
        12 => Packet::V5_0Pingreq(raw.parse_exact(v5_0::Pingreq::parse)?),
        13 => Packet::V5_0Pingresp(raw.parse_exact(v5_0::Pingresp::parse)?),
        14 => Packet::V5_0Disconnect(raw.parse_exact(v5_0::Disconnect::parse)?),
        15 => Packet::V5_0Auth(raw.parse_exact(v5_0::Auth::parse)?),
        _ => return Err(MqttError::MalformedPacket.into()),
    };
    Ok(packet)
}

/// Packet identifier of `packet`, if its type carries one.
pub fn packet_id(packet: &Packet) -> Option<u16> {
    match packet {
        Packet::V5_0Publish(p) => p.packet_id(),
        Packet::V5_0Puback(p) => Some(p.packet_id()),
        Packet::V5_0Pubrec(p) => Some(p.packet_id()),
        Packet::V5_0Pubrel(p) => Some(p.packet_id()),
        Packet::V5_0Pubcomp(p) => Some(p.packet_id()),
        Packet::V5_0Subscribe(p) => Some(p.packet_id()),
        Packet::V5_0Suback(p) => Some(p.packet_id()),
        Packet::V5_0Unsubscribe(p) => Some(p.packet_id()),
        Packet::V5_0Unsuback(p) => Some(p.packet_id()),
        _ => None,
    }
}

/// Make `packet` fit the server's Maximum Packet Size.
///
/// PUBACK, PUBREC, PUBREL, PUBCOMP and DISCONNECT lose their User Properties,
/// then their Reason String, until they fit. Anything still too large fails
/// with [`CodecError::PacketTooLarge`].
pub fn fit(packet: Packet, maximum_packet_size: Option<u32>) -> Result<Packet, CodecError> {
    let Some(maximum) = maximum_packet_size else {
        return Ok(packet);
    };
    let size = packet.size();
    if size <= maximum as usize {
        return Ok(packet);
    }
    for drop_reason_string in [false, true] {
        match reduced(&packet, drop_reason_string)? {
            Some(smaller) if smaller.size() <= maximum as usize => {
                tracing::debug!(size, maximum, drop_reason_string, "optional properties omitted");
                return Ok(smaller);
            }
            Some(_) => {}
            None => break,
        }
    }
    Err(CodecError::PacketTooLarge { size, maximum })
}

/// Properties left after dropping User Properties and, if asked, the Reason
/// String. `None` when nothing is left.
fn optional_props_dropped(props: Option<&Properties>, drop_reason_string: bool) -> Option<Properties> {
    let kept: Properties = props?
        .iter()
        .filter(|prop| match prop {
            Property::UserProperty(_) => false,
            Property::ReasonString(_) => !drop_reason_string,
            _ => true,
        })
        .cloned()
        .collect();
    (!kept.is_empty()).then_some(kept)
}

macro_rules! rebuild_ack {
    ($variant:ident, $ty:ty, $ack:expr, $drop_reason_string:expr) => {{
        let ack = $ack;
        let mut builder = <$ty>::builder().packet_id(ack.packet_id());
        if let Some(reason_code) = ack.reason_code() {
            builder = builder.reason_code(reason_code);
        }
        if let Some(props) = optional_props_dropped(ack.props().as_ref(), $drop_reason_string) {
            builder = builder.props(props);
        }
        Packet::$variant(builder.build()?)
    }};
}

fn reduced(packet: &Packet, drop_reason_string: bool) -> Result<Option<Packet>, MqttError> {
    let packet = match packet {
        Packet::V5_0Puback(ack) => rebuild_ack!(V5_0Puback, v5_0::Puback, ack, drop_reason_string),
        Packet::V5_0Pubrec(ack) => rebuild_ack!(V5_0Pubrec, v5_0::Pubrec, ack, drop_reason_string),
        Packet::V5_0Pubrel(ack) => rebuild_ack!(V5_0Pubrel, v5_0::Pubrel, ack, drop_reason_string),
        Packet::V5_0Pubcomp(ack) => rebuild_ack!(V5_0Pubcomp, v5_0::Pubcomp, ack, drop_reason_string),
        Packet::V5_0Disconnect(disconnect) => {
            let mut builder = v5_0::Disconnect::builder();
            if let Some(reason_code) = disconnect.reason_code() {
                builder = builder.reason_code(reason_code);
            }
            if let Some(props) =
                optional_props_dropped(disconnect.props().as_ref(), drop_reason_string)
            {
                builder = builder.props(props);
            }
            Packet::V5_0Disconnect(builder.build()?)
        }
        _ => return Ok(None),
    };
    Ok(Some(packet))
}

/// Copy of `publish` carrying `packet_id`, DUP cleared.
pub(crate) fn publish_with_id(
    publish: &v5_0::Publish,
    packet_id: Option<u16>,
) -> Result<v5_0::Publish, MqttError> {
    v5_0::Publish::builder()
        .topic_name(publish.topic_name())?
        .qos(publish.qos())
        .retain(publish.retain())
        .packet_id(packet_id)
        .payload(publish.payload().clone())
        .props(publish.props().clone())
        .build()
}

/// Copy of `subscribe` carrying `packet_id` and `subscription_id`. A
/// Subscription Identifier set by the caller is replaced.
pub(crate) fn subscribe_with_id(
    subscribe: &v5_0::Subscribe,
    packet_id: u16,
    subscription_id: Option<u32>,
) -> Result<v5_0::Subscribe, MqttError> {
    let mut props: Properties = subscribe
        .props()
        .iter()
        .filter(|prop| !matches!(prop, Property::SubscriptionIdentifier(_)))
        .cloned()
        .collect();
    if let Some(id) = subscription_id {
        props.push(SubscriptionIdentifier::new(id)?.into());
    }
    v5_0::Subscribe::builder()
        .packet_id(packet_id)
        .entries(subscribe.entries().clone())
        .props(props)
        .build()
}

pub(crate) fn unsubscribe_with_id(
    unsubscribe: &v5_0::Unsubscribe,
    packet_id: u16,
) -> Result<v5_0::Unsubscribe, MqttError> {
    v5_0::Unsubscribe::builder()
        .packet_id(packet_id)
        .entries(unsubscribe.entries().iter().map(|entry| entry.as_str()))?
        .props(unsubscribe.props().clone())
        .build()
}

pub(crate) fn puback(packet_id: u16, reason_code: PubackReasonCode) -> Result<Packet, MqttError> {
    let ack = v5_0::Puback::builder()
        .packet_id(packet_id)
        .reason_code(reason_code)
        .build()?;
    Ok(Packet::V5_0Puback(ack))
}

pub(crate) fn pubrec(packet_id: u16, reason_code: PubrecReasonCode) -> Result<Packet, MqttError> {
    let ack = v5_0::Pubrec::builder()
        .packet_id(packet_id)
        .reason_code(reason_code)
        .build()?;
    Ok(Packet::V5_0Pubrec(ack))
}

pub(crate) fn pubrel(packet_id: u16) -> Result<v5_0::Pubrel, MqttError> {
    v5_0::Pubrel::builder()
        .packet_id(packet_id)
        .reason_code(PubrelReasonCode::Success)
        .build()
}

pub(crate) fn pubcomp(packet_id: u16, reason_code: PubcompReasonCode) -> Result<Packet, MqttError> {
    let ack = v5_0::Pubcomp::builder()
        .packet_id(packet_id)
        .reason_code(reason_code)
        .build()?;
    Ok(Packet::V5_0Pubcomp(ack))
}

pub(crate) fn disconnect(reason_code: DisconnectReasonCode, reason: &str) -> Result<Packet, MqttError> {
    let disconnect = v5_0::Disconnect::builder()
        .reason_code(reason_code)
        .props(vec![ReasonString::new(reason)?.into()])
        .build()?;
    Ok(Packet::V5_0Disconnect(disconnect))
}
