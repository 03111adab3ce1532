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
#![allow(dead_code)]

//! Packet builders for the server side of the integration tests.

use mqtt_session_tokio::mqtt_cs::packet::v5_0::{
    Disconnect, Puback, Pubcomp, Pubrec, Pubrel, Publish, Suback, Subscribe, Unsuback,
    Unsubscribe,
};
use mqtt_session_tokio::mqtt_cs::packet::{Packet, Qos, SubEntry, SubOpts};
use mqtt_session_tokio::mqtt_cs::result_code::{
    DisconnectReasonCode, PubackReasonCode, PubcompReasonCode, PubrecReasonCode,
    PubrelReasonCode, SubackReasonCode, UnsubackReasonCode,
};

/// SUBSCRIBE at QoS 1. The packet id is a placeholder the session replaces.
pub fn subscribe(filters: &[&str]) -> Subscribe {
    let entries: Vec<SubEntry> = filters
        .iter()
        .map(|filter| SubEntry::new(*filter, SubOpts::new().set_qos(Qos::AtLeastOnce)).unwrap())
        .collect();
    Subscribe::builder()
        .packet_id(1)
        .entries(entries)
        .build()
        .unwrap()
}

pub fn unsubscribe(filters: &[&str]) -> Unsubscribe {
    Unsubscribe::builder()
        .packet_id(1)
        .entries(filters.iter().copied())
        .unwrap()
        .build()
        .unwrap()
}

pub fn publish(topic: &str, qos: Qos, packet_id: Option<u16>, payload: &str) -> Publish {
    Publish::builder()
        .topic_name(topic)
        .unwrap()
        .qos(qos)
        .packet_id(packet_id)
        .payload(payload.to_string())
        .build()
        .unwrap()
}

pub fn suback(packet_id: u16, reason_codes: Vec<SubackReasonCode>) -> Packet {
    Packet::V5_0Suback(
        Suback::builder()
            .packet_id(packet_id)
            .reason_codes(reason_codes)
            .build()
            .unwrap(),
    )
}

pub fn unsuback(packet_id: u16, reason_codes: Vec<UnsubackReasonCode>) -> Packet {
    Packet::V5_0Unsuback(
        Unsuback::builder()
            .packet_id(packet_id)
            .reason_codes(reason_codes)
            .build()
            .unwrap(),
    )
}

pub fn puback(packet_id: u16, reason_code: PubackReasonCode) -> Packet {
    Packet::V5_0Puback(
        Puback::builder()
            .packet_id(packet_id)
            .reason_code(reason_code)
            .build()
            .unwrap(),
    )
}

pub fn pubrec(packet_id: u16, reason_code: PubrecReasonCode) -> Packet {
    Packet::V5_0Pubrec(
        Pubrec::builder()
            .packet_id(packet_id)
            .reason_code(reason_code)
            .build()
            .unwrap(),
    )
}

pub fn pubrel(packet_id: u16) -> Packet {
    Packet::V5_0Pubrel(
        Pubrel::builder()
            .packet_id(packet_id)
            .reason_code(PubrelReasonCode::Success)
            .build()
            .unwrap(),
    )
}

pub fn pubcomp(packet_id: u16, reason_code: PubcompReasonCode) -> Packet {
    Packet::V5_0Pubcomp(
        Pubcomp::builder()
            .packet_id(packet_id)
            .reason_code(reason_code)
            .build()
            .unwrap(),
    )
}

pub fn disconnect(reason_code: DisconnectReasonCode) -> Packet {
    Packet::V5_0Disconnect(Disconnect::builder().reason_code(reason_code).build().unwrap())
}

/// Reason code of a DISCONNECT written by the endpoint.
pub fn disconnect_reason(packet: &Packet) -> Option<DisconnectReasonCode> {
    match packet {
        Packet::V5_0Disconnect(disconnect) => disconnect.reason_code(),
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
}
