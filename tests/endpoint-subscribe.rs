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

//! SUBSCRIBE/UNSUBSCRIBE window tests
//!
//! The server plays its part through the stub peer: every packet the endpoint
//! writes is decoded with `next_sent()` and answered with `feed()`.

use std::time::Duration;

use mqtt_session_tokio::mqtt_cs::packet::v5_0::Subscribe;
use mqtt_session_tokio::mqtt_cs::packet::{Packet, Qos};
use mqtt_session_tokio::mqtt_cs::result_code::{
    DisconnectReasonCode, PubackReasonCode, SubackReasonCode, UnsubackReasonCode,
};
use mqtt_session_tokio::mqtt_cs::{self, ConnectionError, FlowEvent, FlowState, TopicError};
use tokio::sync::mpsc;

mod common;

use common::packets::{
    disconnect_reason, puback, publish, suback, subscribe, unsuback, unsubscribe,
};
use stub_transport::{StubPeer, StubTransport};

async fn attached_endpoint(window: u16) -> (mqtt_cs::Endpoint, StubPeer) {
    common::init_tracing();
    let option = mqtt_cs::SessionOption::builder()
        .subscribe_window(window)
        .receive_maximum(10u16)
        .build()
        .unwrap();
    let endpoint = mqtt_cs::Endpoint::new(option);
    let (transport, peer) = StubTransport::pair();
    endpoint.attach(transport).await.unwrap();
    (endpoint, peer)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<FlowEvent>) -> FlowEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a flow event")
        .expect("subscriber dropped")
}

async fn expect_subscribe(peer: &mut StubPeer) -> Subscribe {
    match peer.next_sent().await {
        Packet::V5_0Subscribe(subscribe) => subscribe,
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    }
}

#[tokio::test]
async fn window_admits_queued_subscribe_with_freed_packet_id() {
    let (endpoint, mut peer) = attached_endpoint(2).await;
    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let (tx3, _rx3) = mpsc::unbounded_channel();

    let mut s1 = endpoint.subscribe(subscribe(&["s1"]), tx1).unwrap();
    let mut s2 = endpoint.subscribe(subscribe(&["s2"]), tx2).unwrap();
    let _s3 = endpoint.subscribe(subscribe(&["s3"]), tx3).unwrap();

    let first = expect_subscribe(&mut peer).await;
    let second = expect_subscribe(&mut peer).await;
    assert_eq!(first.packet_id(), 11);
    assert_eq!(second.packet_id(), 12);
    assert_eq!(second.entries()[0].topic_filter(), "s2");
    peer.expect_nothing_sent().await;

    peer.feed(suback(12, vec![SubackReasonCode::NotAuthorized]));
    let result = s2.suback().await;
    assert!(matches!(result, Err(ConnectionError::SubAckError(_))));
    assert!(matches!(
        next_event(&mut rx2).await,
        FlowEvent::Error(ConnectionError::SubAckError(_))
    ));

    let third = expect_subscribe(&mut peer).await;
    assert_eq!(third.packet_id(), 12);
    assert_eq!(third.entries()[0].topic_filter(), "s3");

    peer.feed(suback(11, vec![SubackReasonCode::GrantedQos1]));
    let ack = s1.suback().await.unwrap();
    assert_eq!(ack.reason_codes(), vec![SubackReasonCode::GrantedQos1]);
    assert_eq!(s1.state(), FlowState::Active);

    s1.request(1);
    peer.feed(Packet::V5_0Publish(publish("s1", Qos::AtLeastOnce, Some(1), "hello")));
    let FlowEvent::Item(item) = next_event(&mut rx1).await else {
        panic!("expected an item");
    };
    assert_eq!(item.payload().as_slice(), b"hello");
    assert_eq!(peer.next_sent().await, puback(1, PubackReasonCode::Success));
}

#[tokio::test]
async fn suback_for_unknown_packet_id_closes_the_session() {
    let (endpoint, mut peer) = attached_endpoint(2).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscription = endpoint.subscribe(subscribe(&["a"]), tx).unwrap();
    let sent = expect_subscribe(&mut peer).await;

    peer.feed(suback(sent.packet_id() + 1, vec![SubackReasonCode::GrantedQos1]));
    assert_eq!(
        disconnect_reason(&peer.next_sent().await),
        Some(DisconnectReasonCode::ProtocolError)
    );

    assert!(matches!(
        subscription.suback().await,
        Err(ConnectionError::ProtocolViolation(_))
    ));
    assert!(matches!(
        next_event(&mut rx).await,
        FlowEvent::Error(ConnectionError::ProtocolViolation(_))
    ));
    assert_eq!(peer.shutdown_count(), 1);

    assert!(matches!(
        endpoint.publish(publish("a", Qos::AtMostOnce, None, "")).await,
        Err(ConnectionError::SessionClosed)
    ));
    let (transport, _peer) = StubTransport::pair();
    assert!(matches!(
        endpoint.attach(transport).await,
        Err(ConnectionError::SessionClosed)
    ));
}

#[tokio::test]
async fn reason_code_count_mismatch_is_a_protocol_violation() {
    let (endpoint, mut peer) = attached_endpoint(1).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut subscription = endpoint.subscribe(subscribe(&["a", "b"]), tx).unwrap();
    let sent = expect_subscribe(&mut peer).await;

    peer.feed(suback(sent.packet_id(), vec![SubackReasonCode::GrantedQos1]));
    assert_eq!(
        disconnect_reason(&peer.next_sent().await),
        Some(DisconnectReasonCode::ProtocolError)
    );
    assert!(matches!(
        subscription.suback().await,
        Err(ConnectionError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn unsubscribe_completes_the_flow_once() {
    let (endpoint, mut peer) = attached_endpoint(2).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscription = endpoint.subscribe(subscribe(&["u/#"]), tx).unwrap();
    let sent = expect_subscribe(&mut peer).await;
    peer.feed(suback(sent.packet_id(), vec![SubackReasonCode::GrantedQos1]));
    subscription.suback().await.unwrap();
    subscription.request(u64::MAX);

    let (result, ()) = tokio::join!(endpoint.unsubscribe(unsubscribe(&["u/#"])), async {
        let Packet::V5_0Unsubscribe(request) = peer.next_sent().await else {
            panic!("expected UNSUBSCRIBE");
        };
        assert_eq!(request.packet_id(), 11);
        assert_eq!(request.entries()[0].as_str(), "u/#");
        peer.feed(unsuback(request.packet_id(), vec![UnsubackReasonCode::Success]));
    });
    assert_eq!(result.unwrap().reason_codes(), vec![UnsubackReasonCode::Success]);
    assert!(matches!(next_event(&mut rx).await, FlowEvent::Complete));
    assert_eq!(subscription.state(), FlowState::Done);

    peer.feed(Packet::V5_0Publish(publish("u/x", Qos::AtLeastOnce, Some(3), "")));
    assert_eq!(
        peer.next_sent().await,
        puback(3, PubackReasonCode::NoMatchingSubscribers)
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unsuback_with_only_errors_fails_the_request() {
    let (endpoint, mut peer) = attached_endpoint(2).await;
    let (result, ()) = tokio::join!(endpoint.unsubscribe(unsubscribe(&["never/subscribed"])), async {
        let Packet::V5_0Unsubscribe(request) = peer.next_sent().await else {
            panic!("expected UNSUBSCRIBE");
        };
        peer.feed(unsuback(request.packet_id(), vec![UnsubackReasonCode::NotAuthorized]));
    });
    assert!(matches!(result, Err(ConnectionError::UnsubAckError(_))));
}

#[tokio::test]
async fn invalid_topic_filter_is_refused_before_sending() {
    let (endpoint, mut peer) = attached_endpoint(2).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        endpoint.subscribe(subscribe(&["a/#/b"]), tx),
        Err(ConnectionError::TopicFilter(TopicError::MisplacedWildcard(_)))
    ));
    assert!(matches!(
        endpoint.unsubscribe(unsubscribe(&["a+"])).await,
        Err(ConnectionError::TopicFilter(_))
    ));
    peer.expect_nothing_sent().await;
}

#[tokio::test]
async fn close_fails_exchanges_in_flight() {
    let (endpoint, mut peer) = attached_endpoint(1).await;
    let (tx1, _rx1) = mpsc::unbounded_channel();
    let (tx2, _rx2) = mpsc::unbounded_channel();
    let mut sent = endpoint.subscribe(subscribe(&["a"]), tx1).unwrap();
    let mut queued = endpoint.subscribe(subscribe(&["b"]), tx2).unwrap();
    expect_subscribe(&mut peer).await;

    endpoint.close().await.unwrap();
    assert!(matches!(sent.suback().await, Err(ConnectionError::NotConnected)));
    assert!(matches!(queued.suback().await, Err(ConnectionError::NotConnected)));
    assert_eq!(peer.shutdown_count(), 1);

    let (tx3, _rx3) = mpsc::unbounded_channel();
    let mut detached = endpoint.subscribe(subscribe(&["c"]), tx3).unwrap();
    assert!(matches!(detached.suback().await, Err(ConnectionError::NotConnected)));
}
