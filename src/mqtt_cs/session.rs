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

//! Sans-I/O protocol state of one client session.
//!
//! [`Session`] owns every protocol structure and is driven by the protocol
//! task: requests from the application, packets from the transport and flow
//! tasks go in, [`Event`]s come out. It never performs I/O itself.

use std::collections::{HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::mqtt_cs::codec::{self, CodecError};
use crate::mqtt_cs::connection_error::ConnectionError;
use crate::mqtt_cs::delivery_flow::{DeliveryFlow, FlowId};
use crate::mqtt_cs::flow_registry::FlowRegistry;
use crate::mqtt_cs::id_allocator::IdAllocator;
use crate::mqtt_cs::id_map::IdMap;
use crate::mqtt_cs::incoming::{IncomingPublish, IncomingQueue};
use crate::mqtt_cs::packet::v5_0::{
    Puback, Pubcomp, Pubrec, Pubrel, Publish, Suback, Subscribe, Unsuback, Unsubscribe,
};
use crate::mqtt_cs::packet::{Packet, Qos};
use crate::mqtt_cs::pending_window::{Admitted, PendingWindow, WindowRequest};
use crate::mqtt_cs::qos_store::{QosMessage, QosRecord, QosStore};
use crate::mqtt_cs::result_code::{
    DisconnectReasonCode, MqttError, PubackReasonCode, PubcompReasonCode, PubrecReasonCode,
};
use crate::mqtt_cs::session_option::SessionOption;
use crate::mqtt_cs::topic::TopicFilter;
use crate::mqtt_cs::worker::Dispatch;

/// Final result of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The QoS 0 publish was written to the transport.
    QoS0,
    Acknowledged(Puback),
    /// PUBREC with an error reason code. The QoS 2 exchange ends there.
    Received(Pubrec),
    Completed(Pubcomp),
}

pub(crate) type PublishResponder = oneshot::Sender<Result<PublishOutcome, ConnectionError>>;
pub(crate) type UnsubAckResponder = oneshot::Sender<Result<Unsuback, ConnectionError>>;

/// What to do once a packet has been written.
#[derive(Debug)]
pub(crate) enum SendCompletion {
    None,
    /// SUBSCRIBE or UNSUBSCRIBE in the window. A failed write fails it.
    Exchange(u16),
    /// QoS 0 publish, complete once written.
    AtMostOnce(PublishResponder),
}

/// Output of the session, processed in order by the protocol task.
#[derive(Debug)]
pub(crate) enum Event {
    /// Write `packet`. It already fits the server's Maximum Packet Size.
    Send {
        packet: Packet,
        completion: SendCompletion,
    },
    Dispatch(Dispatch),
    /// Stop using the transport, writing `disconnect` first if present.
    Close { disconnect: Option<Packet> },
}

#[derive(Debug)]
enum Exchange {
    Subscribe {
        subscribe: Subscribe,
        filters: Vec<TopicFilter>,
        flow: FlowId,
    },
    Unsubscribe {
        unsubscribe: Unsubscribe,
        filters: Vec<TopicFilter>,
        responder: UnsubAckResponder,
    },
}

impl WindowRequest for Exchange {
    fn wants_subscription_id(&self) -> bool {
        matches!(self, Self::Subscribe { .. })
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    window: PendingWindow<Exchange>,
    publish_ids: IdAllocator,
    /// QoS 1/2 publishes waiting for a packet id.
    publish_queue: VecDeque<(Publish, PublishResponder)>,
    publish_waiters: IdMap<PublishResponder>,
    store: QosStore,
    registry: FlowRegistry,
    incoming: IncomingQueue,
    /// Inbound QoS 2 packet ids answered with PUBREC and not yet released.
    qos2_received: HashSet<u16>,
    maximum_packet_size: Option<u32>,
    attached: bool,
    /// Set by a protocol violation. Final.
    closed: bool,
    out: Vec<Event>,
}

impl Session {
    pub(crate) fn new(mut option: SessionOption) -> Self {
        let publish_id_max = option.publish_id_max();
        let (records, qos2_received) = option.take_restore_data();
        let mut store = QosStore::new(publish_id_max);
        for record in store.restore(records) {
            tracing::warn!(packet_id = record.packet_id, "restored record rejected");
        }
        let mut publish_ids = IdAllocator::new(1, publish_id_max as u32);
        for record in store.records_in_send_order() {
            publish_ids.register(record.packet_id as u32);
        }
        Self {
            window: PendingWindow::new(
                publish_id_max + 1,
                option.subscribe_window(),
                option.subscription_identifier_maximum(),
            ),
            publish_ids,
            publish_queue: VecDeque::new(),
            publish_waiters: IdMap::new(publish_id_max as u32),
            store,
            registry: FlowRegistry::default(),
            incoming: IncomingQueue::new(option.incoming_queue_capacity()),
            qos2_received,
            maximum_packet_size: option.maximum_packet_size(),
            attached: false,
            closed: false,
            out: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Inbound data is only processed while this holds.
    pub(crate) fn is_attached(&self) -> bool {
        self.attached
    }

    pub(crate) fn stored_records(&self) -> Vec<QosRecord> {
        self.store.records_in_send_order()
    }

    /// Issue a SUBSCRIBE for `flow`. `filters` are the validated topic filters
    /// of `subscribe`, in order.
    pub(crate) fn subscribe(
        &mut self,
        subscribe: Subscribe,
        filters: Vec<TopicFilter>,
        mut flow: DeliveryFlow,
    ) -> Vec<Event> {
        if let Some(error) = self.unavailable() {
            let dispatches = flow.fail(error);
            self.dispatch_all(dispatches);
            return self.finish();
        }
        let id = flow.id();
        self.registry.insert(flow);
        let admitted = self.window.enqueue(Exchange::Subscribe {
            subscribe,
            filters,
            flow: id,
        });
        self.admit_chain(admitted);
        self.finish()
    }

    pub(crate) fn unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
        filters: Vec<TopicFilter>,
        responder: UnsubAckResponder,
    ) -> Vec<Event> {
        if let Some(error) = self.unavailable() {
            self.dispatch(Dispatch::UnsubAck {
                tx: responder,
                result: Err(error),
            });
            return self.finish();
        }
        let admitted = self.window.enqueue(Exchange::Unsubscribe {
            unsubscribe,
            filters,
            responder,
        });
        self.admit_chain(admitted);
        self.finish()
    }

    pub(crate) fn publish(&mut self, publish: Publish, responder: PublishResponder) -> Vec<Event> {
        if let Some(error) = self.unavailable() {
            self.dispatch(Dispatch::Publish {
                tx: responder,
                result: Err(error),
            });
            return self.finish();
        }
        if publish.qos() == Qos::AtMostOnce {
            match self.prepare_publish(&publish, None) {
                Ok(publish) => self.out.push(Event::Send {
                    packet: Packet::V5_0Publish(publish),
                    completion: SendCompletion::AtMostOnce(responder),
                }),
                Err(error) => self.dispatch(Dispatch::Publish {
                    tx: responder,
                    result: Err(error.into()),
                }),
            }
        } else {
            self.publish_queue.push_back((publish, responder));
            self.admit_publishes();
        }
        self.finish()
    }

    /// Process one packet read from the transport. Packets arriving while no
    /// transport is attached are stale and ignored.
    pub(crate) fn recv(&mut self, packet: Packet) -> Vec<Event> {
        if !self.attached {
            tracing::debug!(packet = %packet.packet_type(), closed = self.closed, "packet ignored, session detached");
            return Vec::new();
        }
        tracing::trace!(packet = %packet.packet_type(), packet_id = ?codec::packet_id(&packet), "packet received");
        match packet {
            Packet::V5_0Suback(ack) => self.handle_suback(ack),
            Packet::V5_0Unsuback(ack) => self.handle_unsuback(ack),
            Packet::V5_0Publish(publish) => self.handle_publish(publish),
            Packet::V5_0Puback(ack) => self.handle_puback(ack),
            Packet::V5_0Pubrec(rec) => self.handle_pubrec(rec),
            Packet::V5_0Pubrel(rel) => self.handle_pubrel(rel),
            Packet::V5_0Pubcomp(comp) => self.handle_pubcomp(comp),
            Packet::V5_0Disconnect(disconnect) => {
                tracing::warn!(
                    reason_code = ?disconnect.reason_code(),
                    props = ?disconnect.props(),
                    "DISCONNECT received"
                );
                self.out.push(Event::Close { disconnect: None });
                self.detach();
            }
            packet @ (Packet::V5_0Subscribe(_) | Packet::V5_0Unsubscribe(_)) => {
                self.violation(format!("{} sent by the server", packet.packet_type()))
            }
            other => tracing::debug!(packet = %other.packet_type(), "packet ignored"),
        }
        self.finish()
    }

    /// The write of an exchange failed. Only that exchange fails; its slot
    /// goes to the next queued request.
    pub(crate) fn notify_send_failed(&mut self, packet_id: u16, error: ConnectionError) -> Vec<Event> {
        let next = self.fail_sent(packet_id, error);
        self.admit_chain(next);
        self.finish()
    }

    /// The byte stream could not be decoded.
    pub(crate) fn notify_malformed(&mut self, error: CodecError) -> Vec<Event> {
        self.close_with(error.disconnect_reason_code(), error.to_string());
        self.finish()
    }

    /// Demand was added to flow `id`.
    pub(crate) fn request_flow(&mut self, id: FlowId) -> Vec<Event> {
        if let Some(flow) = self.registry.get_mut(id) {
            flow.control().clear_scheduled();
        }
        self.drain_incoming();
        self.finish()
    }

    /// Flow `id` was cancelled by the application.
    pub(crate) fn cancel_flow(&mut self, id: FlowId) -> Vec<Event> {
        tracing::debug!(flow = id, "flow cancelled");
        self.registry.cancel(id);
        self.drain_incoming();
        self.finish()
    }

    /// A transport was attached. Stored exchanges are retransmitted in their
    /// original send order.
    pub(crate) fn notify_attached(&mut self) -> Result<Vec<Event>, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::SessionClosed);
        }
        if self.attached {
            return Err(ConnectionError::AlreadyConnected);
        }
        self.attached = true;
        let records = self.store.records_in_send_order();
        tracing::debug!(resend = records.len(), "session attached");
        for record in records {
            self.send_packet(record.retransmission());
        }
        Ok(self.finish())
    }

    /// The transport is gone.
    pub(crate) fn notify_detached(&mut self) -> Vec<Event> {
        self.detach();
        self.finish()
    }

    fn unavailable(&self) -> Option<ConnectionError> {
        if self.closed {
            Some(ConnectionError::SessionClosed)
        } else if !self.attached {
            Some(ConnectionError::NotConnected)
        } else {
            None
        }
    }

    fn handle_suback(&mut self, ack: Suback) {
        let packet_id = ack.packet_id();
        let Some(exchange) = self.window.take(packet_id) else {
            return self.violation(format!("SUBACK for unknown packet id {packet_id}"));
        };
        let (subscribe, filters, flow) = match exchange.request {
            Exchange::Subscribe {
                subscribe,
                filters,
                flow,
            } => (subscribe, filters, flow),
            other => {
                return self.reject(other, format!("SUBACK {packet_id} answers an UNSUBSCRIBE"));
            }
        };
        let reason_codes = ack.reason_codes();
        if reason_codes.len() != filters.len() {
            let reason = format!(
                "SUBACK {packet_id} has {} reason codes for {} filters",
                reason_codes.len(),
                filters.len()
            );
            return self.reject(
                Exchange::Subscribe {
                    subscribe,
                    filters,
                    flow,
                },
                reason,
            );
        }
        if reason_codes.iter().all(|code| code.is_failure()) {
            tracing::debug!(packet_id, flow, ?reason_codes, "SUBACK rejected every filter");
            let dispatches = self.registry.fail(flow, ConnectionError::SubAckError(ack));
            self.dispatch_all(dispatches);
        } else {
            let granted: Vec<TopicFilter> = filters
                .into_iter()
                .zip(&reason_codes)
                .filter(|(_, code)| !code.is_failure())
                .map(|(filter, _)| filter)
                .collect();
            tracing::debug!(packet_id, flow, granted = granted.len(), "SUBACK received");
            self.registry.subscribe(flow, granted);
            let dispatch = self.registry.acknowledge(flow, Ok(ack));
            self.dispatch_all(dispatch);
        }
        let next = self.window.free_slot(packet_id);
        self.admit_chain(next);
    }

    fn handle_unsuback(&mut self, ack: Unsuback) {
        let packet_id = ack.packet_id();
        let Some(exchange) = self.window.take(packet_id) else {
            return self.violation(format!("UNSUBACK for unknown packet id {packet_id}"));
        };
        let (unsubscribe, filters, responder) = match exchange.request {
            Exchange::Unsubscribe {
                unsubscribe,
                filters,
                responder,
            } => (unsubscribe, filters, responder),
            other => {
                return self.reject(other, format!("UNSUBACK {packet_id} answers a SUBSCRIBE"));
            }
        };
        let reason_codes = ack.reason_codes();
        if reason_codes.len() != filters.len() {
            let reason = format!(
                "UNSUBACK {packet_id} has {} reason codes for {} filters",
                reason_codes.len(),
                filters.len()
            );
            return self.reject(
                Exchange::Unsubscribe {
                    unsubscribe,
                    filters,
                    responder,
                },
                reason,
            );
        }
        let result = if reason_codes.iter().all(|code| code.is_failure()) {
            Err(ConnectionError::UnsubAckError(ack))
        } else {
            let mut drained = Vec::new();
            for (filter, code) in filters.iter().zip(&reason_codes) {
                if code.is_failure() {
                    continue;
                }
                self.registry.unsubscribe(filter, |flow| {
                    flow.unsubscribe();
                    drained.push(flow.id());
                });
            }
            tracing::debug!(packet_id, drained = drained.len(), "UNSUBACK received");
            let completions = self.registry.complete_drained(&drained);
            self.dispatch_all(completions);
            Ok(ack)
        };
        self.dispatch(Dispatch::UnsubAck {
            tx: responder,
            result,
        });
        // Queued publishes still listing a drained flow release it here.
        self.drain_incoming();
        let next = self.window.free_slot(packet_id);
        self.admit_chain(next);
    }

    fn handle_publish(&mut self, publish: Publish) {
        let qos = publish.qos();
        let packet_id = match (qos, publish.packet_id()) {
            (Qos::AtMostOnce, _) => None,
            (_, Some(packet_id)) => Some(packet_id),
            (_, None) => return self.violation("QoS 1/2 PUBLISH without packet id".into()),
        };
        if let (Qos::ExactlyOnce, Some(id)) = (qos, packet_id) {
            if self.qos2_received.contains(&id) {
                if self.incoming.holds_qos2(id) {
                    tracing::trace!(packet_id = id, "duplicate QoS 2 publish still queued");
                } else {
                    tracing::debug!(packet_id = id, "duplicate QoS 2 publish, PUBREC resent");
                    self.send_built(codec::pubrec(id, PubrecReasonCode::Success));
                }
                return;
            }
        }
        // QoS 1/2 publishes are bounded by the Receive Maximum since their
        // acknowledgements are withheld; QoS 0 has no such bound.
        if qos == Qos::AtMostOnce && self.incoming.is_full() {
            tracing::warn!(topic = publish.topic_name(), "incoming queue full, QoS 0 publish dropped");
            return;
        }

        let (flows, subscribed) = self.registry.find_matching(publish.topic_name());
        let matched = !flows.is_empty();
        if !matched {
            if subscribed {
                tracing::debug!(topic = publish.topic_name(), "publish for a subscription being torn down");
            } else {
                tracing::warn!(topic = publish.topic_name(), "publish matches no subscription");
            }
        }
        let ack = match (qos, packet_id) {
            (Qos::AtLeastOnce, Some(id)) => {
                let reason_code = if matched {
                    PubackReasonCode::Success
                } else {
                    PubackReasonCode::NoMatchingSubscribers
                };
                built(codec::puback(id, reason_code))
            }
            (Qos::ExactlyOnce, Some(id)) => {
                self.qos2_received.insert(id);
                let reason_code = if matched {
                    PubrecReasonCode::Success
                } else {
                    PubrecReasonCode::NoMatchingSubscribers
                };
                built(codec::pubrec(id, reason_code))
            }
            _ => None,
        };
        self.incoming.push(IncomingPublish {
            publish,
            flows,
            ack,
        });
        self.drain_incoming();
    }

    fn handle_puback(&mut self, ack: Puback) {
        let packet_id = ack.packet_id();
        if !self.awaits(packet_id, Some(Qos::AtLeastOnce)) {
            return self.violation(format!("PUBACK for unknown packet id {packet_id}"));
        }
        self.complete_publish(packet_id, Ok(PublishOutcome::Acknowledged(ack)));
    }

    fn handle_pubrec(&mut self, rec: Pubrec) {
        let packet_id = rec.packet_id();
        if !self.awaits(packet_id, Some(Qos::ExactlyOnce)) {
            return self.violation(format!("PUBREC for unknown packet id {packet_id}"));
        }
        if rec.reason_code().is_some_and(|code| code.is_failure()) {
            tracing::debug!(packet_id, reason_code = ?rec.reason_code(), "PUBREC with error");
            return self.complete_publish(packet_id, Ok(PublishOutcome::Received(rec)));
        }
        match codec::pubrel(packet_id) {
            Ok(pubrel) => {
                self.store.mark_released(packet_id, pubrel.clone());
                self.send_packet(Packet::V5_0Pubrel(pubrel));
            }
            Err(error) => tracing::error!(packet_id, %error, "PUBREL could not be built"),
        }
    }

    fn handle_pubrel(&mut self, rel: Pubrel) {
        let packet_id = rel.packet_id();
        let reason_code = if self.qos2_received.remove(&packet_id) {
            PubcompReasonCode::Success
        } else {
            tracing::debug!(packet_id, "PUBREL for unknown packet id");
            PubcompReasonCode::PacketIdentifierNotFound
        };
        self.send_built(codec::pubcomp(packet_id, reason_code));
    }

    fn handle_pubcomp(&mut self, comp: Pubcomp) {
        let packet_id = comp.packet_id();
        if !self.awaits(packet_id, None) {
            return self.violation(format!("PUBCOMP for unknown packet id {packet_id}"));
        }
        self.complete_publish(packet_id, Ok(PublishOutcome::Completed(comp)));
    }

    /// Whether the store holds a PUBLISH of `qos` for `packet_id`, or a PUBREL
    /// when `qos` is `None`.
    fn awaits(&self, packet_id: u16, qos: Option<Qos>) -> bool {
        match (self.store.get(packet_id).map(|record| &record.message), qos) {
            (Some(QosMessage::Publish(publish)), Some(qos)) => publish.qos() == qos,
            (Some(QosMessage::Release(_)), None) => true,
            _ => false,
        }
    }

    fn complete_publish(
        &mut self,
        packet_id: u16,
        result: Result<PublishOutcome, ConnectionError>,
    ) {
        self.store.discard(packet_id);
        self.publish_ids.release(packet_id as u32);
        match self.publish_waiters.remove(packet_id as u32) {
            Some(tx) => self.dispatch(Dispatch::Publish { tx, result }),
            None => tracing::debug!(packet_id, "restored exchange completed"),
        }
        self.admit_publishes();
    }

    /// Copy of `publish` carrying the session's `packet_id`, checked against
    /// the server's Maximum Packet Size.
    fn prepare_publish(&self, publish: &Publish, packet_id: Option<u16>) -> Result<Publish, CodecError> {
        let publish = codec::publish_with_id(publish, packet_id)?;
        codec::fit(Packet::V5_0Publish(publish.clone()), self.maximum_packet_size)?;
        Ok(publish)
    }

    /// Give free packet ids to queued publishes, oldest first.
    fn admit_publishes(&mut self) {
        while !self.publish_queue.is_empty() {
            let Some(id) = self.publish_ids.acquire() else {
                tracing::trace!(queued = self.publish_queue.len(), "publish ids exhausted");
                return;
            };
            let Some((publish, responder)) = self.publish_queue.pop_front() else {
                self.publish_ids.release(id);
                return;
            };
            let packet_id = id as u16;
            match self.prepare_publish(&publish, Some(packet_id)) {
                Ok(publish) => {
                    tracing::trace!(packet_id, qos = ?publish.qos(), "publish admitted");
                    self.store.store(packet_id, publish.clone());
                    self.publish_waiters.put(id, responder);
                    self.out.push(Event::Send {
                        packet: Packet::V5_0Publish(publish),
                        completion: SendCompletion::None,
                    });
                }
                Err(error) => {
                    self.publish_ids.release(id);
                    self.dispatch(Dispatch::Publish {
                        tx: responder,
                        result: Err(error.into()),
                    });
                }
            }
        }
    }

    /// Send admitted exchanges. An exchange that cannot be built fails and
    /// passes its slot on, so this loops until a send is emitted.
    fn admit_chain(&mut self, mut next: Option<Admitted>) {
        while let Some(admitted) = next {
            next = self.send_admitted(admitted);
        }
    }

    fn send_admitted(&mut self, admitted: Admitted) -> Option<Admitted> {
        let Admitted {
            packet_id,
            subscription_id,
        } = admitted;
        let Some(exchange) = self.window.get_mut(packet_id) else {
            tracing::error!(packet_id, "admitted exchange missing");
            return None;
        };
        let (built, flow) = match &exchange.request {
            Exchange::Subscribe {
                subscribe, flow, ..
            } => (
                codec::subscribe_with_id(subscribe, packet_id, subscription_id)
                    .map(Packet::V5_0Subscribe),
                Some(*flow),
            ),
            Exchange::Unsubscribe { unsubscribe, .. } => (
                codec::unsubscribe_with_id(unsubscribe, packet_id).map(Packet::V5_0Unsubscribe),
                None,
            ),
        };
        if let Some(flow) = flow {
            match self.registry.get_mut(flow) {
                Some(flow) => flow.set_subscription_id(subscription_id),
                None => {
                    if let Some(id) = subscription_id {
                        self.window.release_subscription_id(id);
                    }
                }
            }
        }
        let packet = built
            .map_err(CodecError::from)
            .and_then(|packet| codec::fit(packet, self.maximum_packet_size));
        match packet {
            Ok(packet) => {
                tracing::debug!(packet_id, ?subscription_id, packet = %packet.packet_type(), "exchange sent");
                self.out.push(Event::Send {
                    packet,
                    completion: SendCompletion::Exchange(packet_id),
                });
                None
            }
            Err(error) => {
                tracing::warn!(packet_id, %error, "exchange could not be built");
                self.fail_sent(packet_id, error.into())
            }
        }
    }

    fn fail_sent(&mut self, packet_id: u16, error: ConnectionError) -> Option<Admitted> {
        let exchange = self.window.take(packet_id)?;
        self.fail_exchange(exchange.request, error);
        self.window.free_slot(packet_id)
    }

    fn fail_exchange(&mut self, request: Exchange, error: ConnectionError) {
        match request {
            Exchange::Subscribe { flow, .. } => {
                let dispatches = self.registry.fail(flow, error);
                self.dispatch_all(dispatches);
            }
            Exchange::Unsubscribe { responder, .. } => self.dispatch(Dispatch::UnsubAck {
                tx: responder,
                result: Err(error),
            }),
        }
    }

    /// Fail a taken exchange together with the session.
    fn reject(&mut self, request: Exchange, reason: String) {
        self.violation(reason.clone());
        self.fail_exchange(request, ConnectionError::ProtocolViolation(reason));
    }

    fn drain_incoming(&mut self) {
        let drained = self.incoming.drain(&mut self.registry);
        self.dispatch_all(drained.dispatches);
        for ack in drained.acks {
            self.send_packet(ack);
        }
    }

    fn send_built(&mut self, packet: Result<Packet, MqttError>) {
        if let Some(packet) = built(packet) {
            self.send_packet(packet);
        }
    }

    fn send_packet(&mut self, packet: Packet) {
        let packet_type = packet.packet_type();
        match codec::fit(packet, self.maximum_packet_size) {
            Ok(packet) => self.out.push(Event::Send {
                packet,
                completion: SendCompletion::None,
            }),
            Err(error) => tracing::error!(packet = %packet_type, %error, "packet dropped"),
        }
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        tracing::debug!("session detached");
        self.fail_pending(ConnectionError::NotConnected);
    }

    /// Fail window exchanges and queued publishes, and drop queued inbound
    /// publishes. Stored exchanges and their waiters survive.
    fn fail_pending(&mut self, error: ConnectionError) {
        let (sent, queued) = self.window.drain_all();
        for exchange in sent {
            self.fail_exchange(exchange.request, error.clone());
        }
        for request in queued {
            self.fail_exchange(request, error.clone());
        }
        for (_, tx) in std::mem::take(&mut self.publish_queue) {
            self.dispatch(Dispatch::Publish {
                tx,
                result: Err(error.clone()),
            });
        }
        let (dropped, dispatches) = self.incoming.clear(&mut self.registry);
        for entry in dropped {
            // Never acknowledged, so the server sends it again.
            if let (Qos::ExactlyOnce, Some(id)) = (entry.publish.qos(), entry.publish.packet_id()) {
                self.qos2_received.remove(&id);
            }
        }
        self.dispatch_all(dispatches);
    }

    fn violation(&mut self, reason: String) {
        self.close_with(DisconnectReasonCode::ProtocolError, reason);
    }

    /// Close the session, sending DISCONNECT with `reason_code`. Runs once.
    fn close_with(&mut self, reason_code: DisconnectReasonCode, reason: String) {
        if self.closed {
            return;
        }
        tracing::error!(%reason, ?reason_code, "closing session");
        self.closed = true;
        let disconnect = if self.attached {
            codec::disconnect(reason_code, &reason)
                .map_err(CodecError::from)
                .and_then(|packet| codec::fit(packet, self.maximum_packet_size))
                .inspect_err(|error| tracing::error!(%error, "DISCONNECT could not be built"))
                .ok()
        } else {
            None
        };
        self.out.push(Event::Close { disconnect });
        self.attached = false;

        let error = ConnectionError::ProtocolViolation(reason);
        self.fail_pending(error.clone());
        for (_, tx) in self.publish_waiters.drain() {
            self.dispatch(Dispatch::Publish {
                tx,
                result: Err(error.clone()),
            });
        }
        let dispatches = self.registry.fail_all(error);
        self.dispatch_all(dispatches);
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        self.out.push(Event::Dispatch(dispatch));
    }

    fn dispatch_all(&mut self, dispatches: impl IntoIterator<Item = Dispatch>) {
        self.out
            .extend(dispatches.into_iter().map(Event::Dispatch));
    }

    /// Remove finished flows and hand back the events of this step.
    fn finish(&mut self) -> Vec<Event> {
        for mut flow in self.registry.reap() {
            if let Some(id) = flow.take_subscription_id() {
                self.window.release_subscription_id(id);
            }
        }
        std::mem::take(&mut self.out)
    }
}

fn built(packet: Result<Packet, MqttError>) -> Option<Packet> {
    packet
        .inspect_err(|error| tracing::error!(%error, "packet could not be built"))
        .ok()
}
