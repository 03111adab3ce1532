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

//! Tokio front end of a client [`Session`].
//!
//! [`Endpoint::new`] spawns the protocol task, the only place session state is
//! touched. The endpoint handle, [`Subscription`] handles and the transport
//! all talk to it through channels.

use std::collections::VecDeque;
use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::mqtt_cs::codec::{self, Decoder};
use crate::mqtt_cs::common::Cursor;
use crate::mqtt_cs::connection_error::ConnectionError;
use crate::mqtt_cs::delivery_flow::{
    DeliveryFlow, FlowControl, FlowSubscriber, FlowTask, Subscription,
};
use crate::mqtt_cs::packet::v5_0::{Publish, Subscribe, Unsuback, Unsubscribe};
use crate::mqtt_cs::packet::GenericPacketTrait;
use crate::mqtt_cs::qos_store::QosRecord;
use crate::mqtt_cs::request_response::RequestResponse;
use crate::mqtt_cs::session::{Event, PublishOutcome, SendCompletion, Session};
use crate::mqtt_cs::session_option::SessionOption;
use crate::mqtt_cs::topic::TopicFilter;
use crate::mqtt_cs::transport::{TransportError, TransportOps};
use crate::mqtt_cs::worker::{Dispatch, WorkerPool};

/// Handle of a client session.
///
/// The session starts detached. Attach a transport whose MQTT connection is
/// already established (CONNECT/CONNACK done) before subscribing or
/// publishing.
///
/// Packet identifiers belong to the session: the id carried by a SUBSCRIBE,
/// UNSUBSCRIBE or QoS 1/2 PUBLISH handed in is a placeholder and is replaced
/// when the packet is sent. So is any Subscription Identifier property.
#[derive(Debug)]
pub struct Endpoint {
    tx_send: mpsc::UnboundedSender<RequestResponse>,
    tx_flow: mpsc::UnboundedSender<FlowTask>,
    next_flow_id: AtomicU64,
}

impl Endpoint {
    /// Create a session and spawn its protocol task.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use mqtt_session_tokio::mqtt_cs;
    ///
    /// let option = mqtt_cs::SessionOption::builder()
    ///     .receive_maximum(20u16)
    ///     .build()?;
    /// let endpoint = mqtt_cs::Endpoint::new(option);
    /// let transport = mqtt_cs::transport::TcpTransport::connect("127.0.0.1:1883", None).await?;
    /// endpoint.attach(transport).await?;
    /// ```
    pub fn new(option: SessionOption) -> Self {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let (tx_flow, rx_flow) = mpsc::unbounded_channel();
        let task = ProtocolTask::new(option);
        tokio::spawn(task.request_event_loop(rx_send, rx_flow));
        Self {
            tx_send,
            tx_flow,
            next_flow_id: AtomicU64::new(1),
        }
    }

    /// Attach a connected transport.
    ///
    /// Stored QoS 1/2 exchanges are retransmitted right away, PUBLISH with the
    /// DUP flag set.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::AlreadyConnected`] if a transport is attached
    /// - [`ConnectionError::SessionClosed`] after a protocol violation
    pub async fn attach<T>(&self, transport: T) -> Result<(), ConnectionError>
    where
        T: TransportOps + Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(RequestResponse::Attach {
            transport: Box::new(transport),
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?
    }

    /// Shut the transport down.
    ///
    /// In-flight SUBSCRIBE and UNSUBSCRIBE requests fail with
    /// [`ConnectionError::NotConnected`]. QoS 1/2 publishes stay stored and
    /// complete after the next [`attach`](Self::attach).
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(RequestResponse::Close { response_tx })?;
        response_rx
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?
    }

    /// Subscribe and deliver matching publishes to `subscriber`.
    ///
    /// Returns at once. The SUBACK is available from
    /// [`Subscription::suback`], and nothing is delivered before
    /// [`Subscription::request`]. When more SUBSCRIBE/UNSUBSCRIBE requests
    /// are outstanding than the subscribe window allows, this one waits in
    /// line.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::TopicFilter`] if a topic filter is invalid
    /// - [`ConnectionError::ChannelClosed`] if the protocol task is gone
    ///
    /// Every other failure is reported through the subscription.
    pub fn subscribe<S>(
        &self,
        subscribe: Subscribe,
        subscriber: S,
    ) -> Result<Subscription, ConnectionError>
    where
        S: FlowSubscriber,
    {
        let filters = subscribe
            .entries()
            .iter()
            .map(|entry| TopicFilter::new(entry.topic_filter()))
            .collect::<Result<Vec<_>, _>>()?;
        let id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
        let control = FlowControl::new(id);
        let (suback_tx, suback_rx) = oneshot::channel();
        let flow = DeliveryFlow::new(Arc::clone(&control), Arc::new(subscriber), suback_tx);
        self.request(RequestResponse::Subscribe {
            subscribe,
            filters,
            flow,
        })?;
        Ok(Subscription::new(control, self.tx_flow.clone(), suback_rx))
    }

    /// Unsubscribe and wait for the UNSUBACK.
    ///
    /// A flow left without topic filters completes once the publishes it was
    /// already matched with have been handled.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::UnsubAckError`] if every reason code is an error
    /// - [`ConnectionError::NotConnected`] if the transport is detached before
    ///   the UNSUBACK arrives
    /// - [`ConnectionError::TopicFilter`] if a topic filter is invalid
    pub async fn unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<Unsuback, ConnectionError> {
        let filters = unsubscribe
            .entries()
            .iter()
            .map(|entry| TopicFilter::new(entry.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let (response_tx, response_rx) = oneshot::channel();
        self.request(RequestResponse::Unsubscribe {
            unsubscribe,
            filters,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?
    }

    /// Publish and wait for the final acknowledgement.
    ///
    /// QoS 0 completes once written. QoS 1 completes on PUBACK, QoS 2 on
    /// PUBCOMP or on a PUBREC carrying an error. QoS 1/2 publishes beyond the
    /// server's Receive Maximum wait for a packet id. A stored publish
    /// survives a detach and completes after the next attach.
    pub async fn publish(&self, publish: Publish) -> Result<PublishOutcome, ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(RequestResponse::Publish {
            publish,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?
    }

    /// Unacknowledged outgoing exchanges in send order, for saving into
    /// [`SessionOption`] of a later session.
    pub async fn stored_records(&self) -> Result<Vec<QosRecord>, ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(RequestResponse::GetStoredRecords { response_tx })?;
        response_rx
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?
    }

    fn request(&self, request: RequestResponse) -> Result<(), ConnectionError> {
        self.tx_send
            .send(request)
            .map_err(|_| ConnectionError::ChannelClosed)
    }
}

/// State owned by the protocol task.
struct ProtocolTask {
    session: Session,
    workers: WorkerPool,
    transport: Option<Box<dyn TransportOps + Send>>,
    read_buffer: Vec<u8>,
    /// Holds a partial packet between reads.
    decoder: Decoder,
    shutdown_timeout: Duration,
}

impl ProtocolTask {
    fn new(option: SessionOption) -> Self {
        let workers = WorkerPool::new(option.worker_count(), option.worker_queue_capacity());
        let read_buffer = vec![0u8; option.recv_buffer_size()];
        let shutdown_timeout = Duration::from_millis(option.shutdown_timeout_ms());
        let decoder = Decoder::new(option.receive_maximum_packet_size());
        Self {
            session: Session::new(option),
            workers,
            transport: None,
            read_buffer,
            decoder,
            shutdown_timeout,
        }
    }

    async fn request_event_loop(
        mut self,
        mut rx_send: mpsc::UnboundedReceiver<RequestResponse>,
        mut rx_flow: mpsc::UnboundedReceiver<FlowTask>,
    ) {
        loop {
            let transport = &mut self.transport;
            let read_buffer = &mut self.read_buffer;
            let events = tokio::select! {
                // A flow task never overtakes the SUBSCRIBE that created its flow.
                biased;
                request = rx_send.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(task) = rx_flow.recv() => match task {
                    FlowTask::Request(id) => self.session.request_flow(id),
                    FlowTask::Cancel(id) => self.session.cancel_flow(id),
                },
                recv_result = async {
                    match transport.as_mut() {
                        Some(t) => t.recv(read_buffer).await,
                        None => future::pending().await,
                    }
                } => self.handle_received(recv_result).await,
            };
            self.process_events(events).await;
        }
        self.drop_transport().await;
        tracing::debug!("protocol task stopped");
    }

    async fn handle_request(&mut self, request: RequestResponse) -> Vec<Event> {
        match request {
            RequestResponse::Attach {
                transport,
                response_tx,
            } => {
                if self.transport.is_some() {
                    let _ = response_tx.send(Err(ConnectionError::AlreadyConnected));
                    return Vec::new();
                }
                match self.session.notify_attached() {
                    Ok(events) => {
                        tracing::debug!("transport attached");
                        self.transport = Some(transport);
                        self.decoder.reset();
                        let _ = response_tx.send(Ok(()));
                        events
                    }
                    Err(error) => {
                        let _ = response_tx.send(Err(error));
                        Vec::new()
                    }
                }
            }
            RequestResponse::Close { response_tx } => {
                let events = if self.transport.is_some() {
                    self.drop_transport().await;
                    self.session.notify_detached()
                } else {
                    Vec::new()
                };
                let _ = response_tx.send(Ok(()));
                events
            }
            RequestResponse::Subscribe {
                subscribe,
                filters,
                flow,
            } => self.session.subscribe(subscribe, filters, flow),
            RequestResponse::Unsubscribe {
                unsubscribe,
                filters,
                response_tx,
            } => self.session.unsubscribe(unsubscribe, filters, response_tx),
            RequestResponse::Publish {
                publish,
                response_tx,
            } => self.session.publish(publish, response_tx),
            RequestResponse::GetStoredRecords { response_tx } => {
                let _ = response_tx.send(Ok(self.session.stored_records()));
                Vec::new()
            }
        }
    }

    async fn handle_received(&mut self, result: Result<usize, TransportError>) -> Vec<Event> {
        match result {
            Ok(0) => {
                tracing::debug!("transport closed by peer");
                self.drop_transport().await;
                self.session.notify_detached()
            }
            Ok(n) => {
                let mut cursor = Cursor::new(&self.read_buffer[..n]);
                let mut events = Vec::new();
                // Bytes after a DISCONNECT or a decode error belong to a dead
                // connection.
                while self.session.is_attached() {
                    match self.decoder.decode(&mut cursor) {
                        Ok(Some(packet)) => events.extend(self.session.recv(packet)),
                        Ok(None) => break,
                        Err(error) => {
                            tracing::warn!(%error, "undecodable input");
                            self.decoder.reset();
                            events.extend(self.session.notify_malformed(error));
                            break;
                        }
                    }
                }
                events
            }
            Err(error) => {
                tracing::warn!(%error, "transport receive failed");
                self.drop_transport().await;
                self.session.notify_detached()
            }
        }
    }

    /// Carry out session events in order. Events raised while doing so, such
    /// as those of a detach after a failed write, are appended.
    async fn process_events(&mut self, events: Vec<Event>) {
        let mut queue = VecDeque::from(events);
        while let Some(event) = queue.pop_front() {
            match event {
                Event::Send { packet, completion } => {
                    let packet_id = codec::packet_id(&packet);
                    let result = match self.transport.as_mut() {
                        Some(transport) => transport
                            .send(&packet.to_buffers())
                            .await
                            .map_err(ConnectionError::from),
                        None => Err(ConnectionError::NotConnected),
                    };
                    match result {
                        Ok(()) => {
                            tracing::trace!(packet = %packet.packet_type(), ?packet_id, "packet sent");
                            if let SendCompletion::AtMostOnce(tx) = completion {
                                self.workers
                                    .dispatch(Dispatch::Publish {
                                        tx,
                                        result: Ok(PublishOutcome::QoS0),
                                    })
                                    .await;
                            }
                        }
                        Err(error) => {
                            let attached = self.transport.is_some();
                            tracing::warn!(packet = %packet.packet_type(), ?packet_id, %error, "packet not sent");
                            match completion {
                                SendCompletion::Exchange(id) => {
                                    queue.extend(self.session.notify_send_failed(id, error))
                                }
                                SendCompletion::AtMostOnce(tx) => {
                                    self.workers
                                        .dispatch(Dispatch::Publish {
                                            tx,
                                            result: Err(error),
                                        })
                                        .await
                                }
                                SendCompletion::None => {}
                            }
                            if attached {
                                self.drop_transport().await;
                                queue.extend(self.session.notify_detached());
                            }
                        }
                    }
                }
                Event::Dispatch(dispatch) => self.workers.dispatch(dispatch).await,
                Event::Close { disconnect } => {
                    if let Some(mut transport) = self.transport.take() {
                        if let Some(packet) = disconnect {
                            if let Err(error) = transport.send(&packet.to_buffers()).await {
                                tracing::debug!(%error, "DISCONNECT not sent");
                            }
                        }
                        transport.shutdown(self.shutdown_timeout).await;
                    }
                    self.decoder.reset();
                }
            }
        }
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown(self.shutdown_timeout).await;
        }
        self.decoder.reset();
    }
}
