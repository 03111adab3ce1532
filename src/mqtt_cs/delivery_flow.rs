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

//! Demand-gated delivery of inbound publishes to one subscriber.
//!
//! A flow is split in two halves. [`Subscription`] is the application handle:
//! it may be used from any thread and only touches atomics before scheduling
//! work on the protocol task. [`DeliveryFlow`] lives inside the protocol task
//! and owns the delivery credit, topic filters and reference count.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::mqtt_cs::connection_error::ConnectionError;
use crate::mqtt_cs::packet::v5_0::{Publish, Suback};
use crate::mqtt_cs::topic::TopicFilter;
use crate::mqtt_cs::worker::Dispatch;

pub type FlowId = u64;

pub(crate) type SubAckResponder = oneshot::Sender<Result<Suback, ConnectionError>>;

/// Receiver of the events of one subscription.
///
/// Callbacks run on a worker, never on the protocol task. Calls for one flow
/// are made sequentially and in order: items in arrival order, then at most
/// one of `on_error` or `on_complete`.
pub trait FlowSubscriber: Send + Sync + 'static {
    fn on_item(&self, publish: Publish);

    fn on_error(&self, error: ConnectionError);

    /// The last filter of the flow was unsubscribed and every matched publish
    /// has been handled.
    fn on_complete(&self);
}

impl<T: FlowSubscriber + ?Sized> FlowSubscriber for Arc<T> {
    fn on_item(&self, publish: Publish) {
        (**self).on_item(publish)
    }

    fn on_error(&self, error: ConnectionError) {
        (**self).on_error(error)
    }

    fn on_complete(&self) {
        (**self).on_complete()
    }
}

/// Flow events forwarded by the channel subscriber.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    Item(Publish),
    Error(ConnectionError),
    Complete,
}

/// Forward every event into an unbounded channel, for consumers that prefer
/// `recv().await` over callbacks.
impl FlowSubscriber for mpsc::UnboundedSender<FlowEvent> {
    fn on_item(&self, publish: Publish) {
        let _ = self.send(FlowEvent::Item(publish));
    }

    fn on_error(&self, error: ConnectionError) {
        let _ = self.send(FlowEvent::Error(error));
    }

    fn on_complete(&self) {
        let _ = self.send(FlowEvent::Complete);
    }
}

/// Lifecycle of a flow.
///
/// ```text
/// Active ──unsubscribe──> Unsubscribed ──drained──> Done
///   │                          │
///   ├──────────cancel──────────┴──> Cancelled
///   └──error / complete─────────────> Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowState {
    Active = 0,
    /// Every filter is gone; waiting for in-flight deliveries to drain.
    Unsubscribed = 1,
    /// Cancelled by the application. No further signals.
    Cancelled = 2,
    /// Completed or failed. No further signals.
    Done = 3,
}

impl FlowState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Unsubscribed,
            2 => Self::Cancelled,
            _ => Self::Done,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Done)
    }
}

/// Work a [`Subscription`] schedules onto the protocol task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowTask {
    Request(FlowId),
    Cancel(FlowId),
}

/// State shared between a [`Subscription`] and its [`DeliveryFlow`].
#[derive(Debug)]
pub(crate) struct FlowControl {
    id: FlowId,
    /// Demand requested but not yet folded into the delivery credit.
    new_requested: AtomicU64,
    state: AtomicU8,
    /// A `FlowTask::Request` is on its way to the protocol task.
    scheduled: AtomicBool,
}

impl FlowControl {
    pub(crate) fn new(id: FlowId) -> Arc<Self> {
        Arc::new(Self {
            id,
            new_requested: AtomicU64::new(0),
            state: AtomicU8::new(FlowState::Active as u8),
            scheduled: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> FlowId {
        self.id
    }

    pub(crate) fn state(&self) -> FlowState {
        FlowState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to` if the current state is one of `from`.
    pub(crate) fn transition(&self, from: &[FlowState], to: FlowState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                from.contains(&FlowState::from_u8(current)).then_some(to as u8)
            })
            .is_ok()
    }

    fn add_demand(&self, n: u64) {
        // Saturates: u64::MAX is unbounded demand.
        let _ = self
            .new_requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            });
    }

    fn take_demand(&self) -> u64 {
        self.new_requested.swap(0, Ordering::AcqRel)
    }

    fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }
}

/// Application handle of a subscription.
///
/// Nothing is delivered before the first [`request`](Self::request). Dropping
/// the handle does not cancel the flow.
#[derive(Debug)]
pub struct Subscription {
    control: Arc<FlowControl>,
    tx_flow: mpsc::UnboundedSender<FlowTask>,
    suback_rx: Option<oneshot::Receiver<Result<Suback, ConnectionError>>>,
}

impl Subscription {
    pub(crate) fn new(
        control: Arc<FlowControl>,
        tx_flow: mpsc::UnboundedSender<FlowTask>,
        suback_rx: oneshot::Receiver<Result<Suback, ConnectionError>>,
    ) -> Self {
        Self {
            control,
            tx_flow,
            suback_rx: Some(suback_rx),
        }
    }

    pub fn id(&self) -> FlowId {
        self.control.id()
    }

    pub fn state(&self) -> FlowState {
        self.control.state()
    }

    /// Allow `n` more publishes to be delivered. Never blocks.
    pub fn request(&self, n: u64) {
        if n == 0 || self.control.state().is_terminal() {
            return;
        }
        self.control.add_demand(n);
        if self.control.try_schedule()
            && self.tx_flow.send(FlowTask::Request(self.id())).is_err()
        {
            tracing::debug!(flow = self.id(), "request after protocol task stopped");
        }
    }

    /// Stop the flow immediately. No further callbacks are made. Idempotent.
    pub fn cancel(&self) {
        if self
            .control
            .transition(&[FlowState::Active, FlowState::Unsubscribed], FlowState::Cancelled)
        {
            let _ = self.tx_flow.send(FlowTask::Cancel(self.id()));
        }
    }

    /// The SUBACK of the subscribe request. Available once; later calls
    /// return [`ConnectionError::ChannelClosed`].
    pub async fn suback(&mut self) -> Result<Suback, ConnectionError> {
        let rx = self.suback_rx.take().ok_or(ConnectionError::ChannelClosed)?;
        rx.await.map_err(|_| ConnectionError::ChannelClosed)?
    }
}

/// Outcome of [`DeliveryFlow::deliver`] when the flow has no credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rejected;

/// Protocol-task half of a flow.
pub(crate) struct DeliveryFlow {
    control: Arc<FlowControl>,
    subscriber: Arc<dyn FlowSubscriber>,
    suback_tx: Option<SubAckResponder>,
    topic_filters: Vec<TopicFilter>,
    subscription_id: Option<u32>,
    /// Credit visible to the delivery path.
    granted: u64,
    /// Queued inbound publishes that still list this flow.
    referenced: usize,
    /// The last delivery attempt was refused for lack of credit.
    blocking: bool,
}

impl std::fmt::Debug for DeliveryFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryFlow")
            .field("id", &self.control.id())
            .field("state", &self.control.state())
            .field("topic_filters", &self.topic_filters)
            .field("subscription_id", &self.subscription_id)
            .field("granted", &self.granted)
            .field("referenced", &self.referenced)
            .field("blocking", &self.blocking)
            .finish()
    }
}

impl DeliveryFlow {
    pub(crate) fn new(
        control: Arc<FlowControl>,
        subscriber: Arc<dyn FlowSubscriber>,
        suback_tx: SubAckResponder,
    ) -> Self {
        Self {
            control,
            subscriber,
            suback_tx: Some(suback_tx),
            topic_filters: Vec::new(),
            subscription_id: None,
            granted: 0,
            referenced: 0,
            blocking: false,
        }
    }

    pub(crate) fn id(&self) -> FlowId {
        self.control.id()
    }

    pub(crate) fn control(&self) -> &FlowControl {
        &self.control
    }

    pub(crate) fn state(&self) -> FlowState {
        self.control.state()
    }

    pub(crate) fn topic_filters(&self) -> &[TopicFilter] {
        &self.topic_filters
    }

    pub(crate) fn add_filter(&mut self, filter: TopicFilter) {
        if !self.topic_filters.contains(&filter) {
            self.topic_filters.push(filter);
        }
    }

    /// Remove `filter`, returning whether it was owned.
    pub(crate) fn remove_filter(&mut self, filter: &TopicFilter) -> bool {
        let before = self.topic_filters.len();
        self.topic_filters.retain(|owned| owned != filter);
        self.topic_filters.len() != before
    }

    pub(crate) fn set_subscription_id(&mut self, id: Option<u32>) {
        self.subscription_id = id;
    }

    pub(crate) fn take_subscription_id(&mut self) -> Option<u32> {
        self.subscription_id.take()
    }

    pub(crate) fn awaiting_suback(&self) -> bool {
        self.suback_tx.is_some()
    }

    pub(crate) fn referenced(&self) -> usize {
        self.referenced
    }

    #[cfg(test)]
    pub(crate) fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub(crate) fn reference(&mut self) {
        self.referenced += 1;
    }

    pub(crate) fn dereference(&mut self) {
        debug_assert!(self.referenced > 0);
        self.referenced = self.referenced.saturating_sub(1);
    }

    /// Fold requested demand into the delivery credit.
    pub(crate) fn apply_requests(&mut self) {
        let requested = self.control.take_demand();
        self.granted = self.granted.saturating_add(requested);
    }

    /// Try to deliver one publish.
    ///
    /// `Ok(None)` when the flow is no longer active and the publish is skipped.
    /// `Err(Rejected)` when there is no credit; the flow is marked blocking
    /// and the caller keeps the publish for a later attempt.
    pub(crate) fn deliver(&mut self, publish: &Publish) -> Result<Option<Dispatch>, Rejected> {
        if self.state() != FlowState::Active {
            return Ok(None);
        }
        self.apply_requests();
        if self.granted == 0 {
            self.blocking = true;
            return Err(Rejected);
        }
        if self.granted != u64::MAX {
            self.granted -= 1;
        }
        self.blocking = false;
        Ok(Some(Dispatch::Item {
            flow: self.id(),
            control: Arc::clone(&self.control),
            subscriber: Arc::clone(&self.subscriber),
            publish: publish.clone(),
        }))
    }

    /// Resolve the pending SUBACK waiter.
    pub(crate) fn acknowledge(&mut self, result: Result<Suback, ConnectionError>) -> Option<Dispatch> {
        self.suback_tx.take().map(|tx| Dispatch::SubAck {
            flow: self.id(),
            tx,
            result,
        })
    }

    /// Fail the flow. The SUBACK waiter, if still pending, receives the same
    /// error. A cancelled flow only resolves the waiter.
    pub(crate) fn fail(&mut self, error: ConnectionError) -> Vec<Dispatch> {
        let mut dispatches: Vec<Dispatch> = self.acknowledge(Err(error.clone())).into_iter().collect();
        if self
            .control
            .transition(&[FlowState::Active, FlowState::Unsubscribed], FlowState::Done)
        {
            dispatches.push(Dispatch::Error {
                flow: self.id(),
                subscriber: Arc::clone(&self.subscriber),
                error,
            });
        }
        dispatches
    }

    /// Every filter of the flow has been unsubscribed.
    pub(crate) fn unsubscribe(&mut self) {
        self.control
            .transition(&[FlowState::Active], FlowState::Unsubscribed);
    }

    /// Complete an unsubscribed flow once no delivery references it.
    pub(crate) fn try_complete(&mut self) -> Option<Dispatch> {
        if self.referenced > 0 {
            return None;
        }
        self.control
            .transition(&[FlowState::Unsubscribed], FlowState::Done)
            .then(|| Dispatch::Complete {
                flow: self.id(),
                subscriber: Arc::clone(&self.subscriber),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_cs::packet::Qos;

    fn flow() -> (Subscription, DeliveryFlow, mpsc::UnboundedReceiver<FlowTask>) {
        let (tx_flow, rx_flow) = mpsc::unbounded_channel();
        let (suback_tx, suback_rx) = oneshot::channel();
        let (events, _) = mpsc::unbounded_channel::<FlowEvent>();
        let control = FlowControl::new(7);
        let subscription = Subscription::new(Arc::clone(&control), tx_flow, suback_rx);
        let delivery = DeliveryFlow::new(control, Arc::new(events), suback_tx);
        (subscription, delivery, rx_flow)
    }

    fn publish() -> Publish {
        Publish::builder()
            .topic_name("a")
            .unwrap()
            .qos(Qos::AtMostOnce)
            .payload("x")
            .build()
            .unwrap()
    }

    #[test]
    fn delivers_at_most_the_requested_amount() {
        let (subscription, mut delivery, _rx) = flow();
        assert!(matches!(delivery.deliver(&publish()), Err(Rejected)));
        assert!(delivery.is_blocking());

        subscription.request(2);
        assert!(matches!(delivery.deliver(&publish()), Ok(Some(Dispatch::Item { .. }))));
        subscription.request(1);
        assert!(delivery.deliver(&publish()).is_ok());
        assert!(delivery.deliver(&publish()).is_ok());
        assert!(delivery.deliver(&publish()).is_err());
    }

    #[test]
    fn delivered_never_exceeds_requested_under_interleaving() {
        let (subscription, mut delivery, _rx) = flow();
        let mut requested = 0u64;
        let mut delivered = 0u64;
        for step in 0..500u64 {
            if step % 7 < 3 {
                let n = step % 4 + 1;
                subscription.request(n);
                requested += n;
            }
            for _ in 0..(step % 5) {
                if let Ok(Some(_)) = delivery.deliver(&publish()) {
                    delivered += 1;
                }
            }
            assert!(delivered <= requested);
        }
        while let Ok(Some(_)) = delivery.deliver(&publish()) {
            delivered += 1;
        }
        assert_eq!(delivered, requested);
    }

    #[test]
    fn unbounded_demand_is_never_consumed() {
        let (subscription, mut delivery, _rx) = flow();
        subscription.request(u64::MAX);
        subscription.request(5);
        for _ in 0..1000 {
            assert!(delivery.deliver(&publish()).is_ok());
        }
        assert_eq!(delivery.granted, u64::MAX);
    }

    #[test]
    fn requests_are_scheduled_once_until_cleared() {
        let (subscription, delivery, mut rx) = flow();
        subscription.request(1);
        subscription.request(1);
        assert_eq!(rx.try_recv(), Ok(FlowTask::Request(7)));
        assert!(rx.try_recv().is_err());
        delivery.control().clear_scheduled();
        subscription.request(1);
        assert_eq!(rx.try_recv(), Ok(FlowTask::Request(7)));
    }

    #[test]
    fn cancel_is_one_shot_and_stops_delivery() {
        let (subscription, mut delivery, mut rx) = flow();
        subscription.request(10);
        subscription.cancel();
        subscription.cancel();
        assert_eq!(rx.try_recv(), Ok(FlowTask::Request(7)));
        assert_eq!(rx.try_recv(), Ok(FlowTask::Cancel(7)));
        assert!(rx.try_recv().is_err());
        assert!(matches!(delivery.deliver(&publish()), Ok(None)));
        assert_eq!(delivery.fail(ConnectionError::NotConnected).len(), 1);
        assert_eq!(delivery.state(), FlowState::Cancelled);
    }

    #[test]
    fn unsubscribed_flow_completes_after_references_drain() {
        let (subscription, mut delivery, _rx) = flow();
        subscription.request(10);
        delivery.reference();
        delivery.unsubscribe();
        assert!(matches!(delivery.deliver(&publish()), Ok(None)));
        assert!(delivery.try_complete().is_none());
        delivery.dereference();
        assert!(matches!(delivery.try_complete(), Some(Dispatch::Complete { .. })));
        assert!(delivery.try_complete().is_none());
        assert_eq!(delivery.state(), FlowState::Done);
    }
}
