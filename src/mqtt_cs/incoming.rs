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

//! Inbound publishes waiting for subscriber demand.

use std::collections::{HashSet, VecDeque};

use crate::mqtt_cs::delivery_flow::FlowId;
use crate::mqtt_cs::flow_registry::{Delivery, FlowRegistry};
use crate::mqtt_cs::packet::v5_0::Publish;
use crate::mqtt_cs::packet::{Packet, Qos};
use crate::mqtt_cs::worker::Dispatch;

#[derive(Debug)]
pub(crate) struct IncomingPublish {
    pub(crate) publish: Publish,
    /// Matched flows the publish has not been handed to yet.
    pub(crate) flows: Vec<FlowId>,
    /// PUBACK or PUBREC to send once every flow has taken the publish.
    pub(crate) ack: Option<Packet>,
}

/// Arrival-ordered queue of matched publishes.
///
/// A publish leaves the queue once every matched flow has taken it. Its
/// acknowledgement is released only when all older publishes are gone too,
/// so acknowledgements go out in arrival order.
#[derive(Debug)]
pub(crate) struct IncomingQueue {
    entries: VecDeque<IncomingPublish>,
    capacity: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub(crate) dispatches: Vec<Dispatch>,
    pub(crate) acks: Vec<Packet>,
}

impl IncomingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, entry: IncomingPublish) {
        self.entries.push_back(entry);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// QoS 0 publishes arriving while this holds are dropped.
    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Whether a QoS 2 publish with `packet_id` is still waiting here.
    pub(crate) fn holds_qos2(&self, packet_id: u16) -> bool {
        self.entries.iter().any(|entry| {
            entry.publish.qos() == Qos::ExactlyOnce && entry.publish.packet_id() == Some(packet_id)
        })
    }

    /// Hand queued publishes to every flow with credit.
    ///
    /// Once a flow refuses a publish, its later publishes are not offered in
    /// the same pass, which keeps per-flow arrival order.
    pub(crate) fn drain(&mut self, registry: &mut FlowRegistry) -> Drained {
        let mut drained = Drained::default();
        let mut blocked: HashSet<FlowId> = HashSet::new();
        for IncomingPublish { publish, flows, .. } in self.entries.iter_mut() {
            flows.retain(|id| {
                if blocked.contains(id) {
                    return true;
                }
                match registry.deliver(*id, publish) {
                    Delivery::Delivered(dispatch) => drained.dispatches.push(dispatch),
                    Delivery::Skipped => {}
                    Delivery::Blocked => {
                        blocked.insert(*id);
                        return true;
                    }
                }
                drained.dispatches.extend(registry.release(*id));
                false
            });
        }
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.flows.is_empty())
        {
            if let Some(entry) = self.entries.pop_front() {
                drained.acks.extend(entry.ack);
            }
        }
        drained
    }

    /// Drop every queued publish, releasing its flow references.
    pub(crate) fn clear(
        &mut self,
        registry: &mut FlowRegistry,
    ) -> (Vec<IncomingPublish>, Vec<Dispatch>) {
        let mut dispatches = Vec::new();
        let dropped: Vec<IncomingPublish> = self.entries.drain(..).collect();
        for entry in &dropped {
            for id in &entry.flows {
                dispatches.extend(registry.release(*id));
            }
        }
        (dropped, dispatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::{mpsc, oneshot};

    use crate::mqtt_cs::codec;
    use crate::mqtt_cs::connection_error::ConnectionError;
    use crate::mqtt_cs::delivery_flow::{DeliveryFlow, FlowControl, FlowEvent, Subscription};
    use crate::mqtt_cs::result_code::PubackReasonCode;
    use crate::mqtt_cs::topic::TopicFilter;

    fn add_flow(registry: &mut FlowRegistry, id: FlowId, filter: &str) -> Subscription {
        let (tx_flow, _) = mpsc::unbounded_channel();
        let (suback_tx, suback_rx) = oneshot::channel();
        let (events, _) = mpsc::unbounded_channel::<FlowEvent>();
        let control = FlowControl::new(id);
        registry.insert(DeliveryFlow::new(Arc::clone(&control), Arc::new(events), suback_tx));
        let _ = registry.get_mut(id).unwrap().acknowledge(Err(ConnectionError::NotConnected));
        registry.subscribe(id, [TopicFilter::new(filter).unwrap()]);
        Subscription::new(control, tx_flow, suback_rx)
    }

    fn arrive(queue: &mut IncomingQueue, registry: &mut FlowRegistry, topic: &str, packet_id: u16) {
        let publish = Publish::builder()
            .topic_name(topic)
            .unwrap()
            .qos(Qos::AtLeastOnce)
            .packet_id(packet_id)
            .payload("")
            .build()
            .unwrap();
        let (flows, _) = registry.find_matching(publish.topic_name());
        queue.push(IncomingPublish {
            publish,
            flows,
            ack: Some(codec::puback(packet_id, PubackReasonCode::Success).unwrap()),
        });
    }

    fn ack_ids(drained: &Drained) -> Vec<u16> {
        drained.acks.iter().filter_map(codec::packet_id).collect()
    }

    #[test]
    fn acks_wait_for_older_publishes() {
        let mut registry = FlowRegistry::default();
        let slow = add_flow(&mut registry, 1, "slow");
        let fast = add_flow(&mut registry, 2, "fast");
        fast.request(10);
        let mut queue = IncomingQueue::new(8);
        arrive(&mut queue, &mut registry, "slow", 1);
        arrive(&mut queue, &mut registry, "fast", 2);

        let drained = queue.drain(&mut registry);
        assert_eq!(drained.dispatches.len(), 1);
        assert!(drained.acks.is_empty());
        assert_eq!(queue.len(), 2);

        slow.request(1);
        let drained = queue.drain(&mut registry);
        assert_eq!(drained.dispatches.len(), 1);
        assert_eq!(ack_ids(&drained), vec![1, 2]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn blocked_flow_keeps_arrival_order() {
        let mut registry = FlowRegistry::default();
        let flow = add_flow(&mut registry, 1, "t/#");
        let mut queue = IncomingQueue::new(8);
        for id in 1..=3 {
            arrive(&mut queue, &mut registry, "t/x", id);
        }
        flow.request(2);
        let drained = queue.drain(&mut registry);
        let topics: Vec<u16> = drained
            .dispatches
            .iter()
            .map(|dispatch| match dispatch {
                Dispatch::Item { publish, .. } => publish.packet_id().unwrap_or_default(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(topics, vec![1, 2]);
        assert_eq!(ack_ids(&drained), vec![1, 2]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn full_queue_reports_backpressure_and_clear_releases() {
        let mut registry = FlowRegistry::default();
        let _flow = add_flow(&mut registry, 1, "t");
        let mut queue = IncomingQueue::new(2);
        arrive(&mut queue, &mut registry, "t", 1);
        assert!(!queue.is_full());
        arrive(&mut queue, &mut registry, "t", 2);
        assert!(queue.is_full());
        assert_eq!(registry.get_mut(1).unwrap().referenced(), 2);
        let (dropped, _) = queue.clear(&mut registry);
        assert_eq!(dropped.len(), 2);
        assert_eq!(registry.get_mut(1).unwrap().referenced(), 0);
        assert!(!queue.is_full());
    }
}
