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

//! Registry of subscription flows and the topic filters they own.

use std::collections::{HashMap, HashSet};

use crate::mqtt_cs::connection_error::ConnectionError;
use crate::mqtt_cs::delivery_flow::{DeliveryFlow, FlowId, FlowState, Rejected};
use crate::mqtt_cs::packet::v5_0::{Publish, Suback};
use crate::mqtt_cs::topic::TopicFilter;
use crate::mqtt_cs::worker::Dispatch;

/// Result of offering a publish to one flow.
#[derive(Debug)]
pub(crate) enum Delivery {
    Delivered(Dispatch),
    /// The flow is gone or no longer active; the publish is dropped for it.
    Skipped,
    /// No credit; retry once the flow receives more demand.
    Blocked,
}

/// Owns every [`DeliveryFlow`] of a session.
///
/// A flow enters the arena when its SUBSCRIBE is issued and joins the match
/// list once its first filter is granted. It leaves the match list when its
/// last filter is unsubscribed or it is cancelled, and leaves the arena once it
/// is terminal, unreferenced and no longer awaiting its SUBACK.
#[derive(Debug, Default)]
pub(crate) struct FlowRegistry {
    flows: HashMap<FlowId, DeliveryFlow>,
    /// Flows owning at least one filter, in registration order.
    matching: Vec<FlowId>,
    /// Filters the server holds for this session, including those of
    /// cancelled flows.
    subscribed_filters: HashSet<TopicFilter>,
    /// Flows that may have become removable.
    reap_candidates: Vec<FlowId>,
}

impl FlowRegistry {
    pub(crate) fn insert(&mut self, flow: DeliveryFlow) {
        self.flows.insert(flow.id(), flow);
    }

    pub(crate) fn get_mut(&mut self, id: FlowId) -> Option<&mut DeliveryFlow> {
        self.flows.get_mut(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.flows.len()
    }

    /// Grant `filters` to flow `id`. A cancelled or missing flow only records
    /// the filters as held by the server.
    pub(crate) fn subscribe(&mut self, id: FlowId, filters: impl IntoIterator<Item = TopicFilter>) {
        let flow = self
            .flows
            .get_mut(&id)
            .filter(|flow| !flow.state().is_terminal());
        match flow {
            Some(flow) => {
                for filter in filters {
                    if flow.topic_filters().is_empty() && !self.matching.contains(&id) {
                        self.matching.push(id);
                    }
                    flow.add_filter(filter.clone());
                    self.subscribed_filters.insert(filter);
                }
            }
            None => self.subscribed_filters.extend(filters),
        }
    }

    /// Remove `filter` from every flow owning it. Each flow left without
    /// filters is reported to `on_drained` exactly once.
    pub(crate) fn unsubscribe(
        &mut self,
        filter: &TopicFilter,
        mut on_drained: impl FnMut(&mut DeliveryFlow),
    ) {
        let flows = &mut self.flows;
        let reap_candidates = &mut self.reap_candidates;
        self.matching.retain(|id| {
            let Some(flow) = flows.get_mut(id) else {
                return false;
            };
            if flow.remove_filter(filter) && flow.topic_filters().is_empty() {
                on_drained(flow);
                reap_candidates.push(*id);
                return false;
            }
            true
        });
        self.subscribed_filters.remove(filter);
    }

    /// Stop matching flow `id` immediately.
    pub(crate) fn cancel(&mut self, id: FlowId) {
        self.matching.retain(|matching| *matching != id);
        self.reap_candidates.push(id);
    }

    /// Flows with a filter matching `topic`, each listed once and referenced,
    /// plus whether any filter held by the server matches at all.
    pub(crate) fn find_matching(&mut self, topic: &str) -> (Vec<FlowId>, bool) {
        let mut matched = Vec::new();
        for id in &self.matching {
            let Some(flow) = self.flows.get_mut(id) else {
                continue;
            };
            if flow.state() != FlowState::Active {
                continue;
            }
            if flow.topic_filters().iter().any(|filter| filter.matches(topic)) {
                flow.reference();
                matched.push(*id);
            }
        }
        if !matched.is_empty() {
            return (matched, true);
        }
        let subscribed = self
            .subscribed_filters
            .iter()
            .any(|filter| filter.matches(topic));
        (matched, subscribed)
    }

    /// Offer `publish` to flow `id`. Unless blocked, the caller drops the
    /// reference taken by [`find_matching`](Self::find_matching) with
    /// [`release`](Self::release).
    pub(crate) fn deliver(&mut self, id: FlowId, publish: &Publish) -> Delivery {
        let Some(flow) = self.flows.get_mut(&id) else {
            return Delivery::Skipped;
        };
        match flow.deliver(publish) {
            Ok(Some(dispatch)) => Delivery::Delivered(dispatch),
            Ok(None) => Delivery::Skipped,
            Err(Rejected) => Delivery::Blocked,
        }
    }

    /// Drop one reference taken by [`find_matching`](Self::find_matching).
    /// Completes an unsubscribed flow whose last reference this was.
    pub(crate) fn release(&mut self, id: FlowId) -> Option<Dispatch> {
        let flow = self.flows.get_mut(&id)?;
        flow.dereference();
        let completion = flow.try_complete();
        if flow.referenced() == 0 {
            self.reap_candidates.push(id);
        }
        completion
    }

    /// Resolve the SUBACK waiter of flow `id`.
    pub(crate) fn acknowledge(
        &mut self,
        id: FlowId,
        result: Result<Suback, ConnectionError>,
    ) -> Option<Dispatch> {
        self.reap_candidates.push(id);
        self.flows.get_mut(&id)?.acknowledge(result)
    }

    /// Complete every unsubscribed flow that has no references left.
    pub(crate) fn complete_drained(&mut self, ids: &[FlowId]) -> Vec<Dispatch> {
        ids.iter()
            .filter_map(|id| self.flows.get_mut(id)?.try_complete())
            .collect()
    }

    /// Fail flow `id`, e.g. when its SUBSCRIBE exchange fails.
    pub(crate) fn fail(&mut self, id: FlowId, error: ConnectionError) -> Vec<Dispatch> {
        self.matching.retain(|matching| *matching != id);
        self.reap_candidates.push(id);
        match self.flows.get_mut(&id) {
            Some(flow) => flow.fail(error),
            None => Vec::new(),
        }
    }

    /// Fail every flow and forget all filters.
    pub(crate) fn fail_all(&mut self, error: ConnectionError) -> Vec<Dispatch> {
        let mut ids: Vec<FlowId> = self.flows.keys().copied().collect();
        ids.sort_unstable();
        let mut dispatches = Vec::new();
        for id in &ids {
            if let Some(flow) = self.flows.get_mut(id) {
                dispatches.extend(flow.fail(error.clone()));
            }
        }
        self.matching.clear();
        self.subscribed_filters.clear();
        self.reap_candidates.extend(ids);
        dispatches
    }

    /// Remove flows that can no longer produce events, returning them so the
    /// caller can release their subscription identifiers.
    pub(crate) fn reap(&mut self) -> Vec<DeliveryFlow> {
        let mut reaped = Vec::new();
        for id in std::mem::take(&mut self.reap_candidates) {
            let removable = self.flows.get(&id).is_some_and(|flow| {
                flow.state().is_terminal() && flow.referenced() == 0 && !flow.awaiting_suback()
            });
            if removable {
                if let Some(flow) = self.flows.remove(&id) {
                    tracing::trace!(flow = id, "flow removed");
                    reaped.push(flow);
                }
            }
        }
        reaped
    }

    #[cfg(test)]
    pub(crate) fn is_matching(&self, id: FlowId) -> bool {
        self.matching.contains(&id)
    }
}
