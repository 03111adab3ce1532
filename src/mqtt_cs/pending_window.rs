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

//! Bounded window of in-flight request/acknowledgement exchanges.

use std::collections::VecDeque;

use crate::mqtt_cs::id_allocator::IdAllocator;
use crate::mqtt_cs::id_map::IdMap;

/// A request that can occupy a window slot.
pub(crate) trait WindowRequest {
    /// Whether the request carries a subscription identifier when sent.
    fn wants_subscription_id(&self) -> bool;
}

/// An exchange that has been sent and awaits its acknowledgement.
#[derive(Debug)]
pub(crate) struct PendingExchange<T> {
    pub(crate) packet_id: u16,
    pub(crate) subscription_id: Option<u32>,
    pub(crate) request: T,
}

/// Identifiers handed out when a request is admitted into a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Admitted {
    pub(crate) packet_id: u16,
    pub(crate) subscription_id: Option<u32>,
}

/// Window of at most `window` concurrent exchanges with FIFO overflow.
///
/// Each exchange moves `Queued -> Sent -> Acknowledged | Failed`. Packet ids
/// come from the dedicated range `[min, min + window - 1]`, so admission only
/// waits for a slot, never for an identifier. A slot stays occupied from
/// admission until [`free_slot`](Self::free_slot), which hands the same
/// packet id straight to the oldest queued request.
#[derive(Debug)]
pub(crate) struct PendingWindow<T> {
    min: u16,
    window: u16,
    occupied: u16,
    packet_ids: IdAllocator,
    subscription_ids: IdAllocator,
    in_flight: IdMap<PendingExchange<T>>,
    queued: VecDeque<T>,
}

impl<T: WindowRequest> PendingWindow<T> {
    /// `subscription_id_max` of 0 disables subscription identifiers.
    pub(crate) fn new(min: u16, window: u16, subscription_id_max: u32) -> Self {
        debug_assert!(window > 0);
        let max = min as u32 + window as u32 - 1;
        debug_assert!(max <= u16::MAX as u32);
        Self {
            min,
            window,
            occupied: 0,
            packet_ids: IdAllocator::new(min as u32, max),
            subscription_ids: IdAllocator::new(1, subscription_id_max),
            in_flight: IdMap::new(window as u32 - 1),
            queued: VecDeque::new(),
        }
    }

    /// Admit `request` if a slot is free, otherwise queue it.
    pub(crate) fn enqueue(&mut self, request: T) -> Option<Admitted> {
        if self.occupied == self.window {
            self.queued.push_back(request);
            tracing::trace!(queued = self.queued.len(), "exchange window full, request queued");
            return None;
        }
        let Some(packet_id) = self.packet_ids.acquire() else {
            // occupied < window guarantees a free id
            tracing::error!("no packet id despite a free slot");
            self.queued.push_back(request);
            return None;
        };
        Some(self.admit(packet_id as u16, request))
    }

    fn admit(&mut self, packet_id: u16, request: T) -> Admitted {
        let subscription_id = if request.wants_subscription_id() {
            self.subscription_ids.acquire()
        } else {
            None
        };
        self.occupied += 1;
        self.in_flight.put(
            self.key(packet_id),
            PendingExchange {
                packet_id,
                subscription_id,
                request,
            },
        );
        Admitted {
            packet_id,
            subscription_id,
        }
    }

    /// The sent exchange for `packet_id`.
    pub(crate) fn get_mut(&mut self, packet_id: u16) -> Option<&mut PendingExchange<T>> {
        let key = self.key_checked(packet_id)?;
        self.in_flight.get_mut(key)
    }

    /// Remove the sent exchange for `packet_id`. Its slot and packet id stay
    /// occupied until [`free_slot`](Self::free_slot).
    pub(crate) fn take(&mut self, packet_id: u16) -> Option<PendingExchange<T>> {
        let key = self.key_checked(packet_id)?;
        self.in_flight.remove(key)
    }

    /// Free the slot of a taken exchange. The oldest queued request is
    /// admitted with the same packet id and returned, otherwise the id is
    /// released.
    pub(crate) fn free_slot(&mut self, packet_id: u16) -> Option<Admitted> {
        debug_assert!(self.occupied > 0);
        self.occupied -= 1;
        match self.queued.pop_front() {
            Some(request) => Some(self.admit(packet_id, request)),
            None => {
                self.packet_ids.release(packet_id as u32);
                None
            }
        }
    }

    /// Return a subscription identifier once nothing refers to it any more.
    pub(crate) fn release_subscription_id(&mut self, subscription_id: u32) {
        self.subscription_ids.release(subscription_id);
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Remove every sent and queued request, sent ones first in packet id
    /// order, and release their packet ids. Subscription ids stay held.
    pub(crate) fn drain_all(&mut self) -> (Vec<PendingExchange<T>>, Vec<T>) {
        let sent: Vec<PendingExchange<T>> = self
            .in_flight
            .drain()
            .into_iter()
            .map(|(_, exchange)| exchange)
            .collect();
        self.packet_ids.clear();
        self.occupied = 0;
        (sent, self.queued.drain(..).collect())
    }

    fn key(&self, packet_id: u16) -> u32 {
        (packet_id - self.min) as u32
    }

    fn key_checked(&self, packet_id: u16) -> Option<u32> {
        packet_id
            .checked_sub(self.min)
            .map(u32::from)
            .filter(|key| *key < self.window as u32)
    }
}
