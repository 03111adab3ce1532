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

//! In-memory store of unacknowledged outgoing QoS 1/2 exchanges.

use crate::mqtt_cs::id_map::IdMap;
use crate::mqtt_cs::packet::v5_0::{Publish, Pubrel};
use crate::mqtt_cs::packet::Packet;

/// Message to retransmit for an unacknowledged exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QosMessage {
    Publish(Publish),
    /// QoS 2 exchange whose PUBREC has been received.
    Release(Pubrel),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosRecord {
    pub packet_id: u16,
    /// Position in the send order. Reconnect retransmits in ascending order.
    pub sequence: u64,
    pub message: QosMessage,
}

impl QosRecord {
    /// Packet to retransmit after a reconnect. PUBLISH carries the DUP flag.
    pub fn retransmission(&self) -> Packet {
        match &self.message {
            QosMessage::Publish(publish) => Packet::V5_0Publish(publish.clone().set_dup(true)),
            QosMessage::Release(pubrel) => Packet::V5_0Pubrel(pubrel.clone()),
        }
    }
}

#[derive(Debug)]
pub struct QosStore {
    records: IdMap<QosRecord>,
    next_sequence: u64,
}

impl QosStore {
    pub fn new(max_packet_id: u16) -> Self {
        Self {
            records: IdMap::new(max_packet_id as u32),
            next_sequence: 0,
        }
    }

    /// Persist a publish before its first transmission.
    pub fn store(&mut self, packet_id: u16, publish: Publish) {
        let sequence = self.bump();
        let previous = self.records.put(
            packet_id as u32,
            QosRecord {
                packet_id,
                sequence,
                message: QosMessage::Publish(publish),
            },
        );
        debug_assert!(previous.is_none(), "packet id {packet_id} stored twice");
    }

    pub fn get(&self, packet_id: u16) -> Option<&QosRecord> {
        self.records.get(packet_id as u32)
    }

    pub fn discard(&mut self, packet_id: u16) -> Option<QosRecord> {
        self.records.remove(packet_id as u32)
    }

    /// Replace the stored publish with its PUBREL. The record moves to the end
    /// of the send order since the PUBREL is sent now.
    pub fn mark_released(&mut self, packet_id: u16, pubrel: Pubrel) -> bool {
        let sequence = self.next_sequence;
        match self.records.get_mut(packet_id as u32) {
            Some(record) => {
                record.sequence = sequence;
                record.message = QosMessage::Release(pubrel);
                self.next_sequence = self.next_sequence.saturating_add(1);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records_in_send_order(&self) -> Vec<QosRecord> {
        let mut records: Vec<QosRecord> = self.records.iter().map(|(_, r)| r.clone()).collect();
        records.sort_by_key(|record| record.sequence);
        records
    }

    /// Load records saved by an earlier session. Returns the records whose
    /// packet id is out of range or duplicated.
    pub fn restore(&mut self, records: Vec<QosRecord>) -> Vec<QosRecord> {
        let mut rejected = Vec::new();
        for record in records {
            let key = record.packet_id as u32;
            if record.packet_id == 0
                || key > self.records.max_key()
                || self.records.contains_key(key)
            {
                rejected.push(record);
                continue;
            }
            self.next_sequence = self.next_sequence.max(record.sequence.saturating_add(1));
            self.records.put(key, record);
        }
        rejected
    }

    fn bump(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_cs::packet::Qos;
    use crate::mqtt_cs::result_code::PubrelReasonCode;

    fn publish(packet_id: u16) -> Publish {
        Publish::builder()
            .topic_name("t")
            .unwrap()
            .qos(Qos::ExactlyOnce)
            .packet_id(packet_id)
            .payload("p")
            .build()
            .unwrap()
    }

    fn pubrel(packet_id: u16) -> Pubrel {
        Pubrel::builder()
            .packet_id(packet_id)
            .reason_code(PubrelReasonCode::Success)
            .build()
            .unwrap()
    }

    #[test]
    fn qos2_record_moves_from_publish_to_release() {
        let mut store = QosStore::new(10);
        store.store(5, publish(5));
        assert!(matches!(
            store.get(5).map(|r| &r.message),
            Some(QosMessage::Publish(_))
        ));
        assert!(store.mark_released(5, pubrel(5)));
        assert!(matches!(
            store.get(5).map(|r| &r.message),
            Some(QosMessage::Release(_))
        ));
        assert!(store.discard(5).is_some());
        assert!(store.get(5).is_none());
        assert!(!store.mark_released(5, pubrel(5)));
    }

    #[test]
    fn send_order_follows_latest_transmission() {
        let mut store = QosStore::new(10);
        store.store(3, publish(3));
        store.store(1, publish(1));
        store.store(2, publish(2));
        store.mark_released(3, pubrel(3));
        let order: Vec<u16> = store
            .records_in_send_order()
            .iter()
            .map(|r| r.packet_id)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn retransmitted_publish_has_dup_set() {
        let mut store = QosStore::new(10);
        store.store(4, publish(4));
        match store.get(4).map(QosRecord::retransmission) {
            Some(Packet::V5_0Publish(p)) => {
                assert!(p.dup());
                assert_eq!(p.packet_id(), Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn restore_rejects_conflicting_records() {
        let mut store = QosStore::new(10);
        store.store(1, publish(1));
        let rejected = store.restore(vec![
            QosRecord {
                packet_id: 1,
                sequence: 7,
                message: QosMessage::Publish(publish(1)),
            },
            QosRecord {
                packet_id: 11,
                sequence: 8,
                message: QosMessage::Publish(publish(11)),
            },
            QosRecord {
                packet_id: 2,
                sequence: 9,
                message: QosMessage::Publish(publish(2)),
            },
        ]);
        assert_eq!(rejected.len(), 2);
        assert_eq!(store.len(), 2);
        store.store(3, publish(3));
        assert_eq!(store.get(3).map(|r| r.sequence), Some(10));
    }

    #[test]
    fn restoring_the_last_sequence_saturates() {
        let mut store = QosStore::new(10);
        let rejected = store.restore(vec![QosRecord {
            packet_id: 1,
            sequence: u64::MAX,
            message: QosMessage::Publish(publish(1)),
        }]);
        assert!(rejected.is_empty());
        store.store(2, publish(2));
        assert_eq!(store.get(2).map(|r| r.sequence), Some(u64::MAX));
        let order: Vec<u16> = store
            .records_in_send_order()
            .iter()
            .map(|r| r.packet_id)
            .collect();
        assert_eq!(order.len(), 2);
    }
}
