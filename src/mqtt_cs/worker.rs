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

//! Workers that run application callbacks off the protocol task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::mqtt_cs::connection_error::ConnectionError;
use crate::mqtt_cs::delivery_flow::{FlowControl, FlowId, FlowState, FlowSubscriber};
use crate::mqtt_cs::packet::v5_0::{Publish, Suback, Unsuback};
use crate::mqtt_cs::session::PublishOutcome;

/// A user-visible event produced by the protocol task.
pub(crate) enum Dispatch {
    Item {
        flow: FlowId,
        control: Arc<FlowControl>,
        subscriber: Arc<dyn FlowSubscriber>,
        publish: Publish,
    },
    Error {
        flow: FlowId,
        subscriber: Arc<dyn FlowSubscriber>,
        error: ConnectionError,
    },
    Complete {
        flow: FlowId,
        subscriber: Arc<dyn FlowSubscriber>,
    },
    SubAck {
        flow: FlowId,
        tx: oneshot::Sender<Result<Suback, ConnectionError>>,
        result: Result<Suback, ConnectionError>,
    },
    UnsubAck {
        tx: oneshot::Sender<Result<Unsuback, ConnectionError>>,
        result: Result<Unsuback, ConnectionError>,
    },
    Publish {
        tx: oneshot::Sender<Result<PublishOutcome, ConnectionError>>,
        result: Result<PublishOutcome, ConnectionError>,
    },
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Item { flow, publish, .. } => f
                .debug_struct("Item")
                .field("flow", flow)
                .field("topic", &publish.topic_name())
                .finish(),
            Self::Error { flow, error, .. } => f
                .debug_struct("Error")
                .field("flow", flow)
                .field("error", error)
                .finish(),
            Self::Complete { flow, .. } => f.debug_struct("Complete").field("flow", flow).finish(),
            Self::SubAck { flow, result, .. } => f
                .debug_struct("SubAck")
                .field("flow", flow)
                .field("result", result)
                .finish(),
            Self::UnsubAck { result, .. } => {
                f.debug_struct("UnsubAck").field("result", result).finish()
            }
            Self::Publish { result, .. } => {
                f.debug_struct("Publish").field("result", result).finish()
            }
        }
    }
}

impl Dispatch {
    /// Worker lane. Everything for one flow goes to the same lane so its
    /// callbacks run in order.
    pub(crate) fn lane(&self, lanes: usize) -> usize {
        match self {
            Self::Item { flow, .. }
            | Self::Error { flow, .. }
            | Self::Complete { flow, .. }
            | Self::SubAck { flow, .. } => (*flow % lanes as u64) as usize,
            Self::UnsubAck { .. } | Self::Publish { .. } => 0,
        }
    }

    pub(crate) fn run(self) {
        match self {
            Self::Item {
                control,
                subscriber,
                publish,
                ..
            } => {
                if control.state() != FlowState::Cancelled {
                    subscriber.on_item(publish);
                }
            }
            Self::Error {
                subscriber, error, ..
            } => subscriber.on_error(error),
            Self::Complete { subscriber, .. } => subscriber.on_complete(),
            // A dropped receiver means the caller stopped waiting.
            Self::SubAck { tx, result, .. } => {
                let _ = tx.send(result);
            }
            Self::UnsubAck { tx, result } => {
                let _ = tx.send(result);
            }
            Self::Publish { tx, result } => {
                let _ = tx.send(result);
            }
        }
    }
}

/// Fixed set of worker lanes fed through bounded channels.
///
/// Each lane runs on the blocking thread pool, so a callback that blocks only
/// holds up its own lane.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    lanes: Vec<mpsc::Sender<Dispatch>>,
}

impl WorkerPool {
    /// Spawn `count` lanes. Must be called within a tokio runtime.
    pub(crate) fn new(count: usize, capacity: usize) -> Self {
        let lanes = (0..count.max(1))
            .map(|lane| {
                let (tx, mut rx) = mpsc::channel::<Dispatch>(capacity.max(1));
                tokio::task::spawn_blocking(move || {
                    while let Some(dispatch) = rx.blocking_recv() {
                        if catch_unwind(AssertUnwindSafe(|| dispatch.run())).is_err() {
                            tracing::error!(lane, "application callback panicked");
                        }
                    }
                    tracing::trace!(lane, "worker lane stopped");
                });
                tx
            })
            .collect();
        Self { lanes }
    }

    /// Queue a dispatch, waiting while its lane is full.
    pub(crate) async fn dispatch(&self, dispatch: Dispatch) {
        let lane = dispatch.lane(self.lanes.len());
        if let Err(mpsc::error::SendError(dispatch)) = self.lanes[lane].send(dispatch).await {
            tracing::warn!(lane, ?dispatch, "worker lane closed, dispatch dropped");
        }
    }
}
