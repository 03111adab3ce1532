use tokio::sync::oneshot;

use crate::mqtt_cs::connection_error::ConnectionError;
use crate::mqtt_cs::delivery_flow::DeliveryFlow;
use crate::mqtt_cs::packet::v5_0::{Publish, Subscribe, Unsubscribe};
use crate::mqtt_cs::qos_store::QosRecord;
use crate::mqtt_cs::session::{PublishResponder, UnsubAckResponder};
use crate::mqtt_cs::topic::TopicFilter;
use crate::mqtt_cs::transport::TransportOps;

/// Requests from [`Endpoint`](crate::mqtt_cs::Endpoint) handles to the
/// protocol task.
pub(crate) enum RequestResponse {
    Attach {
        transport: Box<dyn TransportOps + Send>,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Close {
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    /// The SUBACK is reported through the flow.
    Subscribe {
        subscribe: Subscribe,
        filters: Vec<TopicFilter>,
        flow: DeliveryFlow,
    },
    Unsubscribe {
        unsubscribe: Unsubscribe,
        filters: Vec<TopicFilter>,
        response_tx: UnsubAckResponder,
    },
    Publish {
        publish: Publish,
        response_tx: PublishResponder,
    },
    GetStoredRecords {
        response_tx: oneshot::Sender<Result<Vec<QosRecord>, ConnectionError>>,
    },
}
