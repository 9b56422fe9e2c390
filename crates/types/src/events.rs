use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::DeviceId;
use crate::roaming::RoamingEvent;
use crate::topology::QualityAnomaly;
use crate::wire::{AttrMsg, CmdAckMsg, CmdResMsg, EvtMsg, LwtMsg, StateMsg};

/// Everything that travels on the internal broadcast bus. The router is
/// the only producer of the `*Received` variants; the others are emitted
/// by the owning component when its model changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    StateReceived {
        device: DeviceId,
        topic: String,
        msg: StateMsg,
    },
    AttrReceived {
        device: DeviceId,
        topic: String,
        msg: AttrMsg,
    },
    TelemetryReceived {
        device: DeviceId,
        topic: String,
        name: Option<String>,
        ts: i64,
        payload: Value,
    },
    EventReceived {
        device: DeviceId,
        topic: String,
        msg: EvtMsg,
    },
    LwtReceived {
        device: DeviceId,
        topic: String,
        msg: LwtMsg,
    },
    CommandAck {
        device: DeviceId,
        msg: CmdAckMsg,
    },
    CommandResult {
        device: DeviceId,
        msg: CmdResMsg,
    },
    TopologyReport {
        device: DeviceId,
        sub: Option<String>,
        ts: i64,
        payload: Value,
    },
    DeviceRegistered {
        device: DeviceId,
    },
    DeviceRemoved {
        device: DeviceId,
    },
    DeviceOnlineChanged {
        device: DeviceId,
        online: bool,
    },
    /// A material model change (interfaces, bridge/route tables) that
    /// should re-trigger connection inference.
    ModelChanged {
        device: DeviceId,
    },
    TopologyChanged {
        hash: u64,
    },
    RoamingDetected(RoamingEvent),
    AnomalyDetected(QualityAnomaly),
}
