//! T7 broadcast frames
//!
//! A T7 streams engine speed, pedal position, vehicle speed and a few
//! status bits on the powertrain bus without being asked. Symbols already
//! covered here are taken from the broadcast instead of the DDLI record.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace};
use trionic_can::{CanClient, CanFrame};

use crate::eventbus::Controller;
use crate::state::Measurements;

/// Engine speed and accelerator pedal
pub const ENGINE_FRAME_ID: u32 = 0x1A0;
/// Status bits, gear and pedals
pub const STATUS_FRAME_ID: u32 = 0x280;
/// Vehicle speed
pub const SPEED_FRAME_ID: u32 = 0x3A0;

pub const BROADCAST_IDS: [u32; 3] = [ENGINE_FRAME_ID, STATUS_FRAME_ID, SPEED_FRAME_ID];

/// One decoded broadcast value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BroadcastValue {
    pub name: &'static str,
    pub value: f64,
    /// Published on the bus only, never stored as a measurement
    pub bus_only: bool,
}

impl BroadcastValue {
    fn measured(name: &'static str, value: f64) -> Self {
        Self {
            name,
            value,
            bus_only: false,
        }
    }

    fn flag(name: &'static str, value: u8) -> Self {
        Self {
            name,
            value: f64::from(value),
            bus_only: true,
        }
    }
}

/// Decode a broadcast frame; unknown identifiers and short frames yield nothing
pub fn decode_broadcast(frame: &CanFrame) -> Vec<BroadcastValue> {
    let d = frame.data.as_ref();
    match frame.id {
        ENGINE_FRAME_ID if d.len() >= 6 => vec![
            BroadcastValue::measured("ActualIn.n_Engine", f64::from(u16::from_be_bytes([d[1], d[2]]))),
            BroadcastValue::measured("Out.X_AccPedal", f64::from(d[5])),
        ],
        STATUS_FRAME_ID if d.len() >= 5 => vec![
            BroadcastValue::flag("LIMP", d[3] & 0x01),
            BroadcastValue::flag("CEL", (d[4] & 0x80) >> 7),
            BroadcastValue::flag("CRUISE", (d[4] & 0x20) >> 5),
            BroadcastValue::measured("Out.X_ActualGear", f64::from(d[1])),
            BroadcastValue::measured("Out.ST_BrakeLight", f64::from((d[2] & 0x02) >> 1)),
            BroadcastValue::measured("In.ST_ClutchBrake1", f64::from((d[2] & 0x08) >> 3)),
        ],
        SPEED_FRAME_ID if d.len() >= 5 => vec![BroadcastValue::measured(
            "In.v_Vehicle",
            f64::from(u16::from_be_bytes([d[3], d[4]])) * 0.1,
        )],
        _ => Vec::new(),
    }
}

/// Names a broadcast can ever store in the measurement state
pub fn adoptable(name: &str) -> bool {
    matches!(
        name,
        "ActualIn.n_Engine"
            | "Out.X_AccPedal"
            | "In.v_Vehicle"
            | "Out.X_ActualGear"
            | "Out.ST_BrakeLight"
            | "In.ST_ClutchBrake1"
    )
}

/// Forward broadcast values to the bus and the measurement state until aborted
pub fn spawn_listener(can: &Arc<CanClient>, bus: Controller, state: Measurements) -> JoinHandle<()> {
    let mut sub = can.subscribe(&BROADCAST_IDS);
    tokio::spawn(async move {
        while let Some(frame) = sub.recv().await {
            trace!(%frame, "Broadcast frame");
            for v in decode_broadcast(&frame) {
                if !v.bus_only {
                    state.set(v.name, v.value);
                }
                if let Err(e) = bus.publish(v.name, v.value) {
                    debug!(%e, name = v.name, "Broadcast value dropped");
                }
            }
        }
    })
}
