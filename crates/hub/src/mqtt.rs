use serde::Deserialize;

use crate::device::Device;
use crate::gateway::{parse_position, parse_switch};
use crate::state::{DeviceUpdate, SensorUpdate, StateStore};

pub(crate) const SENSOR_TOPICS: &str = "greenhouse/sensors/+";
pub(crate) const DEVICE_TOPICS: &str = "greenhouse/devices/+/status";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ValueMsg {
    pub(crate) value: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusMsg {
    pub(crate) status: serde_json::Value,
}

/// What a publish changed in the store.
#[derive(Debug, PartialEq)]
pub(crate) enum Ingested {
    Sensor(String),
    Device(Device),
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract the channel from "greenhouse/sensors/<sensor_type>".
pub(crate) fn extract_sensor_type(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "greenhouse" && parts[1] == "sensors" && !parts[2].is_empty()
    {
        Some(parts[2])
    } else {
        None
    }
}

/// Extract device_id from "greenhouse/devices/<device_id>/status".
pub(crate) fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4 && parts[0] == "greenhouse" && parts[1] == "devices" && parts[3] == "status"
    {
        Some(parts[2])
    } else {
        None
    }
}

pub(crate) fn sensor_update(sensor_type: &str, value: f64) -> Option<SensorUpdate> {
    let mut u = SensorUpdate::default();
    match sensor_type {
        "temperature" => u.temperature = Some(value),
        "humidity" => u.humidity = Some(value),
        "soil_moisture" => u.soil_moisture = Some(value),
        "light_intensity" => u.light_intensity = Some(value),
        _ => return None,
    }
    Some(u)
}

pub(crate) fn device_update(device: Device, status: &serde_json::Value) -> Option<DeviceUpdate> {
    let mut u = DeviceUpdate::default();
    match device {
        Device::Pump => u.pump = Some(parse_switch(status)?),
        Device::Fan => u.fan = Some(parse_switch(status)?),
        Device::Cover => u.cover = Some(parse_position(status)?),
    }
    Some(u)
}

/// Fold one publish into the store. Errors describe why it was dropped.
pub(crate) async fn ingest(
    state: &StateStore,
    topic: &str,
    payload: &[u8],
) -> Result<Ingested, String> {
    if let Some(sensor_type) = extract_sensor_type(topic) {
        let msg: ValueMsg = serde_json::from_slice(payload)
            .map_err(|e| format!("bad sensor json on {topic}: {e}"))?;
        let update = sensor_update(sensor_type, msg.value)
            .ok_or_else(|| format!("unknown sensor channel '{sensor_type}'"))?;
        state.update_sensors(update).await;
        Ok(Ingested::Sensor(sensor_type.to_string()))
    } else if let Some(device_id) = extract_device_id(topic) {
        let device = Device::from_gateway_id(device_id)
            .ok_or_else(|| format!("unknown device '{device_id}'"))?;
        let msg: StatusMsg = serde_json::from_slice(payload)
            .map_err(|e| format!("bad status json on {topic}: {e}"))?;
        let update = device_update(device, &msg.status)
            .ok_or_else(|| format!("unreadable {device} status {}", msg.status))?;
        state.update_devices(update).await;
        Ok(Ingested::Device(device))
    } else {
        Err(format!("unhandled topic={topic}"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
