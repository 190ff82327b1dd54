//! HTTP clients for the sensor source and the actuator gateway.
//!
//! Both services answer either with a bare JSON body or with the
//! `{"success": .., "data": ..}` envelope used by the greenhouse backend; the
//! decoders accept both.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::{Action, CoverPosition, Device};
use crate::error::GatewayError;
use crate::state::{DeviceUpdate, SensorUpdate};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ActuatorGateway: Send + Sync {
    /// Drive one actuator to the state described by `action`.
    async fn send(&self, action: Action) -> Result<(), GatewayError>;

    /// What the hardware currently reports.
    async fn device_statuses(&self) -> Result<DeviceUpdate, GatewayError>;
}

#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn latest(&self) -> Result<SensorUpdate, GatewayError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct SensorRow {
    pub(crate) sensor_type: String,
    pub(crate) value: Option<f64>,
    #[serde(default, alias = "time")]
    #[allow(dead_code)]
    pub(crate) timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeviceRow {
    #[serde(alias = "id")]
    pub(crate) device_id: String,
    #[serde(rename = "type", default)]
    pub(crate) kind: Option<String>,
    pub(crate) status: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ControlRequest<'a> {
    device_type: &'a str,
    command: &'a str,
    status: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ControlResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(t) => t,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

/// Fold `/sensors/latest` rows into a partial update; unknown channels and
/// null values are ignored.
pub(crate) fn fold_sensor_rows(rows: &[SensorRow]) -> SensorUpdate {
    let mut u = SensorUpdate::default();
    for r in rows {
        let Some(v) = r.value else { continue };
        match r.sensor_type.as_str() {
            "temperature" => u.temperature = Some(v),
            "humidity" => u.humidity = Some(v),
            "soil_moisture" => u.soil_moisture = Some(v),
            "light_intensity" => u.light_intensity = Some(v),
            other => debug!(sensor_type = %other, "ignoring unknown sensor channel"),
        }
    }
    u
}

/// Interpret a pump/fan status: `true`, `"true"`, `"ON"`, `1`.
pub(crate) fn parse_switch(v: &serde_json::Value) -> Option<bool> {
    match v {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => n.as_i64().map(|n| n != 0),
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => Some(true),
            "false" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn parse_position(v: &serde_json::Value) -> Option<CoverPosition> {
    v.as_str()?.parse().ok()
}

/// Fold `/devices/status` rows into a partial update. Rows that cannot be
/// understood are skipped.
pub(crate) fn fold_device_rows(rows: &[DeviceRow]) -> DeviceUpdate {
    let mut u = DeviceUpdate::default();
    for r in rows {
        let device = r
            .kind
            .as_deref()
            .and_then(|k| k.parse::<Device>().ok())
            .or_else(|| Device::from_gateway_id(&r.device_id));
        match device {
            Some(Device::Pump) => u.pump = parse_switch(&r.status).or(u.pump),
            Some(Device::Fan) => u.fan = parse_switch(&r.status).or(u.fan),
            Some(Device::Cover) => u.cover = parse_position(&r.status).or(u.cover),
            None => debug!(device_id = %r.device_id, "ignoring unknown device"),
        }
    }
    u
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Status(resp.status().as_u16()));
        }
        let body: Envelope<T> = resp.json().await?;
        Ok(body.into_inner())
    }
}

#[async_trait]
impl ActuatorGateway for HttpGateway {
    async fn send(&self, action: Action) -> Result<(), GatewayError> {
        let device = action.device();
        let url = format!("{}/devices/{}/control", self.base_url, device.gateway_id());
        let body = ControlRequest {
            device_type: device.kind(),
            command: "SET_STATE",
            status: action.wire_status(),
        };

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        let reply: Option<ControlResponse> = resp.json().await.ok();

        match reply {
            Some(r) if r.success => Ok(()),
            Some(r) => Err(GatewayError::Rejected(
                r.error.unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            )),
            None if status.is_success() => {
                warn!(device = %device, "gateway acknowledged without a body");
                Ok(())
            }
            None => Err(GatewayError::Status(status.as_u16())),
        }
    }

    async fn device_statuses(&self) -> Result<DeviceUpdate, GatewayError> {
        let rows: Vec<DeviceRow> = self.get_json("/devices/status").await?;
        Ok(fold_device_rows(&rows))
    }
}

#[async_trait]
impl SensorSource for HttpGateway {
    async fn latest(&self) -> Result<SensorUpdate, GatewayError> {
        let rows: Vec<SensorRow> = self.get_json("/sensors/latest").await?;
        Ok(fold_sensor_rows(&rows))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
