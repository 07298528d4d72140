//! Device layer seam. The engine only ever talks to hardware through
//! [`DeviceBus`]; transports (serial, UDP, HTTP) live outside the core.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::EngineError;

/// A raw sensor reading tagged with the device's native unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub raw: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorAction {
    TurnOn,
    TurnOff,
    Pulse,
    Dose,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActuatorParams {
    pub value: Option<f64>,
    pub duration_secs: Option<u64>,
    pub power_level: Option<u8>,
}

/// Shared, exclusively-owned hardware resource. Reads and writes may be slow
/// and may fail; a failure is fatal to the run that issued it.
#[async_trait]
pub trait DeviceBus: Send + Sync {
    async fn read(&self, device_id: &str) -> Result<Reading, EngineError>;

    async fn write(
        &self,
        device_id: &str,
        action: ActuatorAction,
        params: &ActuatorParams,
    ) -> Result<(), EngineError>;
}

/// In-memory bus for local runs and tests: readings are preset per device,
/// writes are recorded.
pub struct SimulatedBus {
    readings: RwLock<HashMap<String, Reading>>,
    commands: StdMutex<Vec<(String, ActuatorAction, ActuatorParams)>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            readings: RwLock::new(HashMap::new()),
            commands: StdMutex::new(Vec::new()),
        }
    }

    pub async fn set_reading(&self, device_id: &str, raw: f64, unit: &str) {
        self.readings.write().await.insert(
            device_id.to_string(),
            Reading {
                raw,
                unit: unit.to_string(),
            },
        );
    }

    pub fn commands(&self) -> Vec<(String, ActuatorAction, ActuatorParams)> {
        self.commands.lock().unwrap().clone()
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceBus for SimulatedBus {
    async fn read(&self, device_id: &str) -> Result<Reading, EngineError> {
        self.readings
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| EngineError::DeviceIo(format!("device {device_id} not found")))
    }

    async fn write(
        &self,
        device_id: &str,
        action: ActuatorAction,
        params: &ActuatorParams,
    ) -> Result<(), EngineError> {
        tracing::debug!(device = %device_id, ?action, "simulated actuator command");
        self.commands
            .lock()
            .unwrap()
            .push((device_id.to_string(), action, params.clone()));
        Ok(())
    }
}
