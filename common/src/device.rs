use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use crate::{
    actuator::{ActuatorDriver, MAX_BRIGHTNESS},
    alpaca::{AlpacaError, AlpacaResponse, ClientParams, Connection},
    config::{PersistedSettings, RuntimeConfig},
    engine::{CoverCalibratorEngine, EngineEvent, RequestError},
    types::{CalibratorState, DeviceStatus},
};

pub const DEVICE_TYPE: &str = "CoverCalibrator";
pub const DRIVER_NAME: &str = "CoverCalibrator";
pub const DRIVER_DESCRIPTION: &str = "ALPACA servo flap cover with flat-field calibrator";
pub const DRIVER_INFO: &str = "Servo cover and illuminator controller";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const INTERFACE_VERSION: i32 = 1;
pub const UNIQUE_ID: &str = "0012-0000-0000-0002";
pub const MANUFACTURER: &str = "covercal";
pub const SERVER_NAME: &str = "covercal ALPACA server";

/// Outcome of one ALPACA request: HTTP status plus envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct AlpacaReply {
    pub status: u16,
    pub body: AlpacaResponse,
}

/// All mutable device state. Every reader and writer goes through one
/// instance, so a tick is never observed half-applied.
#[derive(Debug, Clone)]
pub struct CoverCalibratorDevice {
    engine: CoverCalibratorEngine,
    connection: Connection,
    settings: PersistedSettings,
    server_transaction_id: u32,
}

impl CoverCalibratorDevice {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            engine: CoverCalibratorEngine::new(config),
            connection: Connection::default(),
            settings: config.settings.clone(),
            server_transaction_id: 0,
        }
    }

    pub fn engine(&self) -> &CoverCalibratorEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut CoverCalibratorEngine {
        &mut self.engine
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn hostname(&self) -> &str {
        &self.settings.hostname
    }

    pub fn location(&self) -> &str {
        &self.settings.location
    }

    pub fn discovery_port(&self) -> u16 {
        self.settings.discovery_port
    }

    pub(crate) fn settings_mut(&mut self) -> &mut PersistedSettings {
        &mut self.settings
    }

    /// Settings as they should be written back to the store.
    pub fn persisted_settings(&self) -> PersistedSettings {
        PersistedSettings {
            flaps: self.engine.flaps().limits(),
            brightness: self.engine.brightness(),
            ..self.settings.clone()
        }
    }

    pub fn next_transaction_id(&mut self) -> u32 {
        self.server_transaction_id = self.server_transaction_id.wrapping_add(1);
        self.server_transaction_id
    }

    pub fn tick(&mut self, driver: &mut dyn ActuatorDriver) -> Vec<EngineEvent> {
        self.engine.tick(driver)
    }

    pub fn sync_outputs(&mut self, driver: &mut dyn ActuatorDriver) -> Vec<EngineEvent> {
        self.engine.sync_outputs(driver)
    }

    pub fn handle_get(&mut self, device_number: &str, method: &str, params: &ClientParams) -> AlpacaReply {
        let response = self.envelope(params);
        if let Err(error) = check_device_number(device_number) {
            return bad_request(response, &error);
        }

        let client_id = params.client_id();
        let result = match method.to_ascii_lowercase().as_str() {
            "brightness" => {
                if self.engine.calibrator_state() == CalibratorState::NotPresent {
                    Err(AlpacaError::NotImplemented("calibrator is not present".to_string()))
                } else {
                    Ok(json!(self.engine.brightness()))
                }
            }
            "maxbrightness" => Ok(json!(MAX_BRIGHTNESS)),
            "coverstate" => Ok(json!(self.engine.cover_state().alpaca_value())),
            "calibratorstate" => Ok(json!(self.engine.calibrator_state().alpaca_value())),
            "connected" => Ok(json!(self.connection.is_held_by(client_id))),
            "name" => Ok(json!(DRIVER_NAME)),
            "description" => Ok(json!(DRIVER_DESCRIPTION)),
            "driverinfo" => Ok(json!(DRIVER_INFO)),
            "driverversion" => Ok(json!(DRIVER_VERSION)),
            "interfaceversion" => Ok(json!(INTERFACE_VERSION)),
            "supportedactions" => Ok(json!(Vec::<String>::new())),
            _ => return bad_request(response, &unknown_method(method)),
        };

        AlpacaReply {
            status: 200,
            body: response.with_result(result.map(Some)),
        }
    }

    pub fn handle_put(&mut self, device_number: &str, method: &str, params: &ClientParams) -> AlpacaReply {
        let response = self.envelope(params);
        if let Err(error) = check_device_number(device_number) {
            return bad_request(response, &error);
        }

        let client_id = params.client_id();
        let result = match method.to_ascii_lowercase().as_str() {
            "connected" => params.required_bool("Connected").and_then(|connect| {
                if connect {
                    self.connection.connect(client_id)
                } else {
                    self.connection.disconnect(client_id)
                }
            }),
            "calibratoron" => self.connection.admit(client_id).and_then(|()| {
                let brightness = params.required_i64("Brightness")?;
                let brightness = u16::try_from(brightness)
                    .ok()
                    .filter(|value| *value <= MAX_BRIGHTNESS)
                    .ok_or_else(|| {
                        AlpacaError::InvalidValue(format!(
                            "brightness {brightness} outside 0..={MAX_BRIGHTNESS}"
                        ))
                    })?;
                self.engine.calibrator_on(brightness).map_err(request_error)
            }),
            "calibratoroff" => self
                .connection
                .admit(client_id)
                .and_then(|()| self.engine.calibrator_off().map_err(request_error)),
            "opencover" => self
                .connection
                .admit(client_id)
                .and_then(|()| self.engine.open_cover().map_err(request_error)),
            "closecover" => self
                .connection
                .admit(client_id)
                .and_then(|()| self.engine.close_cover().map_err(request_error)),
            "haltcover" => self
                .connection
                .admit(client_id)
                .and_then(|()| self.engine.halt_cover().map_err(request_error)),
            "action" | "commandblind" | "commandbool" | "commandstring" => Err(
                AlpacaError::NotImplemented(format!("{method} is not implemented")),
            ),
            _ => return bad_request(response, &unknown_method(method)),
        };

        AlpacaReply {
            status: 200,
            body: response.with_result(result.map(|()| None)),
        }
    }

    pub fn api_versions(&mut self, params: &ClientParams) -> AlpacaResponse {
        self.envelope(params).with_value(json!([1]))
    }

    pub fn description(&mut self, params: &ClientParams) -> AlpacaResponse {
        let value = json!({
            "ServerName": SERVER_NAME,
            "Manufacturer": MANUFACTURER,
            "ManufacturerVersion": DRIVER_VERSION,
            "Location": self.settings.location,
        });
        self.envelope(params).with_value(value)
    }

    pub fn configured_devices(&mut self, params: &ClientParams) -> AlpacaResponse {
        let value = json!([{
            "DeviceName": self.settings.hostname,
            "DeviceType": DEVICE_TYPE,
            "DeviceNumber": 0,
            "UniqueID": UNIQUE_ID,
        }]);
        self.envelope(params).with_value(value)
    }

    /// Rejection for routes outside the device and management API.
    pub fn unknown_route(&mut self, params: &ClientParams, path: &str) -> AlpacaReply {
        let response = self.envelope(params);
        bad_request(
            response,
            &AlpacaError::InvalidOperation(format!("no handler for {path}")),
        )
    }

    pub fn status(&self, now: DateTime<Utc>) -> DeviceStatus {
        let calibrator_state = self.engine.calibrator_state();
        DeviceStatus {
            time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            host: self.settings.hostname.clone(),
            location: self.settings.location.clone(),
            connected: self.connection.holder().is_some(),
            client_id: self.connection.holder().unwrap_or(0),
            cover_state: self.engine.cover_state().reported().as_str(),
            target_cover_state: self.engine.target_cover_state().reported().as_str(),
            movement: self.engine.movement(),
            flaps: self.engine.flaps().statuses(),
            calibrator_state: calibrator_state.as_str(),
            brightness: (calibrator_state != CalibratorState::NotPresent)
                .then(|| self.engine.brightness()),
            servo_power: self.engine.servo_power(),
            server_transaction_id: self.server_transaction_id,
        }
    }

    fn envelope(&mut self, params: &ClientParams) -> AlpacaResponse {
        let server_transaction_id = self.next_transaction_id();
        AlpacaResponse::new(params.client_transaction_id(), server_transaction_id)
    }
}

fn check_device_number(raw: &str) -> Result<(), AlpacaError> {
    match raw.parse::<u32>() {
        Ok(0) => Ok(()),
        _ => Err(AlpacaError::InvalidValue(format!(
            "device number {raw} does not exist"
        ))),
    }
}

fn unknown_method(method: &str) -> AlpacaError {
    AlpacaError::InvalidOperation(format!("unknown method {method}"))
}

fn bad_request(response: AlpacaResponse, error: &AlpacaError) -> AlpacaReply {
    AlpacaReply {
        status: 400,
        body: response.with_error(error),
    }
}

fn request_error(error: RequestError) -> AlpacaError {
    match error {
        RequestError::NotPresent(_) => AlpacaError::NotImplemented(error.to_string()),
        RequestError::Faulted(_) | RequestError::CoverMoving => {
            AlpacaError::InvalidOperation(error.to_string())
        }
        RequestError::Flap(_) => AlpacaError::InvalidValue(error.to_string()),
    }
}
