use serde::{Deserialize, Serialize};

use crate::flaps::{FlapLimits, MAX_SERVOS};
use crate::types::FlapMovement;

pub const CONFIG_MAGIC: u8 = b'*';
pub const MAX_NAME_LENGTH: usize = 40;
pub const ALPACA_DISCOVERY_PORT: u16 = 32227;
pub const DEFAULT_HOSTNAME: &str = "espACC00";
pub const DEFAULT_LOCATION: &str = "update me";
/// LEDC channels reserved for directly driven servos.
pub const MAX_DIRECT_SERVOS: usize = 4;

/// Tick-based timing for the cover and calibrator state machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    pub tick_interval_ms: u64,
    pub movement: FlapMovement,
    pub position_increment_deg: u8,
    pub servo_start_ticks: u32,
    pub all_flaps_settle_ticks: u32,
    pub calibrator_stabilize_ticks: u32,
    pub max_motion_ticks: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5,
            movement: FlapMovement::EachFlapInSequence,
            position_increment_deg: 2,
            servo_start_ticks: 20,
            all_flaps_settle_ticks: 200,
            calibrator_stabilize_ticks: 100,
            max_motion_ticks: 12_000,
        }
    }
}

impl MotionConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 1_000);
        self.position_increment_deg = self.position_increment_deg.clamp(1, 90);
        self.servo_start_ticks = self.servo_start_ticks.max(1);
        self.all_flaps_settle_ticks = self.all_flaps_settle_ticks.max(1);
        self.calibrator_stabilize_ticks = self.calibrator_stabilize_ticks.max(1);
        self.max_motion_ticks = self.max_motion_ticks.max(100);
    }
}

/// Values changed through the setup pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub hostname: String,
    pub location: String,
    #[serde(rename = "discoveryPort")]
    pub discovery_port: u16,
    pub flaps: Vec<FlapLimits>,
    pub brightness: u16,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            discovery_port: ALPACA_DISCOVERY_PORT,
            flaps: vec![FlapLimits::default()],
            brightness: 0,
        }
    }
}

impl PersistedSettings {
    pub fn sanitize(&mut self, max_brightness: u16) {
        if !is_valid_name(&self.hostname) {
            self.hostname = DEFAULT_HOSTNAME.to_string();
        }
        if !is_valid_name(&self.location) {
            self.location = DEFAULT_LOCATION.to_string();
        }
        if self.discovery_port <= 1024 {
            self.discovery_port = ALPACA_DISCOVERY_PORT;
        }
        self.flaps.truncate(MAX_SERVOS);
        if self.flaps.is_empty() {
            self.flaps.push(FlapLimits::default());
        }
        for limits in &mut self.flaps {
            if !limits.is_valid() {
                *limits = FlapLimits::default();
            }
        }
        self.brightness = self.brightness.min(max_brightness);
    }
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() < MAX_NAME_LENGTH - 1
}

/// Physical servo wiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServoTopology {
    /// One PWM pin per servo.
    DirectPins { pins: Vec<i32> },
    /// PCA9685 16-channel PWM expander on I2C.
    Pca9685 {
        #[serde(rename = "sdaPin")]
        sda_pin: i32,
        #[serde(rename = "sclPin")]
        scl_pin: i32,
        address: u8,
    },
}

impl ServoTopology {
    /// Servo channels the board can actually drive.
    pub fn channel_count(&self) -> usize {
        match self {
            Self::DirectPins { pins } => pins.len().min(MAX_DIRECT_SERVOS),
            Self::Pca9685 { .. } => MAX_SERVOS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub topology: ServoTopology,
    #[serde(rename = "powerPin")]
    pub power_pin: i32,
    #[serde(rename = "powerActiveHigh")]
    pub power_active_high: bool,
    #[serde(rename = "illuminatorPin")]
    pub illuminator_pin: i32,
    #[serde(rename = "coverPresent")]
    pub cover_present: bool,
    #[serde(rename = "calibratorPresent")]
    pub calibrator_present: bool,
    #[serde(rename = "servoMinPulseUs")]
    pub servo_min_pulse_us: u16,
    #[serde(rename = "servoMaxPulseUs")]
    pub servo_max_pulse_us: u16,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            topology: ServoTopology::Pca9685 {
                sda_pin: 4,
                scl_pin: 5,
                address: 0x40,
            },
            power_pin: 12,
            power_active_high: true,
            illuminator_pin: 13,
            cover_present: true,
            calibrator_present: true,
            servo_min_pulse_us: 500,
            servo_max_pulse_us: 2_500,
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        if self.servo_min_pulse_us >= self.servo_max_pulse_us {
            self.servo_min_pulse_us = 500;
            self.servo_max_pulse_us = 2_500;
        }
        if let ServoTopology::DirectPins { pins } = &mut self.topology {
            pins.retain(|pin| *pin >= 0);
            pins.truncate(MAX_DIRECT_SERVOS);
            if pins.is_empty() {
                self.cover_present = false;
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub magic: u8,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub settings: PersistedSettings,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            magic: CONFIG_MAGIC,
            motion: MotionConfig::default(),
            settings: PersistedSettings::default(),
            hardware: HardwareConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Result of reading the configuration store at boot.
#[derive(Debug, Clone)]
pub struct StoredConfig {
    pub config: RuntimeConfig,
    /// The stored record was missing or unusable and defaults were substituted.
    pub needs_rewrite: bool,
    pub reason: Option<String>,
}

impl RuntimeConfig {
    /// Interprets a raw stored record. Anything without the magic marker
    /// yields compiled-in defaults flagged for an immediate rewrite.
    pub fn from_stored(raw: Option<&[u8]>, max_brightness: u16) -> StoredConfig {
        let parsed = match raw {
            None => Err("no stored configuration".to_string()),
            Some(raw) => serde_json::from_slice::<RuntimeConfig>(raw)
                .map_err(|err| format!("stored configuration unreadable: {err}"))
                .and_then(|config| {
                    if config.magic == CONFIG_MAGIC {
                        Ok(config)
                    } else {
                        Err("stored configuration missing magic marker".to_string())
                    }
                }),
        };

        match parsed {
            Ok(mut config) => {
                config.sanitize(max_brightness);
                StoredConfig {
                    config,
                    needs_rewrite: false,
                    reason: None,
                }
            }
            Err(reason) => StoredConfig {
                config: RuntimeConfig::default(),
                needs_rewrite: true,
                reason: Some(reason),
            },
        }
    }

    pub fn sanitize(&mut self, max_brightness: u16) {
        self.motion.sanitize();
        self.hardware.sanitize();
        self.settings.sanitize(max_brightness);
        let capacity = self.hardware.topology.channel_count().max(1);
        self.settings.flaps.truncate(capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_record_yields_defaults_and_rewrite() {
        let loaded = RuntimeConfig::from_stored(None, 1023);
        assert!(loaded.needs_rewrite);
        assert_eq!(loaded.config.magic, CONFIG_MAGIC);
        assert_eq!(loaded.config.settings, PersistedSettings::default());
    }

    #[test]
    fn record_without_magic_is_treated_as_corrupt() {
        let raw = br#"{"settings":{"hostname":"dome","location":"roof","discoveryPort":40000,"flaps":[],"brightness":5}}"#;
        let loaded = RuntimeConfig::from_stored(Some(raw), 1023);
        assert!(loaded.needs_rewrite);
        assert_eq!(loaded.config.settings.hostname, DEFAULT_HOSTNAME);
    }

    #[test]
    fn garbage_is_treated_as_corrupt() {
        let loaded = RuntimeConfig::from_stored(Some(b"\xff\x00not json"), 1023);
        assert!(loaded.needs_rewrite);
        assert!(loaded.reason.is_some());
    }

    #[test]
    fn valid_record_round_trips_and_is_sanitized() {
        let mut config = RuntimeConfig::default();
        config.settings.hostname = "cover1".to_string();
        config.settings.brightness = 5_000;
        config.settings.flaps = vec![
            FlapLimits::new(10, 170).unwrap(),
            FlapLimits {
                min_limit: 90,
                max_limit: 10,
            },
        ];
        let raw = serde_json::to_vec(&config).unwrap();

        let loaded = RuntimeConfig::from_stored(Some(&raw), 1023);
        assert!(!loaded.needs_rewrite);
        assert_eq!(loaded.config.settings.hostname, "cover1");
        assert_eq!(loaded.config.settings.brightness, 1023);
        assert_eq!(
            loaded.config.settings.flaps,
            vec![FlapLimits::new(10, 170).unwrap(), FlapLimits::default()]
        );
    }

    #[test]
    fn direct_pin_topology_caps_flap_count() {
        let mut config = RuntimeConfig::default();
        config.hardware.topology = ServoTopology::DirectPins { pins: vec![4, 5] };
        config.settings.flaps = vec![FlapLimits::default(); 6];
        config.sanitize(1023);
        assert_eq!(config.settings.flaps.len(), 2);
    }

    #[test]
    fn direct_pins_beyond_ledc_channels_are_dropped() {
        let mut hardware = HardwareConfig {
            topology: ServoTopology::DirectPins {
                pins: vec![4, 5, 6, 7, 15, 16],
            },
            ..HardwareConfig::default()
        };
        assert_eq!(hardware.topology.channel_count(), MAX_DIRECT_SERVOS);

        hardware.sanitize();
        assert_eq!(
            hardware.topology,
            ServoTopology::DirectPins {
                pins: vec![4, 5, 6, 7]
            }
        );
        assert_eq!(HardwareConfig::default().topology.channel_count(), MAX_SERVOS);
    }

    #[test]
    fn low_discovery_port_is_reset() {
        let mut settings = PersistedSettings {
            discovery_port: 80,
            hostname: String::new(),
            ..PersistedSettings::default()
        };
        settings.sanitize(1023);
        assert_eq!(settings.discovery_port, ALPACA_DISCOVERY_PORT);
        assert_eq!(settings.hostname, DEFAULT_HOSTNAME);
    }
}
