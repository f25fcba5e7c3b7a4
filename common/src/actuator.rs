use thiserror::Error;

use crate::config::HardwareConfig;
use crate::flaps::{MAX_SERVOS, RC_MAX_LIMIT};

/// Full-scale illuminator value (10-bit PWM).
pub const MAX_BRIGHTNESS: u16 = 1023;
pub const SERVO_FREQUENCY_HZ: u32 = 50;
pub const SERVO_PERIOD_US: u32 = 1_000_000 / SERVO_FREQUENCY_HZ;
pub const PCA9685_RESOLUTION: u32 = 4096;
pub const PCA9685_OSCILLATOR_HZ: u32 = 25_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("no servo channel for flap {0}")]
    NoChannel(usize),
    #[error("bus write failed: {0}")]
    Bus(String),
    #[error("pin write failed: {0}")]
    Pin(String),
}

/// Physical outputs of the device. Implementations never retry a failed write.
pub trait ActuatorDriver {
    fn set_flap_position(&mut self, index: usize, degrees: u8) -> Result<(), ActuatorError>;
    fn set_power(&mut self, enabled: bool) -> Result<(), ActuatorError>;
    fn set_illuminator(&mut self, value: u16) -> Result<(), ActuatorError>;
}

/// Angle to pulse-width conversion for hobby servos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoPulse {
    pub min_us: u16,
    pub max_us: u16,
}

impl Default for ServoPulse {
    fn default() -> Self {
        Self {
            min_us: 500,
            max_us: 2_500,
        }
    }
}

impl ServoPulse {
    pub fn from_hardware(hardware: &HardwareConfig) -> Self {
        if hardware.servo_min_pulse_us < hardware.servo_max_pulse_us {
            Self {
                min_us: hardware.servo_min_pulse_us,
                max_us: hardware.servo_max_pulse_us,
            }
        } else {
            Self::default()
        }
    }

    pub fn pulse_us(&self, degrees: u8) -> u32 {
        let degrees = u32::from(degrees.min(RC_MAX_LIMIT));
        let span = u32::from(self.max_us - self.min_us);
        u32::from(self.min_us) + span * degrees / u32::from(RC_MAX_LIMIT)
    }

    /// Duty value for a PWM timer running at 50 Hz with `max_duty` full scale.
    pub fn duty(&self, degrees: u8, max_duty: u32) -> u32 {
        let pulse = u64::from(self.pulse_us(degrees));
        (pulse * u64::from(max_duty) / u64::from(SERVO_PERIOD_US)) as u32
    }

    /// OFF count for a PCA9685 channel whose ON count is 0.
    pub fn pca9685_ticks(&self, degrees: u8) -> u16 {
        (self.pulse_us(degrees) * PCA9685_RESOLUTION / SERVO_PERIOD_US) as u16
    }
}

/// PCA9685 PRE_SCALE value for the servo frame rate.
pub fn pca9685_prescale() -> u8 {
    let prescale = PCA9685_OSCILLATOR_HZ / (PCA9685_RESOLUTION * SERVO_FREQUENCY_HZ);
    prescale.saturating_sub(1).clamp(3, 255) as u8
}

/// Logic level to drive on the servo power pin.
pub fn power_level(enabled: bool, active_high: bool) -> bool {
    enabled == active_high
}

/// Scales a brightness value onto a PWM timer with `max_duty` full scale.
pub fn illuminator_duty(value: u16, max_duty: u32) -> u32 {
    u32::from(value.min(MAX_BRIGHTNESS)) * max_duty / u32::from(MAX_BRIGHTNESS)
}

/// In-memory driver. Records every write; faults can be injected.
#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    positions: Vec<Option<u8>>,
    power: bool,
    illuminator: u16,
    position_writes: usize,
    failing_flap: Option<usize>,
    failing_illuminator: bool,
    failing_power: bool,
}

impl Default for SimulatedActuator {
    fn default() -> Self {
        Self::new(MAX_SERVOS)
    }
}

impl SimulatedActuator {
    pub fn new(channels: usize) -> Self {
        Self {
            positions: vec![None; channels.min(MAX_SERVOS)],
            power: false,
            illuminator: 0,
            position_writes: 0,
            failing_flap: None,
            failing_illuminator: false,
            failing_power: false,
        }
    }

    pub fn position(&self, index: usize) -> Option<u8> {
        self.positions.get(index).copied().flatten()
    }

    pub fn power(&self) -> bool {
        self.power
    }

    pub fn illuminator(&self) -> u16 {
        self.illuminator
    }

    pub fn position_writes(&self) -> usize {
        self.position_writes
    }

    pub fn fail_flap(&mut self, index: Option<usize>) {
        self.failing_flap = index;
    }

    pub fn fail_illuminator(&mut self, failing: bool) {
        self.failing_illuminator = failing;
    }

    pub fn fail_power(&mut self, failing: bool) {
        self.failing_power = failing;
    }
}

impl ActuatorDriver for SimulatedActuator {
    fn set_flap_position(&mut self, index: usize, degrees: u8) -> Result<(), ActuatorError> {
        if self.failing_flap == Some(index) {
            return Err(ActuatorError::Bus(format!("servo {index} did not acknowledge")));
        }
        let slot = self
            .positions
            .get_mut(index)
            .ok_or(ActuatorError::NoChannel(index))?;
        *slot = Some(degrees);
        self.position_writes += 1;
        Ok(())
    }

    fn set_power(&mut self, enabled: bool) -> Result<(), ActuatorError> {
        if self.failing_power {
            return Err(ActuatorError::Pin("servo power switch stuck".to_string()));
        }
        self.power = enabled;
        Ok(())
    }

    fn set_illuminator(&mut self, value: u16) -> Result<(), ActuatorError> {
        if self.failing_illuminator {
            return Err(ActuatorError::Pin("illuminator channel stuck".to_string()));
        }
        self.illuminator = value.min(MAX_BRIGHTNESS);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_spans_configured_range() {
        let pulse = ServoPulse::default();
        assert_eq!(pulse.pulse_us(0), 500);
        assert_eq!(pulse.pulse_us(90), 1_500);
        assert_eq!(pulse.pulse_us(180), 2_500);
        assert_eq!(pulse.pulse_us(200), 2_500);
    }

    #[test]
    fn pca9685_math_matches_50hz_frame() {
        let pulse = ServoPulse::default();
        assert_eq!(pulse.pca9685_ticks(0), 102);
        assert_eq!(pulse.pca9685_ticks(180), 512);
        assert_eq!(pca9685_prescale(), 121);
    }

    #[test]
    fn ledc_duty_scales_with_timer_resolution() {
        let pulse = ServoPulse::default();
        // 14-bit timer at 50 Hz: 1500 us of 20000 us.
        assert_eq!(pulse.duty(90, 16_383), 1_228);
        assert_eq!(illuminator_duty(MAX_BRIGHTNESS, 8_191), 8_191);
        assert_eq!(illuminator_duty(0, 8_191), 0);
    }

    #[test]
    fn power_polarity() {
        assert!(power_level(true, true));
        assert!(!power_level(false, true));
        assert!(!power_level(true, false));
        assert!(power_level(false, false));
    }

    #[test]
    fn simulated_driver_records_and_faults() {
        let mut driver = SimulatedActuator::new(2);
        driver.set_flap_position(1, 45).unwrap();
        assert_eq!(driver.position(1), Some(45));
        assert_eq!(driver.position(0), None);
        assert_eq!(
            driver.set_flap_position(2, 10),
            Err(ActuatorError::NoChannel(2))
        );

        driver.fail_flap(Some(0));
        assert!(driver.set_flap_position(0, 30).is_err());
        assert_eq!(driver.position_writes(), 1);
    }
}
