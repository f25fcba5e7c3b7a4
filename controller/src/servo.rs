use std::{sync::Arc, thread, time::Duration};

use anyhow::Context;
use esp_idf_hal::{
    delay::BLOCK,
    gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver},
    i2c::{I2cConfig, I2cDriver, I2C0},
    ledc::{
        config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, CHANNEL0, CHANNEL1,
        CHANNEL2, CHANNEL3, LEDC, TIMER0, TIMER1,
    },
    sys::EspError,
    units::FromValueType,
};
use log::info;

use covercal_common::{
    actuator::{illuminator_duty, pca9685_prescale, power_level, SERVO_FREQUENCY_HZ},
    config::MAX_DIRECT_SERVOS,
    ActuatorDriver, ActuatorError, HardwareConfig, ServoPulse, ServoTopology, MAX_SERVOS,
};

const PCA9685_MODE1: u8 = 0x00;
const PCA9685_LED0_ON_L: u8 = 0x06;
const PCA9685_PRE_SCALE: u8 = 0xFE;
const MODE1_SLEEP: u8 = 0x10;
const MODE1_AUTO_INCREMENT: u8 = 0x20;
const MODE1_RESTART: u8 = 0x80;
const ILLUMINATOR_FREQUENCY_HZ: u32 = 5_000;

enum ServoOutputs {
    Direct {
        channels: Vec<LedcDriver<'static>>,
        _timer: Arc<LedcTimerDriver<'static, TIMER0>>,
    },
    Pca9685 {
        i2c: I2cDriver<'static>,
        address: u8,
    },
}

/// Servo, power-rail and illuminator outputs of the board.
pub struct BoardActuator {
    servos: ServoOutputs,
    pulse: ServoPulse,
    power: PinDriver<'static, AnyOutputPin, Output>,
    power_active_high: bool,
    illuminator: Option<LedcDriver<'static>>,
    _illuminator_timer: Option<LedcTimerDriver<'static, TIMER1>>,
}

impl BoardActuator {
    pub fn new(ledc: LEDC, i2c0: I2C0, hardware: &HardwareConfig) -> anyhow::Result<Self> {
        let servos = match &hardware.topology {
            ServoTopology::DirectPins { pins } => init_direct_servos(
                ledc.timer0,
                (ledc.channel0, ledc.channel1, ledc.channel2, ledc.channel3),
                pins,
            )?,
            ServoTopology::Pca9685 {
                sda_pin,
                scl_pin,
                address,
            } => init_pca9685(i2c0, *sda_pin, *scl_pin, *address)?,
        };

        let power = unsafe { PinDriver::output(AnyOutputPin::new(hardware.power_pin)) }
            .with_context(|| format!("servo power pin GPIO{} unavailable", hardware.power_pin))?;

        let (illuminator, illuminator_timer) = if hardware.calibrator_present {
            let timer = LedcTimerDriver::new(
                ledc.timer1,
                &TimerConfig::default()
                    .frequency(ILLUMINATOR_FREQUENCY_HZ.Hz().into())
                    .resolution(Resolution::Bits10),
            )
            .context("illuminator timer init failed")?;
            let pin = unsafe { AnyOutputPin::new(hardware.illuminator_pin) };
            let channel = LedcDriver::new(ledc.channel4, &timer, pin).with_context(|| {
                format!("illuminator GPIO{} unavailable", hardware.illuminator_pin)
            })?;
            info!("illuminator PWM on GPIO{}", hardware.illuminator_pin);
            (Some(channel), Some(timer))
        } else {
            (None, None)
        };

        let mut actuator = Self {
            servos,
            pulse: ServoPulse::from_hardware(hardware),
            power,
            power_active_high: hardware.power_active_high,
            illuminator,
            _illuminator_timer: illuminator_timer,
        };
        actuator
            .set_power(false)
            .context("failed to switch servo power off")?;
        Ok(actuator)
    }
}

impl ActuatorDriver for BoardActuator {
    fn set_flap_position(&mut self, index: usize, degrees: u8) -> Result<(), ActuatorError> {
        match &mut self.servos {
            ServoOutputs::Direct { channels, .. } => {
                let channel = channels
                    .get_mut(index)
                    .ok_or(ActuatorError::NoChannel(index))?;
                let duty = self.pulse.duty(degrees, channel.get_max_duty());
                channel.set_duty(duty).map_err(pin_error)
            }
            ServoOutputs::Pca9685 { i2c, address } => {
                if index >= MAX_SERVOS {
                    return Err(ActuatorError::NoChannel(index));
                }
                let [off_low, off_high] = self.pulse.pca9685_ticks(degrees).to_le_bytes();
                let register = PCA9685_LED0_ON_L + 4 * index as u8;
                i2c.write(*address, &[register, 0, 0, off_low, off_high], BLOCK)
                    .map_err(bus_error)
            }
        }
    }

    fn set_power(&mut self, enabled: bool) -> Result<(), ActuatorError> {
        let result = if power_level(enabled, self.power_active_high) {
            self.power.set_high()
        } else {
            self.power.set_low()
        };
        result.map_err(pin_error)
    }

    fn set_illuminator(&mut self, value: u16) -> Result<(), ActuatorError> {
        let Some(channel) = self.illuminator.as_mut() else {
            return Err(ActuatorError::Pin("no illuminator channel".to_string()));
        };
        let duty = illuminator_duty(value, channel.get_max_duty());
        channel.set_duty(duty).map_err(pin_error)
    }
}

fn init_direct_servos(
    timer: TIMER0,
    (channel0, channel1, channel2, channel3): (CHANNEL0, CHANNEL1, CHANNEL2, CHANNEL3),
    pins: &[i32],
) -> anyhow::Result<ServoOutputs> {
    let timer = Arc::new(
        LedcTimerDriver::new(
            timer,
            &TimerConfig::default()
                .frequency(SERVO_FREQUENCY_HZ.Hz().into())
                .resolution(Resolution::Bits14),
        )
        .context("servo timer init failed")?,
    );

    let (mut channel0, mut channel1, mut channel2, mut channel3) =
        (Some(channel0), Some(channel1), Some(channel2), Some(channel3));
    let mut channels = Vec::with_capacity(MAX_DIRECT_SERVOS);
    for (index, pin) in pins.iter().take(MAX_DIRECT_SERVOS).enumerate() {
        let output = unsafe { AnyOutputPin::new(*pin) };
        let driver = match index {
            0 => channel0.take().map(|ch| LedcDriver::new(ch, timer.clone(), output)),
            1 => channel1.take().map(|ch| LedcDriver::new(ch, timer.clone(), output)),
            2 => channel2.take().map(|ch| LedcDriver::new(ch, timer.clone(), output)),
            _ => channel3.take().map(|ch| LedcDriver::new(ch, timer.clone(), output)),
        };
        let Some(driver) = driver else {
            break;
        };
        channels.push(driver.with_context(|| format!("servo {index} on GPIO{pin} unavailable"))?);
        info!("servo {index} on GPIO{pin}");
    }

    Ok(ServoOutputs::Direct {
        channels,
        _timer: timer,
    })
}

fn init_pca9685(i2c0: I2C0, sda_pin: i32, scl_pin: i32, address: u8) -> anyhow::Result<ServoOutputs> {
    let mut i2c = I2cDriver::new(
        i2c0,
        unsafe { AnyIOPin::new(sda_pin) },
        unsafe { AnyIOPin::new(scl_pin) },
        &I2cConfig::new().baudrate(400.kHz().into()),
    )
    .with_context(|| format!("i2c init failed on SDA GPIO{sda_pin} / SCL GPIO{scl_pin}"))?;

    // Prescale can only be written while the oscillator sleeps.
    i2c.write(address, &[PCA9685_MODE1, MODE1_SLEEP], BLOCK)
        .with_context(|| format!("PCA9685 at {address:#04x} did not respond"))?;
    i2c.write(address, &[PCA9685_PRE_SCALE, pca9685_prescale()], BLOCK)?;
    i2c.write(address, &[PCA9685_MODE1, MODE1_AUTO_INCREMENT], BLOCK)?;
    thread::sleep(Duration::from_millis(1));
    i2c.write(
        address,
        &[PCA9685_MODE1, MODE1_RESTART | MODE1_AUTO_INCREMENT],
        BLOCK,
    )?;

    info!("PCA9685 servo driver at {address:#04x} (SDA GPIO{sda_pin}, SCL GPIO{scl_pin})");
    Ok(ServoOutputs::Pca9685 { i2c, address })
}

fn pin_error(err: EspError) -> ActuatorError {
    ActuatorError::Pin(err.to_string())
}

fn bus_error(err: EspError) -> ActuatorError {
    ActuatorError::Bus(err.to_string())
}

/// Stands in when the board outputs could not be brought up. Every write
/// fails, so both axes report an error instead of pretending to move.
pub struct UnavailableActuator {
    reason: String,
}

impl UnavailableActuator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail(&self) -> Result<(), ActuatorError> {
        Err(ActuatorError::Bus(self.reason.clone()))
    }
}

impl ActuatorDriver for UnavailableActuator {
    fn set_flap_position(&mut self, _index: usize, _degrees: u8) -> Result<(), ActuatorError> {
        self.fail()
    }

    fn set_power(&mut self, _enabled: bool) -> Result<(), ActuatorError> {
        self.fail()
    }

    fn set_illuminator(&mut self, _value: u16) -> Result<(), ActuatorError> {
        self.fail()
    }
}
