use std::fmt::Write as _;

use thiserror::Error;

use crate::{
    actuator::MAX_BRIGHTNESS,
    alpaca::ClientParams,
    config::{is_valid_name, MAX_NAME_LENGTH},
    device::{CoverCalibratorDevice, DRIVER_NAME, DRIVER_VERSION},
    engine::RequestError,
    flaps::{FlapError, FlapLimits, MAX_SERVOS, RC_MAX_LIMIT, RC_MIN_LIMIT},
    types::{CalibratorState, CoverState},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("missing form field {0}")]
    MissingField(String),
    #[error("{field} '{value}' is not a number")]
    NotANumber { field: String, value: String },
    #[error("{field} {value} outside 0..=180 degrees")]
    DegreesOutOfRange { field: String, value: u32 },
    #[error("{0} must be 1 to 38 characters")]
    InvalidName(&'static str),
    #[error("discovery port {0} must be above 1024")]
    PortOutOfRange(u32),
    #[error("brightness {0} outside 0..=1023")]
    BrightnessOutOfRange(u32),
    #[error("unrecognised value '{0}'")]
    UnknownChoice(String),
    #[error("unknown setup form {0}")]
    UnknownForm(String),
    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverCommand {
    Open,
    Close,
    Halt,
}

/// One validated setup-form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupChange {
    Hostname(String),
    Location(String),
    DiscoveryPort(u16),
    FlapCount(usize),
    FlapLimits(Vec<(usize, FlapLimits)>),
    Calibrator { brightness: u16, on: Option<bool> },
    CoverPosition(CoverCommand),
}

impl SetupChange {
    /// Parses the form posted to `/setup/{form}`.
    pub fn parse(form: &str, fields: &ClientParams) -> Result<Self, SetupError> {
        match form.to_ascii_lowercase().as_str() {
            "hostname" => parse_name(fields, "hostname").map(Self::Hostname),
            "location" => parse_name(fields, "location").map(Self::Location),
            "udpport" => {
                let port = parse_u32(fields, "udpport")?;
                match u16::try_from(port) {
                    Ok(port) if port > 1024 => Ok(Self::DiscoveryPort(port)),
                    _ => Err(SetupError::PortOutOfRange(port)),
                }
            }
            "flapcount" => {
                let count = parse_u32(fields, "flapcount")? as usize;
                Ok(Self::FlapCount(count))
            }
            "limits" => {
                let mut limits = Vec::new();
                for index in 0..MAX_SERVOS {
                    let min_key = format!("minLimit{index}");
                    let max_key = format!("maxLimit{index}");
                    if fields.get(&min_key).is_none() && fields.get(&max_key).is_none() {
                        continue;
                    }
                    let min = parse_degrees(fields, &min_key)?;
                    let max = parse_degrees(fields, &max_key)?;
                    let pair = FlapLimits::new(min, max).map_err(RequestError::from)?;
                    limits.push((index, pair));
                }
                if limits.is_empty() {
                    return Err(SetupError::MissingField("minLimit0".to_string()));
                }
                Ok(Self::FlapLimits(limits))
            }
            "brightness" => {
                let brightness = parse_u32(fields, "brightness")?;
                let brightness = u16::try_from(brightness)
                    .ok()
                    .filter(|value| *value <= MAX_BRIGHTNESS)
                    .ok_or(SetupError::BrightnessOutOfRange(brightness))?;
                let on = match fields.get("calibratorstate") {
                    None | Some("") => None,
                    Some(raw) if raw.eq_ignore_ascii_case("on") => Some(true),
                    Some(raw) if raw.eq_ignore_ascii_case("off") => Some(false),
                    Some(raw) => return Err(SetupError::UnknownChoice(raw.to_string())),
                };
                Ok(Self::Calibrator { brightness, on })
            }
            "positions" => {
                let raw = required(fields, "coverposition")?;
                let command = if raw.eq_ignore_ascii_case("open") {
                    CoverCommand::Open
                } else if raw.eq_ignore_ascii_case("close") {
                    CoverCommand::Close
                } else if raw.eq_ignore_ascii_case("halt") {
                    CoverCommand::Halt
                } else {
                    return Err(SetupError::UnknownChoice(raw.to_string()));
                };
                Ok(Self::CoverPosition(command))
            }
            other => Err(SetupError::UnknownForm(other.to_string())),
        }
    }

    /// Whether applying this change alters persisted settings.
    pub fn persists(&self) -> bool {
        !matches!(self, Self::CoverPosition(_))
    }
}

impl CoverCalibratorDevice {
    /// Applies a setup change. Setup forms are not subject to client admission.
    pub fn apply_setup(&mut self, change: SetupChange) -> Result<(), SetupError> {
        match change {
            SetupChange::Hostname(name) => self.settings_mut().hostname = name,
            SetupChange::Location(location) => self.settings_mut().location = location,
            SetupChange::DiscoveryPort(port) => self.settings_mut().discovery_port = port,
            SetupChange::FlapCount(count) => self.engine_mut().set_flap_count(count)?,
            SetupChange::FlapLimits(limits) => {
                let count = self.engine().flaps().len();
                if let Some((index, _)) = limits.iter().find(|(index, _)| *index >= count) {
                    return Err(RequestError::from(FlapError::NoSuchFlap(*index)).into());
                }
                for (index, pair) in limits {
                    self.engine_mut().set_flap_limits(index, pair)?;
                }
            }
            SetupChange::Calibrator { brightness, on } => {
                let on = on.unwrap_or(matches!(
                    self.engine().target_calibrator_state(),
                    CalibratorState::Ready
                ));
                self.engine_mut().configure_calibrator(brightness, on)?;
            }
            SetupChange::CoverPosition(command) => {
                let engine = self.engine_mut();
                match command {
                    CoverCommand::Open => engine.open_cover()?,
                    CoverCommand::Close => engine.close_cover()?,
                    CoverCommand::Halt => engine.halt_cover()?,
                }
            }
        }
        Ok(())
    }
}

fn required<'a>(fields: &'a ClientParams, name: &str) -> Result<&'a str, SetupError> {
    fields
        .get(name)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SetupError::MissingField(name.to_string()))
}

fn parse_u32(fields: &ClientParams, name: &str) -> Result<u32, SetupError> {
    let raw = required(fields, name)?;
    raw.parse().map_err(|_| SetupError::NotANumber {
        field: name.to_string(),
        value: raw.to_string(),
    })
}

fn parse_degrees(fields: &ClientParams, name: &str) -> Result<u8, SetupError> {
    let value = parse_u32(fields, name)?;
    u8::try_from(value)
        .ok()
        .filter(|degrees| (RC_MIN_LIMIT..=RC_MAX_LIMIT).contains(degrees))
        .ok_or_else(|| SetupError::DegreesOutOfRange {
            field: name.to_string(),
            value,
        })
}

fn parse_name(fields: &ClientParams, name: &'static str) -> Result<String, SetupError> {
    let raw = required(fields, name)?;
    if is_valid_name(raw) {
        Ok(raw.to_string())
    } else {
        Err(SetupError::InvalidName(name))
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Renders the setup page, optionally with a message from the last submission.
pub fn render_setup_page(device: &CoverCalibratorDevice, message: Option<&str>) -> String {
    let engine = device.engine();
    let mut page = String::new();
    let _ = write!(
        page,
        "<!DOCTYPE html><html><head><title>{DRIVER_NAME} setup</title></head><body>\
         <h1>{} setup</h1><p>Driver version {DRIVER_VERSION}</p>",
        escape(device.hostname())
    );
    if let Some(message) = message {
        let _ = write!(page, "<p class=\"message\">{}</p>", escape(message));
    }

    let max_name = MAX_NAME_LENGTH - 2;
    let _ = write!(
        page,
        "<form method=\"POST\" action=\"/setup/hostname\">Hostname \
         <input name=\"hostname\" maxlength=\"{max_name}\" value=\"{}\">\
         <input type=\"submit\" value=\"Update\"></form>\
         <form method=\"POST\" action=\"/setup/location\">Location \
         <input name=\"location\" maxlength=\"{max_name}\" value=\"{}\">\
         <input type=\"submit\" value=\"Update\"></form>\
         <form method=\"POST\" action=\"/setup/udpport\">Discovery port \
         <input type=\"number\" name=\"udpport\" min=\"1025\" max=\"65535\" value=\"{}\">\
         <input type=\"submit\" value=\"Update\"></form>",
        escape(device.hostname()),
        escape(device.location()),
        device.discovery_port()
    );

    let base = "/setup/v1/covercalibrator/0";
    if engine.cover_state() != CoverState::NotPresent {
        let _ = write!(
            page,
            "<h2>Cover: {}</h2>\
             <form method=\"POST\" action=\"{base}/flapcount\">Flaps \
             <input type=\"number\" name=\"flapcount\" min=\"1\" max=\"{}\" value=\"{}\">\
             <input type=\"submit\" value=\"Update\"></form>\
             <form method=\"POST\" action=\"{base}/limits\"><table>\
             <tr><th>Flap</th><th>Position</th><th>Min</th><th>Max</th></tr>",
            engine.cover_state().reported().as_str(),
            engine.servo_channels(),
            engine.flaps().len()
        );
        for (index, flap) in engine.flaps().iter().enumerate() {
            let _ = write!(
                page,
                "<tr><td>{index}</td><td>{}</td>\
                 <td><input type=\"number\" name=\"minLimit{index}\" min=\"{RC_MIN_LIMIT}\" max=\"{RC_MAX_LIMIT}\" value=\"{}\"></td>\
                 <td><input type=\"number\" name=\"maxLimit{index}\" min=\"{RC_MIN_LIMIT}\" max=\"{RC_MAX_LIMIT}\" value=\"{}\"></td></tr>",
                flap.position(),
                flap.min_limit(),
                flap.max_limit()
            );
        }
        let _ = write!(
            page,
            "</table><input type=\"submit\" value=\"Update limits\"></form>\
             <form method=\"POST\" action=\"{base}/positions\">\
             <input type=\"submit\" name=\"coverposition\" value=\"Open\">\
             <input type=\"submit\" name=\"coverposition\" value=\"Close\">\
             <input type=\"submit\" name=\"coverposition\" value=\"Halt\"></form>"
        );
    }

    if engine.calibrator_state() != CalibratorState::NotPresent {
        let _ = write!(
            page,
            "<h2>Calibrator: {}</h2>\
             <form method=\"POST\" action=\"{base}/brightness\">Brightness \
             <input type=\"number\" name=\"brightness\" min=\"0\" max=\"{MAX_BRIGHTNESS}\" value=\"{}\">\
             <select name=\"calibratorstate\"><option>On</option><option>Off</option></select>\
             <input type=\"submit\" value=\"Update\"></form>",
            engine.calibrator_state().as_str(),
            engine.brightness()
        );
    }

    page.push_str(
        "<h2>Restart device</h2>\
         <form method=\"POST\" action=\"/restart\">\
         <input type=\"submit\" value=\"Restart device\"></form>\
         </body></html>",
    );
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::SimulatedActuator;
    use crate::config::{RuntimeConfig, ServoTopology};
    use pretty_assertions::assert_eq;

    fn form(pairs: &[(&str, &str)]) -> ClientParams {
        ClientParams::from_pairs(pairs.iter().map(|(key, value)| (*key, *value)))
    }

    #[test]
    fn parses_each_form() {
        assert_eq!(
            SetupChange::parse("hostname", &form(&[("hostname", "dome-cover")])),
            Ok(SetupChange::Hostname("dome-cover".to_string()))
        );
        assert_eq!(
            SetupChange::parse("udpport", &form(&[("udpport", "40000")])),
            Ok(SetupChange::DiscoveryPort(40000))
        );
        assert_eq!(
            SetupChange::parse(
                "limits",
                &form(&[("minLimit1", "10"), ("maxlimit1", "170")])
            ),
            Ok(SetupChange::FlapLimits(vec![(1, FlapLimits::new(10, 170).unwrap())]))
        );
        assert_eq!(
            SetupChange::parse(
                "brightness",
                &form(&[("brightness", "300"), ("calibratorstate", "on")])
            ),
            Ok(SetupChange::Calibrator {
                brightness: 300,
                on: Some(true)
            })
        );
        assert_eq!(
            SetupChange::parse("positions", &form(&[("coverposition", "Halt")])),
            Ok(SetupChange::CoverPosition(CoverCommand::Halt))
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let long = "x".repeat(39);
        assert_eq!(
            SetupChange::parse("hostname", &form(&[("hostname", &long)])),
            Err(SetupError::InvalidName("hostname"))
        );
        assert_eq!(
            SetupChange::parse("udpport", &form(&[("udpport", "1024")])),
            Err(SetupError::PortOutOfRange(1024))
        );
        assert_eq!(
            SetupChange::parse("brightness", &form(&[("brightness", "2000")])),
            Err(SetupError::BrightnessOutOfRange(2000))
        );
        let inverted = form(&[("minLimit0", "100"), ("maxLimit0", "20")]);
        assert!(SetupChange::parse("limits", &inverted).is_err());
        let too_wide = form(&[("minLimit0", "0"), ("maxLimit0", "181")]);
        assert!(SetupChange::parse("limits", &too_wide).is_err());
        let sideways = form(&[("coverposition", "Sideways")]);
        assert!(SetupChange::parse("positions", &sideways).is_err());
        assert!(SetupChange::parse("reboot", &form(&[])).is_err());
    }

    #[test]
    fn flap_count_round_trip_through_setup() {
        let mut device = CoverCalibratorDevice::new(&RuntimeConfig::default());
        device
            .apply_setup(SetupChange::FlapLimits(vec![(0, FlapLimits::new(10, 90).unwrap())]))
            .unwrap();
        device.apply_setup(SetupChange::FlapCount(3)).unwrap();
        device
            .apply_setup(SetupChange::FlapLimits(vec![(2, FlapLimits::new(40, 120).unwrap())]))
            .unwrap();
        let before = device.persisted_settings().flaps;

        device.apply_setup(SetupChange::FlapCount(5)).unwrap();
        device.apply_setup(SetupChange::FlapCount(3)).unwrap();
        assert_eq!(device.persisted_settings().flaps, before);

        assert!(device.apply_setup(SetupChange::FlapCount(17)).is_err());
        assert!(device
            .apply_setup(SetupChange::FlapLimits(vec![(3, FlapLimits::default())]))
            .is_err());
    }

    #[test]
    fn brightness_form_keeps_current_on_state() {
        let mut device = CoverCalibratorDevice::new(&RuntimeConfig::default());
        let mut driver = SimulatedActuator::new(1);
        device
            .apply_setup(SetupChange::Calibrator {
                brightness: 250,
                on: Some(true),
            })
            .unwrap();
        device.tick(&mut driver);
        assert_eq!(driver.illuminator(), 250);

        device
            .apply_setup(SetupChange::Calibrator {
                brightness: 700,
                on: None,
            })
            .unwrap();
        device.tick(&mut driver);
        assert_eq!(driver.illuminator(), 700);
        assert_eq!(device.persisted_settings().brightness, 700);
    }

    #[test]
    fn page_lists_every_flap() {
        let mut device = CoverCalibratorDevice::new(&RuntimeConfig::default());
        device.apply_setup(SetupChange::FlapCount(2)).unwrap();
        device
            .apply_setup(SetupChange::Location("<roof>".to_string()))
            .unwrap();

        let page = render_setup_page(&device, Some("saved"));
        assert!(page.contains("name=\"minLimit1\""));
        assert!(!page.contains("minLimit2"));
        assert!(page.contains("&lt;roof&gt;"));
        assert!(page.contains("saved"));
        assert!(page.contains("max=\"16\" value=\"2\""));
        assert!(page.contains("action=\"/restart\""));
    }

    #[test]
    fn flap_count_beyond_wired_servos_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.hardware.topology = ServoTopology::DirectPins { pins: vec![4, 5] };
        let mut device = CoverCalibratorDevice::new(&config);
        let mut driver = SimulatedActuator::new(2);

        assert_eq!(
            device.apply_setup(SetupChange::FlapCount(3)),
            Err(SetupError::Request(RequestError::Flap(
                FlapError::CountOutOfRange { count: 3, max: 2 }
            )))
        );
        device.apply_setup(SetupChange::FlapCount(2)).unwrap();

        device.engine_mut().open_cover().unwrap();
        for _ in 0..2_000 {
            device.tick(&mut driver);
        }
        assert_eq!(device.engine().cover_state(), CoverState::Open);
        assert_eq!(driver.position(1), Some(150));
    }
}
