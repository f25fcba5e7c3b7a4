use serde::{Deserialize, Serialize};

/// Observed aggregate cover position.
///
/// `Halted` is internal: it marks a halt that the next tick has not resolved
/// yet. It is reported as `Moving` and never leaves the device as itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverState {
    NotPresent,
    Closed,
    Moving,
    Open,
    Unknown,
    Error,
    Halted,
}

impl CoverState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotPresent => "NotPresent",
            Self::Closed => "Closed",
            Self::Moving => "Moving",
            Self::Open => "Open",
            Self::Unknown => "Unknown",
            Self::Error => "Error",
            Self::Halted => "Halted",
        }
    }

    /// State as an ASCOM client may see it.
    pub fn reported(self) -> Self {
        match self {
            Self::Halted => Self::Moving,
            other => other,
        }
    }

    /// ASCOM `CoverStatus` numeric value.
    pub fn alpaca_value(self) -> i32 {
        match self.reported() {
            Self::NotPresent => 0,
            Self::Closed => 1,
            Self::Moving | Self::Halted => 2,
            Self::Open => 3,
            Self::Unknown => 4,
            Self::Error => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibratorState {
    NotPresent,
    Off,
    NotReady,
    Ready,
    Unknown,
    Error,
}

impl CalibratorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotPresent => "NotPresent",
            Self::Off => "Off",
            Self::NotReady => "NotReady",
            Self::Ready => "Ready",
            Self::Unknown => "Unknown",
            Self::Error => "Error",
        }
    }

    /// ASCOM `CalibratorStatus` numeric value.
    pub fn alpaca_value(self) -> i32 {
        match self {
            Self::NotPresent => 0,
            Self::Off => 1,
            Self::NotReady => 2,
            Self::Ready => 3,
            Self::Unknown => 4,
            Self::Error => 5,
        }
    }
}

/// How a multi-flap cover is driven. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlapMovement {
    /// Move one flap fully before starting the next.
    #[default]
    EachFlapInSequence,
    /// Advance every flap by one increment per tick.
    EachFlapIncremental,
    /// Command every flap to its goal at once, then wait out a settle time.
    AllFlapsAtOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Cover,
    Calibrator,
}

impl Axis {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cover => "cover",
            Self::Calibrator => "calibrator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlapStatus {
    pub position: u8,
    pub minimum: u8,
    pub maximum: u8,
}

/// Snapshot served by `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub time: String,
    pub host: String,
    pub location: String,
    pub connected: bool,
    #[serde(rename = "clientID")]
    pub client_id: u32,
    #[serde(rename = "coverState")]
    pub cover_state: &'static str,
    #[serde(rename = "targetCoverState")]
    pub target_cover_state: &'static str,
    #[serde(rename = "movementMethod")]
    pub movement: FlapMovement,
    pub flaps: Vec<FlapStatus>,
    #[serde(rename = "calibratorState")]
    pub calibrator_state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u16>,
    #[serde(rename = "servoPower")]
    pub servo_power: bool,
    #[serde(rename = "serverTransactionID")]
    pub server_transaction_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halted_is_reported_as_moving() {
        assert_eq!(CoverState::Halted.reported(), CoverState::Moving);
        assert_eq!(CoverState::Halted.alpaca_value(), 2);
        assert_eq!(CoverState::Unknown.alpaca_value(), 4);
    }

    #[test]
    fn calibrator_values_follow_ascom_order() {
        let values: Vec<i32> = [
            CalibratorState::NotPresent,
            CalibratorState::Off,
            CalibratorState::NotReady,
            CalibratorState::Ready,
            CalibratorState::Unknown,
            CalibratorState::Error,
        ]
        .into_iter()
        .map(CalibratorState::alpaca_value)
        .collect();

        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }
}
