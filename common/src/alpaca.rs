use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const ERROR_NOT_IMPLEMENTED: i32 = 0x400;
pub const ERROR_INVALID_VALUE: i32 = 0x401;
pub const ERROR_NOT_CONNECTED: i32 = 0x407;
pub const ERROR_INVALID_OPERATION: i32 = 0x40B;

/// ASCOM error taxonomy reported inside the response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlpacaError {
    #[error("{0}")]
    NotImplemented(String),
    #[error("{0}")]
    InvalidValue(String),
    #[error("{0}")]
    NotConnected(String),
    #[error("{0}")]
    InvalidOperation(String),
}

impl AlpacaError {
    pub fn error_number(&self) -> i32 {
        match self {
            Self::NotImplemented(_) => ERROR_NOT_IMPLEMENTED,
            Self::InvalidValue(_) => ERROR_INVALID_VALUE,
            Self::NotConnected(_) => ERROR_NOT_CONNECTED,
            Self::InvalidOperation(_) => ERROR_INVALID_OPERATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlpacaResponse {
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "ClientTransactionID")]
    pub client_transaction_id: u32,
    #[serde(rename = "ServerTransactionID")]
    pub server_transaction_id: u32,
    #[serde(rename = "ErrorNumber")]
    pub error_number: i32,
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
}

impl AlpacaResponse {
    pub fn new(client_transaction_id: u32, server_transaction_id: u32) -> Self {
        Self {
            value: None,
            client_transaction_id,
            server_transaction_id,
            error_number: 0,
            error_message: String::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_error(mut self, error: &AlpacaError) -> Self {
        self.value = None;
        self.error_number = error.error_number();
        self.error_message = error.to_string();
        self
    }

    pub fn with_result(self, result: Result<Option<Value>, AlpacaError>) -> Self {
        match result {
            Ok(Some(value)) => self.with_value(value),
            Ok(None) => self,
            Err(error) => self.with_error(&error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_number != 0
    }
}

/// Request parameters from a query string or form body. Names match
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ClientParams {
    values: HashMap<String, String>,
}

impl ClientParams {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(key, value)| (key.as_ref().to_ascii_lowercase(), value.into()))
            .collect();
        Self { values }
    }

    /// Parses `application/x-www-form-urlencoded` text, as found in a query
    /// string or a PUT body.
    pub fn from_urlencoded(raw: &str) -> Self {
        Self::from_pairs(
            raw.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (percent_decode(name), percent_decode(value))
                }),
        )
    }

    /// Adds every parameter from `other`, replacing duplicates.
    pub fn extend(&mut self, other: ClientParams) {
        self.values.extend(other.values);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(|value| value.trim())
    }

    /// Missing or unparseable client ids read as 0.
    pub fn client_id(&self) -> u32 {
        self.get("ClientID")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    pub fn client_transaction_id(&self) -> u32 {
        self.get("ClientTransactionID")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    pub fn required(&self, name: &str) -> Result<&str, AlpacaError> {
        self.get(name)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AlpacaError::InvalidValue(format!("missing parameter {name}")))
    }

    pub fn required_i64(&self, name: &str) -> Result<i64, AlpacaError> {
        let raw = self.required(name)?;
        raw.parse()
            .map_err(|_| AlpacaError::InvalidValue(format!("{name} '{raw}' is not an integer")))
    }

    pub fn required_bool(&self, name: &str) -> Result<bool, AlpacaError> {
        let raw = self.required(name)?;
        if raw.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(AlpacaError::InvalidValue(format!(
                "{name} '{raw}' is not true or false"
            )))
        }
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => decoded.push(b' '),
            b'%' if index + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[index + 1..index + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match hex {
                    Some(byte) => {
                        decoded.push(byte);
                        index += 2;
                    }
                    None => decoded.push(b'%'),
                }
            }
            byte => decoded.push(byte),
        }
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Single-client admission token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connection {
    holder: Option<u32>,
}

impl Connection {
    pub fn holder(&self) -> Option<u32> {
        self.holder
    }

    pub fn is_held_by(&self, client_id: u32) -> bool {
        client_id != 0 && self.holder == Some(client_id)
    }

    pub fn connect(&mut self, client_id: u32) -> Result<(), AlpacaError> {
        if client_id == 0 {
            return Err(AlpacaError::InvalidValue(
                "ClientID 0 may not connect".to_string(),
            ));
        }
        match self.holder {
            Some(holder) if holder != client_id => Err(AlpacaError::InvalidOperation(format!(
                "device already connected to client {holder}"
            ))),
            _ => {
                self.holder = Some(client_id);
                Ok(())
            }
        }
    }

    pub fn disconnect(&mut self, client_id: u32) -> Result<(), AlpacaError> {
        match self.holder {
            None => Ok(()),
            Some(holder) if holder == client_id => {
                self.holder = None;
                Ok(())
            }
            Some(holder) => Err(AlpacaError::InvalidOperation(format!(
                "device is connected to client {holder}"
            ))),
        }
    }

    /// Gate for mutating requests.
    pub fn admit(&self, client_id: u32) -> Result<(), AlpacaError> {
        if self.is_held_by(client_id) {
            Ok(())
        } else {
            Err(AlpacaError::NotConnected(format!(
                "client {client_id} is not connected"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn params_are_case_insensitive() {
        let params = ClientParams::from_pairs([
            ("clientid", "7"),
            ("CLIENTTRANSACTIONID", "42"),
            ("Brightness", " 500 "),
        ]);
        assert_eq!(params.client_id(), 7);
        assert_eq!(params.client_transaction_id(), 42);
        assert_eq!(params.required_i64("brightness"), Ok(500));
    }

    #[test]
    fn bad_client_id_reads_as_zero() {
        let params = ClientParams::from_pairs([("ClientID", "-3")]);
        assert_eq!(params.client_id(), 0);
        assert_eq!(ClientParams::default().client_id(), 0);
    }

    #[test]
    fn urlencoded_bodies_are_decoded() {
        let mut params = ClientParams::from_urlencoded("ClientID=12&location=Back%20yard+dome&flag");
        params.extend(ClientParams::from_urlencoded("clientid=13&bad=%zz"));
        assert_eq!(params.client_id(), 13);
        assert_eq!(params.get("Location"), Some("Back yard dome"));
        assert_eq!(params.get("flag"), Some(""));
        assert_eq!(params.get("bad"), Some("%zz"));
    }

    #[test]
    fn bool_params_accept_any_case() {
        let params = ClientParams::from_pairs([("Connected", "TRUE"), ("Other", "yes")]);
        assert_eq!(params.required_bool("connected"), Ok(true));
        assert!(params.required_bool("other").is_err());
        assert!(params.required_bool("missing").is_err());
    }

    #[test]
    fn connection_admits_only_the_holder() {
        let mut connection = Connection::default();
        assert!(connection.admit(5).is_err());
        assert!(connection.connect(0).is_err());

        connection.connect(5).unwrap();
        connection.connect(5).unwrap();
        assert!(connection.admit(5).is_ok());
        assert_eq!(
            connection.admit(6).map_err(|err| err.error_number()),
            Err(ERROR_NOT_CONNECTED)
        );
        assert_eq!(
            connection.connect(6).map_err(|err| err.error_number()),
            Err(ERROR_INVALID_OPERATION)
        );
        assert!(connection.disconnect(6).is_err());

        connection.disconnect(5).unwrap();
        assert_eq!(connection.holder(), None);
    }

    #[test]
    fn envelope_serializes_ascom_field_names() {
        let ok = AlpacaResponse::new(3, 9).with_value(1023);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({
                "Value": 1023,
                "ClientTransactionID": 3,
                "ServerTransactionID": 9,
                "ErrorNumber": 0,
                "ErrorMessage": "",
            })
        );

        let err = AlpacaResponse::new(3, 10)
            .with_error(&AlpacaError::NotImplemented("no calibrator".to_string()));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["ErrorNumber"], 0x400);
        assert_eq!(json["ErrorMessage"], "no calibrator");
        assert!(json.get("Value").is_none());
    }
}
