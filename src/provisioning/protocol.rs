//! Configuration protocol.
//!
//! One JSON object per line in both directions:
//!
//! ```text
//! C->S  {"cmd":"hi"}
//! S->C  {"cmd":"welcome","device":{...}}
//! C->S  {"cmd":"setconfig","ssid":"...","pass":"...","extconfig":{...}}
//! S->C  {"cmd":"setconfig","status":1}
//! S->C  {"error":"invalid message"} | {"error":"invalid command"}
//! ```
//!
//! # Example
//!
//! ```
//! use wifi_provision_esp32::provisioning::protocol::{parse_request, Request};
//!
//! let request = parse_request(r#"{"cmd":"hi"}"#).unwrap();
//! assert_eq!(request, Request::Hello);
//! ```

use super::DeviceParameters;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use zeroize::Zeroizing;

/// Sent to a client that connects while another one is being served.
pub const BUSY_MESSAGE: &[u8] = b"Configuration already running... Bye!";

/// Terminator of every outbound message.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Value of one `extconfig` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Text(String),
    Number(f64),
    Flag(bool),
}

impl ConfigValue {
    /// Convert a JSON value; only strings, numbers and booleans qualify.
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::Bool(b) => Some(Self::Flag(*b)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{:?}", s),
            Self::Number(n) => write!(f, "{}", n),
            Self::Flag(b) => write!(f, "{}", b),
        }
    }
}

/// Payload of a `setconfig` command.
#[derive(Clone, PartialEq)]
pub struct SetConfig {
    pub ssid: String,
    pub password: Zeroizing<String>,
    /// Extra settings in the order the client sent them.
    pub extconfig: Vec<(String, ConfigValue)>,
}

impl fmt::Debug for SetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetConfig")
            .field("ssid", &self.ssid)
            .field("password", &crate::wifi::mask(&self.password))
            .field("extconfig", &self.extconfig)
            .finish()
    }
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `{"cmd":"hi"}`
    Hello,
    /// `{"cmd":"setconfig",...}`
    SetConfig(SetConfig),
}

/// Errors answered on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not a JSON object, or a command with malformed fields.
    InvalidMessage,
    /// Missing, non-string, or unknown `cmd`.
    InvalidCommand,
}

impl ProtocolError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid message",
            Self::InvalidCommand => "invalid command",
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ProtocolError {}

/// Decode one line.
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        debug!("Unparseable message: {}", e);
        ProtocolError::InvalidMessage
    })?;

    let object = value.as_object().ok_or(ProtocolError::InvalidMessage)?;

    let command = object
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::InvalidCommand)?;

    match command {
        "hi" => Ok(Request::Hello),
        "setconfig" => parse_set_config(object).map(Request::SetConfig),
        _ => Err(ProtocolError::InvalidCommand),
    }
}

fn parse_set_config(object: &Map<String, Value>) -> Result<SetConfig, ProtocolError> {
    let ssid = object
        .get("ssid")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::InvalidMessage)?;

    // No password means an open network
    let password = match object.get("pass") {
        None | Some(Value::Null) => "",
        Some(value) => value.as_str().ok_or(ProtocolError::InvalidMessage)?,
    };

    let mut extconfig = Vec::new();
    if let Some(Value::Object(entries)) = object.get("extconfig") {
        for (name, value) in entries {
            match ConfigValue::from_json(value) {
                Some(value) => extconfig.push((name.clone(), value)),
                None => debug!("Ignoring extconfig entry '{}' of unsupported type", name),
            }
        }
    }

    Ok(SetConfig {
        ssid: ssid.to_string(),
        password: Zeroizing::new(password.to_string()),
        extconfig,
    })
}

/// A message to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Response<'a> {
    Welcome(&'a DeviceParameters),
    SetConfigAck,
    Error(ProtocolError),
}

#[derive(Serialize)]
#[serde(untagged)]
enum Wire<'a> {
    Command {
        cmd: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        device: Option<&'a DeviceParameters>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u8>,
    },
    Error {
        error: &'static str,
    },
}

impl Response<'_> {
    /// Encode as one terminated line.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let wire = match self {
            Self::Welcome(device) => Wire::Command {
                cmd: "welcome",
                device: Some(device),
                status: None,
            },
            Self::SetConfigAck => Wire::Command {
                cmd: "setconfig",
                device: None,
                status: Some(1),
            },
            Self::Error(e) => Wire::Error { error: e.as_str() },
        };

        let mut line = serde_json::to_vec(&wire)?;
        line.extend_from_slice(LINE_TERMINATOR);
        Ok(line)
    }
}

/// Splits a byte stream into protocol lines.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Feed bytes and return every complete line.
    ///
    /// Trailing `\r` is stripped and blank lines are skipped. A line that is
    /// not UTF-8, or grows past the limit, yields
    /// [`ProtocolError::InvalidMessage`]; the rest of an overlong line is
    /// dropped up to its newline.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, ProtocolError>> {
        let mut lines = Vec::new();

        for &byte in bytes {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else if let Some(line) = self.take_line() {
                    lines.push(line);
                }
                continue;
            }

            if self.discarding {
                continue;
            }

            self.buf.push(byte);
            // A `\r` may sit one past the limit, it is stripped with the newline
            let limit = if byte == b'\r' {
                self.max_len + 1
            } else {
                self.max_len
            };
            if self.buf.len() > limit {
                self.buf.clear();
                self.discarding = true;
                lines.push(Err(ProtocolError::InvalidMessage));
            }
        }

        lines
    }

    /// Drop any partial line.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    fn take_line(&mut self) -> Option<Result<String, ProtocolError>> {
        let mut raw = std::mem::take(&mut self.buf);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(String::from_utf8(raw).map_err(|_| ProtocolError::InvalidMessage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &[u8]) -> Value {
        assert!(line.ends_with(b"\r\n"));
        serde_json::from_slice(&line[..line.len() - 2]).unwrap()
    }

    // ==================== Request Tests ====================

    #[test]
    fn test_hello() {
        assert_eq!(parse_request(r#"{"cmd":"hi"}"#), Ok(Request::Hello));
    }

    #[test]
    fn test_set_config_minimal() {
        let request = parse_request(r#"{"cmd":"setconfig","ssid":"net","pass":"pw"}"#).unwrap();
        let Request::SetConfig(config) = request else {
            panic!("expected setconfig");
        };
        assert_eq!(config.ssid, "net");
        assert_eq!(config.password.as_str(), "pw");
        assert!(config.extconfig.is_empty());
    }

    #[test]
    fn test_set_config_extconfig_types() {
        let request = parse_request(
            r#"{"cmd":"setconfig","ssid":"net","pass":"pw",
                "extconfig":{"name":"lamp","interval":2.5,"enabled":true,"list":[1],"none":null}}"#,
        )
        .unwrap();
        let Request::SetConfig(config) = request else {
            panic!("expected setconfig");
        };

        let mut entries = config.extconfig.clone();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            entries,
            vec![
                ("enabled".to_string(), ConfigValue::Flag(true)),
                ("interval".to_string(), ConfigValue::Number(2.5)),
                ("name".to_string(), ConfigValue::Text("lamp".into())),
            ]
        );
    }

    #[test]
    fn test_set_config_without_password() {
        let request = parse_request(r#"{"cmd":"setconfig","ssid":"open"}"#).unwrap();
        assert!(matches!(request, Request::SetConfig(c) if c.password.is_empty()));
    }

    #[test]
    fn test_set_config_without_ssid() {
        assert_eq!(
            parse_request(r#"{"cmd":"setconfig","pass":"pw"}"#),
            Err(ProtocolError::InvalidMessage)
        );
        assert_eq!(
            parse_request(r#"{"cmd":"setconfig","ssid":7}"#),
            Err(ProtocolError::InvalidMessage)
        );
    }

    #[test]
    fn test_invalid_message() {
        for line in ["not json", "[1,2]", "\"hi\"", "42", "{\"cmd\":"] {
            assert_eq!(parse_request(line), Err(ProtocolError::InvalidMessage), "{}", line);
        }
    }

    #[test]
    fn test_invalid_command() {
        for line in [r#"{}"#, r#"{"cmd":1}"#, r#"{"cmd":"reboot"}"#, r#"{"cmd":null}"#] {
            assert_eq!(parse_request(line), Err(ProtocolError::InvalidCommand), "{}", line);
        }
    }

    #[test]
    fn test_debug_hides_password() {
        let request = parse_request(r#"{"cmd":"setconfig","ssid":"net","pass":"hunter22"}"#);
        assert!(!format!("{:?}", request).contains("hunter22"));
    }

    // ==================== Response Tests ====================

    #[test]
    fn test_welcome() {
        let mut device = DeviceParameters::new();
        device.insert("model".into(), "X1".into());
        device.insert("fw".into(), "1.0".into());

        let line = Response::Welcome(&device).encode().unwrap();
        assert_eq!(
            decode(&line),
            serde_json::json!({"cmd":"welcome","device":{"model":"X1","fw":"1.0"}})
        );
    }

    #[test]
    fn test_welcome_empty_device() {
        let device = DeviceParameters::new();
        let line = Response::Welcome(&device).encode().unwrap();
        assert_eq!(decode(&line), serde_json::json!({"cmd":"welcome","device":{}}));
    }

    #[test]
    fn test_ack() {
        let line = Response::SetConfigAck.encode().unwrap();
        assert_eq!(decode(&line), serde_json::json!({"cmd":"setconfig","status":1}));
    }

    #[test]
    fn test_errors() {
        let line = Response::Error(ProtocolError::InvalidMessage).encode().unwrap();
        assert_eq!(line, b"{\"error\":\"invalid message\"}\r\n".to_vec());
        let line = Response::Error(ProtocolError::InvalidCommand).encode().unwrap();
        assert_eq!(line, b"{\"error\":\"invalid command\"}\r\n".to_vec());
    }

    // ==================== LineFramer Tests ====================

    #[test]
    fn test_framer_split_across_chunks() {
        let mut framer = LineFramer::new(64);
        assert!(framer.push(b"{\"cmd\":").is_empty());
        let lines = framer.push(b"\"hi\"}\r\n{\"cmd\"");
        assert_eq!(lines, vec![Ok("{\"cmd\":\"hi\"}".to_string())]);
        let lines = framer.push(b":\"hi\"}\n");
        assert_eq!(lines, vec![Ok("{\"cmd\":\"hi\"}".to_string())]);
    }

    #[test]
    fn test_framer_skips_blank_lines() {
        let mut framer = LineFramer::new(64);
        assert!(framer.push(b"\r\n\n  \n").is_empty());
    }

    #[test]
    fn test_framer_overlong_line() {
        let mut framer = LineFramer::new(8);
        let lines = framer.push(b"0123456789abcdef");
        assert_eq!(lines, vec![Err(ProtocolError::InvalidMessage)]);
        // Remainder of the long line is dropped, the next one is intact
        let lines = framer.push(b"tail\n{}\n");
        assert_eq!(lines, vec![Ok("{}".to_string())]);
    }

    #[test]
    fn test_framer_line_at_limit_with_crlf() {
        let mut framer = LineFramer::new(8);
        let lines = framer.push(b"{\"a\":12}\r\n");
        assert_eq!(lines, vec![Ok("{\"a\":12}".to_string())]);

        // One byte more is still too long, whatever the terminator
        let lines = framer.push(b"{\"a\":123}\r\n");
        assert_eq!(lines, vec![Err(ProtocolError::InvalidMessage)]);
        let lines = framer.push(b"{\"a\":12}\r\r\n");
        assert_eq!(lines, vec![Err(ProtocolError::InvalidMessage)]);
    }

    #[test]
    fn test_framer_invalid_utf8() {
        let mut framer = LineFramer::new(64);
        let lines = framer.push(&[0xff, 0xfe, b'\n']);
        assert_eq!(lines, vec![Err(ProtocolError::InvalidMessage)]);
    }
}
