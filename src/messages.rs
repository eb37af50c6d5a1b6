use serde_derive::{Deserialize, Serialize};

use crate::device::DeviceRecord;
use crate::error::ScanError;

pub const ACTION_START_SCAN: &str = "action_start_scan";
pub const ACTION_STOP_SCAN: &str = "action_stop_scan";
pub const ACTION_NEW_DEVICE: &str = "action_new_device";
pub const ACTION_SCAN_STOPPED: &str = "action_scan_stopped";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Method {
    StartScan { return_bonded_devices: bool },
    StopScan,
    Unknown(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodCall {
    pub id: u64,
    pub method: Method,
}

#[derive(Deserialize)]
struct RawCall {
    id: u64,
    method: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

impl MethodCall {
    pub fn new(id: u64, method: Method) -> Self {
        MethodCall { id, method }
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawCall = serde_json::from_slice(payload)?;
        let method = match raw.method.as_str() {
            ACTION_START_SCAN => Method::StartScan {
                return_bonded_devices: raw.arguments.as_bool().unwrap_or(false),
            },
            ACTION_STOP_SCAN => Method::StopScan,
            _ => Method::Unknown(raw.method),
        };
        Ok(MethodCall::new(raw.id, method))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodResult {
    Devices(Vec<DeviceRecord>),
    Done,
    Error(ScanError),
    NotImplemented,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ResultBody<'a> {
    Success {
        value: Option<&'a [DeviceRecord]>,
    },
    Error {
        code: &'static str,
        message: String,
    },
    NotImplemented,
}

#[derive(Serialize)]
struct ResultMessage<'a> {
    id: u64,
    #[serde(flatten)]
    body: ResultBody<'a>,
}

impl MethodResult {
    pub fn to_json(&self, id: u64) -> Result<String, serde_json::Error> {
        let body = match self {
            MethodResult::Devices(devices) => ResultBody::Success {
                value: Some(devices.as_slice()),
            },
            MethodResult::Done => ResultBody::Success { value: None },
            MethodResult::Error(err) => ResultBody::Error {
                code: err.code(),
                message: err.to_string(),
            },
            MethodResult::NotImplemented => ResultBody::NotImplemented,
        };
        serde_json::to_string(&ResultMessage { id, body })
    }
}

/// Pushed to the caller outside of any request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    NewDeviceFound(DeviceRecord),
    ScanStopped,
}

#[derive(Serialize)]
struct EventMessage<'a> {
    method: &'static str,
    arguments: Option<&'a DeviceRecord>,
}

impl Notification {
    pub fn method(&self) -> &'static str {
        match self {
            Notification::NewDeviceFound(_) => ACTION_NEW_DEVICE,
            Notification::ScanStopped => ACTION_SCAN_STOPPED,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let arguments = match self {
            Notification::NewDeviceFound(record) => Some(record),
            Notification::ScanStopped => None,
        };
        serde_json::to_string(&EventMessage {
            method: self.method(),
            arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_scan() {
        let call =
            MethodCall::from_json(br#"{"id": 3, "method": "action_start_scan", "arguments": true}"#)
                .unwrap();
        assert_eq!(
            call,
            MethodCall::new(
                3,
                Method::StartScan {
                    return_bonded_devices: true
                }
            )
        );

        let call = MethodCall::from_json(br#"{"id": 4, "method": "action_start_scan"}"#).unwrap();
        assert_eq!(
            call.method,
            Method::StartScan {
                return_bonded_devices: false
            }
        );
    }

    #[test]
    fn test_parse_other_methods() {
        let call = MethodCall::from_json(br#"{"id": 5, "method": "action_stop_scan", "arguments": null}"#)
            .unwrap();
        assert_eq!(call.method, Method::StopScan);

        let call = MethodCall::from_json(br#"{"id": 6, "method": "connect"}"#).unwrap();
        assert_eq!(call.method, Method::Unknown("connect".to_string()));

        assert!(MethodCall::from_json(b"not json").is_err());
    }

    #[test]
    fn test_result_json() {
        let record = DeviceRecord {
            name: "Speaker".to_string(),
            address: "00:11:22:AA:BB:CC".to_string(),
            rssi: "-32768".to_string(),
        };
        let json = MethodResult::Devices(vec![record]).to_json(1).unwrap();
        assert_eq!(
            json,
            r#"{"id":1,"status":"success","value":[{"name":"Speaker","address":"00:11:22:AA:BB:CC","rssi":"-32768"}]}"#
        );

        let json = MethodResult::Done.to_json(2).unwrap();
        assert_eq!(json, r#"{"id":2,"status":"success","value":null}"#);

        let json = MethodResult::Error(ScanError::NoGps).to_json(3).unwrap();
        assert_eq!(
            json,
            r#"{"id":3,"status":"error","code":"error_no_gps","message":"Gps need to be turned on to scan BT devices"}"#
        );

        let json = MethodResult::NotImplemented.to_json(4).unwrap();
        assert_eq!(json, r#"{"id":4,"status":"not_implemented"}"#);
    }

    #[test]
    fn test_notification_json() {
        let json = Notification::ScanStopped.to_json().unwrap();
        assert_eq!(json, r#"{"method":"action_scan_stopped","arguments":null}"#);

        let record = DeviceRecord {
            name: "Tag-LE".to_string(),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            rssi: "-70".to_string(),
        };
        let json = Notification::NewDeviceFound(record).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"method":"action_new_device","arguments":{"name":"Tag-LE","address":"AA:BB:CC:DD:EE:FF","rssi":"-70"}}"#
        );
    }
}
