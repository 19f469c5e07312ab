use log::warn;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::protocol::command::Command;
use crate::protocol::method::{Cron, Method};
use crate::protocol::props::PropMap;

/// Method name of unsolicited property updates.
pub const NOTIFICATION_METHOD: &str = "props";

/// An inbound frame: either the result of a command or a property
/// notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Echo of the command id, `None` for notifications.
    pub id: Option<u32>,
    /// `false` when the device answered with an error object.
    pub ok: bool,
    /// Raw result array of a command result.
    pub results: Vec<Value>,
    /// Properties carried by a notification or mapped from a `get_prop` result.
    pub props: Option<PropMap>,
    /// Timer reported by a `cron_get` result.
    pub cron: Option<Cron>,
    pub code: i64,
    pub message: Option<String>,
    /// Method of the command this reply answers, once correlated.
    pub method: Option<Method>,
}

impl Reply {
    pub fn notification(props: PropMap) -> Self {
        Reply {
            id: None,
            ok: true,
            results: Vec::new(),
            props: Some(props),
            cron: None,
            code: 0,
            message: None,
            method: None,
        }
    }

    pub fn result(id: u32, results: Vec<Value>) -> Self {
        Reply {
            id: Some(id),
            ok: true,
            results,
            props: None,
            cron: None,
            code: 0,
            message: None,
            method: None,
        }
    }

    pub fn error(id: u32, code: i64, message: impl Into<String>) -> Self {
        Reply {
            id: Some(id),
            ok: false,
            results: Vec::new(),
            props: None,
            cron: None,
            code,
            message: Some(message.into()),
            method: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_command_result(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_error(&self) -> bool {
        !self.ok
    }

    /// Whether the device acknowledged the command with the plain `["ok"]`.
    pub fn is_ok_ack(&self) -> bool {
        self.ok && self.results.first().and_then(Value::as_str) == Some("ok")
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "expected an object, got {}",
                    other
                )))
            }
        };

        let Some(raw_id) = object.remove("id") else {
            return Reply::from_notification(object);
        };
        let id = raw_id
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| ProtocolError::InvalidValue {
                field: "id",
                value: raw_id.to_string(),
            })?;

        if let Some(error) = object.remove("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Ok(Reply::error(id, code, message));
        }

        match object.remove("result") {
            Some(Value::Array(results)) => Ok(Reply::result(id, results)),
            Some(other) => Err(ProtocolError::InvalidValue {
                field: "result",
                value: other.to_string(),
            }),
            None => Err(ProtocolError::MissingField("result")),
        }
    }

    fn from_notification(mut object: serde_json::Map<String, Value>) -> Result<Self, ProtocolError> {
        let method = object
            .remove("method")
            .ok_or(ProtocolError::MissingField("method"))?;
        if method.as_str() != Some(NOTIFICATION_METHOD) {
            return Err(ProtocolError::Unexpected(format!(
                "notification method {}",
                method
            )));
        }
        match object.remove("params") {
            Some(Value::Object(params)) => Ok(Reply::notification(PropMap::from_json_object(&params))),
            _ => Err(ProtocolError::MissingField("params")),
        }
    }

    /// Attaches the command this reply answers and interprets results whose
    /// meaning depends on the request.
    pub fn correlate(mut self, command: &Command) -> Self {
        self.method = Some(command.method().clone());
        if !self.ok {
            return self;
        }
        match command.method() {
            Method::GetProp => {
                let mut props = PropMap::new();
                for (prop, value) in command.requested_props().iter().zip(&self.results) {
                    if let Some(prop) = prop {
                        props.insert_json(prop.name(), value);
                    }
                }
                self.props = Some(props);
            }
            Method::CronGet => {
                if let Some(entry) = self.results.first() {
                    match Cron::from_value(entry) {
                        Ok(cron) => self.cron = Some(cron),
                        Err(e) => warn!("ignoring cron entry of reply {:?}: {}", self.id, e),
                    }
                }
            }
            _ => {}
        }
        self
    }
}
