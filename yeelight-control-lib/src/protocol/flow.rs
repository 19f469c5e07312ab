//! Color flow expressions for `start_cf`, `bg_start_cf` and flow scenes.

use serde_json::Value;

use crate::error::ProtocolError;
use crate::protocol::props::{BRIGHTNESS_MAX, RGB_MAX, TEMP_MAX, TEMP_MIN};

/// Step count meaning "repeat until stopped".
pub const REPEAT_INFINITE: u32 = 0;
/// Brightness of a step that keeps the current brightness.
pub const BRIGHTNESS_IGNORE: i64 = -1;

/// What the light does after the last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndAction {
    /// Return to the state before the flow started.
    #[default]
    Recover,
    Stay,
    TurnOff,
}

impl EndAction {
    pub fn to_wire(self) -> u8 {
        match self {
            EndAction::Recover => 0,
            EndAction::Stay => 1,
            EndAction::TurnOff => 2,
        }
    }

    pub fn from_wire(value: i64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(EndAction::Recover),
            1 => Ok(EndAction::Stay),
            2 => Ok(EndAction::TurnOff),
            other => Err(ProtocolError::InvalidValue {
                field: "end_action",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowMode {
    Color,
    Temperature,
    Sleep,
}

impl FlowMode {
    pub fn to_wire(self) -> i64 {
        match self {
            FlowMode::Color => 1,
            FlowMode::Temperature => 2,
            FlowMode::Sleep => 7,
        }
    }

    pub fn from_wire(value: i64) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(FlowMode::Color),
            2 => Ok(FlowMode::Temperature),
            7 => Ok(FlowMode::Sleep),
            other => Err(ProtocolError::InvalidValue {
                field: "flow mode",
                value: other.to_string(),
            }),
        }
    }
}

/// A single step of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowStep {
    pub duration_ms: u32,
    pub mode: FlowMode,
    pub value: i64,
    pub brightness: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Flow {
    /// Number of steps performed before the end action, `0` runs forever.
    pub count: u32,
    pub end_action: EndAction,
    pub steps: Vec<FlowStep>,
}

impl Flow {
    pub fn builder() -> FlowBuilder {
        FlowBuilder::default()
    }

    /// The comma separated step tuple list, as sent on the wire.
    pub fn expression(&self) -> String {
        self.steps
            .iter()
            .map(|step| {
                format!(
                    "{},{},{},{}",
                    step.duration_ms,
                    step.mode.to_wire(),
                    step.value,
                    step.brightness
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Command parameters: count, end action and expression.
    pub fn params(&self) -> [Value; 3] {
        [
            Value::from(self.count),
            Value::from(self.end_action.to_wire()),
            Value::from(self.expression()),
        ]
    }

    /// Restores a flow from the parameter triple, e.g. a stored `flow_params`
    /// property.
    pub fn from_params(params: &[Value]) -> Result<Self, ProtocolError> {
        let [count, end_action, expression] = params else {
            return Err(ProtocolError::Malformed(format!(
                "flow needs 3 parameters, got {}",
                params.len()
            )));
        };
        let count = count
            .as_u64()
            .and_then(|count| u32::try_from(count).ok())
            .ok_or_else(|| ProtocolError::InvalidValue {
                field: "count",
                value: count.to_string(),
            })?;
        let end_action = end_action
            .as_i64()
            .ok_or(ProtocolError::MissingField("end_action"))
            .and_then(EndAction::from_wire)?;
        let expression = expression
            .as_str()
            .ok_or(ProtocolError::MissingField("expression"))?;
        Ok(Flow {
            count,
            end_action,
            steps: parse_expression(expression)?,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let params = value
            .as_array()
            .ok_or_else(|| ProtocolError::Malformed(format!("flow is not an array: {}", json)))?;
        Flow::from_params(params)
    }
}

fn parse_expression(expression: &str) -> Result<Vec<FlowStep>, ProtocolError> {
    let numbers = expression
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| ProtocolError::InvalidValue {
                    field: "expression",
                    value: part.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if numbers.len() % 4 != 0 {
        return Err(ProtocolError::Malformed(format!(
            "flow expression has {} values, expected a multiple of 4",
            numbers.len()
        )));
    }
    numbers
        .chunks_exact(4)
        .map(|tuple| {
            Ok(FlowStep {
                duration_ms: u32::try_from(tuple[0]).map_err(|_| ProtocolError::InvalidValue {
                    field: "duration",
                    value: tuple[0].to_string(),
                })?,
                mode: FlowMode::from_wire(tuple[1])?,
                value: tuple[2],
                brightness: tuple[3],
            })
        })
        .collect()
}

/// Builds a [`Flow`]. By default the steps run once and the light recovers
/// its previous state.
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    end_action: EndAction,
    repeat: u32,
    count: Option<u32>,
    steps: Vec<FlowStep>,
}

impl Default for FlowBuilder {
    fn default() -> Self {
        FlowBuilder {
            end_action: EndAction::Recover,
            repeat: 1,
            count: None,
            steps: Vec::new(),
        }
    }
}

impl FlowBuilder {
    pub fn end_action(mut self, end_action: EndAction) -> Self {
        self.end_action = end_action;
        self
    }

    /// Repeats the whole step list. `0` repeats forever.
    pub fn repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self.count = None;
        self
    }

    /// Sets the exact number of steps to perform, overriding [`Self::repeat`].
    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Changes to `rgb`, keeping the current brightness unless one is given.
    pub fn color(mut self, duration_ms: u32, rgb: u32, brightness: Option<u8>) -> Self {
        self.steps.push(FlowStep {
            duration_ms,
            mode: FlowMode::Color,
            value: i64::from(rgb) & RGB_MAX,
            brightness: step_brightness(brightness),
        });
        self
    }

    pub fn color_chain(self, step_ms: u32, colors: &[u32]) -> Self {
        colors
            .iter()
            .fold(self, |builder, rgb| builder.color(step_ms, *rgb, None))
    }

    pub fn temperature(mut self, duration_ms: u32, kelvin: u16, brightness: Option<u8>) -> Self {
        self.steps.push(FlowStep {
            duration_ms,
            mode: FlowMode::Temperature,
            value: i64::from(kelvin).clamp(TEMP_MIN, TEMP_MAX),
            brightness: step_brightness(brightness),
        });
        self
    }

    pub fn temperature_chain(self, step_ms: u32, temperatures: &[u16]) -> Self {
        temperatures
            .iter()
            .fold(self, |builder, kelvin| builder.temperature(step_ms, *kelvin, None))
    }

    /// Keeps the current output for `duration_ms`.
    pub fn sleep(mut self, duration_ms: u32) -> Self {
        self.steps.push(FlowStep {
            duration_ms,
            mode: FlowMode::Sleep,
            value: 0,
            brightness: 0,
        });
        self
    }

    pub fn build(self) -> Flow {
        let count = self.count.unwrap_or_else(|| {
            let steps = u32::try_from(self.steps.len()).unwrap_or(u32::MAX);
            self.repeat.saturating_mul(steps)
        });
        Flow {
            count,
            end_action: self.end_action,
            steps: self.steps,
        }
    }
}

fn step_brightness(brightness: Option<u8>) -> i64 {
    brightness.map_or(BRIGHTNESS_IGNORE, |b| i64::from(b).clamp(1, BRIGHTNESS_MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_counts_steps_times_repeats() {
        let flow = Flow::builder()
            .repeat(2)
            .color(1000, 0xFF0000, Some(100))
            .temperature(500, 2700, None)
            .sleep(200)
            .build();
        assert_eq!(flow.count, 6);
        assert_eq!(flow.expression(), "1000,1,16711680,100,500,2,2700,-1,200,7,0,0");
    }

    #[test]
    fn test_infinite_flow() {
        let flow = Flow::builder()
            .repeat(REPEAT_INFINITE)
            .end_action(EndAction::Stay)
            .color_chain(300, &[0xFF0000, 0x00FF00])
            .build();
        assert_eq!(flow.count, 0);
        assert_eq!(
            flow.params(),
            [json!(0), json!(1), json!("300,1,16711680,-1,300,1,65280,-1")]
        );
    }

    #[test]
    fn test_flow_is_restored_from_json() {
        let original = Flow::builder()
            .end_action(EndAction::TurnOff)
            .temperature_chain(800, &[1700, 6500])
            .build();
        let json = serde_json::to_string(&original.params()).unwrap();
        assert_eq!(Flow::from_json(&json).unwrap(), original);
    }

    #[test]
    fn test_bad_expression_is_rejected() {
        assert!(Flow::from_json(r#"[1, 0, "100,1,255"]"#).is_err());
        assert!(Flow::from_json(r#"[1, 9, "100,1,255,10"]"#).is_err());
        assert!(Flow::from_json(r#"[1, 0]"#).is_err());
    }
}
