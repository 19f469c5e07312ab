use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ProtocolError;

/// A control method understood by the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    GetProp,
    SetCtAbx,
    SetRgb,
    SetHsv,
    SetBright,
    SetPower,
    Toggle,
    SetDefault,
    StartCf,
    StopCf,
    SetScene,
    CronAdd,
    CronGet,
    CronDel,
    SetAdjust,
    SetMusic,
    SetName,
    BgSetRgb,
    BgSetHsv,
    BgSetCtAbx,
    BgStartCf,
    BgStopCf,
    BgSetScene,
    BgSetDefault,
    BgSetPower,
    BgSetBright,
    BgSetAdjust,
    BgToggle,
    DevToggle,
    AdjustBright,
    AdjustCt,
    AdjustColor,
    BgAdjustBright,
    BgAdjustCt,
    BgAdjustColor,
    /// A method this library has no dedicated variant for.
    Custom(String),
}

/// Every known method, in capability bit order.
pub static KNOWN_METHODS: [Method; 35] = [
    Method::GetProp,
    Method::SetCtAbx,
    Method::SetRgb,
    Method::SetHsv,
    Method::SetBright,
    Method::SetPower,
    Method::Toggle,
    Method::SetDefault,
    Method::StartCf,
    Method::StopCf,
    Method::SetScene,
    Method::CronAdd,
    Method::CronGet,
    Method::CronDel,
    Method::SetAdjust,
    Method::SetMusic,
    Method::SetName,
    Method::BgSetRgb,
    Method::BgSetHsv,
    Method::BgSetCtAbx,
    Method::BgStartCf,
    Method::BgStopCf,
    Method::BgSetScene,
    Method::BgSetDefault,
    Method::BgSetPower,
    Method::BgSetBright,
    Method::BgSetAdjust,
    Method::BgToggle,
    Method::DevToggle,
    Method::AdjustBright,
    Method::AdjustCt,
    Method::AdjustColor,
    Method::BgAdjustBright,
    Method::BgAdjustCt,
    Method::BgAdjustColor,
];

impl Method {
    pub fn name(&self) -> &str {
        match self {
            Method::GetProp => "get_prop",
            Method::SetCtAbx => "set_ct_abx",
            Method::SetRgb => "set_rgb",
            Method::SetHsv => "set_hsv",
            Method::SetBright => "set_bright",
            Method::SetPower => "set_power",
            Method::Toggle => "toggle",
            Method::SetDefault => "set_default",
            Method::StartCf => "start_cf",
            Method::StopCf => "stop_cf",
            Method::SetScene => "set_scene",
            Method::CronAdd => "cron_add",
            Method::CronGet => "cron_get",
            Method::CronDel => "cron_del",
            Method::SetAdjust => "set_adjust",
            Method::SetMusic => "set_music",
            Method::SetName => "set_name",
            Method::BgSetRgb => "bg_set_rgb",
            Method::BgSetHsv => "bg_set_hsv",
            Method::BgSetCtAbx => "bg_set_ct_abx",
            Method::BgStartCf => "bg_start_cf",
            Method::BgStopCf => "bg_stop_cf",
            Method::BgSetScene => "bg_set_scene",
            Method::BgSetDefault => "bg_set_default",
            Method::BgSetPower => "bg_set_power",
            Method::BgSetBright => "bg_set_bright",
            Method::BgSetAdjust => "bg_set_adjust",
            Method::BgToggle => "bg_toggle",
            Method::DevToggle => "dev_toggle",
            Method::AdjustBright => "adjust_bright",
            Method::AdjustCt => "adjust_ct",
            Method::AdjustColor => "adjust_color",
            Method::BgAdjustBright => "bg_adjust_bright",
            Method::BgAdjustCt => "bg_adjust_ct",
            Method::BgAdjustColor => "bg_adjust_color",
            Method::Custom(name) => name,
        }
    }

    /// Capability bit of the method, `0` for custom methods.
    pub fn flag(&self) -> u64 {
        KNOWN_METHODS
            .iter()
            .position(|known| known == self)
            .map_or(0, |index| 1 << index)
    }

    /// The counterpart of this method addressing the background light.
    pub fn background(&self) -> Option<Method> {
        let method = match self {
            Method::SetRgb => Method::BgSetRgb,
            Method::SetHsv => Method::BgSetHsv,
            Method::SetCtAbx => Method::BgSetCtAbx,
            Method::StartCf => Method::BgStartCf,
            Method::StopCf => Method::BgStopCf,
            Method::SetScene => Method::BgSetScene,
            Method::SetDefault => Method::BgSetDefault,
            Method::SetPower => Method::BgSetPower,
            Method::SetBright => Method::BgSetBright,
            Method::SetAdjust => Method::BgSetAdjust,
            Method::Toggle => Method::BgToggle,
            Method::AdjustBright => Method::BgAdjustBright,
            Method::AdjustCt => Method::BgAdjustCt,
            Method::AdjustColor => Method::BgAdjustColor,
            _ => return None,
        };
        Some(method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(KNOWN_METHODS
            .iter()
            .find(|method| method.name() == s)
            .cloned()
            .unwrap_or_else(|| Method::Custom(s.to_string())))
    }
}

/// Set of methods a device advertises in its `support` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MethodSet(u64);

impl MethodSet {
    pub fn empty() -> Self {
        MethodSet(0)
    }

    /// Parses a space separated method list. Unknown names are ignored.
    pub fn parse(support: &str) -> Self {
        let bits = support
            .split_whitespace()
            .map(|name| {
                name.parse::<Method>()
                    .map_or(0, |method| method.flag())
            })
            .fold(0, |acc, flag| acc | flag);
        MethodSet(bits)
    }

    pub fn insert(&mut self, method: &Method) {
        self.0 |= method.flag();
    }

    pub fn contains(&self, method: &Method) -> bool {
        let flag = method.flag();
        flag != 0 && self.0 & flag == flag
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static Method> + '_ {
        KNOWN_METHODS
            .iter()
            .filter(move |method| self.contains(method))
    }
}

impl fmt::Display for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|method| method.name()).collect();
        f.write_str(&names.join(" "))
    }
}

impl Serialize for MethodSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MethodSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let support = String::deserialize(deserializer)?;
        Ok(MethodSet::parse(&support))
    }
}

/// Transition applied by commands that change the light output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Effect {
    pub smooth: bool,
    pub duration_ms: u32,
}

impl Effect {
    pub const SUDDEN: Effect = Effect {
        smooth: false,
        duration_ms: 0,
    };

    pub const DEFAULT: Effect = Effect {
        smooth: true,
        duration_ms: 500,
    };

    /// A zero duration is a sudden change, anything else a smooth one.
    pub fn of(duration_ms: u32) -> Self {
        if duration_ms == 0 {
            Effect::SUDDEN
        } else {
            Effect {
                smooth: true,
                duration_ms,
            }
        }
    }

    pub fn params(&self) -> [Value; 2] {
        let name = if self.smooth { "smooth" } else { "sudden" };
        [Value::from(name), Value::from(self.duration_ms)]
    }
}

impl Default for Effect {
    fn default() -> Self {
        Effect::DEFAULT
    }
}

/// Mode a light is switched into when powered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    #[default]
    Normal,
    ColorTemperature,
    Rgb,
    Hsv,
    ColorFlow,
    NightLight,
}

impl PowerMode {
    pub fn to_wire(self) -> u8 {
        match self {
            PowerMode::Normal => 0,
            PowerMode::ColorTemperature => 1,
            PowerMode::Rgb => 2,
            PowerMode::Hsv => 3,
            PowerMode::ColorFlow => 4,
            PowerMode::NightLight => 5,
        }
    }
}

/// Scene class accepted by `set_scene`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneKind {
    Color,
    Hsv,
    Ct,
    Cf,
    AutoDelayOff,
}

impl SceneKind {
    pub fn name(&self) -> &'static str {
        match self {
            SceneKind::Color => "color",
            SceneKind::Hsv => "hsv",
            SceneKind::Ct => "ct",
            SceneKind::Cf => "cf",
            SceneKind::AutoDelayOff => "auto_delay_off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdjustAction {
    Increase,
    Decrease,
    Circle,
}

impl AdjustAction {
    pub fn name(&self) -> &'static str {
        match self {
            AdjustAction::Increase => "increase",
            AdjustAction::Decrease => "decrease",
            AdjustAction::Circle => "circle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdjustProp {
    Bright,
    Ct,
    Color,
}

impl AdjustProp {
    pub fn name(&self) -> &'static str {
        match self {
            AdjustProp::Bright => "bright",
            AdjustProp::Ct => "ct",
            AdjustProp::Color => "color",
        }
    }
}

/// Timer kinds supported by the `cron_*` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronType {
    PowerOff,
}

impl CronType {
    pub fn to_wire(self) -> u8 {
        match self {
            CronType::PowerOff => 0,
        }
    }

    pub fn from_wire(value: i64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(CronType::PowerOff),
            other => Err(ProtocolError::InvalidValue {
                field: "type",
                value: other.to_string(),
            }),
        }
    }
}

/// A timer as reported by `cron_get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cron {
    pub kind: CronType,
    /// Minutes until the timer fires.
    pub delay_minutes: u32,
    pub mix: i64,
}

impl Cron {
    /// Parses a single `cron_get` result entry.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed(format!("cron entry {}", value)))?;
        let int = |field: &'static str| {
            object
                .get(field)
                .and_then(Value::as_i64)
                .ok_or(ProtocolError::MissingField(field))
        };
        let delay = int("delay")?;
        Ok(Cron {
            kind: CronType::from_wire(int("type")?)?,
            delay_minutes: u32::try_from(delay).map_err(|_| ProtocolError::InvalidValue {
                field: "delay",
                value: delay.to_string(),
            })?,
            mix: object.get("mix").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}
