//! Device properties as reported by `get_prop` replies, `props` notifications
//! and discovery advertisements.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub const BRIGHTNESS_MIN: i64 = 1;
pub const BRIGHTNESS_MAX: i64 = 100;
pub const TEMP_MIN: i64 = 1700;
pub const TEMP_MAX: i64 = 6500;
pub const HUE_MAX: i64 = 359;
pub const SATURATION_MAX: i64 = 100;
pub const RGB_MAX: i64 = 0x00FF_FFFF;

/// A named device property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prop {
    Power,
    Bright,
    Ct,
    Rgb,
    Hue,
    Sat,
    ColorMode,
    Flowing,
    Delayoff,
    FlowParams,
    MusicOn,
    Name,
    BgPower,
    BgFlowing,
    BgFlowParams,
    BgCt,
    BgLmode,
    BgBright,
    BgRgb,
    BgHue,
    BgSat,
    NlBr,
    ActiveMode,
}

/// How the wire representation of a property is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    Int,
    Text,
    OnOff,
    ColorMode,
    /// Kept verbatim, e.g. the parameters of a running color flow.
    List,
}

impl Prop {
    pub const ALL: [Prop; 23] = [
        Prop::Power,
        Prop::Bright,
        Prop::Ct,
        Prop::Rgb,
        Prop::Hue,
        Prop::Sat,
        Prop::ColorMode,
        Prop::Flowing,
        Prop::Delayoff,
        Prop::FlowParams,
        Prop::MusicOn,
        Prop::Name,
        Prop::BgPower,
        Prop::BgFlowing,
        Prop::BgFlowParams,
        Prop::BgCt,
        Prop::BgLmode,
        Prop::BgBright,
        Prop::BgRgb,
        Prop::BgHue,
        Prop::BgSat,
        Prop::NlBr,
        Prop::ActiveMode,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Prop::Power => "power",
            Prop::Bright => "bright",
            Prop::Ct => "ct",
            Prop::Rgb => "rgb",
            Prop::Hue => "hue",
            Prop::Sat => "sat",
            Prop::ColorMode => "color_mode",
            Prop::Flowing => "flowing",
            Prop::Delayoff => "delayoff",
            Prop::FlowParams => "flow_params",
            Prop::MusicOn => "music_on",
            Prop::Name => "name",
            Prop::BgPower => "bg_power",
            Prop::BgFlowing => "bg_flowing",
            Prop::BgFlowParams => "bg_flow_params",
            Prop::BgCt => "bg_ct",
            Prop::BgLmode => "bg_lmode",
            Prop::BgBright => "bg_bright",
            Prop::BgRgb => "bg_rgb",
            Prop::BgHue => "bg_hue",
            Prop::BgSat => "bg_sat",
            Prop::NlBr => "nl_br",
            Prop::ActiveMode => "active_mode",
        }
    }

    pub fn kind(&self) -> PropKind {
        match self {
            Prop::Power | Prop::BgPower => PropKind::OnOff,
            Prop::ColorMode | Prop::BgLmode => PropKind::ColorMode,
            Prop::Name => PropKind::Text,
            Prop::FlowParams | Prop::BgFlowParams => PropKind::List,
            _ => PropKind::Int,
        }
    }

    /// Device-domain bounds of numeric properties.
    fn bounds(&self) -> Option<(i64, i64)> {
        match self {
            Prop::Bright | Prop::BgBright => Some((BRIGHTNESS_MIN, BRIGHTNESS_MAX)),
            Prop::Ct | Prop::BgCt => Some((TEMP_MIN, TEMP_MAX)),
            Prop::Hue | Prop::BgHue => Some((0, HUE_MAX)),
            Prop::Sat | Prop::BgSat => Some((0, SATURATION_MAX)),
            Prop::Rgb | Prop::BgRgb => Some((0, RGB_MAX)),
            _ => None,
        }
    }
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Prop {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Prop::ALL
            .iter()
            .find(|prop| prop.name() == s)
            .copied()
            .ok_or_else(|| ProtocolError::InvalidValue {
                field: "prop",
                value: s.to_string(),
            })
    }
}

/// Which light source settings are currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    Unknown,
    Rgb,
    ColorTemperature,
    Hsv,
}

impl ColorMode {
    pub fn from_wire(value: i64) -> Self {
        match value {
            1 => ColorMode::Rgb,
            2 => ColorMode::ColorTemperature,
            3 => ColorMode::Hsv,
            _ => ColorMode::Unknown,
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            ColorMode::Unknown => 0,
            ColorMode::Rgb => 1,
            ColorMode::ColorTemperature => 2,
            ColorMode::Hsv => 3,
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColorMode::Unknown => "Unknown",
            ColorMode::Rgb => "RGB",
            ColorMode::ColorTemperature => "Temp",
            ColorMode::Hsv => "HSV",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Int(i64),
    OnOff(bool),
    ColorMode(ColorMode),
    Text(String),
}

impl PropValue {
    /// Parses the wire representation of `prop`.
    ///
    /// Numeric values outside of the device domain are clamped rather than
    /// rejected, some firmware versions report e.g. a brightness of 0.
    pub fn parse(prop: Prop, raw: &str) -> Result<PropValue, ProtocolError> {
        let raw = raw.trim();
        let invalid = || ProtocolError::InvalidValue {
            field: prop.name(),
            value: raw.to_string(),
        };
        match prop.kind() {
            PropKind::OnOff => match raw {
                "on" => Ok(PropValue::OnOff(true)),
                "off" => Ok(PropValue::OnOff(false)),
                _ => Err(invalid()),
            },
            PropKind::ColorMode => raw
                .parse::<i64>()
                .map(|mode| PropValue::ColorMode(ColorMode::from_wire(mode)))
                .map_err(|_| invalid()),
            PropKind::Text | PropKind::List => Ok(PropValue::Text(raw.to_string())),
            PropKind::Int => {
                let value = raw.parse::<i64>().map_err(|_| invalid())?;
                Ok(PropValue::Int(clamp(prop, value)))
            }
        }
    }

    /// Parses a JSON value as found in `props` notifications, where numbers
    /// may arrive either as JSON numbers or as strings.
    pub fn from_json(prop: Prop, value: &Value) -> Result<PropValue, ProtocolError> {
        match value {
            Value::String(s) => PropValue::parse(prop, s),
            Value::Number(n) => PropValue::parse(prop, &n.to_string()),
            Value::Bool(b) if prop.kind() == PropKind::OnOff => Ok(PropValue::OnOff(*b)),
            other => Err(ProtocolError::InvalidValue {
                field: prop.name(),
                value: other.to_string(),
            }),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::OnOff(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            PropValue::Int(v) => v.to_string(),
            PropValue::OnOff(true) => "on".to_string(),
            PropValue::OnOff(false) => "off".to_string(),
            PropValue::ColorMode(mode) => mode.to_wire().to_string(),
            PropValue::Text(v) => v.clone(),
        }
    }
}

fn clamp(prop: Prop, value: i64) -> i64 {
    match prop.bounds() {
        Some((min, max)) if value < min || value > max => {
            let clamped = value.clamp(min, max);
            warn!("{} value {} out of range, clamped to {}", prop, value, clamped);
            clamped
        }
        _ => value,
    }
}

/// Property snapshot of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct PropMap(HashMap<Prop, PropValue>);

impl PropMap {
    pub fn new() -> Self {
        PropMap::default()
    }

    /// Builds a map from the `params` object of a `props` notification.
    /// Unknown keys and unparsable values are skipped.
    pub fn from_json_object(object: &serde_json::Map<String, Value>) -> Self {
        let mut props = PropMap::new();
        for (key, value) in object {
            props.insert_json(key, value);
        }
        props
    }

    /// Builds a map from textual `key: value` pairs, e.g. advertisement headers.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut props = PropMap::new();
        for (key, value) in pairs {
            props.insert_raw(key, value);
        }
        props
    }

    pub fn insert(&mut self, prop: Prop, value: PropValue) -> Option<PropValue> {
        self.0.insert(prop, value)
    }

    /// Inserts a textual value for a property name. Returns whether the key
    /// was a known property with a valid value.
    pub fn insert_raw(&mut self, key: &str, raw: &str) -> bool {
        let Ok(prop) = key.parse::<Prop>() else {
            return false;
        };
        match PropValue::parse(prop, raw) {
            Ok(value) => {
                self.0.insert(prop, value);
                true
            }
            Err(e) => {
                warn!("skipping property: {}", e);
                false
            }
        }
    }

    pub fn insert_json(&mut self, key: &str, value: &Value) -> bool {
        let Ok(prop) = key.parse::<Prop>() else {
            return false;
        };
        match PropValue::from_json(prop, value) {
            Ok(value) => {
                self.0.insert(prop, value);
                true
            }
            Err(e) => {
                warn!("skipping property: {}", e);
                false
            }
        }
    }

    pub fn get(&self, prop: Prop) -> Option<&PropValue> {
        self.0.get(&prop)
    }

    pub fn get_int(&self, prop: Prop) -> Option<i64> {
        self.get(prop).and_then(PropValue::as_int)
    }

    pub fn get_bool(&self, prop: Prop) -> Option<bool> {
        self.get(prop).and_then(PropValue::as_bool)
    }

    pub fn get_text(&self, prop: Prop) -> Option<&str> {
        self.get(prop).and_then(PropValue::as_text)
    }

    pub fn color_mode(&self, prop: Prop) -> Option<ColorMode> {
        match self.get(prop) {
            Some(PropValue::ColorMode(mode)) => Some(*mode),
            _ => None,
        }
    }

    /// Copies every entry of `other` into this map. Returns whether anything
    /// changed.
    pub fn merge(&mut self, other: &PropMap) -> bool {
        let mut changed = false;
        for (prop, value) in &other.0 {
            if self.0.get(prop) != Some(value) {
                self.0.insert(*prop, value.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Prop, &PropValue)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, String>> for PropMap {
    fn from(map: BTreeMap<String, String>) -> Self {
        PropMap::from_pairs(map.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

impl From<PropMap> for BTreeMap<String, String> {
    fn from(props: PropMap) -> Self {
        props
            .0
            .iter()
            .map(|(prop, value)| (prop.name().to_string(), value.to_wire()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prop_names_round_trip_through_from_str() {
        for prop in Prop::ALL {
            assert_eq!(prop.name().parse::<Prop>().unwrap(), prop);
        }
        assert!("brightness".parse::<Prop>().is_err());
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        assert_eq!(PropValue::parse(Prop::Bright, "0").unwrap(), PropValue::Int(1));
        assert_eq!(PropValue::parse(Prop::Bright, "250").unwrap(), PropValue::Int(100));
        assert_eq!(PropValue::parse(Prop::Ct, "1000").unwrap(), PropValue::Int(1700));
        assert_eq!(PropValue::parse(Prop::BgCt, "9000").unwrap(), PropValue::Int(6500));
        assert_eq!(PropValue::parse(Prop::Hue, "360").unwrap(), PropValue::Int(359));
        assert_eq!(PropValue::parse(Prop::Sat, "-5").unwrap(), PropValue::Int(0));
        assert_eq!(PropValue::parse(Prop::Delayoff, "500").unwrap(), PropValue::Int(500));
    }

    #[test]
    fn test_notification_values_accept_numbers_and_strings() {
        let params = json!({"power": "on", "bright": 50, "ct": "4000", "color_mode": 2, "unknown": 1});
        let props = PropMap::from_json_object(params.as_object().unwrap());
        assert_eq!(props.len(), 4);
        assert_eq!(props.get_bool(Prop::Power), Some(true));
        assert_eq!(props.get_int(Prop::Bright), Some(50));
        assert_eq!(props.get_int(Prop::Ct), Some(4000));
        assert_eq!(props.color_mode(Prop::ColorMode), Some(ColorMode::ColorTemperature));
    }

    #[test]
    fn test_invalid_values_are_skipped() {
        let mut props = PropMap::new();
        assert!(!props.insert_raw("power", "maybe"));
        assert!(!props.insert_raw("bright", "bright"));
        assert!(props.is_empty());
    }

    #[test]
    fn test_merge_reports_changes() {
        let mut current = PropMap::from_pairs([("power", "off"), ("bright", "10")]);
        let update = PropMap::from_pairs([("power", "on")]);
        assert!(current.merge(&update));
        assert!(!current.merge(&update));
        assert_eq!(current.get_bool(Prop::Power), Some(true));
        assert_eq!(current.get_int(Prop::Bright), Some(10));
    }

    #[test]
    fn test_serializes_as_wire_strings() {
        let props = PropMap::from_pairs([("power", "on"), ("color_mode", "1"), ("name", "desk")]);
        let value = serde_json::to_value(&props).unwrap();
        assert_eq!(value, json!({"color_mode": "1", "name": "desk", "power": "on"}));
        let back: PropMap = serde_json::from_value(value).unwrap();
        assert_eq!(back, props);
    }
}
