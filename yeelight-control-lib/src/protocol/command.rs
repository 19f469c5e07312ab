use std::fmt;

use log::warn;
use palette::Srgb;
use serde_json::{json, Value};

use crate::protocol::flow::Flow;
use crate::protocol::method::{AdjustAction, AdjustProp, CronType, Effect, Method, PowerMode, SceneKind};
use crate::protocol::props::{Prop, BRIGHTNESS_MAX, BRIGHTNESS_MIN, HUE_MAX, RGB_MAX, SATURATION_MAX, TEMP_MAX, TEMP_MIN};

/// Parameters of a `set_scene` command.
#[derive(Debug, Clone, PartialEq)]
pub enum Scene {
    Color { rgb: u32, brightness: u8 },
    Hsv { hue: u16, saturation: u8, brightness: u8 },
    ColorTemperature { kelvin: u16, brightness: u8 },
    Flow(Flow),
    /// Turns the light on at `brightness` and off again after `minutes`.
    AutoDelayOff { brightness: u8, minutes: u32 },
}

impl Scene {
    pub fn kind(&self) -> SceneKind {
        match self {
            Scene::Color { .. } => SceneKind::Color,
            Scene::Hsv { .. } => SceneKind::Hsv,
            Scene::ColorTemperature { .. } => SceneKind::Ct,
            Scene::Flow(_) => SceneKind::Cf,
            Scene::AutoDelayOff { .. } => SceneKind::AutoDelayOff,
        }
    }

    fn params(&self) -> Vec<Value> {
        let mut params = vec![Value::from(self.kind().name())];
        match self {
            Scene::Color { rgb, brightness } => {
                params.push(Value::from(rgb & RGB_MAX as u32));
                params.push(Value::from(brightness_param(*brightness)));
            }
            Scene::Hsv {
                hue,
                saturation,
                brightness,
            } => {
                params.push(Value::from(hue_param(*hue)));
                params.push(Value::from(saturation_param(*saturation)));
                params.push(Value::from(brightness_param(*brightness)));
            }
            Scene::ColorTemperature { kelvin, brightness } => {
                params.push(Value::from(temperature_param(*kelvin)));
                params.push(Value::from(brightness_param(*brightness)));
            }
            Scene::Flow(flow) => params.extend(flow.params()),
            Scene::AutoDelayOff {
                brightness,
                minutes,
            } => {
                params.push(Value::from(brightness_param(*brightness)));
                params.push(Value::from(*minutes));
            }
        }
        params
    }
}

/// An outbound request.
///
/// The id correlates the reply and must be unique among the commands that are
/// awaiting a reply on one connection, see
/// [`Connection::next_command_id`](crate::connection::Connection::next_command_id).
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    id: u32,
    method: Method,
    params: Vec<Value>,
    effect: Option<Effect>,
    /// Parameters that follow the effect on the wire.
    trailing: Vec<Value>,
}

impl Command {
    pub fn new(id: u32, method: Method, params: Vec<Value>) -> Self {
        Command {
            id,
            method,
            params,
            effect: None,
            trailing: Vec::new(),
        }
    }

    /// A command for a method without a dedicated [`Method`] variant.
    pub fn custom(id: u32, method: &str, params: Vec<Value>) -> Self {
        Command::new(id, Method::Custom(method.to_string()), params)
    }

    /// Appends a transition to the parameters. Without one, devices apply
    /// the change immediately.
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Retargets the command at the background light. Commands without a
    /// background counterpart are returned unchanged.
    pub fn background(mut self) -> Self {
        match self.method.background() {
            Some(method) => self.method = method,
            None => warn!("{} has no background variant", self.method),
        }
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn effect(&self) -> Option<Effect> {
        self.effect
    }

    /// Properties requested by a `get_prop` command, in request order.
    pub fn requested_props(&self) -> Vec<Option<Prop>> {
        self.params
            .iter()
            .map(|param| param.as_str().and_then(|name| name.parse::<Prop>().ok()))
            .collect()
    }

    /// The wire object, without the frame terminator.
    pub fn to_json(&self) -> Value {
        let mut params = self.params.clone();
        if let Some(effect) = self.effect {
            params.extend(effect.params());
        }
        params.extend(self.trailing.iter().cloned());
        json!({
            "id": self.id,
            "method": self.method.name(),
            "params": params,
        })
    }

    pub fn get_prop(id: u32, props: &[Prop]) -> Self {
        let params = props.iter().map(|prop| Value::from(prop.name())).collect();
        Command::new(id, Method::GetProp, params)
    }

    pub fn toggle(id: u32) -> Self {
        Command::new(id, Method::Toggle, Vec::new())
    }

    /// Toggles the main and the background light together.
    pub fn dev_toggle(id: u32) -> Self {
        Command::new(id, Method::DevToggle, Vec::new())
    }

    pub fn set_power(id: u32, on: bool, effect: Effect) -> Self {
        Command::set_power_mode(id, on, effect, PowerMode::Normal)
    }

    pub fn set_power_mode(id: u32, on: bool, effect: Effect, mode: PowerMode) -> Self {
        let mut command =
            Command::new(id, Method::SetPower, vec![Value::from(on_off(on))]).with_effect(effect);
        if mode != PowerMode::Normal {
            command.trailing.push(Value::from(mode.to_wire()));
        }
        command
    }

    pub fn set_bright(id: u32, brightness: u8, effect: Effect) -> Self {
        Command::new(
            id,
            Method::SetBright,
            vec![Value::from(brightness_param(brightness))],
        )
        .with_effect(effect)
    }

    /// Sets a 24 bit `0xRRGGBB` color.
    pub fn set_rgb(id: u32, rgb: u32, effect: Effect) -> Self {
        Command::new(id, Method::SetRgb, vec![Value::from(rgb & RGB_MAX as u32)]).with_effect(effect)
    }

    pub fn set_color(id: u32, color: Srgb<u8>, effect: Effect) -> Self {
        Command::set_rgb(id, pack_rgb(color), effect)
    }

    pub fn set_ct(id: u32, kelvin: u16, effect: Effect) -> Self {
        Command::new(
            id,
            Method::SetCtAbx,
            vec![Value::from(temperature_param(kelvin))],
        )
        .with_effect(effect)
    }

    pub fn set_hsv(id: u32, hue: u16, saturation: u8, effect: Effect) -> Self {
        Command::new(
            id,
            Method::SetHsv,
            vec![
                Value::from(hue_param(hue)),
                Value::from(saturation_param(saturation)),
            ],
        )
        .with_effect(effect)
    }

    pub fn set_name(id: u32, name: &str) -> Self {
        Command::new(id, Method::SetName, vec![Value::from(name)])
    }

    /// Saves the current state as the power on default.
    pub fn set_default(id: u32) -> Self {
        Command::new(id, Method::SetDefault, Vec::new())
    }

    pub fn start_flow(id: u32, flow: &Flow) -> Self {
        Command::new(id, Method::StartCf, flow.params().to_vec())
    }

    pub fn stop_flow(id: u32) -> Self {
        Command::new(id, Method::StopCf, Vec::new())
    }

    pub fn set_scene(id: u32, scene: &Scene) -> Self {
        Command::new(id, Method::SetScene, scene.params())
    }

    pub fn cron_add(id: u32, kind: CronType, minutes: u32) -> Self {
        Command::new(
            id,
            Method::CronAdd,
            vec![Value::from(kind.to_wire()), Value::from(minutes)],
        )
    }

    pub fn cron_get(id: u32, kind: CronType) -> Self {
        Command::new(id, Method::CronGet, vec![Value::from(kind.to_wire())])
    }

    pub fn cron_del(id: u32, kind: CronType) -> Self {
        Command::new(id, Method::CronDel, vec![Value::from(kind.to_wire())])
    }

    pub fn set_adjust(id: u32, action: AdjustAction, prop: AdjustProp) -> Self {
        Command::new(
            id,
            Method::SetAdjust,
            vec![Value::from(action.name()), Value::from(prop.name())],
        )
    }

    /// Changes brightness by `percentage` (-100 to 100) over `duration_ms`.
    pub fn adjust_bright(id: u32, percentage: i8, duration_ms: u32) -> Self {
        Command::adjust(id, Method::AdjustBright, percentage, duration_ms)
    }

    pub fn adjust_ct(id: u32, percentage: i8, duration_ms: u32) -> Self {
        Command::adjust(id, Method::AdjustCt, percentage, duration_ms)
    }

    pub fn adjust_color(id: u32, percentage: i8, duration_ms: u32) -> Self {
        Command::adjust(id, Method::AdjustColor, percentage, duration_ms)
    }

    fn adjust(id: u32, method: Method, percentage: i8, duration_ms: u32) -> Self {
        Command::new(
            id,
            method,
            vec![
                Value::from(percentage.clamp(-100, 100)),
                Value::from(duration_ms),
            ],
        )
    }

    /// Starts music mode: the device connects back to `host:port` and accepts
    /// commands on that socket without rate limiting.
    pub fn start_music(id: u32, host: &str, port: u16) -> Self {
        Command::new(
            id,
            Method::SetMusic,
            vec![Value::from(1), Value::from(host), Value::from(port)],
        )
    }

    pub fn stop_music(id: u32) -> Self {
        Command::new(id, Method::SetMusic, vec![Value::from(0)])
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}({} params)", self.method, self.id, self.params.len())
    }
}

pub fn pack_rgb(color: Srgb<u8>) -> u32 {
    (u32::from(color.red) << 16) | (u32::from(color.green) << 8) | u32::from(color.blue)
}

pub fn unpack_rgb(rgb: u32) -> Srgb<u8> {
    Srgb::new((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn brightness_param(brightness: u8) -> i64 {
    i64::from(brightness).clamp(BRIGHTNESS_MIN, BRIGHTNESS_MAX)
}

fn temperature_param(kelvin: u16) -> i64 {
    i64::from(kelvin).clamp(TEMP_MIN, TEMP_MAX)
}

fn hue_param(hue: u16) -> i64 {
    i64::from(hue).min(HUE_MAX)
}

fn saturation_param(saturation: u8) -> i64 {
    i64::from(saturation).min(SATURATION_MAX)
}
