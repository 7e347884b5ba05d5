//! Robot control command validation
//!
//! Commands arrive on `robot/control/<command>`, plus the operator panel's
//! start button on `robot/command/start`. The command kind comes from the
//! last topic segment, the payload is decoded into a typed command and
//! every commanded value is clamped into its configured limit. Out-of-range
//! values are corrected and reported as warnings rather than rejected; only
//! unknown commands and structurally unusable payloads are rejected.

use super::decode::{from_value, json_or_empty, json_or_text, DecodeError, NumericValue};
use super::emergency::{detect_emergency, EmergencySignal};
use super::result::Validation;
use crate::config::{LimitsSection, Range, JOINT_COUNT};
use crate::protocol::last_segment;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Speed and acceleration are percentages
const PERCENT: Range = Range::new(0.0, 100.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    MoveJoint,
    MoveLinear,
    Stop,
    EmergencyStop,
    Home,
    SetSpeed,
    Servo,
    Jog,
    /// Operator start button; carries no motion
    Start,
}

impl CommandKind {
    /// Parse a topic suffix; hyphens and underscores are interchangeable
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        let normalized = suffix.trim().to_lowercase().replace('-', "_");
        let kind = match normalized.as_str() {
            "move_joint" | "movej" | "joint_move" => CommandKind::MoveJoint,
            "move_linear" | "movel" | "linear_move" => CommandKind::MoveLinear,
            "stop" => CommandKind::Stop,
            "emergency_stop" | "estop" | "e_stop" => CommandKind::EmergencyStop,
            "home" => CommandKind::Home,
            "set_speed" | "speed" => CommandKind::SetSpeed,
            "servo" | "servoj" => CommandKind::Servo,
            "jog" => CommandKind::Jog,
            "start" => CommandKind::Start,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::MoveJoint => "move_joint",
            CommandKind::MoveLinear => "move_linear",
            CommandKind::Stop => "stop",
            CommandKind::EmergencyStop => "emergency_stop",
            CommandKind::Home => "home",
            CommandKind::SetSpeed => "set_speed",
            CommandKind::Servo => "servo",
            CommandKind::Jog => "jog",
            CommandKind::Start => "start",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Normal,
    Elevated,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    Immediate,
    Queued,
}

/// Outcome of validating one control message
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub command: Option<CommandKind>,
    pub validation: Validation,
    pub safety_level: SafetyLevel,
    pub execution: Execution,
    /// Validated parameters with every clamped value substituted
    pub parameters: Value,
    pub emergency: Option<EmergencySignal>,
}

impl CommandOutcome {
    /// Normalized form carried in the classified result
    pub fn to_value(&self) -> Value {
        json!({
            "command": self.command.map(|c| c.as_str()),
            "parameters": self.parameters,
            "safety_level": self.safety_level,
            "execution": self.execution,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum JointPayload {
    Bare(Vec<NumericValue>),
    Fields {
        #[serde(alias = "joints", alias = "angles")]
        positions: Vec<NumericValue>,
        speed: Option<NumericValue>,
        acceleration: Option<NumericValue>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LinearPayload {
    Bare(Vec<NumericValue>),
    Split {
        position: Vec<NumericValue>,
        #[serde(alias = "orientation")]
        rotation: Vec<NumericValue>,
        speed: Option<NumericValue>,
        acceleration: Option<NumericValue>,
    },
    Named {
        x: NumericValue,
        y: NumericValue,
        z: NumericValue,
        rx: NumericValue,
        ry: NumericValue,
        rz: NumericValue,
        speed: Option<NumericValue>,
        acceleration: Option<NumericValue>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MotionFields {
    speed: Option<NumericValue>,
    acceleration: Option<NumericValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SpeedPayload {
    Bare(NumericValue),
    Fields {
        #[serde(alias = "value", alias = "percent")]
        speed: NumericValue,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct JogPayload {
    #[serde(alias = "joint")]
    axis: i64,
    direction: Option<NumericValue>,
    speed: Option<NumericValue>,
}

/// Validates robot control commands against configured limits
#[derive(Debug, Clone)]
pub struct CommandValidator {
    limits: LimitsSection,
}

impl CommandValidator {
    pub fn new(limits: LimitsSection) -> Self {
        Self { limits }
    }

    /// Validate the command published on `topic`; never fails
    pub fn validate(&self, topic: &str, payload: &[u8]) -> CommandOutcome {
        let text = String::from_utf8_lossy(payload);
        let emergency = detect_emergency(topic, &text);

        let Some(kind) = CommandKind::from_suffix(last_segment(topic)) else {
            return CommandOutcome {
                command: None,
                validation: Validation::rejected("unknown command type"),
                safety_level: if emergency.is_some() {
                    SafetyLevel::Critical
                } else {
                    SafetyLevel::Normal
                },
                execution: Execution::Queued,
                parameters: Value::Null,
                emergency,
            };
        };

        let mut warnings = Vec::new();
        let checked = match kind {
            CommandKind::Stop | CommandKind::EmergencyStop => {
                // A stop is never refused, whatever its payload looks like
                return CommandOutcome {
                    command: Some(kind),
                    validation: Validation::accepted(),
                    safety_level: SafetyLevel::Critical,
                    execution: Execution::Immediate,
                    parameters: json_or_text(payload).unwrap_or(Value::Null),
                    emergency,
                };
            }
            // Button presses carry whatever the panel sends, often nothing
            CommandKind::Start => match json_or_text(payload) {
                Ok(value) => Ok(value),
                Err(DecodeError::Empty) => Ok(Value::Null),
                Err(e) => Err(e.to_string()),
            },
            CommandKind::MoveJoint | CommandKind::Servo => self.joint_move(payload, &mut warnings),
            CommandKind::MoveLinear => self.linear_move(payload, &mut warnings),
            CommandKind::Home => self.home(payload, &mut warnings),
            CommandKind::SetSpeed => self.set_speed(payload, &mut warnings),
            CommandKind::Jog => self.jog(payload, &mut warnings),
        };

        match checked {
            Ok(parameters) => {
                let safety_level = if emergency.is_some() {
                    SafetyLevel::Critical
                } else if warnings.is_empty() {
                    SafetyLevel::Normal
                } else {
                    SafetyLevel::Elevated
                };
                CommandOutcome {
                    command: Some(kind),
                    validation: Validation::accepted_with(warnings),
                    safety_level,
                    execution: if emergency.is_some() {
                        Execution::Immediate
                    } else {
                        Execution::Queued
                    },
                    parameters,
                    emergency,
                }
            }
            Err(reason) => CommandOutcome {
                command: Some(kind),
                validation: Validation::rejected(reason),
                safety_level: if emergency.is_some() {
                    SafetyLevel::Critical
                } else {
                    SafetyLevel::Normal
                },
                execution: Execution::Queued,
                parameters: Value::Null,
                emergency,
            },
        }
    }

    /// Clamp joint positions; each correction adds a warning
    pub fn clamp_joints(&self, positions: &[f64], warnings: &mut Vec<String>) -> Vec<f64> {
        positions
            .iter()
            .zip(self.limits.joints.iter())
            .enumerate()
            .map(|(index, (&position, range))| {
                let clamped = range.clamp(position);
                if clamped != position {
                    warnings.push(format!(
                        "joint {} position {} clamped to {}",
                        index + 1,
                        position,
                        clamped
                    ));
                }
                clamped
            })
            .collect()
    }

    fn joint_move(&self, payload: &[u8], warnings: &mut Vec<String>) -> Result<Value, String> {
        let (raw, speed, acceleration) = match decode::<JointPayload>(payload)? {
            JointPayload::Bare(positions) => (positions, None, None),
            JointPayload::Fields {
                positions,
                speed,
                acceleration,
            } => (positions, speed, acceleration),
        };
        if raw.len() != JOINT_COUNT {
            return Err(format!(
                "expected {} joint positions, got {}",
                JOINT_COUNT,
                raw.len()
            ));
        }
        let positions = numbers(&raw)?;
        let positions = self.clamp_joints(&positions, warnings);
        let (speed, acceleration) = self.motion_profile(speed, acceleration, warnings)?;
        Ok(json!({
            "positions": positions,
            "speed": speed,
            "acceleration": acceleration,
        }))
    }

    fn linear_move(&self, payload: &[u8], warnings: &mut Vec<String>) -> Result<Value, String> {
        let (position, rotation, speed, acceleration) = match decode::<LinearPayload>(payload)? {
            LinearPayload::Bare(pose) => {
                if pose.len() != 6 {
                    return Err(format!("expected 6 pose values, got {}", pose.len()));
                }
                let (position, rotation) = pose.split_at(3);
                (position.to_vec(), rotation.to_vec(), None, None)
            }
            LinearPayload::Split {
                position,
                rotation,
                speed,
                acceleration,
            } => (position, rotation, speed, acceleration),
            LinearPayload::Named {
                x,
                y,
                z,
                rx,
                ry,
                rz,
                speed,
                acceleration,
            } => (vec![x, y, z], vec![rx, ry, rz], speed, acceleration),
        };
        if position.len() != 3 || rotation.len() != 3 {
            return Err("linear move needs 3 position and 3 rotation components".to_string());
        }

        let position = numbers(&position)?;
        let rotation = numbers(&rotation)?;
        let workspace = self.limits.workspace;
        let clamped: Vec<f64> = ["x", "y", "z"]
            .iter()
            .zip([workspace.x, workspace.y, workspace.z])
            .zip(position.iter())
            .map(|((axis, range), &value)| {
                let clamped = range.clamp(value);
                if clamped != value {
                    warnings.push(format!("{axis} position {value} clamped to {clamped}"));
                }
                clamped
            })
            .collect();
        let (speed, acceleration) = self.motion_profile(speed, acceleration, warnings)?;
        Ok(json!({
            "position": clamped,
            "rotation": rotation,
            "speed": speed,
            "acceleration": acceleration,
        }))
    }

    fn home(&self, payload: &[u8], warnings: &mut Vec<String>) -> Result<Value, String> {
        let fields = match json_or_empty(payload).map_err(|e| e.to_string())? {
            Value::Object(map) => from_value::<MotionFields>(Value::Object(map))
                .map_err(|e| e.to_string())?,
            _ => MotionFields::default(),
        };
        let (speed, acceleration) =
            self.motion_profile(fields.speed, fields.acceleration, warnings)?;
        Ok(json!({ "speed": speed, "acceleration": acceleration }))
    }

    fn set_speed(&self, payload: &[u8], warnings: &mut Vec<String>) -> Result<Value, String> {
        let value = json_or_text(payload).map_err(|e| e.to_string())?;
        let raw = match from_value::<SpeedPayload>(value).map_err(|e| e.to_string())? {
            SpeedPayload::Bare(n) => n,
            SpeedPayload::Fields { speed } => speed,
        };
        let speed = clamp_percent("speed", raw.to_f64().map_err(|e| e.to_string())?, warnings);
        Ok(json!({ "speed": speed }))
    }

    fn jog(&self, payload: &[u8], warnings: &mut Vec<String>) -> Result<Value, String> {
        let jog = decode::<JogPayload>(payload)?;
        if jog.axis < 0 || jog.axis >= JOINT_COUNT as i64 {
            return Err(format!(
                "jog axis {} outside 0..{}",
                jog.axis,
                JOINT_COUNT - 1
            ));
        }
        let direction = match jog.direction {
            Some(d) => {
                if d.to_f64().map_err(|e| e.to_string())? < 0.0 {
                    -1
                } else {
                    1
                }
            }
            None => 1,
        };
        let (speed, _) = self.motion_profile(jog.speed, None, warnings)?;
        Ok(json!({ "axis": jog.axis, "direction": direction, "speed": speed }))
    }

    /// Resolve speed and acceleration, substituting defaults when absent
    fn motion_profile(
        &self,
        speed: Option<NumericValue>,
        acceleration: Option<NumericValue>,
        warnings: &mut Vec<String>,
    ) -> Result<(f64, f64), String> {
        let speed = match speed {
            Some(v) => clamp_percent("speed", v.to_f64().map_err(|e| e.to_string())?, warnings),
            None => self.limits.default_speed,
        };
        let acceleration = match acceleration {
            Some(v) => clamp_percent(
                "acceleration",
                v.to_f64().map_err(|e| e.to_string())?,
                warnings,
            ),
            None => self.limits.default_acceleration,
        };
        Ok((speed, acceleration))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, String> {
    let value = json_or_empty(payload).map_err(|e| e.to_string())?;
    from_value(value).map_err(|e: DecodeError| e.to_string())
}

fn numbers(values: &[NumericValue]) -> Result<Vec<f64>, String> {
    values
        .iter()
        .map(|v| v.to_f64().map_err(|e| e.to_string()))
        .collect()
}

fn clamp_percent(name: &str, value: f64, warnings: &mut Vec<String>) -> f64 {
    let clamped = PERCENT.clamp(value);
    if clamped != value {
        warnings.push(format!("{name} {value} clamped to {clamped}"));
    }
    clamped
}
