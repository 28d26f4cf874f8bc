//! The agent's tool catalog: three tools, strict input schemas.
//!
//! `enumerate_mixer` is served from the session's mirror; the other two go
//! through the bridge to the DAW. Arguments are validated against the mirror
//! before any OSC goes out, so a hallucinated index or an out-of-range value
//! becomes a tool error instead of a silent misfire.

use std::sync::Arc;

use liveosc::{LiveBridge, ParamKey};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use super::claude::ToolSpec;
use crate::sessions::SessionState;

pub const TOOL_ENUMERATE_MIXER: &str = "enumerate_mixer";
pub const TOOL_GET_DEVICE_PARAMETERS: &str = "get_device_parameters";
pub const TOOL_SET_DEVICE_PARAMETER: &str = "set_device_parameter";

/// Only the set tool mutates the DAW and therefore needs approval.
pub fn is_mutating(name: &str) -> bool {
    name == TOOL_SET_DEVICE_PARAMETER
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EnumerateMixerArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetDeviceParametersArgs {
    /// Track index as reported by enumerate_mixer.
    pub track_id: u32,
    /// Device index within the track.
    pub device_id: u32,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetDeviceParameterArgs {
    /// Track index as reported by enumerate_mixer.
    pub track_id: u32,
    /// Device index within the track.
    pub device_id: u32,
    /// Parameter index as reported by get_device_parameters.
    pub param_id: u32,
    /// New value in the parameter's native units, within [min, max].
    pub value: f64,
}

/// The tool declarations sent with every completion request.
pub fn catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: TOOL_ENUMERATE_MIXER.to_string(),
            description: "List the tracks and devices of the attached DAW session.".to_string(),
            input_schema: schemars::schema_for!(EnumerateMixerArgs).to_value(),
        },
        ToolSpec {
            name: TOOL_GET_DEVICE_PARAMETERS.to_string(),
            description:
                "List the parameters of one device with current value, min, and max.".to_string(),
            input_schema: schemars::schema_for!(GetDeviceParametersArgs).to_value(),
        },
        ToolSpec {
            name: TOOL_SET_DEVICE_PARAMETER.to_string(),
            description:
                "Set one device parameter to a new value. Requires user approval.".to_string(),
            input_schema: schemars::schema_for!(SetDeviceParameterArgs).to_value(),
        },
    ]
}

/// Executes validated tool calls for one session.
pub struct ToolExecutor {
    bridge: Arc<LiveBridge>,
    session: Arc<SessionState>,
}

impl ToolExecutor {
    pub fn new(bridge: Arc<LiveBridge>, session: Arc<SessionState>) -> Self {
        Self { bridge, session }
    }

    /// Run one tool call. `Ok` carries the JSON-encoded result, `Err` the
    /// error text that goes back to the model as an error tool-result.
    pub async fn execute(&self, name: &str, arguments: &Value) -> Result<String, String> {
        match name {
            TOOL_ENUMERATE_MIXER => self.enumerate_mixer(),
            TOOL_GET_DEVICE_PARAMETERS => self.get_device_parameters(arguments).await,
            TOOL_SET_DEVICE_PARAMETER => self.set_device_parameter(arguments).await,
            other => Err(format!("unknown tool: {}", other)),
        }
    }

    fn enumerate_mixer(&self) -> Result<String, String> {
        let snapshot = self
            .session
            .mirror
            .load()
            .ok_or_else(|| "mixer is not indexed yet".to_string())?;

        let tracks: Vec<Value> = snapshot
            .tracks
            .iter()
            .map(|track| {
                json!({
                    "track_id": track.track_id,
                    "name": track.name,
                    "devices": track.devices.iter().map(|device| json!({
                        "device_id": device.device_id,
                        "name": device.name,
                        "class_name": device.class_name,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();

        encode(&json!({ "tracks": tracks }))
    }

    async fn get_device_parameters(&self, arguments: &Value) -> Result<String, String> {
        let args: GetDeviceParametersArgs = decode(arguments)?;

        let snapshot = self
            .session
            .mirror
            .load()
            .ok_or_else(|| "mixer is not indexed yet".to_string())?;
        if snapshot.device(args.track_id, args.device_id).is_none() {
            return Err(format!(
                "unknown device: track {} device {}",
                args.track_id, args.device_id
            ));
        }

        let parameters = self
            .bridge
            .get_parameters(args.track_id, args.device_id)
            .await
            .map_err(|e| e.to_string())?;

        encode(&serde_json::to_value(&parameters).map_err(|e| e.to_string())?)
    }

    async fn set_device_parameter(&self, arguments: &Value) -> Result<String, String> {
        let args: SetDeviceParameterArgs = decode(arguments)?;
        let key = ParamKey::new(args.track_id, args.device_id, args.param_id);

        let known = self
            .session
            .mirror
            .parameter(key)
            .ok_or_else(|| format!("unknown parameter: {}", key))?;
        if args.value < known.min as f64 || args.value > known.max as f64 {
            return Err(format!(
                "value {} out of range [{}, {}] for {}",
                args.value, known.min, known.max, known.name
            ));
        }

        let outcome = self
            .bridge
            .set_parameter(key, args.value as f32)
            .await
            .map_err(|e| e.to_string())?;

        encode(&serde_json::to_value(&outcome).map_err(|e| e.to_string())?)
    }
}

fn decode<'a, T: Deserialize<'a>>(arguments: &'a Value) -> Result<T, String> {
    T::deserialize(arguments).map_err(|e| format!("invalid arguments: {}", e))
}

fn encode(value: &Value) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| e.to_string())
}
