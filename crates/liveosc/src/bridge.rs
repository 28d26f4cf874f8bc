//! Domain API over the OSC transport.
//!
//! Address vocabulary matches the DAW remote script verbatim. Track- and
//! device-scoped queries echo their integer arguments ahead of the payload;
//! the bridge validates and strips the echo, and treats any shape mismatch as
//! a protocol violation.
//!
//! Parameter indices: the remote script reserves two placeholder entries at
//! the head of every device's parameter list. The bridge shims them out on
//! every path - list replies drop the first two entries, raw-index queries
//! (value_string, set, listen) add 2, and push notifications subtract 2.
//! Callers only ever see effective parameter ids.

use std::sync::Arc;
use std::time::Duration;

use rosc::OscType;
use tracing::warn;

use crate::error::{OscError, Result};
use crate::transport::{OscTransport, Subscription};
use crate::types::{Device, MixerSnapshot, ParamKey, Parameter, ParameterUpdate, SetOutcome, Track};

pub const ADDR_TEST: &str = "/live/test";
pub const ADDR_NUM_TRACKS: &str = "/live/song/get/num_tracks";
pub const ADDR_TRACK_DATA: &str = "/live/song/get/track_data";
pub const ADDR_NUM_DEVICES: &str = "/live/track/get/num_devices";
pub const ADDR_DEVICES_NAME: &str = "/live/track/get/devices/name";
pub const ADDR_DEVICES_CLASS: &str = "/live/track/get/devices/class_name";
pub const ADDR_DEVICE_NAME: &str = "/live/device/get/name";
pub const ADDR_PARAMS_NAME: &str = "/live/device/get/parameters/name";
pub const ADDR_PARAMS_VALUE: &str = "/live/device/get/parameters/value";
pub const ADDR_PARAMS_MIN: &str = "/live/device/get/parameters/min";
pub const ADDR_PARAMS_MAX: &str = "/live/device/get/parameters/max";
pub const ADDR_VALUE_STRING: &str = "/live/device/get/parameter/value_string";
pub const ADDR_SET_VALUE: &str = "/live/device/set/parameter/value";
pub const ADDR_START_LISTEN: &str = "/live/device/start_listen/parameter/value";
pub const ADDR_STOP_LISTEN: &str = "/live/device/stop_listen/parameter/value";
pub const ADDR_PARAM_VALUE: &str = "/live/device/get/parameter/value";

/// Offset between effective parameter ids and the raw indices on the wire.
const PARAM_SHIM: u32 = 2;

/// Domain API over one shared transport. Stateless; cheap to clone via Arc.
pub struct LiveBridge {
    transport: Arc<OscTransport>,
    liveness_timeout: Duration,
    query_timeout: Duration,
}

impl LiveBridge {
    pub fn new(
        transport: Arc<OscTransport>,
        liveness_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            liveness_timeout,
            query_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<OscTransport> {
        &self.transport
    }

    /// Liveness probe: true iff the DAW answers within the liveness timeout.
    pub async fn is_live(&self) -> bool {
        self.transport
            .call(ADDR_TEST, vec![], self.liveness_timeout)
            .await
            .is_ok()
    }

    /// Enumerate tracks and devices (parameter lists are fetched separately).
    ///
    /// Progress milestones: 0 at start, 10 after the track count, 20 after
    /// track names, 50 once device enumeration completes.
    pub async fn enumerate_mixer(
        &self,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<MixerSnapshot> {
        progress(0);

        let reply = self
            .transport
            .call(ADDR_NUM_TRACKS, vec![], self.query_timeout)
            .await?;
        let num_tracks = args_int(ADDR_NUM_TRACKS, &reply, 0)? as u32;
        progress(10);

        let names = if num_tracks > 0 {
            let reply = self
                .transport
                .call(
                    ADDR_TRACK_DATA,
                    vec![
                        OscType::Int(0),
                        OscType::Int(num_tracks as i32),
                        OscType::String("track.name".to_string()),
                    ],
                    self.query_timeout,
                )
                .await?;
            if reply.len() != num_tracks as usize {
                return Err(OscError::Protocol {
                    addr: ADDR_TRACK_DATA.to_string(),
                    detail: format!("expected {} names, got {}", num_tracks, reply.len()),
                });
            }
            reply
                .iter()
                .enumerate()
                .map(|(i, v)| args_string_value(ADDR_TRACK_DATA, v, i))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        progress(20);

        let mut tracks = Vec::with_capacity(num_tracks as usize);
        for (track_id, name) in names.into_iter().enumerate() {
            let track_id = track_id as u32;
            let reply = self
                .transport
                .call(
                    ADDR_NUM_DEVICES,
                    vec![OscType::Int(track_id as i32)],
                    self.query_timeout,
                )
                .await?;
            let payload = strip_echo(ADDR_NUM_DEVICES, reply, &[track_id as i32])?;
            let num_devices = args_int(ADDR_NUM_DEVICES, &payload, 0)? as usize;

            let devices = if num_devices >= 1 {
                let names = self.device_list(ADDR_DEVICES_NAME, track_id).await?;
                let classes = self.device_list(ADDR_DEVICES_CLASS, track_id).await?;
                if names.len() != num_devices || classes.len() != num_devices {
                    return Err(OscError::Protocol {
                        addr: ADDR_DEVICES_NAME.to_string(),
                        detail: format!(
                            "track {}: expected {} devices, got {} names / {} classes",
                            track_id,
                            num_devices,
                            names.len(),
                            classes.len()
                        ),
                    });
                }
                names
                    .into_iter()
                    .zip(classes)
                    .enumerate()
                    .map(|(device_id, (name, class_name))| Device {
                        device_id: device_id as u32,
                        name,
                        class_name,
                        parameters: Vec::new(),
                    })
                    .collect()
            } else {
                Vec::new()
            };

            tracks.push(Track {
                track_id,
                name,
                devices,
            });
        }
        progress(50);

        Ok(MixerSnapshot { tracks })
    }

    async fn device_list(&self, addr: &'static str, track_id: u32) -> Result<Vec<String>> {
        let reply = self
            .transport
            .call(addr, vec![OscType::Int(track_id as i32)], self.query_timeout)
            .await?;
        let payload = strip_echo(addr, reply, &[track_id as i32])?;
        payload
            .iter()
            .enumerate()
            .map(|(i, v)| args_string_value(addr, v, i))
            .collect()
    }

    /// Live parameter list for one device, placeholders dropped.
    ///
    /// Names, values, mins, and maxes are four independent addresses, so the
    /// queries run concurrently without violating per-address serialization.
    pub async fn get_parameters(&self, track: u32, device: u32) -> Result<Vec<Parameter>> {
        let (names, values, mins, maxes) = tokio::try_join!(
            self.param_query(ADDR_PARAMS_NAME, track, device),
            self.param_query(ADDR_PARAMS_VALUE, track, device),
            self.param_query(ADDR_PARAMS_MIN, track, device),
            self.param_query(ADDR_PARAMS_MAX, track, device),
        )?;

        if names.len() != values.len() || names.len() != mins.len() || names.len() != maxes.len() {
            return Err(OscError::Protocol {
                addr: ADDR_PARAMS_NAME.to_string(),
                detail: format!(
                    "misaligned parameter lists: {} names, {} values, {} mins, {} maxes",
                    names.len(),
                    values.len(),
                    mins.len(),
                    maxes.len()
                ),
            });
        }

        let mut parameters = Vec::new();
        for (i, (((name, value), min), max)) in names
            .into_iter()
            .zip(values)
            .zip(mins)
            .zip(maxes)
            .enumerate()
            .skip(PARAM_SHIM as usize)
        {
            parameters.push(Parameter {
                param_id: i as u32 - PARAM_SHIM,
                name: args_string_value(ADDR_PARAMS_NAME, &name, i)?,
                value: as_float(ADDR_PARAMS_VALUE, &value, i)?,
                min: as_float(ADDR_PARAMS_MIN, &min, i)?,
                max: as_float(ADDR_PARAMS_MAX, &max, i)?,
                value_string: None,
            });
        }
        Ok(parameters)
    }

    async fn param_query(
        &self,
        addr: &'static str,
        track: u32,
        device: u32,
    ) -> Result<Vec<OscType>> {
        let reply = self
            .transport
            .call(
                addr,
                vec![OscType::Int(track as i32), OscType::Int(device as i32)],
                self.query_timeout,
            )
            .await?;
        strip_echo(addr, reply, &[track as i32, device as i32])
    }

    /// The DAW's textual rendering of one parameter value.
    pub async fn value_string(&self, key: ParamKey) -> Result<String> {
        let raw = (key.param + PARAM_SHIM) as i32;
        let reply = self
            .transport
            .call(
                ADDR_VALUE_STRING,
                vec![
                    OscType::Int(key.track as i32),
                    OscType::Int(key.device as i32),
                    OscType::Int(raw),
                ],
                self.query_timeout,
            )
            .await?;
        let payload = strip_echo(
            ADDR_VALUE_STRING,
            reply,
            &[key.track as i32, key.device as i32, raw],
        )?;
        args_string(ADDR_VALUE_STRING, &payload, 0)
    }

    /// Set one parameter, returning names and the before/after value strings.
    pub async fn set_parameter(&self, key: ParamKey, value: f32) -> Result<SetOutcome> {
        let from = self.value_string(key).await?;

        let reply = self
            .transport
            .call(
                ADDR_DEVICE_NAME,
                vec![OscType::Int(key.track as i32), OscType::Int(key.device as i32)],
                self.query_timeout,
            )
            .await?;
        let payload = strip_echo(
            ADDR_DEVICE_NAME,
            reply,
            &[key.track as i32, key.device as i32],
        )?;
        let device_name = args_string(ADDR_DEVICE_NAME, &payload, 0)?;

        let names = self
            .param_query(ADDR_PARAMS_NAME, key.track, key.device)
            .await?;
        let raw = (key.param + PARAM_SHIM) as usize;
        let parameter_name = names
            .get(raw)
            .ok_or_else(|| OscError::Protocol {
                addr: ADDR_PARAMS_NAME.to_string(),
                detail: format!("no parameter at raw index {}", raw),
            })
            .and_then(|v| args_string_value(ADDR_PARAMS_NAME, v, raw))?;

        self.transport
            .send(
                ADDR_SET_VALUE,
                vec![
                    OscType::Int(key.track as i32),
                    OscType::Int(key.device as i32),
                    OscType::Int(raw as i32),
                    OscType::Float(value),
                ],
            )
            .await?;

        let to = self.value_string(key).await?;

        Ok(SetOutcome {
            device_name,
            parameter_name,
            from,
            to,
        })
    }

    /// Enable value push notifications for one parameter. Fire-and-forget.
    pub async fn start_listen(&self, key: ParamKey) -> Result<()> {
        self.listen(ADDR_START_LISTEN, key).await
    }

    /// Disable value push notifications for one parameter. Fire-and-forget.
    pub async fn stop_listen(&self, key: ParamKey) -> Result<()> {
        self.listen(ADDR_STOP_LISTEN, key).await
    }

    async fn listen(&self, addr: &'static str, key: ParamKey) -> Result<()> {
        self.transport
            .send(
                addr,
                vec![
                    OscType::Int(key.track as i32),
                    OscType::Int(key.device as i32),
                    OscType::Int((key.param + PARAM_SHIM) as i32),
                ],
            )
            .await
    }

    /// Subscribe to the value push address. One subscription serves every
    /// listened parameter; the payload names the parameter.
    pub fn parameter_updates(&self) -> ParameterUpdates {
        ParameterUpdates {
            sub: self.transport.subscribe(ADDR_PARAM_VALUE),
        }
    }
}

/// Stream of parsed value push notifications.
pub struct ParameterUpdates {
    sub: Subscription,
}

impl ParameterUpdates {
    /// Next update, with the raw index mapped back to an effective id.
    /// Notifications for the placeholder indices are dropped.
    pub async fn recv(&mut self) -> Option<ParameterUpdate> {
        loop {
            let args = self.sub.recv().await?;
            match parse_update(&args) {
                Ok(Some(update)) => return Some(update),
                Ok(None) => continue,
                Err(e) => {
                    warn!("discarding malformed value notification: {}", e);
                    continue;
                }
            }
        }
    }
}

fn parse_update(args: &[OscType]) -> Result<Option<ParameterUpdate>> {
    let track = args_int(ADDR_PARAM_VALUE, args, 0)?;
    let device = args_int(ADDR_PARAM_VALUE, args, 1)?;
    let raw = args_int(ADDR_PARAM_VALUE, args, 2)?;
    let value = as_float(ADDR_PARAM_VALUE, args.get(3).unwrap_or(&OscType::Nil), 3)?;

    if track < 0 || device < 0 || raw < 0 {
        return Err(OscError::Protocol {
            addr: ADDR_PARAM_VALUE.to_string(),
            detail: "negative index".to_string(),
        });
    }
    if (raw as u32) < PARAM_SHIM {
        return Ok(None);
    }
    Ok(Some(ParameterUpdate {
        key: ParamKey::new(track as u32, device as u32, raw as u32 - PARAM_SHIM),
        value,
    }))
}

/// Validate and strip the echoed query arguments from a reply.
fn strip_echo(addr: &str, reply: Vec<OscType>, expect: &[i32]) -> Result<Vec<OscType>> {
    if reply.len() < expect.len() {
        return Err(OscError::Protocol {
            addr: addr.to_string(),
            detail: format!("reply shorter than its echo ({} args)", reply.len()),
        });
    }
    for (i, want) in expect.iter().enumerate() {
        match &reply[i] {
            OscType::Int(got) if got == want => {}
            other => {
                return Err(OscError::Protocol {
                    addr: addr.to_string(),
                    detail: format!("echo mismatch at {}: expected {}, got {:?}", i, want, other),
                });
            }
        }
    }
    Ok(reply.into_iter().skip(expect.len()).collect())
}

fn args_int(addr: &str, args: &[OscType], index: usize) -> Result<i32> {
    match args.get(index) {
        Some(OscType::Int(v)) => Ok(*v),
        other => Err(OscError::Protocol {
            addr: addr.to_string(),
            detail: format!("expected int at {}, got {:?}", index, other),
        }),
    }
}

fn as_float(addr: &str, value: &OscType, index: usize) -> Result<f32> {
    match value {
        OscType::Float(v) => Ok(*v),
        OscType::Int(v) => Ok(*v as f32),
        other => Err(OscError::Protocol {
            addr: addr.to_string(),
            detail: format!("expected float at {}, got {:?}", index, other),
        }),
    }
}

fn args_string(addr: &str, args: &[OscType], index: usize) -> Result<String> {
    args_string_value(addr, args.get(index).unwrap_or(&OscType::Nil), index)
}

fn args_string_value(addr: &str, value: &OscType, index: usize) -> Result<String> {
    match value {
        OscType::String(s) => Ok(s.clone()),
        other => Err(OscError::Protocol {
            addr: addr.to_string(),
            detail: format!("expected string at {}, got {:?}", index, other),
        }),
    }
}
