//! Test support: an in-process fake of the DAW's remote script.
//!
//! `FakeLive` binds its own UDP socket and answers the bridge's address
//! vocabulary from a scripted mixer fixture. It reproduces the remote
//! script's quirks on purpose: replies echo the query indices, every device
//! parameter list carries two placeholder entries at the head, and each
//! `start_listen` emits one synthetic value notification.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rosc::{OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bridge;

/// One scripted parameter (a *real* one; placeholders are added internally).
#[derive(Debug, Clone)]
pub struct FakeParam {
    pub name: String,
    pub value: f32,
    pub min: f32,
    pub max: f32,
}

impl FakeParam {
    pub fn new(name: &str, value: f32, min: f32, max: f32) -> Self {
        Self {
            name: name.to_string(),
            value,
            min,
            max,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub name: String,
    pub class_name: String,
    /// Raw parameter list as the remote script reports it, placeholders first.
    pub raw_params: Vec<FakeParam>,
}

impl FakeDevice {
    pub fn new(name: &str, class_name: &str, params: Vec<FakeParam>) -> Self {
        let mut raw_params = vec![
            FakeParam::new("Device On", 1.0, 0.0, 1.0),
            FakeParam::new("Reserved", 0.0, 0.0, 1.0),
        ];
        raw_params.extend(params);
        Self {
            name: name.to_string(),
            class_name: class_name.to_string(),
            raw_params,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeTrack {
    pub name: String,
    pub devices: Vec<FakeDevice>,
}

impl FakeTrack {
    pub fn new(name: &str, devices: Vec<FakeDevice>) -> Self {
        Self {
            name: name.to_string(),
            devices,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    tracks: Vec<FakeTrack>,
    /// Addresses that swallow queries instead of replying (for timeout tests).
    muted: HashSet<String>,
    /// (track, device, raw) triples with an active value listen.
    listening: HashSet<(i32, i32, i32)>,
    /// Every set received, in order.
    sets: Vec<(i32, i32, i32, f32)>,
    /// Last peer that sent us anything; replies and pushes go there.
    reply_to: Option<SocketAddr>,
}

/// In-process fake DAW. Dropping it stops the responder task.
pub struct FakeLive {
    state: Arc<Mutex<FakeState>>,
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl FakeLive {
    /// Bind an ephemeral local port and start answering.
    pub async fn spawn(tracks: Vec<FakeTrack>) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let addr = socket.local_addr()?;
        let state = Arc::new(Mutex::new(FakeState {
            tracks,
            ..FakeState::default()
        }));

        let loop_socket = socket.clone();
        let loop_state = state.clone();
        let task = tokio::spawn(async move {
            respond_loop(loop_socket, loop_state).await;
        });

        Ok(Self {
            state,
            socket,
            addr,
            task,
        })
    }

    /// The address the transport should treat as the DAW endpoint.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Swallow all queries to `addr` from now on.
    pub fn mute(&self, addr: &str) {
        self.state.lock().unwrap().muted.insert(addr.to_string());
    }

    /// All sets received so far as (track, device, raw, value).
    pub fn sets(&self) -> Vec<(i32, i32, i32, f32)> {
        self.state.lock().unwrap().sets.clone()
    }

    /// Whether a value listen is active for the given raw triple.
    pub fn is_listening(&self, track: i32, device: i32, raw: i32) -> bool {
        self.state
            .lock()
            .unwrap()
            .listening
            .contains(&(track, device, raw))
    }

    /// Count of active value listens.
    pub fn listen_count(&self) -> usize {
        self.state.lock().unwrap().listening.len()
    }

    /// Push a value notification to the last-seen peer, as the DAW does when
    /// a listened parameter moves.
    pub async fn notify(&self, track: i32, device: i32, raw: i32, value: f32) {
        let reply_to = self.state.lock().unwrap().reply_to;
        if let Some(peer) = reply_to {
            send_message(
                &self.socket,
                peer,
                bridge::ADDR_PARAM_VALUE,
                vec![
                    OscType::Int(track),
                    OscType::Int(device),
                    OscType::Int(raw),
                    OscType::Float(value),
                ],
            )
            .await;
        }
    }
}

impl Drop for FakeLive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond_loop(socket: Arc<UdpSocket>, state: Arc<Mutex<FakeState>>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => continue,
        };
        let packet = match rosc::decoder::decode_udp(&buf[..len]) {
            Ok((_, packet)) => packet,
            Err(_) => continue,
        };
        let msg = match packet {
            OscPacket::Message(msg) => msg,
            OscPacket::Bundle(_) => continue,
        };

        let replies = {
            let mut state = state.lock().unwrap();
            state.reply_to = Some(from);
            if state.muted.contains(&msg.addr) {
                continue;
            }
            answer(&mut state, &msg)
        };

        for (addr, args) in replies {
            send_message(&socket, from, &addr, args).await;
        }
    }
}

async fn send_message(socket: &UdpSocket, to: SocketAddr, addr: &str, args: Vec<OscType>) {
    let packet = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    });
    if let Ok(buf) = rosc::encoder::encode(&packet) {
        let _ = socket.send_to(&buf, to).await;
    }
}

fn int_arg(msg: &OscMessage, index: usize) -> Option<i32> {
    match msg.args.get(index) {
        Some(OscType::Int(v)) => Some(*v),
        _ => None,
    }
}

type Reply = (String, Vec<OscType>);

fn answer(state: &mut FakeState, msg: &OscMessage) -> Vec<Reply> {
    let addr = msg.addr.as_str();
    debug!("fake DAW got {} {:?}", addr, msg.args);

    match addr {
        bridge::ADDR_TEST => vec![(addr.to_string(), vec![OscType::String("ok".to_string())])],

        bridge::ADDR_NUM_TRACKS => vec![(
            addr.to_string(),
            vec![OscType::Int(state.tracks.len() as i32)],
        )],

        bridge::ADDR_TRACK_DATA => {
            // [start, count, property...]; only track.name is scripted.
            let start = int_arg(msg, 0).unwrap_or(0) as usize;
            let count = int_arg(msg, 1).unwrap_or(0) as usize;
            let names = state
                .tracks
                .iter()
                .skip(start)
                .take(count)
                .map(|t| OscType::String(t.name.clone()))
                .collect();
            vec![(addr.to_string(), names)]
        }

        bridge::ADDR_NUM_DEVICES => {
            let track = int_arg(msg, 0).unwrap_or(-1);
            let count = state
                .tracks
                .get(track as usize)
                .map(|t| t.devices.len())
                .unwrap_or(0);
            vec![(
                addr.to_string(),
                vec![OscType::Int(track), OscType::Int(count as i32)],
            )]
        }

        bridge::ADDR_DEVICES_NAME | bridge::ADDR_DEVICES_CLASS => {
            let track = int_arg(msg, 0).unwrap_or(-1);
            let mut args = vec![OscType::Int(track)];
            if let Some(t) = state.tracks.get(track as usize) {
                for d in &t.devices {
                    let s = if addr == bridge::ADDR_DEVICES_NAME {
                        d.name.clone()
                    } else {
                        d.class_name.clone()
                    };
                    args.push(OscType::String(s));
                }
            }
            vec![(addr.to_string(), args)]
        }

        bridge::ADDR_DEVICE_NAME => {
            let track = int_arg(msg, 0).unwrap_or(-1);
            let device = int_arg(msg, 1).unwrap_or(-1);
            let name = device_at(state, track, device)
                .map(|d| d.name.clone())
                .unwrap_or_default();
            vec![(
                addr.to_string(),
                vec![
                    OscType::Int(track),
                    OscType::Int(device),
                    OscType::String(name),
                ],
            )]
        }

        bridge::ADDR_PARAMS_NAME
        | bridge::ADDR_PARAMS_VALUE
        | bridge::ADDR_PARAMS_MIN
        | bridge::ADDR_PARAMS_MAX => {
            let track = int_arg(msg, 0).unwrap_or(-1);
            let device = int_arg(msg, 1).unwrap_or(-1);
            let mut args = vec![OscType::Int(track), OscType::Int(device)];
            if let Some(d) = device_at(state, track, device) {
                for p in &d.raw_params {
                    args.push(match addr {
                        bridge::ADDR_PARAMS_NAME => OscType::String(p.name.clone()),
                        bridge::ADDR_PARAMS_VALUE => OscType::Float(p.value),
                        bridge::ADDR_PARAMS_MIN => OscType::Float(p.min),
                        _ => OscType::Float(p.max),
                    });
                }
            }
            vec![(addr.to_string(), args)]
        }

        bridge::ADDR_VALUE_STRING => {
            let track = int_arg(msg, 0).unwrap_or(-1);
            let device = int_arg(msg, 1).unwrap_or(-1);
            let raw = int_arg(msg, 2).unwrap_or(-1);
            let rendered = param_at(state, track, device, raw)
                .map(|p| format!("{:.2}", p.value))
                .unwrap_or_default();
            vec![(
                addr.to_string(),
                vec![
                    OscType::Int(track),
                    OscType::Int(device),
                    OscType::Int(raw),
                    OscType::String(rendered),
                ],
            )]
        }

        bridge::ADDR_SET_VALUE => {
            let track = int_arg(msg, 0).unwrap_or(-1);
            let device = int_arg(msg, 1).unwrap_or(-1);
            let raw = int_arg(msg, 2).unwrap_or(-1);
            let value = match msg.args.get(3) {
                Some(OscType::Float(v)) => *v,
                _ => return Vec::new(),
            };
            if let Some(p) = param_at_mut(state, track, device, raw) {
                p.value = value;
            }
            state.sets.push((track, device, raw, value));
            Vec::new()
        }

        bridge::ADDR_START_LISTEN => {
            let track = int_arg(msg, 0).unwrap_or(-1);
            let device = int_arg(msg, 1).unwrap_or(-1);
            let raw = int_arg(msg, 2).unwrap_or(-1);
            state.listening.insert((track, device, raw));
            // The remote script pushes the current value once per subscribe.
            let current = param_at(state, track, device, raw)
                .map(|p| p.value)
                .unwrap_or(0.0);
            vec![(
                bridge::ADDR_PARAM_VALUE.to_string(),
                vec![
                    OscType::Int(track),
                    OscType::Int(device),
                    OscType::Int(raw),
                    OscType::Float(current),
                ],
            )]
        }

        bridge::ADDR_STOP_LISTEN => {
            let track = int_arg(msg, 0).unwrap_or(-1);
            let device = int_arg(msg, 1).unwrap_or(-1);
            let raw = int_arg(msg, 2).unwrap_or(-1);
            state.listening.remove(&(track, device, raw));
            Vec::new()
        }

        _ => vec![(
            crate::transport::ERROR_ADDR.to_string(),
            vec![OscType::String(format!("unknown address {}", addr))],
        )],
    }
}

fn device_at(state: &FakeState, track: i32, device: i32) -> Option<&FakeDevice> {
    state.tracks.get(track as usize)?.devices.get(device as usize)
}

fn param_at(state: &FakeState, track: i32, device: i32, raw: i32) -> Option<&FakeParam> {
    device_at(state, track, device)?.raw_params.get(raw as usize)
}

fn param_at_mut(
    state: &mut FakeState,
    track: i32,
    device: i32,
    raw: i32,
) -> Option<&mut FakeParam> {
    state
        .tracks
        .get_mut(track as usize)?
        .devices
        .get_mut(device as usize)?
        .raw_params
        .get_mut(raw as usize)
}
