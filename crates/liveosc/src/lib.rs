//! liveosc - OSC transport and DAW bridge for Deskhand
//!
//! The DAW's remote script speaks Open Sound Control over a UDP socket pair
//! and answers queries asynchronously on the same address they were sent to.
//! This crate turns that into something usable:
//!
//! - [`OscTransport`]: one socket pair, address-keyed dispatch of inbound
//!   messages, and an awaited request/response `call` with per-address
//!   serialization (concurrent calls to the same address are indistinguishable
//!   at the reply, so they queue).
//! - [`LiveBridge`]: the domain API - liveness probe, mixer enumeration,
//!   parameter listing, parameter sets, and value-listen subscriptions.
//! - [`testing::FakeLive`]: an in-process scriptable responder so the whole
//!   stack can be exercised without a DAW.

pub mod bridge;
pub mod error;
pub mod testing;
pub mod transport;
pub mod types;

pub use rosc;

pub use bridge::{LiveBridge, ParameterUpdates};
pub use error::OscError;
pub use transport::{OscTransport, Subscription};
pub use types::{
    Device, MixerSnapshot, ParamKey, Parameter, ParameterUpdate, SetOutcome, Track,
};
