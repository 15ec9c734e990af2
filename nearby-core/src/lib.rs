//! Nearby peer-to-peer coordinator core.
//! Host-driven: no I/O; host passes commands, frames and ticks and receives actions.

pub mod action;
pub mod config;
pub mod connection;
pub mod core;
pub mod discovery;
pub mod error;
pub mod event;
pub mod identity;
pub mod payload;
pub mod protocol;
pub mod strategy;
pub mod wire;

pub use action::Action;
pub use config::CoreConfig;
pub use connection::{ConnectionSnapshot, ConnectionState};
pub use core::NearbyCore;
pub use discovery::EndpointSnapshot;
pub use error::{NearbyError, Result};
pub use event::{ConnectionStatus, Event};
pub use identity::{AuthToken, EndpointId, PublicKey};
pub use payload::{Direction, PayloadId, PayloadSnapshot, PayloadStatus};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use strategy::{Role, Strategy};
pub use wire::{decode_datagram, decode_frame, encode_frame, WireError, MAX_FRAME_LEN};
