//! Shared wire primitives for the skiff chat bridge.
//!
//! The backend speaks an OneBot-v11-flavored JSON protocol over a single
//! WebSocket. This crate keeps the frame and segment shapes in a dedicated
//! crate so the bridge, test harnesses and any future server-side tooling
//! agree on the wire format without pulling in runtime code.

use serde::Serialize;
use thiserror::Error;

pub mod frames;
pub mod segment;

pub use frames::{
    ApiRequest, ApiResponse, DeliverAction, HeartbeatEvent, HeartbeatStatus, InboundContent,
    InboundFrame, LifecycleEvent, MessageEvent, PrivateMessageEvent, WireSender,
};
pub use segment::{ForwardNode, Segment};

/// Application identity announced in the lifecycle handshake and echoed by
/// `get_version_info`.
pub const APP_NAME: &str = "skiff";
pub const APP_VERSION: &str = "0.1.0";
pub const PROTOCOL_VERSION: &str = "v11";

/// First locally issued message id; ids grow monotonically from here.
pub const MESSAGE_ID_BASE: i64 = 100_000;

/// Heartbeat cadence advertised on the wire, in milliseconds.
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub protocol_version: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            app_name: APP_NAME,
            app_version: APP_VERSION,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
}
