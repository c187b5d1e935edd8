pub mod bridge;
pub mod config;
pub mod identity;
pub mod pending;
pub mod telemetry;
pub mod translate;

pub use bridge::{Bridge, BridgeEvent, ConnectionState};
pub use config::Config;
pub use translate::{DisplayRecord, RecordBody, SenderKind};
