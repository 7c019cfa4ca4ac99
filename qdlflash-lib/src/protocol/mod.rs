//! Device-side flashing protocol: frame codec and the command engine.

pub mod codec;
pub mod engine;

pub use codec::{DeviceIdentity, HelloInfo, Opcode, Status};
pub use engine::{EngineConfig, Interlock, ProtocolEngine};
