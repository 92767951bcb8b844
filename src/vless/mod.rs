pub mod protocol;
pub mod service;

pub use protocol::Request;
pub use service::{Accept, PoolGuard, Service, VlessPacketConn, VlessStream};

pub const VERSION: u8 = 0;

pub const COMMAND_TCP: u8 = 1;
pub const COMMAND_UDP: u8 = 2;
pub const COMMAND_MUX: u8 = 3;

/// XTLS vision 流控标签；行为由外层实现，此处仅解析与校验
pub const FLOW_VISION: &str = "xtls-rprx-vision";
