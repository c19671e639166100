//! Wire protocol: packet framing, reliability routing and remote commands

pub mod command;
pub mod packet;
pub mod reliability;

pub use command::{CaptureMode, RemoteCommand};
pub use packet::{Packet, PacketTag};
pub use reliability::{choose_mode, SendMode};
