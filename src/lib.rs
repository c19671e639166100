//! peercam - peer-to-peer live video and photo streaming
//!
//! A capturing device streams H.264 pictures and still photos to a nearby
//! peer over two channels: a reliable command channel carrying keep-alives
//! and remote commands, and a streaming channel where parameter sets and
//! photos are reliable and pictures are not.

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod utils;

pub use error::{AppError, Result};
