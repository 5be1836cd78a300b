use log::info;

pub mod framing;
pub mod udp;
pub mod unix;

pub use framing::{FramedMessage, FramingError, MessageFramer};

pub fn init() {
    info!("ccn-transport initialized");
}
