use log::info;

pub mod bloom;
pub mod name;
pub mod packets;
pub mod tlv;

pub use bloom::Bloom;
pub use name::Name;
pub use packets::{ContentObject, Exclude, Interest, ParsedContent};
pub use tlv::{TlvElement, TlvError, MAX_MESSAGE_SIZE};

pub fn init() {
    info!("ccn-core initialized");
}
