//! Session engine: broker address, token storage, status and the
//! connection state machine.

pub mod address;
pub mod engine;
pub mod status;
pub mod token;

pub use address::Address;
pub use engine::{in_session_setup, Network, NetworkEvents};
pub use status::{reconnect_delay, NetworkStatus, ReconnectHandle, StatusKind};
pub use token::{FileTokenProvider, MemoryTokenProvider, TokenProvider};
