//! telnet-core: Telnet protocol layer for the telnetd session engine.
//!
//! Provides the command/option constants, the streaming codec that strips
//! in-band control sequences from client input, the option negotiation
//! policy, and the shared error type.

pub mod codec;
pub mod error;
pub mod policy;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use codec::{CodecSink, CodecState, TelnetCodec};
pub use error::{TelnetError, TelnetResult};
pub use policy::OptionPolicy;
pub use protocol::{greeting, Verb, WindowSize};
