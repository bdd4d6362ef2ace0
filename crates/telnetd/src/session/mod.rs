//! Session management: PTY lifecycle, ring buffers, registry.

pub mod bridge;
pub mod pty;
pub mod registry;
pub mod ring_buffer;

pub use bridge::{Preamble, Readiness, Session, SessionId};
pub use pty::{NativeSpawner, PtySpawner};
pub use registry::Registry;
