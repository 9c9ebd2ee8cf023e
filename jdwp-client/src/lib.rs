// JDWP client library
//
// The small slice of JDWP a dev-mode attach needs:
// - Connection and handshake (with a handshake timeout)
// - Background event loop routing replies and VM lifecycle events
// - VirtualMachine.Version / VirtualMachine.Dispose

pub mod commands;
pub mod connection;
pub mod eventloop;
pub mod events;
pub mod protocol;
pub mod reader;
pub mod vm;

pub use connection::JdwpConnection;
pub use events::{DebuggeeEvent, EventKind, EventSet};
pub use protocol::{JdwpError, JdwpResult, JDWP_HANDSHAKE};
pub use vm::VmVersion;
