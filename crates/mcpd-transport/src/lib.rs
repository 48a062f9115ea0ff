//! Transport layer: opens and closes one MCP session to a downstream server
//! over a stdio subprocess or streamable HTTP. The wire codec (framing,
//! handshake, id ↔ response matching) is rmcp's; this crate owns process
//! supervision, stderr capture, and deterministic spawn environments.

mod handler;
mod session;

pub use handler::{HostClientHandler, ListChangedEvent, ListChangedKind};
pub use session::{HandshakeInfo, SessionHandle, TransportContext, open_session};
