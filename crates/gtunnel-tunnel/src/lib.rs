//! gTunnel core
//!
//! A [`Tunnel`] owns local listen sockets, turns every accepted TCP connection
//! into a [`Connection`] keyed by a tunnel-scoped id, and coordinates setup and
//! teardown with its peer Tunnel over one control stream using three
//! operations: `Connect`, `Ack` and `Disconnect`.
//!
//! # Handshake
//!
//! ```text
//!  listening side                         destination side
//!  ──────────────                         ────────────────
//!  accept() ── add_connection(id)
//!          ── Connect{id} ───────────────▶ dial destination
//!                                          ├─ failed: ◀── Ack{id, status≠0}
//!                                          └─ ok: register id
//!          ◀───────────────── Ack{id, 0} ── get_byte_stream() → start
//!  acknowledge() → start
//!
//!  either side ── Disconnect{id} ────────▶ remove + close
//! ```

mod config;
mod connection;
mod error;
mod registry;
mod tunnel;

pub use config::TunnelConfig;
pub use connection::{Connection, ConnectionInfo, ConnectionOrigin, ConnectionState};
pub use error::{ConnectionError, TableError, TunnelError};
pub use gtunnel_proto::{ConnectionId, Direction};
pub use registry::ConnectionTable;
pub use tunnel::{ShutdownReport, Tunnel};
