//! The RELP engine: reliable syslog over TCP with transaction-numbered
//! acknowledgments coupled to downstream delivery.

mod server;
mod session;

pub use server::{
    handle_connection, spawn_relp_listener, ImmediateStasher, RelpConnection, RelpStasher,
    StoreRelpStasher,
};
pub use session::{AckWindow, RelpError, RelpSession, SessionState};
