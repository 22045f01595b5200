//! Client side of the iRODS wire protocol.
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol`] - packing instruction codec, API numbers and message bodies
//! - [`connection`] - framed messages over the control connection
//! - [`auth`] - startup handshake followed by native or PAM authentication
//! - [`parallel`] - data movement over the server's parallel transfer portal
//! - [`session`] - an authenticated [`Session`] with catalog and data object operations
//!
//! With the `testutils` feature the crate also ships `testutils::MockGrid`, an in-process server
//! used by the tests of this and the dependent crates.

pub mod account;
pub mod auth;
pub mod connection;
pub mod parallel;
pub mod path;
pub mod protocol;
pub mod session;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use account::{Account, AuthScheme};
pub use connection::{Connection, Message};
pub use session::{CollectionEntry, ObjectKind, ObjectStat, Session};
