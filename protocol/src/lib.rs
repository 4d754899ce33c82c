//! Wire types spoken by vmgate.
//!
//! Two protocols cross a process boundary: SOCKS5 frames exchanged with the
//! guest (RFC 1928, CONNECT only, no authentication) and the line-delimited
//! JSON of the QEMU Machine Protocol exchanged with the hypervisor. This crate
//! only describes and encodes the messages; all I/O lives in the daemon.

pub mod qmp;
pub mod socks5;

pub use qmp::{QmpCommand, QmpErrorBody, QmpEvent, QmpGreeting, QmpMessage};
pub use socks5::{Address, Command, ReplyCode, RequestHeader, Socks5Error, Target};
