//! Utilities for testing code that uses the tunnel: a [tracking_sink::TrackingPacketSink] for
//!  looking at what a connection sends, and transports that connect a client to a relay inside
//!  the same process, optionally losing and reordering packets.
//!
//! These are part of the crate's regular (non-#[cfg(test)]) code so that integration tests and
//!  applications can use them.

pub mod in_process;
pub mod tracking_sink;

