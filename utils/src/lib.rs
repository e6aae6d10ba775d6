pub mod bytes;
/// Utilities for storing integer-like data in different byteorders.
pub mod endian;
/// Error-handling utilities.
pub mod error;
/// A small, self-contained socket address type used across the wire and server crates.
pub mod sockaddr;
