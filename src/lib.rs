//! h2push - HTTP/2 connection and stream management core
//!
//! This crate turns an accepted (optionally TLS-wrapped) byte stream into a
//! set of multiplexed HTTP/2 streams and lets an application push
//! server-initiated resources onto an existing connection.

pub mod http;
