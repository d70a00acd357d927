//! Wiring for the two bridge binaries
//!
//! `edi-tcp-bridge` merges or switches between redundant EDI/TCP inputs
//! and re-emits them over UDP (with FEC), TCP and optionally ZMQ;
//! `edi-udp-bridge` presents a multicast EDI/UDP feed, possibly
//! tunnelled in MPE or GSE, as an EDI/TCP server.
//!
//! This library holds everything both binaries share: the merge/switch
//! control plane, the UNIX-datagram remote control, the stats document,
//! the HTTP endpoint, logging and signal plumbing.

pub mod control;
pub mod logging;
pub mod rc;
pub mod signals;
pub mod stats;
pub mod web;
