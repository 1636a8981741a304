//! Integration tests for the peerprobe harness
//!
//! Scenario helpers live in [`integration`]; the scenarios themselves are
//! under `tests/`. Everything runs against the in-process loopback engine,
//! so no real sockets are opened.
