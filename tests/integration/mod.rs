//! tests/integration/mod.rs
//!
//! Declares the end-to-end integration test submodules, each exercising
//! real nodes over loopback QUIC plus their REST front-ends.

mod network;
