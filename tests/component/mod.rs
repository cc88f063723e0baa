//! tests/component/mod.rs
//!
//! In-process component tests against the `Engine` actor directly, driven
//! through its real channels with no QUIC/TLS involved. Where the
//! `tests/integration/` suite proves the system works end-to-end over real
//! sockets, these tests isolate the engine's own event loop: command
//! handling, gossip fan-out decisions, and reserved-key routing.

mod dispatch;
mod election;
