//! Voxflow gateway — the server binary's building blocks.
//!
//! Components, leaves first: the event bus, the termination arbiter,
//! the telephony gateway (provider REST + TwiML), the AI-provider
//! client, the media bridge, the campaign engine, the real-time hub,
//! and the HTTP surface that ties them together.

pub mod ai;
pub mod api;
pub mod arbiter;
pub mod bridge;
pub mod bus;
pub mod cli;
pub mod crm;
pub mod engine;
pub mod hub;
pub mod state;
pub mod telephony;
