//! Network and I/O scheduling engine.
//!
//! The engine fuses four cooperating parts: per-peer connection state machines
//! ([`state::PeerState`]) that parse framed commands off non-blocking sockets, a per-connection
//! transaction registry ([`transaction::TransactionTable`]) matching replies to outstanding
//! requests, multi-discipline worker pools ([`pool::WorkPool`]) behind a global backpressure
//! gate ([`backpressure::Backpressure`]), and poller threads ([`poller`]) driving read, write,
//! and accept readiness for hundreds of peers at once.
//!
//! Socket ownership stays on dedicated poller threads; decoded requests travel to worker pools
//! as owned [`pool::IoReq`] items that keep their connection alive until processed.

pub mod backpressure;
pub mod dispatch;
pub mod poller;
pub mod pool;
pub mod reconnect;
pub mod state;
pub mod sys;
pub mod transaction;

#[cfg(test)]
mod tests;
