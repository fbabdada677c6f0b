//! Service Facade over the Message Bridge
//!
//! One operation per administrative action exposed by the remote service.
//! Round-trip operations build a typed request, drive the bridge with a
//! fixed per-call timeout and classify the reply; derived reads are pure
//! functions over already-fetched data and cost no extra round trip.

pub mod client;
pub mod service;

pub use client::{UsmClient, UsmClientConfig};
pub use service::UsmService;

pub use usm_common::{Result, UsmError};
