//! API types for the host-agent bridge.
//!
//! This module defines stable error, state, and event types,
//! isolating protocol complexity from consumers.

pub mod types;
