//! Front end of the aether VM orchestrator.
//!
//! Consumes commands from an AMQP direct exchange, hands them to the
//! compute engine through the [`router::Router`] and publishes correlated
//! replies. The same engine can be served over a small REST API instead.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod amqp;
pub mod config;
pub mod error;
pub mod routes;
pub mod router;
