//! Auto Reply: at-most-once customer replies across webhook push and a
//! reconciliation sweep.

pub mod channels;
pub mod config;
pub mod error;
pub mod escalation;
pub mod gateway;
pub mod llm;
pub mod pipeline;
pub mod stats;
pub mod store;
pub mod webhook;
