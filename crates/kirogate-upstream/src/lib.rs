//! Upstream side of the gateway: credential lifecycle, model catalog,
//! request conversion, the framed event-stream parser, and the retrying
//! HTTP client for the Kiro/CodeWhisperer API.

pub mod auth;
pub mod catalog;
pub mod client;
pub mod convert;
pub mod events;
pub mod parser;
