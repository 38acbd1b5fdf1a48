//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate store calls into the topic resolution use case.
//! - Keep callers (web layer, CLI) decoupled from storage details.

pub mod generator;
pub mod resolver;
