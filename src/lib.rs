//! docguard - security hardening for documentation tooling
//!
//! This crate provides:
//! - Input validation against config, path, env, object and argument injection
//! - Per-operation rate limiting with escalation to blocking and blacklisting
//! - A PII-redacting, hash-chained, optionally encrypted log pipeline
//! - Mode-selectable policy (basic, optimized, secure, enterprise) tying them together

pub mod cli;
pub mod concurrency;
pub mod config;
pub mod facade;
pub mod paths;
pub mod security;

pub use config::Config;
pub use security::{SecurityMode, SecurityService};
