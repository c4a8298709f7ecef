//! Gatekeeper - Adaptive Request Throttling
//!
//! This crate implements an in-memory request throttling core: a sliding-window
//! counter store, named rate limiters with per-route selection, and a login
//! throttle with escalating lockouts keyed by identifier and client address.
//! An axum middleware and reference login endpoint expose it over HTTP.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod throttle;
