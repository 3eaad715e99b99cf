//! Core data models for the storage verifier.
//!
//! These describe the buckets and objects the verifier probes, the
//! short-lived signed access grants it issues, and the client session the
//! navigation view renders from. All of them serialize naturally as JSON
//! via `serde`.

pub mod bucket;
pub mod object;
pub mod session;
