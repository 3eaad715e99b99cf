//! Payment-proof storage verifier.
//!
//! Checks that a Cloud Storage bucket exists, stays private, accepts uploads
//! and hands out working signed URLs. Also ships an in-memory emulator of the
//! XML API subset the checks use and the session-aware navigation view.

pub mod config;
pub mod credentials;
pub mod emulator;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod nav;
pub mod routes;
pub mod services;
pub mod signing;
pub mod verifier;
