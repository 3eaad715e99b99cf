//! Object-store capability interface and its implementations.

pub mod gcs_client;
pub mod memory_store;
pub mod oauth;
pub mod store;
pub mod xml;
