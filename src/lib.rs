//! Tenantgate - a multi-tenant reverse proxy for per-user backend servers
//!
//! This library provides:
//! - Path-encoded identity routing on the primary host (direct mode)
//! - Custom domain bindings stored per owner (domain mode)
//! - A registration API authenticated against the hub
//! - Certificate issuance, renewal and revocation for bound domains
//! - SNI-based certificate selection at TLS handshake time

pub mod api;
pub mod certs;
pub mod config;
pub mod db;
pub mod error;
pub mod forward;
pub mod identity;
pub mod issuer;
pub mod lifecycle;
pub mod proxy;
pub mod registry;
pub mod routing;
pub mod tls;
