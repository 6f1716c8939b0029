//! The tiller object store and API gateway.
//!
//! Hosts the single source of truth ([`store::ObjectStore`]) behind the
//! [`gateway::Gateway`], which enforces authorization and admission on every
//! request and fans writes out to watch streams. Components program against
//! the typed [`Api`] surface over a [`Client`] carrying their identity.
#![deny(unsafe_code)]

pub mod admission;
pub mod api;
pub mod authz;
pub mod client;
pub mod gateway;
pub mod store;

pub use api::Api;
pub use authz::{Identity, Verb};
pub use client::Client;
pub use gateway::{Gateway, GatewayConfig};

pub use tiller_core as core;
pub use tiller_core::{ErrorResponse, Result};
