//! The client handle components talk to the gateway through.
use crate::{authz::Identity, gateway::Gateway};
use std::sync::Arc;

/// A cheap-to-clone handle carrying the caller's identity.
///
/// All component traffic flows through a `Client`; components never talk to
/// each other directly, only through shared objects behind the gateway.
#[derive(Clone)]
pub struct Client {
    gateway: Arc<Gateway>,
    identity: Identity,
}

impl Client {
    /// A client speaking as the given identity
    pub fn new(gateway: Arc<Gateway>, identity: Identity) -> Self {
        Self { gateway, identity }
    }

    /// The same gateway, as a different identity
    #[must_use]
    pub fn with_identity(&self, identity: Identity) -> Self {
        Self {
            gateway: self.gateway.clone(),
            identity,
        }
    }

    /// The gateway behind this client
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// The identity requests are attributed to
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}
