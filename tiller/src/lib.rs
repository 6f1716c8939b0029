//! Tiller is an umbrella crate for a declarative reconciliation control
//! plane.
//!
//! Clients declare desired state as objects; the gateway authorizes,
//! admits and persists them; the scheduler, the reconciliation
//! controllers and the node agents independently drive observed state
//! toward what was declared, coordinating only through watched objects.
//!
//! The main modules are:
//!
//! - [`core`] with the object envelope, built-in kinds, selectors and the
//!   error taxonomy
//! - [`api`] with the object store, the [`Gateway`], and the typed
//!   [`Api`] surface over a [`Client`]
//! - [`runtime`] with the [`watcher`](runtime::watcher()),
//!   [`Controller`](runtime::Controller) loop and finalizer helper
//! - [`controlplane`] with the placement scheduler and the replica,
//!   endpoint, scaling, disruption, rollout and node-lifecycle
//!   controllers
//! - [`agent`] with the node-local [`Agent`](agent::Agent)
//!
//! # Standing up an in-process control plane
//!
//! ```no_run
//! use tiller::{api::GatewayConfig, Api, Client, Gateway, Identity};
//! use tiller::core::kinds::ReplicaGroup;
//!
//! # async fn example() -> tiller::Result<()> {
//! let gateway = Gateway::new(GatewayConfig::default());
//! let client = Client::new(gateway, Identity::system("bootstrap"));
//!
//! // run the control plane loops
//! tokio::spawn(tiller::controlplane::scheduler::run(
//!     client.with_identity(Identity::system("scheduler")),
//!     Default::default(),
//! ));
//! tokio::spawn(tiller::controlplane::replica::run(
//!     client.with_identity(Identity::system("replica-controller")),
//! ));
//!
//! // declare desired state
//! let groups: Api<ReplicaGroup> = Api::namespaced(client, "default");
//! # let group = ReplicaGroup::new("web");
//! groups.create(&group).await?;
//! # Ok(())
//! # }
//! ```

pub use tiller_core as core;
pub use tiller_core::{ErrorResponse, Reason, Resource, ResourceExt, Result};

pub use tiller_api as api;
pub use tiller_api::{Api, Client, Gateway, Identity};

pub use tiller_runtime as runtime;

pub use tiller_controlplane as controlplane;

pub use tiller_agent as agent;
