//! Crate with the tiller runtime components.
//!
//! Contains the building blocks controllers are assembled from: a
//! level-triggered [`watcher`], a [`reflector`] cache, the deduplicating
//! [`requeue`] queue, the shared [`Controller`] loop and the [`finalizer`]
//! helper. Correctness under concurrency comes from idempotent
//! reconciliation plus the store's compare-and-swap writes, never from
//! exclusive locking.
#![deny(unsafe_code)]

pub mod controller;
pub mod finalizer;
pub mod reflector;
pub mod requeue;
pub mod utils;
pub mod watcher;

pub use controller::{Action, Config, Controller};
pub use reflector::{ObjectRef, Store, Writer};
pub use watcher::watcher;
