//! Convergent - Resource-Oriented State Runtime
//!
//! A runtime for building convergent control planes: versioned resources in
//! a watchable store, reconciled by controllers that re-derive outputs from
//! inputs until the system settles.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Controllers                           │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  TransformController (input kind → owned output kind)  │  │
//! │  └───────────────┬──────────────────────────▲─────────────┘  │
//! │                  │ create / update / destroy│ watch          │
//! ├──────────────────▼──────────────────────────┴────────────────┤
//! │                      State contract                          │
//! │  ┌──────────────────────┐      ┌──────────────────────────┐  │
//! │  │    InMemoryState     │      │   Adapter<T: Transport>  │  │
//! │  │  (slots + event log) │      │  (wire envelope client)  │  │
//! │  └──────────────────────┘      └───────────┬──────────────┘  │
//! │                                            │                 │
//! │                              ┌─────────────▼──────────────┐  │
//! │                              │     LoopbackTransport      │  │
//! │                              │  (in-process wire server)  │  │
//! │                              └────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation bumps the resource version and is fanned out, in mutation
//! order, to watch subscribers. Optimistic concurrency (version and phase
//! compare-and-swap), exclusive ownership, and finalizer-gated destruction
//! make concurrent controllers safe without coordination.
//!
//! # Modules
//!
//! - [`resource`]: resources, metadata, identity types, kind registry
//! - [`state`]: the `State` contract, events, filters, in-memory store
//! - [`remote`]: wire envelope, `Transport` trait, client adapter, loopback
//! - [`controller`]: transform reconciliation controller
//! - [`error`]: unified error taxonomy
//! - [`harness`]: watch-driven convergence assertions for tests

pub mod controller;
pub mod error;
pub mod harness;
pub mod remote;
pub mod resource;
pub mod state;

// Re-export commonly used types
pub use controller::{TransformController, TransformOptions, Transformer};
pub use error::{Error, Result};
pub use remote::{Adapter, LoopbackTransport, Transport};
pub use resource::{Kind, Metadata, Phase, Pointer, Resource, Version};
pub use state::{Event, InMemoryState, ResourceFilter, State};
