//! Reconciliation controllers
//!
//! [`TransformController`] maintains one output resource per input resource
//! of a kind, re-running a [`Transformer`] whenever watched state changes.
//! Controllers identify themselves by name: the name is recorded as the
//! owner of every output they create and doubles as their finalizer token
//! on inputs.

mod options;
mod transform;

pub use options::{ShutdownCallback, TransformOptions, DEFAULT_REQUEUE_INTERVAL};
pub use transform::{TransformController, Transformer};
