//! In-process transport serving a local state
//!
//! The server half of the wire contract: executes requests against an
//! `Arc<dyn State>` and maps store errors onto transport status codes. The
//! client-side [`Adapter`](crate::remote::Adapter) reverses the mapping,
//! which is what makes the pair a faithful stand-in for a networked
//! deployment.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Error;
use crate::remote::wire::{Frame, Request, Response, WireResource};
use crate::remote::{FrameStream, StatusCode, Transport, TransportError};
use crate::resource::Kind;
use crate::state::{
    CreateOptions, DestroyOptions, Event, GetOptions, ListOptions, State, UpdateOptions,
    WatchKindOptions, WatchOptions,
};

/// Capacity of the internal event channel backing each watch stream.
const STREAM_BUFFER: usize = 64;

/// In-process transport backed by a local state.
pub struct LoopbackTransport {
    state: Arc<dyn State>,
}

impl LoopbackTransport {
    pub fn new(state: Arc<dyn State>) -> Self {
        Self { state }
    }
}

/// Map a store error onto the wire status code.
///
/// Version conflicts and pending finalizers deliberately collapse onto
/// `FailedPrecondition`: the wire does not distinguish them.
fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NotFound,
        Error::AlreadyExists { .. } => StatusCode::AlreadyExists,
        Error::OwnerConflict { .. } => StatusCode::PermissionDenied,
        Error::PhaseConflict { .. } => StatusCode::InvalidArgument,
        Error::VersionConflict { .. }
        | Error::PendingFinalizers { .. }
        | Error::Conflict { .. } => StatusCode::FailedPrecondition,
        _ => StatusCode::Internal,
    }
}

fn transport_err(err: Error) -> TransportError {
    TransportError::new(status_of(&err), err.to_string())
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn unary(&self, request: Request) -> Result<Response, TransportError> {
        match request {
            Request::Get { pointer } => {
                let resource = self
                    .state
                    .get(&pointer, GetOptions::default())
                    .await
                    .map_err(transport_err)?;
                Ok(Response::Resource(
                    WireResource::from_resource(&resource).map_err(transport_err)?,
                ))
            }

            Request::List {
                namespace,
                ty,
                filter,
            } => {
                let resources = self
                    .state
                    .list(&Kind::new(namespace, ty), ListOptions::filtered(filter))
                    .await
                    .map_err(transport_err)?;
                let items = resources
                    .iter()
                    .map(WireResource::from_resource)
                    .collect::<crate::error::Result<Vec<_>>>()
                    .map_err(transport_err)?;
                Ok(Response::Resources(items))
            }

            Request::Create { resource, owner } => {
                let mut resource = resource.into_resource(false).map_err(transport_err)?;
                self.state
                    .create(&mut resource, CreateOptions { owner })
                    .await
                    .map_err(transport_err)?;
                Ok(Response::Resource(
                    WireResource::from_resource(&resource).map_err(transport_err)?,
                ))
            }

            Request::Update {
                resource,
                expected_version,
                expected_phase,
                owner,
            } => {
                let mut resource = resource.into_resource(false).map_err(transport_err)?;
                self.state
                    .update(
                        &mut resource,
                        UpdateOptions {
                            expected_version,
                            expected_phase,
                            owner,
                        },
                    )
                    .await
                    .map_err(transport_err)?;
                Ok(Response::Resource(
                    WireResource::from_resource(&resource).map_err(transport_err)?,
                ))
            }

            Request::Destroy { pointer, owner } => {
                self.state
                    .destroy(&pointer, DestroyOptions { owner })
                    .await
                    .map_err(transport_err)?;
                Ok(Response::Empty)
            }

            Request::AddFinalizer { pointer, token } => {
                self.state
                    .add_finalizer(&pointer, &token)
                    .await
                    .map_err(transport_err)?;
                Ok(Response::Empty)
            }

            Request::RemoveFinalizer { pointer, token } => {
                self.state
                    .remove_finalizer(&pointer, &token)
                    .await
                    .map_err(transport_err)?;
                Ok(Response::Empty)
            }

            Request::Watch { .. } => Err(TransportError::new(
                StatusCode::InvalidArgument,
                "watch is a streaming verb",
            )),
        }
    }

    async fn stream(&self, request: Request) -> Result<FrameStream, TransportError> {
        let Request::Watch {
            namespace,
            ty,
            id,
            bootstrap,
            tail_events,
            filter,
        } = request
        else {
            return Err(TransportError::new(
                StatusCode::InvalidArgument,
                "only watch may stream",
            ));
        };

        let (event_tx, event_rx) = mpsc::channel::<Event>(STREAM_BUFFER);

        match id {
            Some(id) => {
                let pointer = Kind::new(namespace, ty).pointer(id);
                self.state
                    .watch(
                        &pointer,
                        event_tx,
                        WatchOptions {
                            tail_events,
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(transport_err)?;
            }
            None => {
                let kind = Kind::new(namespace, ty);
                self.state
                    .watch_kind(
                        &kind,
                        event_tx,
                        WatchKindOptions {
                            bootstrap,
                            tail_events,
                            filter,
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(transport_err)?;
            }
        }

        // Frame stream: establishment confirmation first, then encoded
        // events until the store-side subscription ends.
        let frames = stream::unfold(event_rx, |mut event_rx| async move {
            let event = event_rx.recv().await?;
            let frame = Frame::from_event(&event).map_err(|err| {
                debug!(error = %err, "failed to encode watch frame");
                TransportError::new(StatusCode::Internal, err.to_string())
            });
            Some((frame, event_rx))
        });

        Ok(Box::pin(
            stream::iter([Ok(Frame::Established)]).chain(frames),
        ))
    }
}
