//! Client-side adapter: the `State` contract over a transport
//!
//! Translates transport status codes into store error kinds, performs the
//! established-frame handshake on watch streams, and keeps the caller's
//! in-memory resource copies consistent with the server's view after
//! create/update.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::remote::wire::{EventType, Frame, Request, Response, WireResource};
use crate::remote::{FrameStream, StatusCode, Transport, TransportError};
use crate::resource::{Kind, Pointer, Resource};
use crate::state::{
    CreateOptions, DestroyOptions, Event, GetOptions, ListOptions, State, UpdateOptions,
    WatchKindOptions, WatchOptions,
};

/// Remote state client over an abstract transport.
pub struct Adapter<T> {
    transport: T,
}

impl<T: Transport> Adapter<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Copy server-assigned metadata back onto the caller's resource so the
    /// in-memory copy stays consistent with the store's view.
    fn copy_assigned(wire: &WireResource, target: &mut Resource) {
        let md = target.metadata_mut();
        md.set_version(wire.metadata.version());
        md.set_updated(wire.metadata.updated());
        md.set_created(wire.metadata.created());
        md.set_owner(wire.metadata.owner());
    }

    /// Open a watch stream, consume the establishment frame, and hand the
    /// tail to a delivery task.
    async fn open_watch(
        &self,
        request: Request,
        sink: mpsc::Sender<Event>,
        cancel: CancellationToken,
        skip_spec_decode: bool,
    ) -> Result<()> {
        let mut stream = self
            .transport
            .stream(request)
            .await
            .map_err(passthrough)?;

        // The first frame confirms the stream is established; it carries no
        // resource data and is not surfaced to the subscriber.
        match stream.next().await {
            Some(Ok(Frame::Established)) => {}
            Some(Ok(_)) => return Err(protocol_violation("expected establishment frame")),
            Some(Err(err)) => return Err(passthrough(err)),
            None => return Err(protocol_violation("stream closed before establishment")),
        }

        tokio::spawn(deliver_frames(stream, sink, cancel, skip_spec_decode));
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> State for Adapter<T> {
    async fn get(&self, pointer: &Pointer, options: GetOptions) -> Result<Resource> {
        let response = self
            .transport
            .unary(Request::Get {
                pointer: pointer.clone(),
            })
            .await
            .map_err(|err| match err.code {
                StatusCode::NotFound => Error::NotFound {
                    pointer: pointer.clone(),
                },
                _ => passthrough(err),
            })?;

        match response {
            Response::Resource(wire) => wire.into_resource(options.skip_spec_decode),
            _ => Err(protocol_violation("expected resource response")),
        }
    }

    async fn list(&self, kind: &Kind, options: ListOptions) -> Result<Vec<Resource>> {
        let response = self
            .transport
            .unary(Request::List {
                namespace: kind.namespace.clone(),
                ty: kind.ty.clone(),
                filter: options.filter.clone(),
            })
            .await
            .map_err(passthrough)?;

        match response {
            // Any per-item decode error aborts the whole call.
            Response::Resources(items) => items
                .into_iter()
                .map(|wire| wire.into_resource(options.skip_spec_decode))
                .collect(),
            _ => Err(protocol_violation("expected resource list response")),
        }
    }

    async fn create(&self, resource: &mut Resource, options: CreateOptions) -> Result<()> {
        let pointer = resource.metadata().pointer();
        let response = self
            .transport
            .unary(Request::Create {
                resource: WireResource::from_resource(resource)?,
                owner: options.owner,
            })
            .await
            .map_err(|err| match err.code {
                StatusCode::NotFound => Error::NotFound {
                    pointer: pointer.clone(),
                },
                StatusCode::PermissionDenied => Error::OwnerConflict {
                    pointer: pointer.clone(),
                    owner: String::new(),
                },
                StatusCode::AlreadyExists => Error::AlreadyExists {
                    pointer: pointer.clone(),
                },
                _ => passthrough(err),
            })?;

        match response {
            Response::Resource(wire) => {
                Self::copy_assigned(&wire, resource);
                Ok(())
            }
            _ => Err(protocol_violation("expected resource response")),
        }
    }

    async fn update(&self, resource: &mut Resource, options: UpdateOptions) -> Result<()> {
        let pointer = resource.metadata().pointer();
        let expected_phase = options.expected_phase;
        let response = self
            .transport
            .unary(Request::Update {
                resource: WireResource::from_resource(resource)?,
                expected_version: options.expected_version,
                expected_phase,
                owner: options.owner,
            })
            .await
            .map_err(|err| match err.code {
                StatusCode::NotFound => Error::NotFound {
                    pointer: pointer.clone(),
                },
                StatusCode::PermissionDenied => Error::OwnerConflict {
                    pointer: pointer.clone(),
                    owner: String::new(),
                },
                // Always a phase conflict, whether or not this caller
                // supplied the expectation that tripped it.
                StatusCode::InvalidArgument => Error::PhaseConflict {
                    pointer: pointer.clone(),
                    expected: expected_phase,
                },
                // Version conflicts and pending finalizers share this code;
                // the wire cannot distinguish them.
                StatusCode::FailedPrecondition => Error::Conflict {
                    pointer: pointer.clone(),
                    message: err.message,
                },
                _ => passthrough(err),
            })?;

        match response {
            Response::Resource(wire) => {
                Self::copy_assigned(&wire, resource);
                Ok(())
            }
            _ => Err(protocol_violation("expected resource response")),
        }
    }

    async fn destroy(&self, pointer: &Pointer, options: DestroyOptions) -> Result<()> {
        self.transport
            .unary(Request::Destroy {
                pointer: pointer.clone(),
                owner: options.owner,
            })
            .await
            .map_err(|err| match err.code {
                StatusCode::NotFound => Error::NotFound {
                    pointer: pointer.clone(),
                },
                StatusCode::PermissionDenied => Error::OwnerConflict {
                    pointer: pointer.clone(),
                    owner: String::new(),
                },
                StatusCode::FailedPrecondition => Error::Conflict {
                    pointer: pointer.clone(),
                    message: err.message,
                },
                _ => passthrough(err),
            })?;

        Ok(())
    }

    async fn add_finalizer(&self, pointer: &Pointer, token: &str) -> Result<()> {
        self.transport
            .unary(Request::AddFinalizer {
                pointer: pointer.clone(),
                token: token.to_string(),
            })
            .await
            .map_err(|err| match err.code {
                StatusCode::NotFound => Error::NotFound {
                    pointer: pointer.clone(),
                },
                _ => passthrough(err),
            })?;

        Ok(())
    }

    async fn remove_finalizer(&self, pointer: &Pointer, token: &str) -> Result<()> {
        self.transport
            .unary(Request::RemoveFinalizer {
                pointer: pointer.clone(),
                token: token.to_string(),
            })
            .await
            .map_err(|err| match err.code {
                StatusCode::NotFound => Error::NotFound {
                    pointer: pointer.clone(),
                },
                _ => passthrough(err),
            })?;

        Ok(())
    }

    async fn watch(
        &self,
        pointer: &Pointer,
        sink: mpsc::Sender<Event>,
        options: WatchOptions,
    ) -> Result<()> {
        self.open_watch(
            Request::Watch {
                namespace: pointer.namespace.clone(),
                ty: pointer.ty.clone(),
                id: Some(pointer.id.clone()),
                bootstrap: false,
                tail_events: options.tail_events,
                filter: Default::default(),
            },
            sink,
            options.cancel,
            options.skip_spec_decode,
        )
        .await
    }

    async fn watch_kind(
        &self,
        kind: &Kind,
        sink: mpsc::Sender<Event>,
        options: WatchKindOptions,
    ) -> Result<()> {
        self.open_watch(
            Request::Watch {
                namespace: kind.namespace.clone(),
                ty: kind.ty.clone(),
                id: None,
                bootstrap: options.bootstrap,
                tail_events: options.tail_events,
                filter: options.filter,
            },
            sink,
            options.cancel,
            options.skip_spec_decode,
        )
        .await
    }
}

fn passthrough(err: TransportError) -> Error {
    Error::Transport {
        code: err.code,
        message: err.message,
    }
}

fn protocol_violation(message: &str) -> Error {
    Error::Transport {
        code: StatusCode::Internal,
        message: message.to_string(),
    }
}

// =============================================================================
// Frame Delivery
// =============================================================================

/// Decode frames into events until end-of-stream, cancellation, or decode
/// failure. The latter two surface exactly one terminal `Errored` event.
async fn deliver_frames(
    mut stream: FrameStream,
    sink: mpsc::Sender<Event>,
    cancel: CancellationToken,
    skip_spec_decode: bool,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                // Best effort only: the subscriber asked to stop.
                let _ = sink.try_send(Event::Errored(Arc::new(Error::Transport {
                    code: StatusCode::Cancelled,
                    message: "watch cancelled".into(),
                })));
                return;
            }
            next = stream.next() => next,
        };

        let event = match frame {
            // Clean end of stream.
            None => return,
            Some(Err(err)) => {
                send_terminal(&sink, &cancel, passthrough(err)).await;
                return;
            }
            Some(Ok(Frame::Established)) => {
                send_terminal(
                    &sink,
                    &cancel,
                    Error::Transport {
                        code: StatusCode::Internal,
                        message: "unexpected establishment frame mid-stream".into(),
                    },
                )
                .await;
                return;
            }
            Some(Ok(Frame::Event {
                event_type,
                resource,
                old,
                error,
            })) => match decode_event(event_type, resource, old, error, skip_spec_decode) {
                Ok(event) => event,
                Err(err) => {
                    debug!(error = %err, "watch frame decode failed");
                    send_terminal(&sink, &cancel, err).await;
                    return;
                }
            },
        };

        let terminal = event.is_terminal();
        let delivered = tokio::select! {
            _ = cancel.cancelled() => false,
            sent = sink.send(event) => sent.is_ok(),
        };
        if terminal || !delivered {
            return;
        }
    }
}

/// Deliver the terminal `Errored` event, blocking on a full sink like any
/// other event; a failed stream ends with exactly one `Errored`, even when
/// the subscriber is slow. Gives up only on cancellation or a closed
/// receiver.
async fn send_terminal(sink: &mpsc::Sender<Event>, cancel: &CancellationToken, err: Error) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sink.send(Event::Errored(Arc::new(err))) => {}
    }
}

fn decode_event(
    event_type: EventType,
    resource: Option<WireResource>,
    old: Option<WireResource>,
    error: Option<String>,
    skip_spec_decode: bool,
) -> Result<Event> {
    let missing = || Error::Transport {
        code: StatusCode::Internal,
        message: format!("frame {event_type:?} is missing a resource"),
    };

    Ok(match event_type {
        EventType::Created => {
            Event::Created(resource.ok_or_else(missing)?.into_resource(skip_spec_decode)?)
        }
        EventType::Updated => Event::Updated {
            old: old.ok_or_else(missing)?.into_resource(skip_spec_decode)?,
            new: resource.ok_or_else(missing)?.into_resource(skip_spec_decode)?,
        },
        EventType::Destroyed => {
            Event::Destroyed(resource.ok_or_else(missing)?.into_resource(skip_spec_decode)?)
        }
        EventType::Bootstrapped => Event::Bootstrapped,
        EventType::Errored => Event::Errored(Arc::new(Error::Transport {
            code: StatusCode::Unavailable,
            message: error.unwrap_or_else(|| "remote watch failed".into()),
        })),
    })
}
