//! Wire envelope for remote state access
//!
//! Byte-exact encode/decode of resources and events: any transport carrying
//! these types losslessly satisfies the serialization boundary.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resource::{Metadata, Phase, Pointer, Resource, SpecPayload, Version};
use crate::state::{Event, ResourceFilter};

// =============================================================================
// Resources
// =============================================================================

/// A resource in wire form: metadata plus encoded spec payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResource {
    pub metadata: Metadata,
    pub spec: Vec<u8>,
}

impl WireResource {
    pub fn from_resource(resource: &Resource) -> Result<Self> {
        Ok(Self {
            metadata: resource.metadata().clone(),
            spec: resource.spec().to_bytes()?.to_vec(),
        })
    }

    /// Reconstruct the resource, optionally skipping spec decoding and
    /// keeping the raw wire payload.
    pub fn into_resource(self, skip_spec_decode: bool) -> Result<Resource> {
        let spec = if skip_spec_decode {
            SpecPayload::Raw(self.spec.into())
        } else {
            SpecPayload::Decoded(serde_json::from_slice(&self.spec)?)
        };

        Ok(Resource::from_parts(self.metadata, spec))
    }
}

// =============================================================================
// Requests / Responses
// =============================================================================

/// Unary and streaming request verbs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Get {
        pointer: Pointer,
    },
    List {
        namespace: String,
        ty: String,
        filter: ResourceFilter,
    },
    Create {
        resource: WireResource,
        owner: Option<String>,
    },
    Update {
        resource: WireResource,
        expected_version: Option<Version>,
        expected_phase: Option<Phase>,
        owner: Option<String>,
    },
    Destroy {
        pointer: Pointer,
        owner: Option<String>,
    },
    AddFinalizer {
        pointer: Pointer,
        token: String,
    },
    RemoveFinalizer {
        pointer: Pointer,
        token: String,
    },
    /// Streaming verb: single resource when `id` is set, whole kind
    /// otherwise.
    Watch {
        namespace: String,
        ty: String,
        id: Option<String>,
        bootstrap: bool,
        tail_events: usize,
        filter: ResourceFilter,
    },
}

/// Unary response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Resource(WireResource),
    Resources(Vec<WireResource>),
    Empty,
}

// =============================================================================
// Watch Frames
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Created,
    Updated,
    Destroyed,
    Bootstrapped,
    Errored,
}

/// One frame of a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// First frame of every stream: confirms establishment, carries no
    /// resource data, and is never surfaced to the subscriber.
    Established,
    Event {
        event_type: EventType,
        resource: Option<WireResource>,
        old: Option<WireResource>,
        error: Option<String>,
    },
}

impl Frame {
    pub fn from_event(event: &Event) -> Result<Self> {
        let frame = match event {
            Event::Created(r) => Frame::Event {
                event_type: EventType::Created,
                resource: Some(WireResource::from_resource(r)?),
                old: None,
                error: None,
            },
            Event::Updated { old, new } => Frame::Event {
                event_type: EventType::Updated,
                resource: Some(WireResource::from_resource(new)?),
                old: Some(WireResource::from_resource(old)?),
                error: None,
            },
            Event::Destroyed(r) => Frame::Event {
                event_type: EventType::Destroyed,
                resource: Some(WireResource::from_resource(r)?),
                old: None,
                error: None,
            },
            Event::Bootstrapped => Frame::Event {
                event_type: EventType::Bootstrapped,
                resource: None,
                old: None,
                error: None,
            },
            Event::Errored(err) => Frame::Event {
                event_type: EventType::Errored,
                resource: None,
                old: None,
                error: Some(err.to_string()),
            },
        };

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_resource_round_trip() {
        let mut r = Resource::new("x", "Widget", "w1");
        r.set_spec(&json!({"size": 3})).unwrap();
        r.metadata_mut().set_label("tier", "hot");

        let wire = WireResource::from_resource(&r).unwrap();
        let encoded = serde_json::to_vec(&wire).unwrap();
        let decoded: WireResource = serde_json::from_slice(&encoded).unwrap();

        let back = decoded.into_resource(false).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_wire_resource_skip_decode() {
        let mut r = Resource::new("x", "Widget", "w1");
        r.set_spec(&json!({"size": 3})).unwrap();

        let wire = WireResource::from_resource(&r).unwrap();
        let back = wire.into_resource(true).unwrap();

        assert!(back.spec().is_raw());
        assert_eq!(
            back.spec_as::<serde_json::Value>().unwrap(),
            json!({"size": 3})
        );
    }

    #[test]
    fn test_event_frame_round_trip() {
        let old = Resource::new("x", "Widget", "w1");
        let mut new = old.clone();
        new.metadata_mut().bump_version();

        let frame = Frame::from_event(&Event::Updated {
            old: old.clone(),
            new: new.clone(),
        })
        .unwrap();

        let encoded = serde_json::to_vec(&frame).unwrap();
        let decoded: Frame = serde_json::from_slice(&encoded).unwrap();

        match decoded {
            Frame::Event {
                event_type: EventType::Updated,
                resource: Some(resource),
                old: Some(previous),
                error: None,
            } => {
                assert_eq!(resource.metadata.version(), new.metadata().version());
                assert_eq!(previous.metadata.version(), old.metadata().version());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
