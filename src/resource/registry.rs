//! Resource-kind registry
//!
//! Records each kind's namespace/type pair in the meta namespace at
//! bootstrap. Kinds declare their descriptors statically through the
//! [`Registered`] trait; an unregistered kind is a startup error, never a
//! runtime type assertion.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::resource::{Kind, Resource};
use crate::state::State;

/// Namespace holding kind definitions.
pub const META_NAMESPACE: &str = "meta";

/// Resource type of a kind definition.
pub const KIND_DEFINITION_TYPE: &str = "meta.KindDefinition";

/// Static description of a resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindDescriptor {
    pub namespace: String,
    pub ty: String,
    /// Alternative short names accepted by tooling.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl KindDescriptor {
    pub fn new(namespace: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ty: ty.into(),
            aliases: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn kind(&self) -> Kind {
        Kind::new(self.namespace.clone(), self.ty.clone())
    }

    /// Definition resource id: `<namespace>.<type>`.
    fn definition_id(&self) -> String {
        format!("{}.{}", self.namespace, self.ty)
    }
}

/// Capability trait implemented by every resource kind known at compile time.
pub trait Registered {
    fn descriptor() -> KindDescriptor;
}

/// Registry recording kind definitions in the state store.
pub struct Registry {
    state: Arc<dyn State>,
}

impl Registry {
    pub fn new(state: Arc<dyn State>) -> Self {
        Self { state }
    }

    /// Register the meta kinds themselves.
    pub async fn register_default(&self) -> Result<()> {
        self.register(&KindDescriptor::new(META_NAMESPACE, KIND_DEFINITION_TYPE))
            .await
    }

    /// Register a statically declared kind.
    pub async fn register_kind<K: Registered>(&self) -> Result<()> {
        self.register(&K::descriptor()).await
    }

    /// Record a kind definition. Re-registering the same descriptor is
    /// idempotent; a conflicting definition under the same id is an error.
    pub async fn register(&self, descriptor: &KindDescriptor) -> Result<()> {
        let mut definition = Resource::new(
            META_NAMESPACE,
            KIND_DEFINITION_TYPE,
            descriptor.definition_id(),
        );
        definition.set_spec(descriptor)?;

        match self.state.create(&mut definition, Default::default()).await {
            Ok(()) => {
                debug!(kind = %descriptor.kind(), "registered resource kind");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                let existing = self
                    .state
                    .get(&definition.metadata().pointer(), Default::default())
                    .await?;
                let existing_descriptor: KindDescriptor = existing.spec_as()?;

                if existing_descriptor == *descriptor {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryState;

    struct WidgetKind;

    impl Registered for WidgetKind {
        fn descriptor() -> KindDescriptor {
            KindDescriptor::new("default", "Widget").with_alias("wdg")
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let registry = Registry::new(state.clone());

        registry.register_default().await.unwrap();
        registry.register_kind::<WidgetKind>().await.unwrap();
        // Same descriptor again: fine.
        registry.register_kind::<WidgetKind>().await.unwrap();

        let definition = state
            .get(
                &crate::resource::Pointer::new(
                    META_NAMESPACE,
                    KIND_DEFINITION_TYPE,
                    "default.Widget",
                ),
                Default::default(),
            )
            .await
            .unwrap();
        let descriptor: KindDescriptor = definition.spec_as().unwrap();
        assert_eq!(descriptor.aliases, vec!["wdg".to_string()]);
    }

    #[tokio::test]
    async fn test_conflicting_definition_rejected() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let registry = Registry::new(state);

        registry
            .register(&KindDescriptor::new("default", "Widget"))
            .await
            .unwrap();

        let err = registry
            .register(&KindDescriptor::new("default", "Widget").with_alias("w"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
