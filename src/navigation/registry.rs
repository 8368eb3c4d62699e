//! Unit kind registry: maps short kind tags to payload decoders and the
//! platform navigation callback for that kind.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::CheckpointError;
use crate::navigation::unit::ActivatedUnit;

/// Opaque handle to the host platform, passed through to navigators.
pub type PlatformHandle = Arc<dyn Any + Send + Sync>;

/// Shows a restored unit on the platform.
#[async_trait]
pub trait UnitNavigator: Send + Sync {
    /// Navigate to the view for `unit`. Returns `true` on success.
    async fn navigate_to_view(
        &self,
        platform: &PlatformHandle,
        unit: Arc<ActivatedUnit>,
        use_animations: bool,
    ) -> bool;
}

#[async_trait]
impl<F, Fut> UnitNavigator for F
where
    F: Fn(PlatformHandle, Arc<ActivatedUnit>, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn navigate_to_view(
        &self,
        platform: &PlatformHandle,
        unit: Arc<ActivatedUnit>,
        use_animations: bool,
    ) -> bool {
        (self)(Arc::clone(platform), unit, use_animations).await
    }
}

type PayloadCheck = fn(&serde_json::Value) -> Result<(), String>;

struct KindEntry {
    type_name: &'static str,
    check: PayloadCheck,
    navigator: Arc<dyn UnitNavigator>,
}

/// Registry of restorable unit kinds. Populated once at startup.
#[derive(Default)]
pub struct UnitKindRegistry {
    kinds: HashMap<String, KindEntry>,
}

impl UnitKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tag` with payload type `T` and its navigator.
    ///
    /// Registering the same tag again replaces the previous entry.
    pub fn register<T, N>(&mut self, tag: impl Into<String>, navigator: N) -> &mut Self
    where
        T: DeserializeOwned + 'static,
        N: UnitNavigator + 'static,
    {
        let tag = tag.into();
        let check: PayloadCheck = |payload| {
            serde_json::from_value::<T>(payload.clone())
                .map(|_| ())
                .map_err(|e| e.to_string())
        };
        tracing::debug!(kind = %tag, type_name = std::any::type_name::<T>(), "Unit kind registered");
        self.kinds.insert(
            tag,
            KindEntry {
                type_name: std::any::type_name::<T>(),
                check,
                navigator: Arc::new(navigator),
            },
        );
        self
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.kinds.contains_key(tag)
    }

    /// Concrete payload type registered for `tag`.
    pub fn type_name(&self, tag: &str) -> Option<&'static str> {
        self.kinds.get(tag).map(|k| k.type_name)
    }

    pub fn navigator(&self, tag: &str) -> Option<Arc<dyn UnitNavigator>> {
        self.kinds.get(tag).map(|k| Arc::clone(&k.navigator))
    }

    /// Check that `payload` decodes as the type registered for `tag`.
    pub fn validate(&self, tag: &str, payload: &serde_json::Value) -> Result<(), CheckpointError> {
        let entry = self
            .kinds
            .get(tag)
            .ok_or_else(|| CheckpointError::UnknownKind {
                kind: tag.to_string(),
            })?;
        (entry.check)(payload).map_err(|reason| {
            tracing::warn!(kind = tag, reason = %reason, "Payload does not decode for kind");
            CheckpointError::UnknownKind {
                kind: format!("{tag} ({})", entry.type_name),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
