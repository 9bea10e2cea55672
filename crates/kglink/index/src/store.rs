//! The set of type indices a linker serves from.

use std::collections::BTreeMap;

use kglink_core::{EncoderIdentity, EntityType};

/// A registered type whose index could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub entity_type: EntityType,
    pub reason: String,
}

/// Loaded type indices keyed by entity type.
///
/// Types are registered explicitly at load time. A registered type whose
/// directory is missing or incompatible is recorded in [`IndexStore::failures`]
/// and simply absent from the store; the remaining types stay usable.
#[derive(Debug, Default)]
pub struct IndexStore {
    indices: BTreeMap<EntityType, crate::TypeIndex>,
    failures: Vec<LoadFailure>,
}

impl IndexStore {
    /// Load `<root>/<type>/` for every registered type.
    ///
    /// Every index must have been built with `encoder`.
    pub fn load(
        root: &std::path::Path,
        registrations: &[EntityType],
        encoder: &EncoderIdentity,
    ) -> Self {
        let mut store = Self::default();
        let mut seen = Vec::with_capacity(registrations.len());

        for &entity_type in registrations {
            if seen.contains(&entity_type) {
                continue;
            }
            seen.push(entity_type);

            let dir = root.join(entity_type.as_str());
            match crate::storage::load(&dir, entity_type, Some(encoder)) {
                Ok(index) => {
                    store.indices.insert(entity_type, index);
                }
                Err(e) => {
                    tracing::warn!(%entity_type, dir = %dir.display(), "{e}");
                    let reason = match e {
                        kglink_core::Error::IndexUnavailable { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    store.failures.push(LoadFailure {
                        entity_type,
                        reason,
                    });
                }
            }
        }

        tracing::info!(
            loaded = store.indices.len(),
            failed = store.failures.len(),
            root = %root.display(),
            "index store ready"
        );
        store
    }

    /// Build a store from in-memory indices.
    ///
    /// All indices must share one encoder identity and each type may appear
    /// at most once.
    pub fn from_indices(
        indices: impl IntoIterator<Item = crate::TypeIndex>,
    ) -> kglink_core::Result<Self> {
        let mut store = Self::default();
        for index in indices {
            if let Some(encoder) = store.encoder() {
                if encoder != index.encoder() {
                    return Err(kglink_core::Error::Layout(format!(
                        "`{}` index uses encoder {}, store uses {encoder}",
                        index.entity_type(),
                        index.encoder()
                    )));
                }
            }
            let entity_type = index.entity_type();
            if store.indices.insert(entity_type, index).is_some() {
                return Err(kglink_core::Error::Layout(format!(
                    "`{entity_type}` registered twice"
                )));
            }
        }
        Ok(store)
    }

    #[must_use]
    pub fn get(&self, entity_type: EntityType) -> Option<&crate::TypeIndex> {
        self.indices.get(&entity_type)
    }

    /// Loaded types in name order.
    pub fn entity_types(&self) -> impl Iterator<Item = EntityType> + '_ {
        self.indices.keys().copied()
    }

    #[must_use]
    pub fn failures(&self) -> &[LoadFailure] {
        &self.failures
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Encoder identity shared by the loaded indices.
    #[must_use]
    pub fn encoder(&self) -> Option<&EncoderIdentity> {
        self.indices.values().next().map(crate::TypeIndex::encoder)
    }
}
