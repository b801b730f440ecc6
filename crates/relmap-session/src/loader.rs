//! Lazy repository materialization.

use crate::repository::Repository;
use relmap_core::{Error, LookupErrorKind, RepositoryId, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Source of repository instances for the model.
pub trait RepositoryLoader: Send + Sync {
    /// Whether a repository is registered under `id`.
    fn has_repository(&self, id: RepositoryId) -> bool;

    /// Get the repository, materializing it on first access.
    fn get_repository(&self, id: RepositoryId) -> Result<Arc<dyn Repository>>;

    /// Whether the repository has been materialized.
    fn is_created(&self, id: RepositoryId) -> bool;
}

/// Builds a repository instance.
pub type RepositoryFactory = Box<dyn Fn() -> Arc<dyn Repository> + Send + Sync>;

struct Slot {
    factory: RepositoryFactory,
    instance: OnceLock<Arc<dyn Repository>>,
}

/// Loader materializing each registered repository at most once.
pub struct LazyRepositoryLoader {
    slots: HashMap<RepositoryId, Slot>,
}

impl LazyRepositoryLoader {
    pub fn builder() -> LazyRepositoryLoaderBuilder {
        LazyRepositoryLoaderBuilder::default()
    }
}

impl RepositoryLoader for LazyRepositoryLoader {
    fn has_repository(&self, id: RepositoryId) -> bool {
        self.slots.contains_key(&id)
    }

    fn get_repository(&self, id: RepositoryId) -> Result<Arc<dyn Repository>> {
        let slot = self
            .slots
            .get(&id)
            .ok_or_else(|| Error::lookup(LookupErrorKind::RepositoryClass, id.name()))?;
        let repository = slot.instance.get_or_init(|| {
            tracing::debug!(repository = %id, "Materializing repository");
            (slot.factory)()
        });
        Ok(Arc::clone(repository))
    }

    fn is_created(&self, id: RepositoryId) -> bool {
        self.slots
            .get(&id)
            .is_some_and(|slot| slot.instance.get().is_some())
    }
}

impl fmt::Debug for LazyRepositoryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut created: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.instance.get().is_some())
            .map(|(id, _)| id.name())
            .collect();
        created.sort_unstable();
        f.debug_struct("LazyRepositoryLoader")
            .field("registered", &self.slots.len())
            .field("created", &created)
            .finish()
    }
}

/// Builder for [`LazyRepositoryLoader`].
#[derive(Default)]
pub struct LazyRepositoryLoaderBuilder {
    slots: HashMap<RepositoryId, Slot>,
}

impl LazyRepositoryLoaderBuilder {
    /// Register a repository factory.
    #[must_use]
    pub fn repository(
        mut self,
        id: RepositoryId,
        factory: impl Fn() -> Arc<dyn Repository> + Send + Sync + 'static,
    ) -> Self {
        self.slots.insert(
            id,
            Slot {
                factory: Box::new(factory),
                instance: OnceLock::new(),
            },
        );
        self
    }

    pub fn build(self) -> LazyRepositoryLoader {
        LazyRepositoryLoader { slots: self.slots }
    }
}
