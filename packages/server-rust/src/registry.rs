//! Process-wide registry of cache instances, one per type tag.
//!
//! One instance per type bounds the number of completion consumers in a
//! process to the number of types in use, no matter how many call sites ask
//! for a cache. Lookups hit a concurrent map; creation is serialized by an
//! async mutex and re-checked under it. A failed construction is not
//! recorded, so the next call retries.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tiercache_core::TypeTag;
use tracing::info;

use crate::config::CacheOptions;
use crate::error::CacheError;
use crate::instance::{CacheInstance, CacheValue};

// ---------------------------------------------------------------------------
// ManagedInstance
// ---------------------------------------------------------------------------

/// Type-erased lifecycle handle for a registered instance.
#[async_trait]
pub trait ManagedInstance: Send + Sync + Any {
    fn type_tag(&self) -> &TypeTag;

    async fn close(&self);
}

#[async_trait]
impl<T: CacheValue> ManagedInstance for CacheInstance<T> {
    fn type_tag(&self) -> &TypeTag {
        CacheInstance::type_tag(self)
    }

    async fn close(&self) {
        CacheInstance::close(self).await;
    }
}

struct Entry {
    /// Downcast target for typed lookups.
    typed: Arc<dyn Any + Send + Sync>,
    managed: Arc<dyn ManagedInstance>,
}

// ---------------------------------------------------------------------------
// InstanceRegistry
// ---------------------------------------------------------------------------

/// Map from type tag to its singleton [`CacheInstance`].
pub struct InstanceRegistry {
    entries: DashMap<TypeTag, Entry>,
    create_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl InstanceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the instance for `T`, creating it from `options` on first use.
    ///
    /// `options` is ignored once the instance exists.
    ///
    /// # Errors
    ///
    /// Construction errors from [`CacheInstance::new`].
    pub async fn get_or_create<T: CacheValue>(
        &self,
        options: CacheOptions,
    ) -> Result<Arc<CacheInstance<T>>, CacheError> {
        self.get_or_create_tagged(TypeTag::of::<T>(), options).await
    }

    /// Like [`get_or_create`](Self::get_or_create) under an explicit tag.
    ///
    /// # Errors
    ///
    /// [`CacheError::TagConflict`] if `tag` is already held by an instance of
    /// another value type, or construction errors.
    pub async fn get_or_create_tagged<T: CacheValue>(
        &self,
        tag: TypeTag,
        options: CacheOptions,
    ) -> Result<Arc<CacheInstance<T>>, CacheError> {
        if let Some(found) = self.lookup::<T>(&tag) {
            return found;
        }

        let _guard = self.create_lock.lock().await;
        if let Some(found) = self.lookup::<T>(&tag) {
            return found;
        }

        let instance = Arc::new(CacheInstance::<T>::with_tag(tag.clone(), options).await?);
        info!(type_name = %tag, cache_id = instance.cache_id(), "registered cache instance");
        self.entries.insert(
            tag,
            Entry {
                typed: Arc::clone(&instance) as Arc<dyn Any + Send + Sync>,
                managed: Arc::clone(&instance) as Arc<dyn ManagedInstance>,
            },
        );
        Ok(instance)
    }

    /// Returns the registered instance for `T`, if any.
    #[must_use]
    pub fn get<T: CacheValue>(&self) -> Option<Arc<CacheInstance<T>>> {
        self.lookup::<T>(&TypeTag::of::<T>()).and_then(Result::ok)
    }

    fn lookup<T: CacheValue>(
        &self,
        tag: &TypeTag,
    ) -> Option<Result<Arc<CacheInstance<T>>, CacheError>> {
        let typed = Arc::clone(&self.entries.get(tag)?.typed);
        Some(
            typed
                .downcast::<CacheInstance<T>>()
                .map_err(|_| CacheError::TagConflict {
                    tag: tag.to_string(),
                }),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closes and forgets every registered instance.
    pub async fn close_all(&self) {
        let _guard = self.create_lock.lock().await;
        let managed: Vec<Arc<dyn ManagedInstance>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.value().managed))
            .collect();
        self.entries.clear();
        for instance in managed {
            instance.close().await;
        }
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Process-wide registry
// ---------------------------------------------------------------------------

/// The registry shared by the whole process.
pub fn global() -> &'static InstanceRegistry {
    static REGISTRY: OnceLock<InstanceRegistry> = OnceLock::new();
    REGISTRY.get_or_init(InstanceRegistry::new)
}

/// [`InstanceRegistry::get_or_create`] on the [`global`] registry.
///
/// # Errors
///
/// Construction errors from [`CacheInstance::new`].
pub async fn get_or_create<T: CacheValue>(
    options: CacheOptions,
) -> Result<Arc<CacheInstance<T>>, CacheError> {
    global().get_or_create::<T>(options).await
}
