use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::api::entity::EntityDescriptor;
use crate::cache::DocumentCache;
use crate::error::EntglResult;
use crate::model::Document;
use crate::query::Filter;
use crate::store::PeerStore;

/// Handle to one named collection. Reads go through the LRU cache; writes are
/// written through and tombstones invalidate.
#[derive(Clone)]
pub struct Collection {
    name: String,
    store: Arc<dyn PeerStore>,
    cache: Arc<DocumentCache>,
}

impl Collection {
    pub(crate) fn new(
        name: impl Into<String>,
        store: Arc<dyn PeerStore>,
        cache: Arc<DocumentCache>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn put(&self, key: &str, content: Value) -> EntglResult<Document> {
        let document = self.store.save_document(&self.name, key, content).await?;
        self.cache.set(document.clone());
        Ok(document)
    }

    pub async fn get(&self, key: &str) -> EntglResult<Option<Value>> {
        Ok(self.get_document(key).await?.map(|doc| doc.content))
    }

    pub async fn get_document(&self, key: &str) -> EntglResult<Option<Document>> {
        if let Some(cached) = self.cache.get(&self.name, key) {
            if cached.is_deleted {
                return Ok(None);
            }
            return Ok(Some(cached));
        }
        let document = self.store.get_document(&self.name, key).await?;
        if let Some(document) = &document {
            self.cache.set(document.clone());
        }
        Ok(document)
    }

    pub async fn delete(&self, key: &str) -> EntglResult<()> {
        self.store.delete_document(&self.name, key).await?;
        self.cache.remove(&self.name, key);
        Ok(())
    }

    pub async fn find(&self, filter: &Filter) -> EntglResult<Vec<Document>> {
        self.store.query_documents(&self.name, filter).await
    }

    pub async fn count(&self, filter: Option<&Filter>) -> EntglResult<usize> {
        self.store.count_documents(&self.name, filter).await
    }
}

/// Typed view over a collection: entities serialize through serde, so any
/// per-field rename attributes decide the stored property names, and the
/// predicate paths match the serialized form.
pub struct TypedCollection<T> {
    collection: Collection,
    descriptor: EntityDescriptor,
    _entity: PhantomData<fn() -> T>,
}

impl<T> TypedCollection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(collection: Collection, descriptor: EntityDescriptor) -> Self {
        Self {
            collection,
            descriptor,
            _entity: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// Keyless put: the key comes from the entity's primary-key field, with
    /// UUID generation when the descriptor allows it. Returns the key used.
    pub async fn put(&self, entity: &T) -> EntglResult<String> {
        let mut content = serde_json::to_value(entity)?;
        let key = self.descriptor.extract_key(&mut content)?;
        self.collection.put(&key, content).await?;
        Ok(key)
    }

    pub async fn put_with_key(&self, key: &str, entity: &T) -> EntglResult<()> {
        let content = serde_json::to_value(entity)?;
        self.collection.put(key, content).await?;
        Ok(())
    }

    /// Absent keys (and tombstones) read as `None`.
    pub async fn get(&self, key: &str) -> EntglResult<Option<T>> {
        match self.collection.get(key).await? {
            Some(content) => Ok(Some(serde_json::from_value(content)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> EntglResult<()> {
        self.collection.delete(key).await
    }

    pub async fn find(&self, filter: &Filter) -> EntglResult<Vec<T>> {
        let documents = self.collection.find(filter).await?;
        documents
            .into_iter()
            .map(|doc| serde_json::from_value(doc.content).map_err(Into::into))
            .collect()
    }
}
