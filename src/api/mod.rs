mod collection;
mod entity;

pub use collection::{Collection, TypedCollection};
pub use entity::{describe, Entity, EntityDescriptor};

use std::sync::Arc;

use crate::cache::DocumentCache;
use crate::error::EntglResult;
use crate::store::PeerStore;

/// Application-facing database handle: named collections of JSON documents
/// with typed views on top.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn PeerStore>,
    cache: Arc<DocumentCache>,
}

impl Database {
    pub fn new(store: Arc<dyn PeerStore>, cache: Arc<DocumentCache>) -> Self {
        Self { store, cache }
    }

    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection::new(name, Arc::clone(&self.store), Arc::clone(&self.cache))
    }

    /// Typed view using `T`'s own descriptor.
    pub fn typed<T: Entity>(&self) -> TypedCollection<T> {
        let descriptor = T::descriptor();
        let collection = self.collection(descriptor.collection().to_owned());
        TypedCollection::new(collection, descriptor)
    }

    /// Typed view with an explicit descriptor, for types without an `Entity`
    /// implementation or with a custom collection name.
    pub fn typed_with<T>(&self, descriptor: EntityDescriptor) -> TypedCollection<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let collection = self.collection(descriptor.collection().to_owned());
        TypedCollection::new(collection, descriptor)
    }

    pub async fn collections(&self) -> EntglResult<Vec<String>> {
        self.store.get_collections().await
    }

    pub async fn ensure_index(&self, collection: &str, path: &str) -> EntglResult<()> {
        self.store.ensure_index(collection, path).await
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    pub fn store(&self) -> &Arc<dyn PeerStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::entity::describe;
    use crate::store::MemoryPeerStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Todo {
        id: String,
        title: String,
        done: bool,
    }

    impl Entity for Todo {
        fn descriptor() -> EntityDescriptor {
            describe::<Todo>().primary_key("id").auto_generate()
        }
    }

    fn database() -> Database {
        Database::new(
            Arc::new(MemoryPeerStore::new("node-a")),
            Arc::new(DocumentCache::new(32)),
        )
    }

    #[tokio::test]
    async fn typed_collections_default_to_lowercase_type_names() {
        let db = database();
        let todos = db.typed::<Todo>();
        todos
            .put(&Todo {
                id: "t1".to_owned(),
                title: "write docs".to_owned(),
                done: false,
            })
            .await
            .unwrap();

        assert_eq!(db.collections().await.unwrap(), vec!["todo".to_owned()]);
        let loaded = todos.get("t1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "write docs");
    }

    #[tokio::test]
    async fn untyped_and_typed_views_share_state() {
        let db = database();
        db.collection("todo")
            .put("t9", json!({"id": "t9", "title": "shared", "done": true}))
            .await
            .unwrap();

        let typed = db.typed::<Todo>();
        let loaded = typed.get("t9").await.unwrap().unwrap();
        assert!(loaded.done);
    }
}
