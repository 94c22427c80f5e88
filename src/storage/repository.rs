//! Typed repositories over the key-value store
//!
//! Each entity type owns its collection (one JSON array per owner stored under
//! `<collection>:<owner_id>`) and declares explicit filter and sort types, so
//! callers page through data with typed parameters instead of predicates.

use super::{KeyValueStore, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A locally stored domain object
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name, used as the storage key prefix
    const COLLECTION: &'static str;

    /// Typed filter accepted by `Repository::list`
    type Filter: Default + Send + Sync;

    /// Fields the collection can be sorted by
    type SortField: Copy + Send + Sync;

    fn id(&self) -> &str;

    fn owner_id(&self) -> &str;

    fn matches(&self, filter: &Self::Filter) -> bool;

    fn compare_by(&self, other: &Self, field: Self::SortField) -> Ordering;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter, sort and pagination parameters for one owner's collection
pub struct ListQuery<E: Entity> {
    pub owner_id: String,
    pub filter: E::Filter,
    pub sort: Option<(E::SortField, SortOrder)>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl<E: Entity> ListQuery<E> {
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            filter: E::Filter::default(),
            sort: None,
            offset: 0,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: E::Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort_by(mut self, field: E::SortField, order: SortOrder) -> Self {
        self.sort = Some((field, order));
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// One page of query results
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matches before pagination
    pub total: usize,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

/// Repository for one entity type
pub struct Repository<E: Entity> {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            write_lock: Arc::clone(&self.write_lock),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
            _entity: PhantomData,
        }
    }

    fn collection_key(owner_id: &str) -> String {
        format!("{}:{}", E::COLLECTION, owner_id)
    }

    /// Every entity of an owner, in stored order (newest first)
    pub async fn all(&self, owner_id: &str) -> Result<Vec<E>, StorageError> {
        Ok(self
            .store
            .load::<Vec<E>>(&Self::collection_key(owner_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn list(&self, query: &ListQuery<E>) -> Result<Page<E>, StorageError> {
        let mut items: Vec<E> = self
            .all(&query.owner_id)
            .await?
            .into_iter()
            .filter(|e| e.matches(&query.filter))
            .collect();

        if let Some((field, order)) = query.sort {
            items.sort_by(|a, b| {
                let ord = a.compare_by(b, field);
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }

        let total = items.len();
        let items = items
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(Page {
            items,
            total,
            offset: query.offset,
            limit: query.limit,
        })
    }

    pub async fn get(&self, owner_id: &str, id: &str) -> Result<Option<E>, StorageError> {
        Ok(self.all(owner_id).await?.into_iter().find(|e| e.id() == id))
    }

    /// Insert or replace by id; new entities go to the front
    pub async fn upsert(&self, entity: E) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let owner_id = entity.owner_id().to_string();
        let mut items = self.all(&owner_id).await?;

        match items.iter_mut().find(|e| e.id() == entity.id()) {
            Some(existing) => *existing = entity,
            None => items.insert(0, entity),
        }

        self.store.save(&Self::collection_key(&owner_id), &items).await
    }

    /// Remove by id, returning the removed entity
    pub async fn remove(&self, owner_id: &str, id: &str) -> Result<Option<E>, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.all(owner_id).await?;

        let Some(pos) = items.iter().position(|e| e.id() == id) else {
            return Ok(None);
        };
        let removed = items.remove(pos);

        self.store.save(&Self::collection_key(owner_id), &items).await?;
        Ok(Some(removed))
    }

    pub async fn replace_all(&self, owner_id: &str, items: Vec<E>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.store.save(&Self::collection_key(owner_id), &items).await
    }

    pub async fn count(&self, owner_id: &str) -> Result<usize, StorageError> {
        Ok(self.all(owner_id).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Bookmark, BookmarkFilter, BookmarkSort, Conversation, ConversationFilter,
        ConversationSort, Note, NoteFilter, NoteSort,
    };
    use crate::storage::MemoryKeyValueStore;

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryKeyValueStore::new())
    }

    fn bookmark(id: &str, title: &str, folder: Option<&str>, tags: &[&str]) -> Bookmark {
        let mut b = Bookmark::new("user-1", title, &format!("https://example.com/{}", id));
        b.id = id.to_string();
        b.folder = folder.map(String::from);
        b.tags = tags.iter().map(|t| t.to_string()).collect();
        b
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let repo: Repository<Bookmark> = Repository::new(store());

        repo.upsert(bookmark("a", "Rust", None, &[])).await.unwrap();
        repo.upsert(bookmark("b", "Tokio", None, &[])).await.unwrap();

        let mut updated = bookmark("a", "Rust Book", None, &[]);
        updated.version = 2;
        repo.upsert(updated).await.unwrap();

        let all = repo.all("user-1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "b");

        let a = repo.get("user-1", "a").await.unwrap().unwrap();
        assert_eq!(a.title, "Rust Book");
        assert_eq!(a.version, 2);
    }

    #[tokio::test]
    async fn test_owners_are_isolated() {
        let repo: Repository<Bookmark> = Repository::new(store());
        repo.upsert(bookmark("a", "Mine", None, &[])).await.unwrap();

        assert_eq!(repo.count("user-1").await.unwrap(), 1);
        assert_eq!(repo.count("user-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_filter_sort_paginate() {
        let repo: Repository<Bookmark> = Repository::new(store());
        repo.upsert(bookmark("1", "Charlie", Some("work"), &["rust"])).await.unwrap();
        repo.upsert(bookmark("2", "Alpha", Some("work"), &["rust", "async"])).await.unwrap();
        repo.upsert(bookmark("3", "Bravo", Some("home"), &["rust"])).await.unwrap();
        repo.upsert(bookmark("4", "Delta", Some("work"), &["go"])).await.unwrap();

        let query = ListQuery::<Bookmark>::for_owner("user-1")
            .filter(BookmarkFilter {
                folder: Some("work".to_string()),
                tag: Some("rust".to_string()),
                ..Default::default()
            })
            .sort_by(BookmarkSort::Title, SortOrder::Ascending)
            .page(0, 1);

        let page = repo.list(&query).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].title, "Alpha");
        assert!(page.has_more());

        let second = repo.list(&query.page(1, 1)).await.unwrap();
        assert_eq!(second.items[0].title, "Charlie");
        assert!(!second.has_more());
    }

    #[tokio::test]
    async fn test_search_filter() {
        let repo: Repository<Bookmark> = Repository::new(store());
        repo.upsert(bookmark("1", "The Rust Programming Language", None, &[])).await.unwrap();
        repo.upsert(bookmark("2", "Python docs", None, &[])).await.unwrap();

        let query = ListQuery::<Bookmark>::for_owner("user-1").filter(BookmarkFilter {
            search: Some("rust".to_string()),
            ..Default::default()
        });

        let page = repo.list(&query).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, "1");
    }

    #[tokio::test]
    async fn test_remove() {
        let repo: Repository<Bookmark> = Repository::new(store());
        repo.upsert(bookmark("a", "A", None, &[])).await.unwrap();

        let removed = repo.remove("user-1", "a").await.unwrap();
        assert_eq!(removed.map(|b| b.id), Some("a".to_string()));
        assert!(repo.remove("user-1", "a").await.unwrap().is_none());
        assert_eq!(repo.count("user-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_notes_pinned_first() {
        let repo: Repository<Note> = Repository::new(store());
        let mut a = Note::new("user-1", "Groceries", "milk");
        a.id = "a".to_string();
        let mut b = Note::new("user-1", "Ideas", "offline sync");
        b.id = "b".to_string();
        b.pinned = true;
        repo.upsert(a).await.unwrap();
        repo.upsert(b).await.unwrap();

        let query = ListQuery::<Note>::for_owner("user-1")
            .sort_by(NoteSort::PinnedFirst, SortOrder::Ascending);
        let page = repo.list(&query).await.unwrap();
        assert_eq!(page.items[0].id, "b");

        let pinned_only = ListQuery::<Note>::for_owner("user-1").filter(NoteFilter {
            pinned: Some(true),
            ..Default::default()
        });
        assert_eq!(repo.list(&pinned_only).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_conversations_archived_filter() {
        let repo: Repository<Conversation> = Repository::new(store());
        let mut active = Conversation::new("user-1", "Summaries");
        active.id = "c1".to_string();
        let mut old = Conversation::new("user-1", "Old chat");
        old.id = "c2".to_string();
        old.archived = true;
        repo.upsert(active).await.unwrap();
        repo.upsert(old).await.unwrap();

        let query = ListQuery::<Conversation>::for_owner("user-1")
            .filter(ConversationFilter {
                archived: Some(false),
                ..Default::default()
            })
            .sort_by(ConversationSort::Title, SortOrder::Descending);

        let page = repo.list(&query).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, "c1");
    }
}
