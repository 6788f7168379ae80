use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Document, DocumentStore, Filter, FindOptions, IndexSpec, ReplaceSession, index_key};

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    fn check_unique(&self, docs: &[Document]) -> Result<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let mut seen = HashSet::new();
            for doc in docs {
                let key = index_key(index, doc);
                if !seen.insert(key.clone()) {
                    bail!("duplicate key on unique index {}: {}", index.name, key);
                }
            }
        }
        Ok(())
    }
}

/// Keeps every collection in process memory.
///
/// Unique indexes are enforced the same way as in the SQLite store, so tests
/// against this store see the same constraint failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<HashMap<String, Collection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> Result<()> {
        let mut collections = self.lock()?;
        let coll = collections.entry(collection.to_string()).or_default();
        if coll.indexes.iter().any(|i| i.name == index.name) {
            return Ok(());
        }
        coll.indexes.push(index.clone());
        if let Err(e) = coll.check_unique(&coll.docs) {
            coll.indexes.pop();
            return Err(e);
        }
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<u64> {
        let mut collections = self.lock()?;
        let coll = collections.entry(collection.to_string()).or_default();
        let count = docs.len() as u64;
        let mut next = coll.docs.clone();
        next.extend(docs);
        coll.check_unique(&next)?;
        coll.docs = next;
        Ok(count)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut collections = self.lock()?;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = coll.docs.len();
        coll.docs.retain(|doc| !filter.matches(doc));
        Ok((before - coll.docs.len()) as u64)
    }

    async fn upsert_one(&self, collection: &str, filter: &Filter, set: Document) -> Result<()> {
        let mut collections = self.lock()?;
        let coll = collections.entry(collection.to_string()).or_default();
        let mut next = coll.docs.clone();

        match next.iter_mut().find(|doc| filter.matches(doc)) {
            Some(doc) => doc.extend(set),
            None => {
                let mut doc: Document = filter
                    .clauses()
                    .iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect();
                doc.extend(set);
                next.push(doc);
            }
        }

        coll.check_unique(&next)?;
        coll.docs = next;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let collections = self.lock()?;
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .docs
            .iter()
            .filter(|doc| filter.matches(doc))
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|doc| options.apply_projection(doc.clone()))
            .collect())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let collections = self.lock()?;
        Ok(collections
            .get(collection)
            .map(|coll| coll.docs.iter().filter(|doc| filter.matches(doc)).count())
            .unwrap_or(0) as u64)
    }

    async fn begin_replace(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<Box<dyn ReplaceSession>> {
        Ok(Box::new(MemoryReplace {
            store: self.clone(),
            collection: collection.to_string(),
            filter,
            staged: Vec::new(),
        }))
    }
}

struct MemoryReplace {
    store: MemoryStore,
    collection: String,
    filter: Filter,
    staged: Vec<Document>,
}

#[async_trait]
impl ReplaceSession for MemoryReplace {
    async fn insert_many(&mut self, docs: Vec<Document>) -> Result<()> {
        self.staged.extend(docs);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let MemoryReplace {
            store,
            collection,
            filter,
            staged,
        } = *self;

        let mut collections = store.lock()?;
        let coll = collections.entry(collection).or_default();
        let count = staged.len() as u64;

        let mut next: Vec<Document> = coll
            .docs
            .iter()
            .filter(|doc| !filter.matches(doc))
            .cloned()
            .collect();
        next.extend(staged);

        coll.check_unique(&next)?;
        coll.docs = next;
        Ok(count)
    }
}
