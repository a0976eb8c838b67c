//! Identity persistence boundary.
//!
//! The tracker never owns identities; it reads them through
//! [`EmbeddingStore::load_all_embeddings`] and writes decisions back. Two
//! implementations ship with the crate: an in-memory map and a JSON file that
//! is rewritten after every mutation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::utils::Embedding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(pub u64);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub vector: Embedding,
    pub quality: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPerson {
    pub name: String,
    pub embeddings: Vec<StoredEmbedding>,
}

impl StoredPerson {
    pub fn embedding_count(&self) -> usize {
        self.embeddings.len()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown person {0}")]
    UnknownPerson(PersonId),
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("store format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

pub trait EmbeddingStore {
    fn load_all_embeddings(&self) -> Result<BTreeMap<PersonId, StoredPerson>, StoreError>;

    fn save_new_embedding(&mut self, person: PersonId, embedding: &Embedding, quality: f32) -> Result<(), StoreError>;

    fn create_person(&mut self, name: &str, embedding: &Embedding, quality: f32) -> Result<PersonId, StoreError>;

    fn set_active_person(&mut self, person: PersonId) -> Result<(), StoreError>;

    fn active_person(&self) -> Result<Option<PersonId>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    people: BTreeMap<PersonId, StoredPerson>,
    next_id: u64,
    active: Option<PersonId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a person with several embeddings at once.
    pub fn insert_person(&mut self, name: &str, embeddings: Vec<StoredEmbedding>) -> PersonId {
        self.next_id += 1;
        let id = PersonId(self.next_id);
        self.people.insert(id, StoredPerson { name: name.to_string(), embeddings });
        id
    }

    pub fn person(&self, id: PersonId) -> Option<&StoredPerson> {
        self.people.get(&id)
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }
}

impl EmbeddingStore for MemoryStore {
    fn load_all_embeddings(&self) -> Result<BTreeMap<PersonId, StoredPerson>, StoreError> {
        Ok(self.people.clone())
    }

    fn save_new_embedding(&mut self, person: PersonId, embedding: &Embedding, quality: f32) -> Result<(), StoreError> {
        let entry = self.people.get_mut(&person).ok_or(StoreError::UnknownPerson(person))?;
        entry.embeddings.push(StoredEmbedding { vector: embedding.clone(), quality });
        Ok(())
    }

    fn create_person(&mut self, name: &str, embedding: &Embedding, quality: f32) -> Result<PersonId, StoreError> {
        let id = self.insert_person(name, vec![StoredEmbedding { vector: embedding.clone(), quality }]);
        self.active = Some(id);
        Ok(id)
    }

    fn set_active_person(&mut self, person: PersonId) -> Result<(), StoreError> {
        if !self.people.contains_key(&person) {
            return Err(StoreError::UnknownPerson(person));
        }
        self.active = Some(person);
        Ok(())
    }

    fn active_person(&self) -> Result<Option<PersonId>, StoreError> {
        Ok(self.active)
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    active: Option<PersonId>,
    people: Vec<PersonRecord>,
}

#[derive(Serialize, Deserialize)]
struct PersonRecord {
    id: PersonId,
    name: String,
    embeddings: Vec<EmbeddingRecord>,
}

#[derive(Serialize, Deserialize)]
struct EmbeddingRecord {
    vector: Vec<f32>,
    quality: f32,
}

/// [`MemoryStore`] persisted as a JSON document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    /// Open an existing file, or start empty if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = if path.exists() {
            let snapshot: Snapshot = serde_json::from_str(&fs::read_to_string(&path)?)?;
            MemoryStore {
                next_id: snapshot.next_id,
                active: snapshot.active,
                people: snapshot
                    .people
                    .into_iter()
                    .map(|p| {
                        let embeddings = p
                            .embeddings
                            .into_iter()
                            .map(|e| StoredEmbedding { vector: Embedding::from_vec(e.vector), quality: e.quality })
                            .collect();
                        (p.id, StoredPerson { name: p.name, embeddings })
                    })
                    .collect(),
            }
        } else {
            MemoryStore::new()
        };
        debug!(path = %path.display(), people = inner.len(), "opened embedding store");
        Ok(Self { path, inner })
    }

    pub fn people(&self) -> impl Iterator<Item = (PersonId, &StoredPerson)> {
        self.inner.people.iter().map(|(id, p)| (*id, p))
    }

    fn flush(&self) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            next_id: self.inner.next_id,
            active: self.inner.active,
            people: self
                .inner
                .people
                .iter()
                .map(|(id, p)| PersonRecord {
                    id: *id,
                    name: p.name.clone(),
                    embeddings: p
                        .embeddings
                        .iter()
                        .map(|e| EmbeddingRecord { vector: e.vector.as_slice().to_vec(), quality: e.quality })
                        .collect(),
                })
                .collect(),
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl EmbeddingStore for JsonFileStore {
    fn load_all_embeddings(&self) -> Result<BTreeMap<PersonId, StoredPerson>, StoreError> {
        self.inner.load_all_embeddings()
    }

    fn save_new_embedding(&mut self, person: PersonId, embedding: &Embedding, quality: f32) -> Result<(), StoreError> {
        self.inner.save_new_embedding(person, embedding, quality)?;
        self.flush()
    }

    fn create_person(&mut self, name: &str, embedding: &Embedding, quality: f32) -> Result<PersonId, StoreError> {
        let id = self.inner.create_person(name, embedding, quality)?;
        self.flush()?;
        Ok(id)
    }

    fn set_active_person(&mut self, person: PersonId) -> Result<(), StoreError> {
        self.inner.set_active_person(person)?;
        self.flush()
    }

    fn active_person(&self) -> Result<Option<PersonId>, StoreError> {
        self.inner.active_person()
    }
}
