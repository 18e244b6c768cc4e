use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::attr::Schemas;
use crate::attr::Value;
use crate::codec::Codec;
use crate::entity::Entity;
use crate::entity::EntityId;
use crate::entity::IdGen;
use crate::error::{Error, StorageError, ValidationError};

/// Key/value persistence under the entity codec.
pub trait Backend: Send {
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Removing a missing key is not an error.
    fn delete(&mut self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// One JSON file per entity: `<dir>/<id>.json`, replaced atomically.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(StorageError::BadKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl Backend for FileBackend {
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path(key)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(self.path(key)?) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for ent in std::fs::read_dir(&self.dir)? {
            let path = ent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, Vec<u8>>,
    failing_puts: u32,
}

/// In-memory backend. Clones share the same records, which lets two stores
/// (say, a core and its reload successor) see one "disk".
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail as if the store were unreachable.
    pub fn fail_next_puts(&self, n: u32) {
        self.state().failing_puts = n;
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for MemoryBackend {
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut st = self.state();
        if st.failing_puts > 0 {
            st.failing_puts -= 1;
            return Err(StorageError::Unavailable("injected write failure".to_string()));
        }
        st.records.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.state().records.get(key).cloned())
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.state().records.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.state().records.keys().cloned().collect())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct SaveReport {
    pub saved: usize,
    pub failed: Vec<(EntityId, String)>,
}

/// Longest pause [`EntityStore::save`] may take before its retry. The pause
/// blocks the control loop, so it stays short.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Owns every live entity. Runs on the control-loop thread only; there is no
/// locking inside.
pub struct EntityStore {
    schemas: Arc<Schemas>,
    codec: Box<dyn Codec>,
    backend: Box<dyn Backend>,
    entities: HashMap<EntityId, Entity>,
    ids: IdGen,
    retry_backoff: Duration,
}

impl EntityStore {
    pub fn new(
        schemas: Arc<Schemas>,
        codec: Box<dyn Codec>,
        backend: Box<dyn Backend>,
        node_id: Option<&str>,
    ) -> Self {
        Self {
            schemas,
            codec,
            backend,
            entities: HashMap::new(),
            ids: IdGen::new(node_id),
            retry_backoff: Duration::from_millis(20),
        }
    }

    /// Pause before the single retry of a failed write, capped at
    /// [`MAX_RETRY_BACKOFF`].
    pub fn retry_backoff(mut self, d: Duration) -> Self {
        self.retry_backoff = d.min(MAX_RETRY_BACKOFF);
        self
    }

    pub fn schemas(&self) -> &Schemas {
        &self.schemas
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// `R-0abc...` style label for logs.
    pub fn label(&self, id: EntityId) -> String {
        let code = self
            .entities
            .get(&id)
            .and_then(|e| self.schemas.get(e.kind()).ok())
            .map(|s| s.code())
            .unwrap_or('?');
        format!("{code}-{id}")
    }

    /// New entity of `kind` with a fresh id and every descriptor default.
    pub fn create(&mut self, kind: &str) -> Result<&mut Entity, ValidationError> {
        let schema = self.schemas.get(kind)?;
        let id = self.ids.next_id(now_unix_ms());
        let e = Entity::new(id, schema.kind(), schema.defaults());
        debug!(entity = %id, kind, "created entity");
        Ok(self.entities.entry(id).or_insert(e))
    }

    pub fn get(&self, id: EntityId) -> Result<&Entity, StorageError> {
        self.entities.get(&id).ok_or(StorageError::NotFound(id))
    }

    pub fn get_mut(&mut self, id: EntityId) -> Result<&mut Entity, StorageError> {
        self.entities.get_mut(&id).ok_or(StorageError::NotFound(id))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Typed set: the value must match the declared type now; validators run
    /// at save time. Returns the previous value.
    pub fn set(&mut self, id: EntityId, name: &str, v: Value) -> Result<Value, Error> {
        let e = self.entities.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        let schema = self.schemas.get(e.kind())?;
        let d = schema.get(name).ok_or_else(|| ValidationError::UnknownAttr {
            kind: e.kind().to_string(),
            attr: name.to_string(),
        })?;
        d.check_type(&v)?;
        Ok(e.put(name, v).unwrap_or_else(|| d.default().clone()))
    }

    /// Validate and persist one entity.
    ///
    /// `Ok(false)` when the entity is not savable. On any error the entity
    /// stays dirty and nothing about it changes in memory.
    ///
    /// Runs on the caller's thread. A failed first write sleeps for the retry
    /// backoff before trying again, which stalls the loop for that long.
    pub fn save(&mut self, id: EntityId) -> Result<bool, Error> {
        let e = self.entities.get(&id).ok_or(StorageError::NotFound(id))?;
        if !e.is_savable() {
            return Ok(false);
        }
        let schema = self.schemas.get(e.kind())?;
        for d in schema.attrs() {
            d.check(e.get(d.name()).unwrap_or(d.default()))?;
        }
        let bytes = self.codec.encode(e)?;
        let key = id.encode();
        if let Err(first) = self.backend.put(&key, &bytes) {
            warn!(entity = %id, err = %first, "entity write failed; retrying once");
            std::thread::sleep(self.retry_backoff);
            self.backend.put(&key, &bytes)?;
        }
        if let Some(e) = self.entities.get_mut(&id) {
            e.mark_clean();
        }
        Ok(true)
    }

    /// Remove an entity from memory and storage. If the stored record cannot
    /// be removed the entity stays live.
    pub fn delete(&mut self, id: EntityId) -> Result<Entity, Error> {
        if !self.entities.contains_key(&id) {
            return Err(StorageError::NotFound(id).into());
        }
        self.backend.delete(&id.encode())?;
        self.entities
            .remove(&id)
            .ok_or_else(|| StorageError::NotFound(id).into())
    }

    /// Entities of `kind` matching `pred`, yielded lazily from a snapshot of
    /// ids taken now. Call again to restart.
    pub fn find<P>(&self, kind: &str, pred: P) -> Find<'_, P>
    where
        P: FnMut(&Entity) -> bool,
    {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        Find {
            store: self,
            ids: ids.into_iter(),
            kind: kind.to_string(),
            pred,
        }
    }

    pub fn dirty_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.is_dirty() && e.is_savable())
            .map(Entity::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn save_dirty(&mut self) -> SaveReport {
        let mut report = SaveReport::default();
        for id in self.dirty_ids() {
            match self.save(id) {
                Ok(_) => report.saved += 1,
                Err(e) => {
                    warn!(entity = %id, err = %e, "save failed; entity stays dirty");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        report
    }

    /// Read every stored entity into memory. Records that fail to decode are
    /// logged and left on disk.
    pub fn load_all(&mut self) -> Result<LoadReport, StorageError> {
        let mut report = LoadReport::default();
        for key in self.backend.keys()? {
            let decoded = match self.backend.get(&key) {
                Ok(Some(bytes)) => self.codec.decode(&bytes),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match decoded {
                Ok(e) => {
                    self.ids.observe(e.id());
                    self.entities.insert(e.id(), e);
                    report.loaded += 1;
                }
                Err(err) => {
                    warn!(key = %key, err = %err, "skipping unreadable entity record");
                    report.skipped += 1;
                }
            }
        }
        info!(loaded = report.loaded, skipped = report.skipped, "entities loaded");
        Ok(report)
    }
}

pub struct Find<'a, P> {
    store: &'a EntityStore,
    ids: std::vec::IntoIter<EntityId>,
    kind: String,
    pred: P,
}

impl<'a, P> Iterator for Find<'a, P>
where
    P: FnMut(&Entity) -> bool,
{
    type Item = &'a Entity;

    fn next(&mut self) -> Option<Self::Item> {
        let store = self.store;
        for id in self.ids.by_ref() {
            let Some(e) = store.entities.get(&id) else {
                continue;
            };
            if e.kind() == self.kind && (self.pred)(e) {
                return Some(e);
            }
        }
        None
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
