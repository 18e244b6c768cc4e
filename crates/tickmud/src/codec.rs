//! Versioned on-disk form of an entity.
//!
//! Current layout (v2):
//! `{"v":2,"id":"<id>","kind":"room","savable":true,"saved_at":"<rfc3339>","attrs":{..}}`
//!
//! v1 records (`{"v":1,"uid":..,"type":..,"data":{..}}`) are upgraded on read.
//! Anything newer than this build understands is refused, never truncated.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as Json;
use tracing::warn;

use crate::attr::Schemas;
use crate::entity::Entity;
use crate::entity::EntityId;
use crate::error::StorageError;

pub const CODEC_VERSION: u64 = 2;

pub trait Codec: Send {
    fn encode(&self, e: &Entity) -> Result<Vec<u8>, StorageError>;
    fn decode(&self, bytes: &[u8]) -> Result<Entity, StorageError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordV2 {
    v: u64,
    id: EntityId,
    kind: String,
    savable: bool,
    saved_at: String,
    attrs: Map<String, Json>,
}

#[derive(Debug, Deserialize)]
struct RecordV1 {
    uid: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Map<String, Json>,
}

#[derive(Debug, Clone)]
pub struct JsonCodec {
    schemas: Arc<Schemas>,
}

impl JsonCodec {
    pub fn new(schemas: Arc<Schemas>) -> Self {
        Self { schemas }
    }

    fn build(
        &self,
        id: EntityId,
        kind: String,
        savable: bool,
        stored: Map<String, Json>,
    ) -> Result<Entity, StorageError> {
        let schema = self
            .schemas
            .get(&kind)
            .map_err(|e| StorageError::Malformed(format!("{id}: {e}")))?;
        let mut attrs = schema.defaults();
        for (name, raw) in stored {
            let Some(d) = schema.get(&name) else {
                warn!(entity = %id, kind = %kind, attr = %name, "dropping unknown attribute");
                continue;
            };
            let v = d.decode(&raw).ok_or_else(|| {
                StorageError::Malformed(format!("{id}: {kind}.{name} does not decode as {}", d.ty()))
            })?;
            attrs.insert(name, v);
        }
        Ok(Entity::loaded(id, kind, attrs, savable))
    }
}

impl Codec for JsonCodec {
    fn encode(&self, e: &Entity) -> Result<Vec<u8>, StorageError> {
        let schema = self
            .schemas
            .get(e.kind())
            .map_err(|err| StorageError::Malformed(format!("{}: {err}", e.id())))?;
        let attrs = e
            .attrs()
            .iter()
            .filter_map(|(name, v)| schema.get(name).map(|d| (name.clone(), d.encode(v))))
            .collect();
        let rec = RecordV2 {
            v: CODEC_VERSION,
            id: e.id(),
            kind: e.kind().to_string(),
            savable: e.is_savable(),
            saved_at: chrono::Utc::now().to_rfc3339(),
            attrs,
        };
        Ok(serde_json::to_vec_pretty(&rec)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Entity, StorageError> {
        let raw: Json = serde_json::from_slice(bytes)?;
        let v = raw
            .get("v")
            .and_then(Json::as_u64)
            .ok_or_else(|| StorageError::Malformed("missing version".to_string()))?;
        match v {
            1 => {
                let rec: RecordV1 = serde_json::from_value(raw)?;
                // v1 uids were plain decimal numbers.
                let id = rec
                    .uid
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .map(EntityId)
                    .ok_or_else(|| StorageError::Malformed(format!("bad uid {:?}", rec.uid)))?;
                self.build(id, rec.kind, true, rec.data)
            }
            CODEC_VERSION => {
                let rec: RecordV2 = serde_json::from_value(raw)?;
                self.build(rec.id, rec.kind, rec.savable, rec.attrs)
            }
            other => Err(StorageError::UnsupportedVersion(other)),
        }
    }
}
