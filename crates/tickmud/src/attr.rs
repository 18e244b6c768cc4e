//! Attribute descriptors: the fixed, typed schema each entity kind registers
//! at startup.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

use serde_json::Value as Json;

use crate::entity::EntityId;
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Bool,
    Int,
    Text,
    TextList,
    EntityRef,
}

impl AttrType {
    /// Default used when a descriptor does not name one.
    pub fn zero(self) -> Value {
        match self {
            AttrType::Bool => Value::Bool(false),
            AttrType::Int => Value::Int(0),
            AttrType::Text => Value::Text(String::new()),
            AttrType::TextList => Value::TextList(Vec::new()),
            AttrType::EntityRef => Value::EntityRef(None),
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttrType::Bool => "bool",
            AttrType::Int => "int",
            AttrType::Text => "text",
            AttrType::TextList => "text list",
            AttrType::EntityRef => "entity ref",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    TextList(Vec<String>),
    EntityRef(Option<EntityId>),
}

impl Value {
    pub fn ty(&self) -> AttrType {
        match self {
            Value::Bool(_) => AttrType::Bool,
            Value::Int(_) => AttrType::Int,
            Value::Text(_) => AttrType::Text,
            Value::TextList(_) => AttrType::TextList,
            Value::EntityRef(_) => AttrType::EntityRef,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::TextList(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            Value::EntityRef(r) => *r,
            _ => None,
        }
    }

    /// Plain JSON form used when a descriptor has no serializer override.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Text(s) => Json::String(s.clone()),
            Value::TextList(l) => Json::Array(l.iter().cloned().map(Json::String).collect()),
            Value::EntityRef(None) => Json::Null,
            Value::EntityRef(Some(id)) => Json::String(id.encode()),
        }
    }

    pub fn from_json(ty: AttrType, j: &Json) -> Option<Value> {
        match ty {
            AttrType::Bool => j.as_bool().map(Value::Bool),
            AttrType::Int => j.as_i64().map(Value::Int),
            AttrType::Text => j.as_str().map(|s| Value::Text(s.to_string())),
            AttrType::TextList => j
                .as_array()?
                .iter()
                .map(|x| x.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Value::TextList),
            AttrType::EntityRef => match j {
                Json::Null => Some(Value::EntityRef(None)),
                Json::String(s) => EntityId::decode(s).map(|id| Value::EntityRef(Some(id))),
                _ => None,
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<String>> for Value {
    fn from(l: Vec<String>) -> Self {
        Value::TextList(l)
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        Value::EntityRef(Some(id))
    }
}

impl From<Option<EntityId>> for Value {
    fn from(id: Option<EntityId>) -> Self {
        Value::EntityRef(id)
    }
}

pub type Validator = fn(&Value) -> Result<(), String>;

/// Replaces the plain JSON form of one attribute in stored records.
#[derive(Clone, Copy)]
pub struct Serializer {
    pub encode: fn(&Value) -> Json,
    pub decode: fn(&Json) -> Option<Value>,
}

#[derive(Clone)]
pub struct AttrDescriptor {
    name: &'static str,
    ty: AttrType,
    default: Value,
    validator: Option<Validator>,
    serializer: Option<Serializer>,
}

impl fmt::Debug for AttrDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttrDescriptor")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("default", &self.default)
            .field("validator", &self.validator.is_some())
            .field("serializer", &self.serializer.is_some())
            .finish()
    }
}

impl AttrDescriptor {
    pub fn new(name: &'static str, ty: AttrType) -> Self {
        Self {
            name,
            ty,
            default: ty.zero(),
            validator: None,
            serializer: None,
        }
    }

    pub fn default_value(mut self, v: impl Into<Value>) -> Self {
        self.default = v.into();
        self
    }

    pub fn validator(mut self, f: Validator) -> Self {
        self.validator = Some(f);
        self
    }

    pub fn serializer(mut self, s: Serializer) -> Self {
        self.serializer = Some(s);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ty(&self) -> AttrType {
        self.ty
    }

    pub fn default(&self) -> &Value {
        &self.default
    }

    pub fn check_type(&self, v: &Value) -> Result<(), ValidationError> {
        if v.ty() != self.ty {
            return Err(ValidationError::WrongType {
                attr: self.name.to_string(),
                expected: self.ty,
                got: v.ty(),
            });
        }
        Ok(())
    }

    /// Type check plus the registered validator.
    pub fn check(&self, v: &Value) -> Result<(), ValidationError> {
        self.check_type(v)?;
        if let Some(f) = self.validator {
            f(v).map_err(|reason| ValidationError::Rejected {
                attr: self.name.to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    pub fn encode(&self, v: &Value) -> Json {
        match self.serializer {
            Some(s) => (s.encode)(v),
            None => v.to_json(),
        }
    }

    /// `None` when the stored form does not fit the declared type.
    pub fn decode(&self, j: &Json) -> Option<Value> {
        let v = match self.serializer {
            Some(s) => (s.decode)(j)?,
            None => Value::from_json(self.ty, j)?,
        };
        (v.ty() == self.ty).then_some(v)
    }
}

/// Descriptor table for one entity kind.
#[derive(Debug, Clone)]
pub struct KindSchema {
    kind: &'static str,
    code: char,
    attrs: Vec<AttrDescriptor>,
}

impl KindSchema {
    /// `code` is the single letter used in front of ids in logs (`R-...`).
    pub fn new(kind: &'static str, code: char) -> Self {
        Self {
            kind,
            code,
            attrs: Vec::new(),
        }
    }

    pub fn attr(mut self, d: AttrDescriptor) -> Self {
        self.attrs.push(d);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn code(&self) -> char {
        self.code
    }

    pub fn get(&self, name: &str) -> Option<&AttrDescriptor> {
        self.attrs.iter().find(|d| d.name == name)
    }

    pub fn attrs(&self) -> &[AttrDescriptor] {
        &self.attrs
    }

    pub fn defaults(&self) -> BTreeMap<String, Value> {
        self.attrs
            .iter()
            .map(|d| (d.name.to_string(), d.default.clone()))
            .collect()
    }
}

/// Every registered kind. Filled during startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct Schemas {
    kinds: HashMap<&'static str, KindSchema>,
}

impl Schemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: KindSchema) -> Result<(), ValidationError> {
        if self.kinds.contains_key(schema.kind) {
            return Err(ValidationError::DuplicateKind(schema.kind.to_string()));
        }
        for (i, d) in schema.attrs.iter().enumerate() {
            if schema.attrs[..i].iter().any(|p| p.name == d.name) {
                return Err(ValidationError::Rejected {
                    attr: d.name.to_string(),
                    reason: format!("declared twice on {}", schema.kind),
                });
            }
            d.check_type(&d.default)?;
        }
        self.kinds.insert(schema.kind, schema);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Result<&KindSchema, ValidationError> {
        self.kinds
            .get(kind)
            .ok_or_else(|| ValidationError::UnknownKind(kind.to_string()))
    }
}

pub fn not_blank(v: &Value) -> Result<(), String> {
    match v.as_text() {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err("must not be blank".to_string()),
    }
}

pub fn non_negative(v: &Value) -> Result<(), String> {
    match v.as_int() {
        Some(i) if i >= 0 => Ok(()),
        _ => Err("must be zero or more".to_string()),
    }
}
