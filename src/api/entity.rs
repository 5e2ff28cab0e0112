use serde_json::{Map, Value};

use crate::error::{config_error, EntglResult};

/// Compile-time entity metadata: where a type lives and how its primary key
/// is found. Built explicitly instead of scanned from attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityDescriptor {
    collection: String,
    primary_key: Option<String>,
    auto_generate: bool,
    indexed: Vec<String>,
}

impl EntityDescriptor {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn indexed(&self) -> &[String] {
        &self.indexed
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = Some(field.into());
        self
    }

    /// Generates a UUID v4 when the key field is empty or absent.
    pub fn auto_generate(mut self) -> Self {
        self.auto_generate = true;
        self
    }

    pub fn indexed_path(mut self, path: impl Into<String>) -> Self {
        self.indexed.push(path.into());
        self
    }

    pub fn named(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// The field holding the primary key: the declared one, or by convention
    /// `id` / `{collection}_id` when present in the serialized entity.
    fn key_field(&self, object: &Map<String, Value>) -> Option<String> {
        if let Some(declared) = &self.primary_key {
            return Some(declared.clone());
        }
        if object.contains_key("id") {
            return Some("id".to_owned());
        }
        let conventional = format!("{}_id", self.collection);
        if object.contains_key(&conventional) {
            return Some(conventional);
        }
        None
    }

    /// Extracts (or generates) the key for a keyless put, mutating the
    /// serialized entity when a key is generated.
    pub fn extract_key(&self, content: &mut Value) -> EntglResult<String> {
        let object = content.as_object_mut().ok_or_else(|| {
            config_error("keyless put requires the entity to serialize as a JSON object")
        })?;

        let field = match self.key_field(object) {
            Some(field) => field,
            None if self.auto_generate => self
                .primary_key
                .clone()
                .unwrap_or_else(|| "id".to_owned()),
            None => {
                return Err(config_error(format!(
                    "no primary key declared or detected for collection `{}`",
                    self.collection
                )))
            }
        };

        let current = object.get(&field).and_then(Value::as_str).unwrap_or("");
        if !current.is_empty() {
            return Ok(current.to_owned());
        }

        if !self.auto_generate {
            return Err(config_error(format!(
                "entity for `{}` has an empty `{field}` and key generation is off",
                self.collection
            )));
        }
        let generated = uuid::Uuid::new_v4().to_string();
        object.insert(field, Value::String(generated.clone()));
        Ok(generated)
    }
}

/// Starts a descriptor for `T`, defaulting the collection to the lowercased
/// type name.
pub fn describe<T>() -> EntityDescriptor {
    let full = std::any::type_name::<T>();
    let name = full.rsplit("::").next().unwrap_or(full);
    EntityDescriptor {
        collection: name.to_ascii_lowercase(),
        primary_key: None,
        auto_generate: false,
        indexed: Vec::new(),
    }
}

/// Types that know their own storage layout. The default descriptor uses the
/// lowercase type name and key-field conventions.
pub trait Entity: serde::Serialize + serde::de::DeserializeOwned {
    fn descriptor() -> EntityDescriptor;
}
