//! Message type descriptors and typed values
//!
//! Intents and resource instances are carried as [`TypedValue`]s: the name of
//! a message type plus its canonical JSON encoding. The shape of each type is
//! described by a [`MessageType`], looked up in the package that declares it
//! or in the loader's [`TypeRegistry`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Package references, written as `"pkg:name"` strings or objects
pub const PACKAGE_REF_TYPE: &str = "keel.schema.PackageRef";

/// File contents, written as a path relative to the package or
/// `{"inline": "..."}`
pub const FILE_CONTENTS_TYPE: &str = "keel.schema.FileContents";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Enum(Vec<String>),
    Message(String),
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub json_name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub repeated: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        FieldDescriptor {
            json_name: lower_camel(&name),
            name,
            kind,
            repeated: false,
        }
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    /// The JSON name, defaulting to the lowerCamelCase form of the name.
    pub fn json_name(&self) -> String {
        if self.json_name.is_empty() {
            lower_camel(&self.name)
        } else {
            self.json_name.clone()
        }
    }
}

fn lower_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Shape of a message type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageType {
    pub full_name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl MessageType {
    pub fn new(full_name: impl Into<String>) -> Self {
        MessageType {
            full_name: full_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Look a field up by JSON name, then by declared name.
    pub fn lookup_field(&self, key: &str) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.json_name() == key)
            .or_else(|| self.fields.iter().find(|f| f.name == key))
    }
}

/// Message types known independently of any package
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<MessageType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the well-known types.
    pub fn with_well_known() -> Self {
        let mut registry = TypeRegistry::new();
        registry.register(
            MessageType::new(PACKAGE_REF_TYPE)
                .field(FieldDescriptor::new("package_name", FieldKind::String))
                .field(FieldDescriptor::new("name", FieldKind::String)),
        );
        registry.register(
            MessageType::new(FILE_CONTENTS_TYPE)
                .field(FieldDescriptor::new("contents", FieldKind::Bytes))
                .field(FieldDescriptor::new("utf8", FieldKind::Bool)),
        );
        registry
    }

    pub fn register(&mut self, message: MessageType) {
        self.types.insert(message.full_name.clone(), Arc::new(message));
    }

    pub fn get(&self, full_name: &str) -> Option<Arc<MessageType>> {
        self.types.get(full_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// A resolved message type together with every message type it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserType {
    pub descriptor: Arc<MessageType>,
    pub dependencies: HashMap<String, Arc<MessageType>>,
}

impl UserType {
    /// Resolve `full_name`, looking in `declared` first and then in
    /// `registry`, and transitively resolve the message types its fields
    /// use.
    pub fn resolve(full_name: &str, declared: &[MessageType], registry: &TypeRegistry) -> Result<UserType> {
        let lookup = |name: &str| -> Option<Arc<MessageType>> {
            declared
                .iter()
                .find(|t| t.full_name == name)
                .map(|t| Arc::new(t.clone()))
                .or_else(|| registry.get(name))
        };

        let descriptor = lookup(full_name)
            .ok_or_else(|| Error::bad_input(format!("{}: no such type", full_name)))?;

        let mut dependencies = HashMap::new();
        let mut pending = vec![descriptor.clone()];
        while let Some(message) = pending.pop() {
            for field in &message.fields {
                if let FieldKind::Message(nested) = &field.kind {
                    if nested == &descriptor.full_name || dependencies.contains_key(nested) {
                        continue;
                    }
                    let resolved = lookup(nested).ok_or_else(|| {
                        Error::bad_input(format!(
                            "{}.{}: no such type {}",
                            message.full_name, field.name, nested
                        ))
                    })?;
                    dependencies.insert(nested.clone(), resolved.clone());
                    pending.push(resolved);
                }
            }
        }

        Ok(UserType {
            descriptor,
            dependencies,
        })
    }

    pub fn full_name(&self) -> &str {
        &self.descriptor.full_name
    }

    /// The descriptor of `full_name`, which must be this type or one of its
    /// dependencies.
    pub fn message(&self, full_name: &str) -> Option<&Arc<MessageType>> {
        if self.descriptor.full_name == full_name {
            Some(&self.descriptor)
        } else {
            self.dependencies.get(full_name)
        }
    }

    /// Canonicalize a dotted field selector. Each segment may use the JSON
    /// or the declared name; the result uses declared names.
    pub fn canonical_selector(&self, selector: &str) -> Result<String> {
        let mut message = &self.descriptor;
        let mut path = Vec::new();

        let segments: Vec<&str> = selector.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let field = message.lookup_field(segment).ok_or_else(|| {
                Error::bad_input(format!("{}: no such field {:?}", message.full_name, segment))
            })?;
            path.push(field.name.clone());

            if i + 1 < segments.len() {
                match &field.kind {
                    FieldKind::Message(nested) if !field.repeated => {
                        message = self.message(nested).ok_or_else(|| {
                            Error::internal(format!("{}: type {} was not resolved", self.full_name(), nested))
                        })?;
                    }
                    _ => {
                        return Err(Error::bad_input(format!(
                            "{}: field {:?} can't be traversed",
                            message.full_name, field.name
                        )))
                    }
                }
            }
        }

        Ok(path.join("."))
    }
}

/// A value of a message type, encoded as canonical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedValue {
    pub type_name: String,
    pub value: Vec<u8>,
}

impl TypedValue {
    pub fn from_json(type_name: impl Into<String>, value: &serde_json::Value) -> Result<Self> {
        let value = serde_json::to_vec(value)
            .map_err(|e| Error::internal(format!("failed to serialize value: {}", e)))?;
        Ok(TypedValue {
            type_name: type_name.into(),
            value,
        })
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.value)
            .map_err(|e| Error::internal(format!("{}: invalid value: {}", self.type_name, e)))
    }
}
