//! Typed intent values
//!
//! Converts the raw JSON a package supplies as a resource intent into the
//! canonical encoding of a message type: keys become declared field names,
//! enums become their value names, package references are resolved and
//! loaded, and file references are inlined.

use crate::error::{Error, Result};
use crate::module::Location;
use crate::schema::{
    FieldDescriptor, FieldKind, MessageType, PackageName, PackageRef, TypedValue, UserType,
    FILE_CONTENTS_TYPE, PACKAGE_REF_TYPE,
};
use serde_json::{Map, Value};

/// Where an intent is parsed
pub struct ParseContext<'a> {
    /// Package relative references and file paths are resolved against
    pub location: &'a Location,
    /// Called for every package a value references
    pub ensure_package: &'a dyn Fn(&PackageName) -> Result<()>,
}

/// Parse `value` as a `user_type` value.
pub fn allocate_intent(pctx: &ParseContext<'_>, user_type: &UserType, value: &Value) -> Result<TypedValue> {
    let canonical = allocate_message(pctx, user_type, &user_type.descriptor, value)?;
    TypedValue::from_json(user_type.full_name(), &canonical)
}

/// Parse `value` as a package reference, loading the referenced package.
pub fn allocate_package_ref(pctx: &ParseContext<'_>, value: &Value) -> Result<PackageRef> {
    let reference = match value {
        Value::String(s) => PackageRef::parse(&pctx.location.package_name, s)?,
        Value::Object(_) => serde_json::from_value::<PackageRef>(value.clone())
            .map_err(|e| Error::bad_input(format!("{}: {}", PACKAGE_REF_TYPE, e)))?,
        other => {
            return Err(Error::bad_input(format!(
                "{}: expected string or map, got {}",
                PACKAGE_REF_TYPE,
                kind_of(other)
            )))
        }
    };

    (pctx.ensure_package)(&reference.package_name)?;
    Ok(reference)
}

fn allocate_message(pctx: &ParseContext<'_>, ut: &UserType, message: &MessageType, value: &Value) -> Result<Value> {
    match message.full_name.as_str() {
        PACKAGE_REF_TYPE => {
            let reference = allocate_package_ref(pctx, value)?;
            return serde_json::to_value(reference)
                .map_err(|e| Error::internal(format!("failed to serialize package ref: {}", e)));
        }
        FILE_CONTENTS_TYPE => return allocate_file_contents(pctx, value),
        _ => {}
    }

    let Value::Object(entries) = value else {
        return Err(Error::bad_input(format!(
            "{}: expected map, got {}",
            message.full_name,
            kind_of(value)
        )));
    };

    let mut out = Map::new();
    for (key, v) in entries {
        let field = message.lookup_field(key).ok_or_else(|| {
            Error::bad_input(format!("{{{}}}.{:?}: no such field", message.full_name, key))
        })?;

        let allocated = allocate_value(pctx, ut, field, v).map_err(|e| {
            Error::bad_input(format!("{{{}}}.{:?}: {}", message.full_name, key, e))
        })?;

        out.insert(field.name.clone(), allocated);
    }

    Ok(Value::Object(out))
}

fn allocate_value(pctx: &ParseContext<'_>, ut: &UserType, field: &FieldDescriptor, value: &Value) -> Result<Value> {
    if field.kind == FieldKind::Map {
        return Err(Error::bad_input("maps not supported"));
    }

    if field.repeated {
        let Value::Array(items) = value else {
            return Err(Error::bad_input(format!("expected list, got {}", kind_of(value))));
        };

        let mut out = Vec::with_capacity(items.len());
        for (k, item) in items.iter().enumerate() {
            let allocated = allocate_single(pctx, ut, field, item)
                .map_err(|e| Error::bad_input(format!("[{}]: {}", k, e)))?;
            out.push(allocated);
        }
        return Ok(Value::Array(out));
    }

    allocate_single(pctx, ut, field, value)
}

fn allocate_single(pctx: &ParseContext<'_>, ut: &UserType, field: &FieldDescriptor, value: &Value) -> Result<Value> {
    match &field.kind {
        FieldKind::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            other => Err(expected("bool", other)),
        },

        FieldKind::Float => match value {
            Value::Number(_) => Ok(value.clone()),
            other => Err(expected("float", other)),
        },

        FieldKind::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            other => Err(expected("integer", other)),
        },

        FieldKind::String | FieldKind::Bytes => match value {
            Value::String(_) => Ok(value.clone()),
            other => Err(expected("string", other)),
        },

        FieldKind::Enum(values) => match value {
            Value::String(s) if values.contains(s) => Ok(value.clone()),
            Value::String(s) => Err(Error::bad_input(format!("unknown enum value {}", s))),
            Value::Number(n) => {
                let index = n
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .filter(|i| *i < values.len())
                    .ok_or_else(|| Error::bad_input(format!("unknown enum value {}", n)))?;
                Ok(Value::String(values[index].clone()))
            }
            other => Err(expected("string or integer", other)),
        },

        FieldKind::Message(type_name) => {
            let message = ut.message(type_name).ok_or_else(|| {
                Error::internal(format!("{}: type {} was not resolved", ut.full_name(), type_name))
            })?;
            allocate_message(pctx, ut, message, value)
        }

        FieldKind::Map => Err(Error::bad_input("maps not supported")),
    }
}

fn allocate_file_contents(pctx: &ParseContext<'_>, value: &Value) -> Result<Value> {
    let contents = match value {
        Value::String(path) => {
            let file = pctx.location.file(path).ok_or_else(|| {
                Error::bad_input(format!("failed to load {:?}: path leaves the module", path))
            })?;
            std::fs::read(&file)
                .map_err(|e| Error::bad_input(format!("failed to load {:?}: {}", path, e)))?
        }

        Value::Object(entries) => {
            if entries.len() != 1 {
                return Err(Error::bad_input(
                    "failed to handle inline resource, expected single-key map",
                ));
            }

            match entries.get("inline") {
                Some(Value::String(s)) => s.clone().into_bytes(),
                Some(other) => {
                    return Err(Error::bad_input(format!(
                        "failed to handle inline resource, got {}",
                        kind_of(other)
                    )))
                }
                None => {
                    let key = entries.keys().next().cloned().unwrap_or_default();
                    return Err(Error::bad_input(format!(
                        "failed to handle inline resource, expected \"inline\" got {:?}",
                        key
                    )));
                }
            }
        }

        other => {
            return Err(Error::bad_input(format!(
                "failed to handle resource type, got {}",
                kind_of(other)
            )))
        }
    };

    let mut out = Map::new();
    match String::from_utf8(contents) {
        Ok(text) => {
            out.insert("contents".to_string(), Value::String(text));
            out.insert("utf8".to_string(), Value::Bool(true));
        }
        Err(err) => {
            out.insert("contents".to_string(), Value::String(hex::encode(err.as_bytes())));
            out.insert("utf8".to_string(), Value::Bool(false));
        }
    }
    Ok(Value::Object(out))
}

fn expected(what: &str, got: &Value) -> Error {
    Error::bad_input(format!("expected {}, got {}", what, kind_of(got)))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
