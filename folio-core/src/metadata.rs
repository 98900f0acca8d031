//! Page metadata and the allow-list of fields clients may change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

pub const PAGE_NAME_MAX_CHARS: usize = 60;

const NAME_PUNCTUATION: &[char] = &[' ', '-', '_', '.', ',', '\'', '!', '?', '&', '(', ')'];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub page_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_id: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_timestamp: Option<u64>,
    /// Fields this crate does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What a successful patch changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataChange {
    pub renamed: Option<String>,
    pub touched: bool,
}

enum Field {
    Name(String),
    LastModified(u64),
}

impl PageMetadata {
    pub fn new(page_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            page_id,
            notebook_id: None,
            name: name.into(),
            last_modified_timestamp: None,
            extra: Map::new(),
        }
    }

    /// Apply the allow-listed fields of a client patch.
    ///
    /// Only `name` and `lastModifiedTimestamp` are honoured; anything else
    /// is ignored. Every honoured field is validated before any is written.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<MetadataChange, ValidationError> {
        let mut accepted = Vec::new();
        for (key, value) in patch {
            match key.as_str() {
                "name" => accepted.push(Field::Name(validate_page_name(value)?)),
                "lastModifiedTimestamp" => {
                    accepted.push(Field::LastModified(validate_last_modified(value)?))
                }
                _ => {}
            }
        }

        let mut change = MetadataChange::default();
        for field in accepted {
            change.touched = true;
            match field {
                Field::Name(name) => {
                    if name != self.name {
                        change.renamed = Some(name.clone());
                    }
                    self.name = name;
                }
                Field::LastModified(ts) => self.last_modified_timestamp = Some(ts),
            }
        }
        Ok(change)
    }
}

/// A page name: 1 to 60 characters of letters, digits, spaces and light
/// punctuation.
pub fn validate_page_name(value: &Value) -> Result<String, ValidationError> {
    let Some(name) = value.as_str() else {
        return Err(ValidationError::invalid("name", "expected a string"));
    };
    let chars = name.chars().count();
    if chars == 0 || chars > PAGE_NAME_MAX_CHARS {
        return Err(ValidationError::invalid(
            "name",
            format!("length must be 1..={PAGE_NAME_MAX_CHARS}, got {chars}"),
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !c.is_alphanumeric() && !NAME_PUNCTUATION.contains(c))
    {
        return Err(ValidationError::invalid("name", format!("character {bad:?} not allowed")));
    }
    Ok(name.to_owned())
}

pub fn validate_last_modified(value: &Value) -> Result<u64, ValidationError> {
    value
        .as_u64()
        .ok_or_else(|| ValidationError::invalid("lastModifiedTimestamp", "expected a non-negative integer"))
}
