use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::CoreError;

/// Pointer to a resource, as embedded in another resource's properties.
///
/// The bridge writes these as `{"rid": .., "rtype": ..}`; resource bodies
/// themselves carry `{"id": .., "type": ..}`. Both forms parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub rid: String,
    pub rtype: String,
}

impl Reference {
    pub fn new(rid: impl Into<String>, rtype: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            rtype: rtype.into(),
        }
    }

    /// Parse either reference form out of a JSON object.
    ///
    /// Fails with [`CoreError::UnresolvableReference`] unless one complete
    /// pair of string fields is present.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        let pair = |id: &str, ty: &str| {
            Some(Self::new(
                value.get(id)?.as_str()?,
                value.get(ty)?.as_str()?,
            ))
        };

        pair("id", "type")
            .or_else(|| pair("rid", "rtype"))
            .ok_or_else(|| CoreError::UnresolvableReference {
                reference: value.to_string(),
            })
    }

    /// All references in a JSON array, skipping malformed entries.
    pub fn list(value: Option<&Value>) -> Vec<Self> {
        value
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| Self::from_value(item).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// v2 endpoint of the referenced resource, relative to `/clip/v2`.
    pub fn endpoint(&self) -> String {
        format!("/resource/{}/{}", self.rtype, self.rid)
    }

    pub fn to_value(&self) -> Value {
        json!({ "rid": self.rid, "rtype": self.rtype })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rtype, self.rid)
    }
}
