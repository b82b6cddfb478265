//! Table schemas.
//!
//! A descriptor names a table and declares its ordered field layout; the
//! template revision derived from it is the structure reference every
//! insert is checked against.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::revision::{FieldType, Revision};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("table descriptor invalid: {reason}")]
pub struct InvalidDescriptor {
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    name: String,
    fields: Vec<FieldType>,
}

impl TableDescriptor {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<FieldType>,
    ) -> Result<Self, InvalidDescriptor> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidDescriptor {
                reason: "table name must not be empty".into(),
            });
        }
        if name.chars().any(char::is_whitespace) {
            return Err(InvalidDescriptor {
                reason: format!("table name `{name}` contains whitespace"),
            });
        }
        Ok(Self { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldType] {
        &self.fields
    }

    pub fn template(&self) -> Revision {
        Revision::with_layout(&self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_builds_matching_template() {
        let descriptor =
            TableDescriptor::new("poses", vec![FieldType::Double, FieldType::Blob]).unwrap();
        let template = descriptor.template();
        assert_eq!(template.field_count(), 2);
        assert!(descriptor.template().structure_match(&template));
    }

    #[test]
    fn descriptor_rejects_bad_names() {
        assert!(TableDescriptor::new("", vec![]).is_err());
        assert!(TableDescriptor::new("two words", vec![]).is_err());
    }
}
