//! Record identifiers
//!
//! Records created by the document store carry 24-hex object ids. Records
//! in the relational store have a UUID primary key and keep the object id
//! they were migrated with in `mongo_object_id`. Callers may hand either
//! form to any lookup, so repositories parse it into a [`RecordId`] first.

use mongodb::bson::oid::ObjectId;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordId {
    /// UUID primary key of the relational store
    Native(Uuid),
    /// Hex object id from the document store
    Legacy(String),
}

impl RecordId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::validation("valid id is required"));
        }
        if is_object_id(raw) {
            return Ok(Self::Legacy(raw.to_lowercase()));
        }
        Uuid::parse_str(raw)
            .map(Self::Native)
            .map_err(|_| Error::validation(format!("invalid id: {}", raw)))
    }

    /// SQL predicate selecting this id, with the textual id bound as `$n`.
    pub fn sql_match(&self, n: usize) -> String {
        match self {
            Self::Native(_) => format!("id = ${}::uuid", n),
            Self::Legacy(_) => format!("mongo_object_id = ${}", n),
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(id) => write!(f, "{}", id),
            Self::Legacy(id) => write!(f, "{}", id),
        }
    }
}

/// Generate a fresh hex object id.
pub fn new_object_id() -> String {
    ObjectId::new().to_hex()
}

pub fn is_object_id(raw: &str) -> bool {
    raw.len() == 24 && ObjectId::parse_str(raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_id() {
        let id = RecordId::parse("65a1f0c2e4b0a1b2c3d4e5f6").unwrap();
        assert_eq!(id, RecordId::Legacy("65a1f0c2e4b0a1b2c3d4e5f6".into()));
    }

    #[test]
    fn test_parse_uuid() {
        let raw = "0b7e4c2a-52a4-4a8e-9b8f-3f1b2d9c6a10";
        let id = RecordId::parse(raw).unwrap();
        assert_eq!(id, RecordId::Native(Uuid::parse_str(raw).unwrap()));
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(RecordId::parse(""), Err(Error::Validation(_))));
        assert!(matches!(RecordId::parse("not-an-id"), Err(Error::Validation(_))));
        // 24 chars but not hex
        assert!(RecordId::parse("zzzzzzzzzzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn test_sql_match_picks_column() {
        let legacy = RecordId::parse("65a1f0c2e4b0a1b2c3d4e5f6").unwrap();
        assert_eq!(legacy.sql_match(1), "mongo_object_id = $1");

        let native = RecordId::parse("0b7e4c2a-52a4-4a8e-9b8f-3f1b2d9c6a10").unwrap();
        assert_eq!(native.sql_match(3), "id = $3::uuid");
    }

    #[test]
    fn test_new_object_id_is_parseable() {
        let id = new_object_id();
        assert!(is_object_id(&id));
        assert!(matches!(RecordId::parse(&id), Ok(RecordId::Legacy(_))));
    }
}
