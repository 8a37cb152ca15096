use serde::{Deserialize, Serialize};

use crate::error::{BackfillError, Result};

/// Describes one backfill: which collection is scanned, which collection is
/// joined, and which fields carry the partition key and the target value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProfile {
    pub name: String,
    pub candidate_collection: String,
    pub join_collection: String,
    pub partition_field: String,
    pub target_field: String,
    /// Written to `migration_source` on every updated document.
    pub source_tag: String,
}

impl MigrationProfile {
    /// Products joined to sellers on `seller_id`.
    pub fn products() -> Self {
        MigrationProfile {
            name: "products".to_string(),
            candidate_collection: "products".to_string(),
            join_collection: "sellers".to_string(),
            partition_field: "seller_id".to_string(),
            target_field: "company_id".to_string(),
            source_tag: "paginated-migration".to_string(),
        }
    }

    /// Quotations joined to users on `seller_id`.
    pub fn quotations() -> Self {
        MigrationProfile {
            name: "quotations".to_string(),
            candidate_collection: "quotations".to_string(),
            join_collection: "users".to_string(),
            partition_field: "seller_id".to_string(),
            target_field: "company_id".to_string(),
            source_tag: "quotation-migration".to_string(),
        }
    }

    pub fn by_name(name: &str) -> Result<Self> {
        match name {
            "products" => Ok(Self::products()),
            "quotations" => Ok(Self::quotations()),
            other => Err(BackfillError::InvalidArgument(format!(
                "unknown migration profile '{}'; use products|quotations",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let p = MigrationProfile::by_name("quotations").unwrap();
        assert_eq!(p.join_collection, "users");
        assert_eq!(p.target_field, "company_id");
        assert!(MigrationProfile::by_name("orders").is_err());
    }

    #[test]
    fn test_profile_from_json() {
        let p: MigrationProfile = serde_json::from_str(
            r#"{"name":"offers","candidateCollection":"offers","joinCollection":"sellers",
                "partitionField":"seller_id","targetField":"company_id","sourceTag":"offers-backfill"}"#,
        )
        .unwrap();
        assert_eq!(p.candidate_collection, "offers");
    }
}
