use serde::{Deserialize, Serialize};

/// Per-collection configuration.
///
/// `data_field` names the payload key inside each stored document (for an
/// `accounts` collection this is typically `"account"`). Exactly one of the
/// payload and `meta` carries the record sequence, chosen once per
/// collection via `sequence_in_data`. Every entry in `unique_fields` spawns
/// a proxy collection named `<collection_name>-<field>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub collection_name: String,
    pub data_field: String,
    pub sequence_in_data: bool,
    pub unique_fields: Vec<String>,
}

impl CollectionConfig {
    pub(crate) fn proxy_collection_name(&self, unique_field: &str) -> String {
        format!("{}-{}", self.collection_name, unique_field)
    }

    /// Key under which proxy rows store the owning record id, e.g.
    /// `"accountId"`.
    pub(crate) fn owner_id_field(&self) -> String {
        format!("{}Id", self.data_field)
    }

    pub(crate) fn id_path(&self) -> String {
        format!("{}.id", self.data_field)
    }

    pub(crate) fn data_path(&self, field: &str) -> String {
        format!("{}.{}", self.data_field, field)
    }

    pub(crate) fn sequence_path(&self) -> String {
        if self.sequence_in_data {
            format!("{}.sequence", self.data_field)
        } else {
            "meta.sequence".to_string()
        }
    }
}
