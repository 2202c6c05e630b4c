//! Core candidate data model shared by every ATSync crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "atsync-core";

/// Conflict column every sink upserts on.
pub const CONFLICT_KEY: &str = "merge_id";

pub const DEFAULT_TABLE_NAME: &str = "candidates";

/// Candidate record as returned by the remote ATS.
///
/// Every recognized field is optional; JSON `null`, a missing key and a value
/// of the wrong shape all deserialize to `None`. Fields the bridge does not
/// interpret are kept in `extra` so the record can be handed back unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawCandidate {
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient::list", skip_serializing_if = "Option::is_none")]
    pub email_addresses: Option<Vec<JsonValue>>,
    #[serde(default, deserialize_with = "lenient::list", skip_serializing_if = "Option::is_none")]
    pub phone_numbers: Option<Vec<JsonValue>>,
    #[serde(default, deserialize_with = "lenient::list", skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<JsonValue>>,
    #[serde(default, deserialize_with = "lenient::list", skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<JsonValue>>,
    #[serde(default, deserialize_with = "lenient::list", skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<JsonValue>>,
    #[serde(default, deserialize_with = "lenient::list", skip_serializing_if = "Option::is_none")]
    pub applications: Option<Vec<JsonValue>>,
    #[serde(default, deserialize_with = "lenient::list", skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<JsonValue>>,
    #[serde(default, deserialize_with = "lenient::object", skip_serializing_if = "Option::is_none")]
    pub field_mappings: Option<Map<String, JsonValue>>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub remote_created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub remote_updated_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::flag", skip_serializing_if = "Option::is_none")]
    pub remote_was_deleted: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// One page of the remote candidates listing.
///
/// Entries that are not JSON objects are dropped and counted in `skipped`
/// instead of failing the page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "CandidatePageWire")]
pub struct CandidatePage {
    pub results: Vec<RawCandidate>,
    pub skipped: usize,
}

#[derive(Deserialize)]
struct CandidatePageWire {
    #[serde(default, deserialize_with = "lenient::list")]
    results: Option<Vec<JsonValue>>,
}

impl From<CandidatePageWire> for CandidatePage {
    fn from(wire: CandidatePageWire) -> Self {
        let entries = wire.results.unwrap_or_default();
        let total = entries.len();
        let results: Vec<RawCandidate> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect();
        Self {
            skipped: total - results.len(),
            results,
        }
    }
}

/// Shape-tolerant field decoders: anything off-type becomes `None`.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::{Map, Value};

    pub fn string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(de)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn list<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<Value>>, D::Error> {
        Ok(match Value::deserialize(de)? {
            Value::Array(items) => Some(items),
            _ => None,
        })
    }

    pub fn object<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Map<String, Value>>, D::Error> {
        Ok(match Value::deserialize(de)? {
            Value::Object(map) => Some(map),
            _ => None,
        })
    }

    pub fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<Option<bool>, D::Error> {
        Ok(match Value::deserialize(de)? {
            Value::Bool(b) => Some(b),
            _ => None,
        })
    }
}

/// Flat, storage-ready projection of a [`RawCandidate`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedCandidateRow {
    pub merge_id: String,
    pub remote_id: String,
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    pub title: String,
    pub email: String,
    pub phone: String,
    pub location: String,
    pub created_at: String,
    pub modified_at: String,
    pub remote_created_at: String,
    pub remote_updated_at: String,
    pub applications_json: String,
    pub attachments_json: String,
    pub locations_json: String,
    pub phone_numbers_json: String,
    pub email_addresses_json: String,
    pub urls_json: String,
    pub tags_json: String,
    pub field_mappings_json: String,
    pub remote_was_deleted: bool,
}

impl NormalizedCandidateRow {
    /// Column names in declaration order; sinks bind values in this order.
    pub const COLUMNS: [&'static str; 22] = [
        "merge_id",
        "remote_id",
        "first_name",
        "last_name",
        "company",
        "title",
        "email",
        "phone",
        "location",
        "created_at",
        "modified_at",
        "remote_created_at",
        "remote_updated_at",
        "applications_json",
        "attachments_json",
        "locations_json",
        "phone_numbers_json",
        "email_addresses_json",
        "urls_json",
        "tags_json",
        "field_mappings_json",
        "remote_was_deleted",
    ];

    /// Text columns in [`Self::COLUMNS`] order, i.e. everything except
    /// `remote_was_deleted`.
    pub fn text_values(&self) -> [&str; 21] {
        [
            self.merge_id.as_str(),
            self.remote_id.as_str(),
            self.first_name.as_str(),
            self.last_name.as_str(),
            self.company.as_str(),
            self.title.as_str(),
            self.email.as_str(),
            self.phone.as_str(),
            self.location.as_str(),
            self.created_at.as_str(),
            self.modified_at.as_str(),
            self.remote_created_at.as_str(),
            self.remote_updated_at.as_str(),
            self.applications_json.as_str(),
            self.attachments_json.as_str(),
            self.locations_json.as_str(),
            self.phone_numbers_json.as_str(),
            self.email_addresses_json.as_str(),
            self.urls_json.as_str(),
            self.tags_json.as_str(),
            self.field_mappings_json.as_str(),
        ]
    }

    pub fn has_merge_id(&self) -> bool {
        !self.merge_id.trim().is_empty()
    }
}

/// Outcome of a sync, shaped for direct JSON responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl SyncResult {
    pub fn succeeded(count: usize, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            count: Some(count),
            rejected: None,
            error_code: None,
        }
    }

    pub fn failed(error_code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            count: None,
            rejected: None,
            error_code: Some(error_code.to_string()),
        }
    }

    pub fn with_rejected(mut self, rejected: usize) -> Self {
        self.rejected = (rejected > 0).then_some(rejected);
        self
    }
}

/// Read-only inspection of what a sync would write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePreview {
    pub count: usize,
    pub table_structure: Vec<String>,
    pub data: Vec<NormalizedCandidateRow>,
}

/// Keep only the last four characters of a credential for log lines.
pub fn redact_token(token: &str) -> String {
    let tail: String = token
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_candidate_treats_null_as_absent_and_keeps_unknown_fields() {
        let raw: RawCandidate = serde_json::from_value(json!({
            "id": "c1",
            "first_name": null,
            "is_private": true,
            "remote_data": [{"path": "/candidates"}]
        }))
        .expect("raw candidate");

        assert_eq!(raw.id.as_deref(), Some("c1"));
        assert!(raw.first_name.is_none());
        assert_eq!(raw.extra.get("is_private"), Some(&json!(true)));

        let back = serde_json::to_value(&raw).expect("serialize");
        assert_eq!(back["remote_data"], json!([{"path": "/candidates"}]));
        assert!(back.get("first_name").is_none());
    }

    #[test]
    fn page_without_results_is_empty() {
        let page: CandidatePage = serde_json::from_str(r#"{"next": null, "previous": null}"#).expect("page");
        assert!(page.results.is_empty());
        assert_eq!(page.skipped, 0);

        let page: CandidatePage = serde_json::from_str(r#"{"results": null}"#).expect("null page");
        assert!(page.results.is_empty());
    }

    #[test]
    fn off_type_fields_do_not_sink_the_page() {
        let page: CandidatePage = serde_json::from_value(json!({
            "results": [
                {"id": "c1"},
                {
                    "id": "c2",
                    "remote_id": 21198773,
                    "company": {"name": "Acme"},
                    "tags": "vip",
                    "field_mappings": [],
                    "remote_was_deleted": "no"
                },
                "not a candidate",
                42
            ]
        }))
        .expect("page");

        assert_eq!(page.results.len(), 2);
        assert_eq!(page.skipped, 2);
        let c2 = &page.results[1];
        assert_eq!(c2.id.as_deref(), Some("c2"));
        assert_eq!(c2.remote_id.as_deref(), Some("21198773"));
        assert!(c2.company.is_none());
        assert!(c2.tags.is_none());
        assert!(c2.field_mappings.is_none());
        assert!(c2.remote_was_deleted.is_none());
    }

    #[test]
    fn columns_line_up_with_text_values() {
        let row = NormalizedCandidateRow {
            merge_id: "m".into(),
            field_mappings_json: "{}".into(),
            ..Default::default()
        };
        let values = row.text_values();
        assert_eq!(values.len() + 1, NormalizedCandidateRow::COLUMNS.len());
        assert_eq!(values[0], "m");
        assert_eq!(NormalizedCandidateRow::COLUMNS[20], "field_mappings_json");
        assert_eq!(values[20], "{}");
    }

    #[test]
    fn failed_result_omits_count() {
        let value = serde_json::to_value(SyncResult::failed("NO_CANDIDATES", "nothing")).unwrap();
        assert_eq!(value["success"], json!(false));
        assert!(value.get("count").is_none());
    }

    #[test]
    fn redact_token_keeps_tail() {
        assert_eq!(redact_token("abcdef123"), "...f123");
        assert_eq!(redact_token("ab"), "...ab");
    }
}
