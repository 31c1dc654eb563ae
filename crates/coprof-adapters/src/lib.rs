//! Company data provider contracts and the provider-record -> destination-row mapper.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use coprof_core::{
    normalize_domain, Attachment, CanonicalField, CellValue, DestinationRow, FieldMapping,
    MatchError, ProviderQueryResult,
};
use coprof_storage::{ApiClient, FetchError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "coprof-adapters";

pub const DEFAULT_TRACXN_API_URL: &str = "https://tracxn.com/api/2.2";

/// Why a single canonical field could not be extracted. Never fatal: the
/// column receives the empty marker instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("`{path}` is missing")]
    Missing { path: &'static str },
    #[error("`{path}` is not {expected}")]
    WrongType {
        path: &'static str,
        expected: &'static str,
    },
    #[error("no extractor registered")]
    Unsupported,
}

pub type Extractor = fn(&JsonValue) -> Result<CellValue, ExtractionError>;

/// Per-field extraction rules, one entry per canonical field.
pub static FIELD_EXTRACTORS: [(CanonicalField, Extractor); 8] = [
    (CanonicalField::Name, extract_name),
    (CanonicalField::Logo, extract_logo),
    (CanonicalField::ShortDescription, extract_short_description),
    (CanonicalField::LongDescription, extract_long_description),
    (CanonicalField::Headquarters, extract_headquarters),
    (CanonicalField::FoundedYear, extract_founded_year),
    (CanonicalField::EmployeeCount, extract_employee_count),
    (CanonicalField::Url, extract_url),
];

pub fn extractor_for(field: CanonicalField) -> Option<Extractor> {
    FIELD_EXTRACTORS
        .iter()
        .find(|(candidate, _)| *candidate == field)
        .map(|(_, extractor)| *extractor)
}

/// Walk a dotted path; `null` counts as absent.
fn value_at<'a>(record: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = record;
    for segment in path.split('.') {
        cur = cur.get(segment)?;
    }
    (!cur.is_null()).then_some(cur)
}

fn required_str<'a>(record: &'a JsonValue, path: &'static str) -> Result<&'a str, ExtractionError> {
    value_at(record, path)
        .ok_or(ExtractionError::Missing { path })?
        .as_str()
        .ok_or(ExtractionError::WrongType {
            path,
            expected: "a string",
        })
}

fn str_or_empty<'a>(record: &'a JsonValue, path: &'static str) -> Result<&'a str, ExtractionError> {
    match required_str(record, path) {
        Err(ExtractionError::Missing { .. }) => Ok(""),
        other => other,
    }
}

fn extract_name(record: &JsonValue) -> Result<CellValue, ExtractionError> {
    str_or_empty(record, "name").map(CellValue::text)
}

fn extract_logo(record: &JsonValue) -> Result<CellValue, ExtractionError> {
    let url = str_or_empty(record, "logos.imageUrl")?.trim();
    let attachments = if url.is_empty() {
        Vec::new()
    } else {
        vec![Attachment::from_url(url)]
    };
    Ok(CellValue::Attachments(attachments))
}

fn extract_short_description(record: &JsonValue) -> Result<CellValue, ExtractionError> {
    required_str(record, "description.short").map(CellValue::text)
}

fn extract_long_description(record: &JsonValue) -> Result<CellValue, ExtractionError> {
    required_str(record, "description.long").map(CellValue::text)
}

fn extract_headquarters(record: &JsonValue) -> Result<CellValue, ExtractionError> {
    let parts = [
        required_str(record, "location.city")?,
        required_str(record, "location.country")?,
        required_str(record, "location.continent")?,
    ];
    Ok(CellValue::text(parts.join(", ")))
}

fn extract_founded_year(record: &JsonValue) -> Result<CellValue, ExtractionError> {
    const PATH: &str = "foundedYear";
    let not_a_year = ExtractionError::WrongType {
        path: PATH,
        expected: "a calendar year",
    };
    let raw = value_at(record, PATH).ok_or(ExtractionError::Missing { path: PATH })?;
    let year = match raw {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .and_then(|year| i32::try_from(year).ok())
    .ok_or_else(|| not_a_year.clone())?;

    let date = NaiveDate::from_ymd_opt(year, 1, 1).ok_or(not_a_year)?;
    Ok(CellValue::text(date.format("%Y-%m-%d").to_string()))
}

fn extract_employee_count(record: &JsonValue) -> Result<CellValue, ExtractionError> {
    const PATH: &str = "latestEmployeeCount.value";
    match value_at(record, PATH) {
        Some(JsonValue::Number(n)) => Ok(CellValue::Number(n.clone())),
        Some(_) => Err(ExtractionError::WrongType {
            path: PATH,
            expected: "a number",
        }),
        None => Err(ExtractionError::Missing { path: PATH }),
    }
}

fn extract_url(record: &JsonValue) -> Result<CellValue, ExtractionError> {
    str_or_empty(record, "domain").map(CellValue::text)
}

/// A configured field that fell back to the empty marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldFailure {
    pub field: CanonicalField,
    pub column: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub row: DestinationRow,
    pub failures: Vec<FieldFailure>,
}

/// Build the destination row for one provider company record.
///
/// Only fields with a non-blank destination column produce a cell. A field
/// whose extraction fails produces [`CellValue::Null`] and a [`FieldFailure`];
/// the remaining fields are unaffected.
pub fn map_company(company: &JsonValue, mapping: &FieldMapping) -> MappedRow {
    let mut row = DestinationRow::new();
    let mut failures = Vec::new();

    for (field, column) in mapping.configured() {
        let outcome = extractor_for(field)
            .ok_or(ExtractionError::Unsupported)
            .and_then(|extract| extract(company));

        match outcome {
            Ok(value) => {
                debug!(%field, column, "field mapped");
                row.insert(column, value);
            }
            Err(err) => {
                warn!(%field, column, error = %err, "field left empty");
                row.insert(column, CellValue::Null);
                failures.push(FieldFailure {
                    field,
                    column: column.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    MappedRow { row, failures }
}

/// Map a provider answer that must contain exactly one company.
pub fn map_query_result(
    result: &ProviderQueryResult,
    mapping: &FieldMapping,
) -> Result<MappedRow, MatchError> {
    result
        .single_company()
        .map(|company| map_company(company, mapping))
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait CompanyProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// Companies registered under `domain` (already normalized).
    async fn find_by_domain(&self, domain: &str) -> Result<ProviderQueryResult, ProviderError>;
}

#[derive(Debug, Serialize)]
struct CompanyQuery<'a> {
    filter: DomainFilter<'a>,
}

#[derive(Debug, Serialize)]
struct DomainFilter<'a> {
    domain: [&'a str; 1],
}

/// Tracxn company search (`POST /companies` filtered by domain).
#[derive(Debug)]
pub struct TracxnProvider {
    api: ApiClient,
    api_url: String,
}

impl TracxnProvider {
    pub fn new(api: ApiClient, api_url: impl Into<String>) -> Self {
        Self {
            api,
            api_url: api_url.into(),
        }
    }

    pub fn companies_url(&self) -> String {
        format!("{}/companies", self.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompanyProvider for TracxnProvider {
    fn provider_id(&self) -> &'static str {
        "tracxn"
    }

    async fn find_by_domain(&self, domain: &str) -> Result<ProviderQueryResult, ProviderError> {
        let body = CompanyQuery {
            filter: DomainFilter { domain: [domain] },
        };
        let result: ProviderQueryResult = self.api.post_json(&self.companies_url(), &body).await?;
        debug!(domain, matches = result.result.len(), "tracxn query answered");
        Ok(result)
    }
}

/// Answers queries from a saved provider response instead of the network.
/// Records are filtered by their `domain` so a multi-company export works too.
#[derive(Debug, Clone)]
pub struct RecordedProvider {
    source: PathBuf,
    response: ProviderQueryResult,
}

impl RecordedProvider {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let response =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            source: path.to_path_buf(),
            response,
        })
    }

    pub fn from_response(response: ProviderQueryResult) -> Self {
        Self {
            source: PathBuf::from("<inline>"),
            response,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[async_trait]
impl CompanyProvider for RecordedProvider {
    fn provider_id(&self) -> &'static str {
        "recorded"
    }

    async fn find_by_domain(&self, domain: &str) -> Result<ProviderQueryResult, ProviderError> {
        let result: Vec<JsonValue> = self
            .response
            .result
            .iter()
            .filter(|company| {
                company
                    .get("domain")
                    .and_then(JsonValue::as_str)
                    .is_some_and(|d| normalize_domain(d).eq_ignore_ascii_case(domain))
            })
            .cloned()
            .collect();
        Ok(ProviderQueryResult {
            total_count: Some(result.len() as u64),
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_record() -> JsonValue {
        json!({
            "name": "Acme",
            "domain": "acme.com",
            "logos": { "imageUrl": "https://img.tracxn.com/acme.png" },
            "description": { "short": "Anvils", "long": "Anvils and rockets for coyotes." },
            "location": { "city": "Phoenix", "country": "United States", "continent": "North America" },
            "foundedYear": 1949,
            "latestEmployeeCount": { "value": 250, "date": "2024-01-01" }
        })
    }

    fn every_field() -> FieldMapping {
        FieldMapping::new()
            .with(CanonicalField::Name, "Company")
            .with(CanonicalField::Logo, "Logo")
            .with(CanonicalField::ShortDescription, "Tagline")
            .with(CanonicalField::LongDescription, "About")
            .with(CanonicalField::Headquarters, "HQ")
            .with(CanonicalField::FoundedYear, "Founded")
            .with(CanonicalField::EmployeeCount, "Employees")
            .with(CanonicalField::Url, "URL")
    }

    #[test]
    fn extractor_table_covers_every_canonical_field() {
        for field in CanonicalField::ALL {
            assert!(extractor_for(field).is_some(), "{field} has no extractor");
        }
    }

    #[test]
    fn full_record_maps_every_column() {
        let mapped = map_company(&full_record(), &every_field());
        assert!(mapped.failures.is_empty());
        assert_eq!(
            serde_json::to_value(&mapped.row).unwrap(),
            json!({
                "Company": "Acme",
                "Logo": [{ "url": "https://img.tracxn.com/acme.png" }],
                "Tagline": "Anvils",
                "About": "Anvils and rockets for coyotes.",
                "HQ": "Phoenix, United States, North America",
                "Founded": "1949-01-01",
                "Employees": 250,
                "URL": "acme.com"
            })
        );
    }

    #[test]
    fn unmapped_and_blank_fields_produce_no_columns() {
        let mapping: FieldMapping = serde_json::from_value(json!({
            "Name": "Company",
            "URL": "URL",
            "Logo": null,
            "Founded Year": ""
        }))
        .unwrap();
        let mapped = map_company(&full_record(), &mapping);
        let columns: Vec<_> = mapped.row.columns().collect();
        assert_eq!(columns, vec!["Company", "URL"]);
    }

    #[test]
    fn missing_nested_attribute_blanks_only_that_column() {
        let mut record = full_record();
        record["description"].as_object_mut().unwrap().remove("short");
        record["location"]["continent"] = JsonValue::Null;

        let mapped = map_company(&record, &every_field());
        assert_eq!(mapped.row.get("Tagline"), Some(&CellValue::Null));
        assert_eq!(mapped.row.get("HQ"), Some(&CellValue::Null));
        assert_eq!(mapped.row.get("About"), Some(&CellValue::text("Anvils and rockets for coyotes.")));
        assert_eq!(mapped.row.get("Company"), Some(&CellValue::text("Acme")));

        let failed: Vec<_> = mapped.failures.iter().map(|f| f.field).collect();
        assert_eq!(
            failed,
            vec![CanonicalField::ShortDescription, CanonicalField::Headquarters]
        );
        assert_eq!(mapped.failures[0].reason, "`description.short` is missing");
    }

    #[test]
    fn name_and_url_default_to_empty_text() {
        let mapped = map_company(&json!({}), &every_field());
        assert_eq!(mapped.row.get("Company"), Some(&CellValue::text("")));
        assert_eq!(mapped.row.get("URL"), Some(&CellValue::text("")));
        assert_eq!(mapped.row.get("Logo"), Some(&CellValue::Attachments(vec![])));
        assert_eq!(mapped.row.len(), 8);
        assert_eq!(mapped.failures.len(), 5);
    }

    #[test]
    fn logo_without_url_is_an_empty_attachment_list() {
        let record = json!({ "logos": { "imageUrl": "" } });
        assert_eq!(extract_logo(&record), Ok(CellValue::Attachments(vec![])));
        let record = json!({ "logos": { "imageUrl": 7 } });
        assert!(matches!(
            extract_logo(&record),
            Err(ExtractionError::WrongType { path: "logos.imageUrl", .. })
        ));
    }

    #[test]
    fn founded_year_accepts_numeric_strings_and_rejects_garbage() {
        assert_eq!(
            extract_founded_year(&json!({ "foundedYear": "2015" })),
            Ok(CellValue::text("2015-01-01"))
        );
        assert!(extract_founded_year(&json!({ "foundedYear": "soon" })).is_err());
        assert!(extract_founded_year(&json!({ "foundedYear": 1.5 })).is_err());
        assert_eq!(
            extract_founded_year(&json!({})),
            Err(ExtractionError::Missing { path: "foundedYear" })
        );
    }

    #[test]
    fn employee_count_keeps_numeric_value_as_is() {
        assert_eq!(
            extract_employee_count(&json!({ "latestEmployeeCount": { "value": 12.5 } })),
            Ok(CellValue::Number(serde_json::Number::from_f64(12.5).unwrap()))
        );
        assert!(matches!(
            extract_employee_count(&json!({ "latestEmployeeCount": { "value": "many" } })),
            Err(ExtractionError::WrongType { .. })
        ));
    }

    #[test]
    fn wrong_typed_name_is_a_field_failure() {
        let mapping = FieldMapping::new().with(CanonicalField::Name, "Company");
        let mapped = map_company(&json!({ "name": ["Acme"] }), &mapping);
        assert_eq!(mapped.row.get("Company"), Some(&CellValue::Null));
        assert_eq!(mapped.failures[0].reason, "`name` is not a string");
    }

    #[test]
    fn query_result_must_hold_exactly_one_company() {
        let mapping = FieldMapping::new().with(CanonicalField::Name, "Company");
        let none = ProviderQueryResult::default();
        assert_eq!(map_query_result(&none, &mapping), Err(MatchError::NoMatch));

        let two = ProviderQueryResult {
            result: vec![full_record(), full_record()],
            total_count: Some(2),
        };
        assert_eq!(
            map_query_result(&two, &mapping),
            Err(MatchError::Ambiguous { count: 2 })
        );
    }

    #[test]
    fn tracxn_query_body_filters_on_domain() {
        let body = CompanyQuery {
            filter: DomainFilter {
                domain: ["acme.com"],
            },
        };
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({ "filter": { "domain": ["acme.com"] } })
        );
    }

    #[test]
    fn tracxn_companies_url_tolerates_trailing_slash() {
        let api = ApiClient::new(Default::default()).unwrap();
        let provider = TracxnProvider::new(api, "https://tracxn.com/api/2.2/");
        assert_eq!(provider.companies_url(), "https://tracxn.com/api/2.2/companies");
    }

    #[tokio::test]
    async fn recorded_provider_filters_by_normalized_domain() {
        let provider = RecordedProvider::from_response(ProviderQueryResult {
            result: vec![
                json!({ "name": "Acme", "domain": "www.acme.com" }),
                json!({ "name": "Other", "domain": "other.io" }),
                json!({ "name": "No domain" }),
            ],
            total_count: None,
        });

        let found = provider.find_by_domain("acme.com").await.unwrap();
        assert_eq!(found.result.len(), 1);
        assert_eq!(found.result[0]["name"], "Acme");

        let missing = provider.find_by_domain("nowhere.dev").await.unwrap();
        assert!(missing.result.is_empty());
    }
}
