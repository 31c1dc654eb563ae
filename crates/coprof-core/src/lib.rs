//! Core domain model for coprof: canonical company fields, destination rows and
//! the URL helpers shared by the provider and destination crates.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "coprof-core";

/// The closed set of company attributes the importer understands.
///
/// Variant order is the order fields are mapped and logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CanonicalField {
    #[serde(rename = "Name")]
    Name,
    #[serde(rename = "Logo")]
    Logo,
    #[serde(rename = "Short Description")]
    ShortDescription,
    #[serde(rename = "Long Description")]
    LongDescription,
    #[serde(rename = "Headquarters", alias = "Headquaters")]
    Headquarters,
    #[serde(rename = "Founded Year")]
    FoundedYear,
    #[serde(rename = "Employee Count")]
    EmployeeCount,
    #[serde(rename = "URL")]
    Url,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 8] = [
        CanonicalField::Name,
        CanonicalField::Logo,
        CanonicalField::ShortDescription,
        CanonicalField::LongDescription,
        CanonicalField::Headquarters,
        CanonicalField::FoundedYear,
        CanonicalField::EmployeeCount,
        CanonicalField::Url,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::Name => "Name",
            CanonicalField::Logo => "Logo",
            CanonicalField::ShortDescription => "Short Description",
            CanonicalField::LongDescription => "Long Description",
            CanonicalField::Headquarters => "Headquarters",
            CanonicalField::FoundedYear => "Founded Year",
            CanonicalField::EmployeeCount => "Employee Count",
            CanonicalField::Url => "URL",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-configured mapping from canonical fields to destination column names.
///
/// A field that is absent, `null` or mapped to a blank name is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping(BTreeMap<CanonicalField, Option<String>>);

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: CanonicalField, column: impl Into<String>) -> Self {
        self.0.insert(field, Some(column.into()));
        self
    }

    /// Destination column for `field`, if one is configured and non-blank.
    pub fn destination(&self, field: CanonicalField) -> Option<&str> {
        self.0
            .get(&field)
            .and_then(|column| column.as_deref())
            .filter(|column| !column.trim().is_empty())
    }

    /// Configured `(field, column)` pairs in canonical order, blanks skipped.
    pub fn configured(&self) -> impl Iterator<Item = (CanonicalField, &str)> + '_ {
        CanonicalField::ALL
            .into_iter()
            .filter_map(|field| self.destination(field).map(|column| (field, column)))
    }

    pub fn url_column(&self) -> Option<&str> {
        self.destination(CanonicalField::Url)
    }

    pub fn is_empty(&self) -> bool {
        self.configured().next().is_none()
    }
}

/// Airtable attachment reference; the destination downloads the file from `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
}

impl Attachment {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// A single destination cell. `Null` is the empty marker written for a field
/// whose source data could not be extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Text(String),
    Number(serde_json::Number),
    Attachments(Vec<Attachment>),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// Flat column -> value row, built once per run and then inserted or discarded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationRow(BTreeMap<String, CellValue>);

impl DestinationRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: CellValue) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.0.get(column)
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, CellValue)> for DestinationRow {
    fn from_iter<I: IntoIterator<Item = (K, CellValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A row already present in the destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: String,
    #[serde(rename = "createdTime", default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, JsonValue>,
}

impl StoredRow {
    pub fn text(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(JsonValue::as_str)
    }
}

/// Raw provider answer for a domain query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderQueryResult {
    #[serde(default)]
    pub result: Vec<JsonValue>,
    #[serde(rename = "totalCount", default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("provider returned no company")]
    NoMatch,
    #[error("provider returned {count} companies, expected exactly one")]
    Ambiguous { count: usize },
}

impl ProviderQueryResult {
    /// The one matched company record; zero or several matches are errors.
    pub fn single_company(&self) -> Result<&JsonValue, MatchError> {
        match self.result.as_slice() {
            [] => Err(MatchError::NoMatch),
            [company] => Ok(company),
            many => Err(MatchError::Ambiguous { count: many.len() }),
        }
    }
}

/// Reduce a company URL or bare domain to its host, dropping scheme, userinfo,
/// port, path, query, fragment and any leading `www.` labels.
///
/// ```
/// use coprof_core::normalize_domain;
///
/// assert_eq!(normalize_domain("https://www.Example.com:443/x"), "Example.com");
/// assert_eq!(normalize_domain("example.com"), "example.com");
/// ```
pub fn normalize_domain(url: &str) -> String {
    let trimmed = url.trim();
    let after_scheme = match split_scheme(trimmed) {
        Some((_, rest)) => rest,
        None => trimmed.strip_prefix("//").unwrap_or(trimmed),
    };

    let authority = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_and_port = authority.rsplit('@').next().unwrap_or_default();
    let mut host = host_and_port.split(':').next().unwrap_or_default().trim();

    while let Some(rest) = strip_www_label(host) {
        host = rest;
    }

    host.to_string()
}

fn split_scheme(url: &str) -> Option<(&str, &str)> {
    let idx = url.find("://")?;
    let scheme = &url[..idx];
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then(|| (scheme, &url[idx + 3..]))
}

fn strip_www_label(host: &str) -> Option<&str> {
    let prefix = host.get(..4)?;
    let rest = &host[4..];
    (prefix.eq_ignore_ascii_case("www.") && !rest.is_empty()).then_some(rest)
}

/// Base and table identifiers of the destination, taken from a shared link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationLocation {
    pub base_id: String,
    pub table_id: String,
}

const DESTINATION_LINK_PATTERN: &str =
    r"^https://(?:www\.)?airtable\.com/(app[A-Za-z0-9]+)/([A-Za-z0-9]+)(?:[/?#]|$)";

/// Parse `https://airtable.com/<app...>/<table>/...` into its identifiers.
/// Returns `None` when the link does not have that shape.
pub fn extract_destination_location(link: &str) -> Option<DestinationLocation> {
    let pattern = Regex::new(DESTINATION_LINK_PATTERN).ok()?;
    let captures = pattern.captures(link.trim())?;
    Some(DestinationLocation {
        base_id: captures.get(1)?.as_str().to_string(),
        table_id: captures.get(2)?.as_str().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_strips_scheme_www_port_and_path() {
        assert_eq!(normalize_domain("https://www.Example.com:443/x"), "Example.com");
        assert_eq!(normalize_domain("http://acme.io/about?x=1#top"), "acme.io");
        assert_eq!(normalize_domain("www.acme.io:8080"), "acme.io");
        assert_eq!(normalize_domain("acme.io/path?next=http://other.com"), "acme.io");
        assert_eq!(normalize_domain("  https://user:pw@www.acme.io/  "), "acme.io");
    }

    #[test]
    fn normalize_handles_scheme_less_input() {
        assert_eq!(normalize_domain("example.com"), "example.com");
        assert_eq!(normalize_domain("localhost:3000"), "localhost");
        assert_eq!(normalize_domain("//cdn.example.com/a.png"), "cdn.example.com");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in [
            "https://www.Example.com:443/x",
            "www.www.acme.io",
            "acme.io",
            "sub.acme.co.uk",
            "https:// acme.io",
            "",
        ] {
            let once = normalize_domain(input);
            assert_eq!(normalize_domain(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn normalize_trims_whitespace_around_the_host() {
        assert_eq!(normalize_domain("https:// acme.io"), "acme.io");
        assert_eq!(normalize_domain("https:// www.acme.io /about"), "acme.io");
    }

    #[test]
    fn normalize_keeps_bare_www_host() {
        assert_eq!(normalize_domain("https://www."), "www.");
        assert_eq!(normalize_domain("wwwacme.com"), "wwwacme.com");
    }

    #[test]
    fn destination_link_yields_base_and_table() {
        let location =
            extract_destination_location("https://airtable.com/appABC123/tblXYZ789/viwDEF").unwrap();
        assert_eq!(location.base_id, "appABC123");
        assert_eq!(location.table_id, "tblXYZ789");

        let bare = extract_destination_location("https://airtable.com/appABC123/tblXYZ789").unwrap();
        assert_eq!(bare.table_id, "tblXYZ789");
    }

    #[test]
    fn destination_link_rejects_other_shapes() {
        assert_eq!(extract_destination_location("https://example.com/notmatching"), None);
        assert_eq!(extract_destination_location("https://airtable.com/baseABC/tblXYZ/"), None);
        assert_eq!(extract_destination_location("airtable.com/appABC/tblXYZ/"), None);
    }

    #[test]
    fn field_mapping_ignores_null_and_blank_destinations() {
        let mapping: FieldMapping = serde_json::from_value(json!({
            "URL": "Website",
            "Name": "Company",
            "Logo": null,
            "Short Description": "  ",
            "Headquaters": "HQ"
        }))
        .unwrap();

        let configured: Vec<_> = mapping.configured().collect();
        assert_eq!(
            configured,
            vec![
                (CanonicalField::Name, "Company"),
                (CanonicalField::Headquarters, "HQ"),
                (CanonicalField::Url, "Website"),
            ]
        );
        assert_eq!(mapping.url_column(), Some("Website"));
        assert_eq!(mapping.destination(CanonicalField::Logo), None);
    }

    #[test]
    fn field_mapping_keeps_configured_column_names_verbatim() {
        let mapping = FieldMapping::new()
            .with(CanonicalField::Name, "Company ")
            .with(CanonicalField::Url, " Website");
        assert_eq!(mapping.destination(CanonicalField::Name), Some("Company "));
        assert_eq!(mapping.url_column(), Some(" Website"));
    }

    #[test]
    fn field_mapping_rejects_unknown_canonical_names() {
        let err = serde_json::from_value::<FieldMapping>(json!({ "Revenue": "ARR" }));
        assert!(err.is_err());
    }

    #[test]
    fn single_company_distinguishes_zero_one_and_many() {
        let empty = ProviderQueryResult::default();
        assert_eq!(empty.single_company(), Err(MatchError::NoMatch));

        let one: ProviderQueryResult =
            serde_json::from_value(json!({ "result": [{ "name": "Acme" }], "totalCount": 1 })).unwrap();
        assert_eq!(one.single_company().unwrap()["name"], "Acme");

        let two: ProviderQueryResult =
            serde_json::from_value(json!({ "result": [{}, {}] })).unwrap();
        assert_eq!(two.single_company(), Err(MatchError::Ambiguous { count: 2 }));
    }

    #[test]
    fn cell_values_serialize_to_destination_json() {
        let row: DestinationRow = [
            ("Company", CellValue::text("Acme")),
            ("Logo", CellValue::Attachments(vec![Attachment::from_url("https://x/l.png")])),
            ("Employees", CellValue::Number(42.into())),
            ("HQ", CellValue::Null),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            json!({
                "Company": "Acme",
                "Logo": [{ "url": "https://x/l.png" }],
                "Employees": 42,
                "HQ": null
            })
        );
    }
}
