//! Single-company import: configuration, duplicate guard and the sync pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use coprof_adapters::{
    map_query_result, CompanyProvider, FieldFailure, RecordedProvider, TracxnProvider,
    DEFAULT_TRACXN_API_URL,
};
use coprof_core::{
    extract_destination_location, normalize_domain, DestinationLocation, DestinationRow,
    FieldMapping, MatchError, StoredRow,
};
use coprof_storage::{
    AirtableStore, ApiAuth, ApiClient, DestinationStore, HttpClientConfig, StoreError,
    DEFAULT_AIRTABLE_API_URL,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "coprof-sync";

pub const PROVIDER_TOKEN_VAR: &str = "API_KEY_TRACXN";
pub const DESTINATION_TOKEN_VAR: &str = "API_KEY_AIRTABLE";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0:#}")]
    Configuration(anyhow::Error),
    #[error("missing credential: set {var} in the environment")]
    Credential { var: &'static str },
    #[error("company {domain} not found: {reason}")]
    NotFound { domain: String, reason: String },
    #[error("provider returned {count} companies for {domain}; refusing to pick one")]
    AmbiguousMatch { domain: String, count: usize },
    #[error("insert rejected: {0}")]
    Insert(String),
    #[error("could not read existing destination rows: {0}")]
    DestinationRead(#[source] StoreError),
    #[error(transparent)]
    Guard(#[from] GuardError),
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Configuration(anyhow!(message.into()))
    }

    /// Process exit code for this failure category.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Configuration(_) | SyncError::Guard(_) => 2,
            SyncError::Credential { .. } => 3,
            SyncError::NotFound { .. } => 4,
            SyncError::AmbiguousMatch { .. } => 5,
            SyncError::Insert(_) => 6,
            SyncError::DestinationRead(_) => 7,
        }
    }
}

/// Runtime settings taken from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub tracxn_api_url: String,
    pub airtable_api_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.json"),
            tracxn_api_url: DEFAULT_TRACXN_API_URL.to_string(),
            airtable_api_url: DEFAULT_AIRTABLE_API_URL.to_string(),
            user_agent: "coprof/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            config_path: lookup("COPROF_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            tracxn_api_url: lookup("COPROF_TRACXN_API_URL").unwrap_or(defaults.tracxn_api_url),
            airtable_api_url: lookup("COPROF_AIRTABLE_API_URL")
                .unwrap_or(defaults.airtable_api_url),
            user_agent: lookup("COPROF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: lookup("COPROF_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
        }
    }

    fn http_client_config(&self, auth: ApiAuth) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            auth,
        }
    }
}

/// The import configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    pub fields: FieldMapping,
    pub links: Links,
    #[serde(default)]
    pub options: ImportOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Links {
    pub airtable: String,
    pub company: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportOptions {
    #[serde(default = "default_check_duplicates")]
    pub check_duplicates: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            check_duplicates: default_check_duplicates(),
        }
    }
}

fn default_check_duplicates() -> bool {
    true
}

/// Read the import configuration; `.yaml`/`.yml` files are YAML, anything else JSON.
pub fn load_import_config(path: &Path) -> anyhow::Result<ImportConfig> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    if is_yaml {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Everything resolved from the configuration before any credential or network use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportPlan {
    pub location: DestinationLocation,
    pub company_link: String,
    pub domain: String,
    pub mapping: FieldMapping,
    pub check_duplicates: bool,
}

impl ImportPlan {
    pub fn from_config(config: &ImportConfig) -> Result<Self, SyncError> {
        let location = extract_destination_location(&config.links.airtable).ok_or_else(|| {
            SyncError::config(format!(
                "links.airtable is not an Airtable base/table link: {:?}",
                config.links.airtable
            ))
        })?;

        let domain = normalize_domain(&config.links.company);
        if domain.is_empty() {
            return Err(SyncError::config(format!(
                "links.company has no domain: {:?}",
                config.links.company
            )));
        }

        if config.fields.is_empty() {
            return Err(SyncError::config("fields maps no canonical field to a column"));
        }

        let check_duplicates = config.options.check_duplicates;
        if check_duplicates && config.fields.url_column().is_none() {
            return Err(GuardError::UrlNotMapped.into());
        }

        Ok(Self {
            location,
            company_link: config.links.company.clone(),
            domain,
            mapping: config.fields.clone(),
            check_duplicates,
        })
    }
}

/// Where company records come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProviderSource {
    #[default]
    Tracxn,
    /// A saved provider response; no provider token is needed.
    Recorded(PathBuf),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub provider_token: Option<String>,
    pub destination_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("provider_token", &self.provider_token.as_ref().map(|_| "<redacted>"))
            .field("destination_token", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Fetch every token the run needs; blank values count as missing.
    pub fn resolve(
        lookup: impl Fn(&str) -> Option<String>,
        source: &ProviderSource,
    ) -> Result<Self, SyncError> {
        let require = |var: &'static str| {
            lookup(var)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(SyncError::Credential { var })
        };

        let provider_token = match source {
            ProviderSource::Tracxn => Some(require(PROVIDER_TOKEN_VAR)?),
            ProviderSource::Recorded(_) => None,
        };
        let destination_token = require(DESTINATION_TOKEN_VAR)?;

        Ok(Self {
            provider_token,
            destination_token,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("configuration error: duplicate checking needs the URL field mapped to a column")]
    UrlNotMapped,
    #[error("candidate row has no `{column}` column to compare against existing rows")]
    MissingUrlColumn { column: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Insert,
    Duplicate { record_id: String },
}

/// Point-in-time duplicate check against the destination's current rows.
///
/// The read and the following insert are not atomic: two concurrent imports
/// of the same domain can both pass. Callers that need strict uniqueness must
/// serialize runs themselves.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateGuard {
    pub enforce_uniqueness: bool,
}

impl DuplicateGuard {
    pub fn new(enforce_uniqueness: bool) -> Self {
        Self { enforce_uniqueness }
    }

    pub fn decide(
        &self,
        candidate: &DestinationRow,
        existing: &[StoredRow],
        url_column: &str,
    ) -> Result<GuardDecision, GuardError> {
        if !self.enforce_uniqueness {
            return Ok(GuardDecision::Insert);
        }
        Ok(match find_duplicate(candidate, existing, url_column)? {
            Some(row) => GuardDecision::Duplicate {
                record_id: row.id.clone(),
            },
            None => GuardDecision::Insert,
        })
    }
}

/// First existing row whose `url_column` text equals the candidate's exactly.
pub fn find_duplicate<'a>(
    candidate: &DestinationRow,
    existing: &'a [StoredRow],
    url_column: &str,
) -> Result<Option<&'a StoredRow>, GuardError> {
    let value = candidate
        .get(url_column)
        .ok_or_else(|| GuardError::MissingUrlColumn {
            column: url_column.to_string(),
        })?;
    let Some(url) = value.as_text() else {
        return Ok(None);
    };
    Ok(existing.iter().find(|row| row.text(url_column) == Some(url)))
}

pub fn should_insert(
    candidate: &DestinationRow,
    existing: &[StoredRow],
    url_column: &str,
    enforce_uniqueness: bool,
) -> Result<bool, GuardError> {
    DuplicateGuard::new(enforce_uniqueness)
        .decide(candidate, existing, url_column)
        .map(|decision| decision == GuardDecision::Insert)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Overrides the configuration's `check_duplicates` to false when set.
    pub allow_duplicates: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Inserted {
        record_id: String,
        row: DestinationRow,
    },
    Skipped {
        existing_record_id: String,
    },
    DryRun {
        row: DestinationRow,
        would_insert: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub domain: String,
    pub location: DestinationLocation,
    pub outcome: SyncOutcome,
    pub empty_fields: Vec<FieldFailure>,
}

pub struct SyncPipeline {
    provider: Box<dyn CompanyProvider>,
    destination: Box<dyn DestinationStore>,
    options: SyncOptions,
}

impl SyncPipeline {
    pub fn new(
        provider: Box<dyn CompanyProvider>,
        destination: Box<dyn DestinationStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            provider,
            destination,
            options,
        }
    }

    /// Query, map, check and insert. Any failure stops the run before the
    /// write, so no partial row is ever created.
    pub async fn run_once(&self, plan: &ImportPlan) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, domain = %plan.domain);
        self.run_inner(run_id, plan).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, plan: &ImportPlan) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let domain = plan.domain.clone();

        let response = self
            .provider
            .find_by_domain(&domain)
            .await
            .map_err(|err| SyncError::NotFound {
                domain: domain.clone(),
                reason: err.to_string(),
            })?;

        let mapped = map_query_result(&response, &plan.mapping).map_err(|err| match err {
            MatchError::NoMatch => SyncError::NotFound {
                domain: domain.clone(),
                reason: format!("{} has no company with this domain", self.provider.provider_id()),
            },
            MatchError::Ambiguous { count } => SyncError::AmbiguousMatch {
                domain: domain.clone(),
                count,
            },
        })?;
        info!(
            columns = mapped.row.len(),
            empty = mapped.failures.len(),
            "company record mapped"
        );

        let guard = DuplicateGuard::new(plan.check_duplicates && !self.options.allow_duplicates);
        let decision = if guard.enforce_uniqueness {
            let url_column = plan.mapping.url_column().ok_or(GuardError::UrlNotMapped)?;
            let existing = self
                .destination
                .list_rows()
                .await
                .map_err(SyncError::DestinationRead)?;
            debug!(existing = existing.len(), url_column, "checking for duplicates");
            guard.decide(&mapped.row, &existing, url_column)?
        } else {
            GuardDecision::Insert
        };

        let outcome = match (decision, self.options.dry_run) {
            (GuardDecision::Duplicate { record_id }, false) => {
                info!(existing_record_id = %record_id, "company already imported; skipping");
                SyncOutcome::Skipped {
                    existing_record_id: record_id,
                }
            }
            (decision, true) => {
                let would_insert = decision == GuardDecision::Insert;
                info!(would_insert, "dry run; nothing written");
                SyncOutcome::DryRun {
                    row: mapped.row,
                    would_insert,
                }
            }
            (GuardDecision::Insert, false) => {
                let created = self
                    .destination
                    .create_row(&mapped.row)
                    .await
                    .map_err(|err| match err {
                        StoreError::Rejected { status, message } => {
                            SyncError::Insert(format!("http {status}: {message}"))
                        }
                        other => SyncError::Insert(other.to_string()),
                    })?;
                info!(record_id = %created.id, "row inserted");
                SyncOutcome::Inserted {
                    record_id: created.id,
                    row: mapped.row,
                }
            }
        };

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            domain,
            location: self.destination.location().clone(),
            outcome,
            empty_fields: mapped.failures,
        })
    }
}

/// Per-invocation choices made on the command line.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub config_path: Option<PathBuf>,
    pub provider: ProviderSource,
    pub options: SyncOptions,
}

/// Configuration, destination link, domain and credentials, resolved without
/// touching the network.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub settings: SyncConfig,
    pub plan: ImportPlan,
    pub credentials: Credentials,
}

pub fn prepare_run(
    settings: SyncConfig,
    request: &RunRequest,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PreparedRun, SyncError> {
    let config_path = request
        .config_path
        .clone()
        .unwrap_or_else(|| settings.config_path.clone());
    let config = load_import_config(&config_path).map_err(SyncError::Configuration)?;
    let plan = ImportPlan::from_config(&config)?;
    let credentials = Credentials::resolve(lookup, &request.provider)?;
    debug!(
        base = %plan.location.base_id,
        table = %plan.location.table_id,
        domain = %plan.domain,
        "import plan resolved"
    );
    Ok(PreparedRun {
        settings,
        plan,
        credentials,
    })
}

/// Steps up to and including credential lookup, reading the real environment.
pub fn check_from_env(request: &RunRequest) -> Result<PreparedRun, SyncError> {
    prepare_run(SyncConfig::from_env(), request, |name| std::env::var(name).ok())
}

fn build_pipeline(prepared: &PreparedRun, request: &RunRequest) -> Result<SyncPipeline, SyncError> {
    let settings = &prepared.settings;

    let provider: Box<dyn CompanyProvider> = match &request.provider {
        ProviderSource::Tracxn => {
            let token = prepared
                .credentials
                .provider_token
                .clone()
                .ok_or(SyncError::Credential {
                    var: PROVIDER_TOKEN_VAR,
                })?;
            let api = ApiClient::new(settings.http_client_config(ApiAuth::Header {
                name: "accessToken".to_string(),
                token,
            }))
            .map_err(SyncError::Configuration)?;
            Box::new(TracxnProvider::new(api, settings.tracxn_api_url.clone()))
        }
        ProviderSource::Recorded(path) => {
            Box::new(RecordedProvider::from_file(path).map_err(SyncError::Configuration)?)
        }
    };

    let api = ApiClient::new(settings.http_client_config(ApiAuth::Bearer(
        prepared.credentials.destination_token.clone(),
    )))
    .map_err(SyncError::Configuration)?;
    let destination = AirtableStore::new(
        api,
        settings.airtable_api_url.clone(),
        prepared.plan.location.clone(),
    );

    Ok(SyncPipeline::new(
        provider,
        Box::new(destination),
        request.options,
    ))
}

pub async fn run_sync_once_from_env(request: &RunRequest) -> Result<SyncRunSummary, SyncError> {
    let prepared = check_from_env(request)?;
    let pipeline = build_pipeline(&prepared, request)?;
    pipeline.run_once(&prepared.plan).await
}
