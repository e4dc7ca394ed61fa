//! Core domain model for the career-page scraping pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub mod dates;
pub mod identity;

pub use dates::{normalize_date, normalize_date_at, subtract_months, DateError};
pub use identity::{listing_identity, ListingIdentity};

/// Location stored when the source markup does not name one.
pub const UNSPECIFIED_LOCATION: &str = "United States";

/// Company name used when a source entry omits `company_name`.
pub const UNDISCLOSED_COMPANY: &str = "Not Disclosing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Static,
    Dynamic,
}

impl FromStr for FetchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(format!("unknown fetch mode `{other}` (expected static|dynamic)")),
        }
    }
}

/// Granularity of the staleness scope used while reconciling a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeGranularity {
    /// Every listing of the company is one scope.
    Company,
    /// Each (category, job type) group of the company is its own scope.
    Category,
}

impl FromStr for ScopeGranularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "company" => Ok(Self::Company),
            "category" | "category_type" | "company+category+type" => Ok(Self::Category),
            other => Err(format!("unknown scope granularity `{other}` (expected company|category)")),
        }
    }
}

/// Identifier of a category or job type inside the registry file. Accepts numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LabelId(pub String);

impl<'de> Deserialize<'de> for LabelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(i64),
            Str(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Num(n) => LabelId(n.to_string()),
            Repr::Str(s) => LabelId(s.trim().to_string()),
        })
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LabelId {
    fn from(value: &str) -> Self {
        LabelId(value.to_string())
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        One(String),
        Many(Vec<String>),
        Null(()),
    }
    Ok(match Repr::deserialize(deserializer)? {
        Repr::One(url) => vec![url],
        Repr::Many(urls) => urls,
        Repr::Null(()) => Vec::new(),
    })
}

/// Decoded source registry: the configured career pages plus the category/type label tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceRegistry {
    pub job_categories: BTreeMap<LabelId, String>,
    pub job_types: BTreeMap<LabelId, String>,
    pub websites: Vec<SourceConfig>,
}

impl<'de> Deserialize<'de> for SourceRegistry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Full {
            #[serde(default)]
            job_categories: BTreeMap<LabelId, String>,
            #[serde(default)]
            job_types: BTreeMap<LabelId, String>,
            websites: Vec<SourceConfig>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bare(Vec<SourceConfig>),
            Full(Full),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Full(full) => SourceRegistry {
                job_categories: full.job_categories,
                job_types: full.job_types,
                websites: full.websites,
            },
            Repr::Bare(websites) => SourceRegistry {
                websites,
                ..SourceRegistry::default()
            },
        })
    }
}

impl SourceRegistry {
    pub fn category_name(&self, id: &LabelId) -> Option<&str> {
        self.job_categories.get(id).map(String::as_str)
    }

    pub fn job_type_name(&self, id: &LabelId) -> Option<&str> {
        self.job_types.get(id).map(String::as_str)
    }
}

/// One configured employer career page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_company_name")]
    pub company_name: String,
    #[serde(default)]
    pub company_logo: Option<String>,
    #[serde(default)]
    pub company_desc: Option<String>,
    #[serde(default)]
    pub company_career_url: Option<String>,
    #[serde(default, alias = "compnany_job_base_url")]
    pub company_job_base_url: Option<String>,
    #[serde(default)]
    pub company_tags: Vec<String>,
    #[serde(flatten)]
    pub selectors: SelectorConfig,
    #[serde(flatten)]
    pub pagination: PaginationConfig,
    #[serde(default, deserialize_with = "one_or_many")]
    pub url: Vec<String>,
    #[serde(default)]
    pub job_urls: Vec<UrlGroup>,
    /// Overrides the run-wide fetch mode for this source.
    #[serde(default)]
    pub dynamic: Option<bool>,
    /// Overrides the run-wide scope granularity for this source.
    #[serde(default)]
    pub scope: Option<ScopeGranularity>,
}

fn default_company_name() -> String {
    UNDISCLOSED_COMPANY.to_string()
}

impl SourceConfig {
    pub fn company_profile(&self) -> CompanyProfile {
        CompanyProfile {
            name: self.company_name.clone(),
            logo: self.company_logo.clone(),
            description: self.company_desc.clone(),
            career_url: self.company_career_url.clone(),
            job_base_url: self.company_job_base_url.clone(),
            tags: self.company_tags.clone(),
        }
    }

    pub fn has_url_groups(&self) -> bool {
        !self.job_urls.is_empty()
    }

    pub fn fetch_mode(&self, default: FetchMode) -> FetchMode {
        match self.dynamic {
            Some(true) => FetchMode::Dynamic,
            Some(false) => FetchMode::Static,
            None => default,
        }
    }

    /// Flat-URL sources have no partitions, so they always reconcile per company.
    pub fn scope_granularity(&self, default: ScopeGranularity) -> ScopeGranularity {
        if !self.has_url_groups() {
            return ScopeGranularity::Company;
        }
        self.scope.unwrap_or(default)
    }
}

/// CSS selectors and flags that locate listing fields inside a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub job_selector: String,
    #[serde(default)]
    pub title_selector: Option<String>,
    #[serde(default)]
    pub location_selector: Option<String>,
    /// Read the location from the node right after the matched element.
    #[serde(default)]
    pub next_sibling: bool,
    #[serde(default)]
    pub date_selector: Option<String>,
    #[serde(default)]
    pub link_selector: Option<String>,
    /// The listing container itself carries the `href`.
    #[serde(default)]
    pub link_in_job_selector: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default)]
    pub load_more_selector: Option<String>,
    #[serde(default)]
    pub infinite_scroll: bool,
    #[serde(default)]
    pub next_page_selector: Option<String>,
}

impl PaginationConfig {
    pub fn load_more(&self) -> Option<&str> {
        non_blank(self.load_more_selector.as_deref())
    }

    pub fn next_page(&self) -> Option<&str> {
        non_blank(self.next_page_selector.as_deref())
    }
}

pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// A category × job type URL group declared by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlGroup {
    pub category_id: LabelId,
    pub type_id: LabelId,
    #[serde(default, deserialize_with = "one_or_many")]
    pub url: Vec<String>,
}

/// Company metadata written once when the company is first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub name: String,
    pub logo: Option<String>,
    pub description: Option<String>,
    pub career_url: Option<String>,
    pub job_base_url: Option<String>,
    pub tags: Vec<String>,
}

/// Listing fields as found in the page markup. `None` means the markup did not yield the field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: Option<String>,
    pub location: Option<String>,
    pub date_text: Option<String>,
    pub link: Option<String>,
    pub category: Option<String>,
    pub job_type: Option<String>,
}

impl RawListing {
    pub fn identity(&self) -> ListingIdentity {
        listing_identity(self.title.as_deref(), self.link.as_deref())
    }
}

/// The (category, job type) narrowing of a company scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub category_id: i64,
    pub job_type_id: i64,
}

/// Unit of staleness tracking during one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub company_id: i64,
    pub partition: Option<Partition>,
}

impl ScopeKey {
    pub fn company(company_id: i64) -> Self {
        Self {
            company_id,
            partition: None,
        }
    }

    pub fn partitioned(company_id: i64, category_id: i64, job_type_id: i64) -> Self {
        Self {
            company_id,
            partition: Some(Partition {
                category_id,
                job_type_id,
            }),
        }
    }

    /// Whether a listing with these references falls inside this scope.
    pub fn contains(&self, company_id: i64, category_id: Option<i64>, job_type_id: Option<i64>) -> bool {
        if company_id != self.company_id {
            return false;
        }
        match self.partition {
            None => true,
            Some(p) => category_id == Some(p.category_id) && job_type_id == Some(p.job_type_id),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            None => write!(f, "company={}", self.company_id),
            Some(p) => write!(
                f,
                "company={}/category={}/type={}",
                self.company_id, p.category_id, p.job_type_id
            ),
        }
    }
}

/// Upsert payload produced for every extracted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewListing {
    pub identity: ListingIdentity,
    pub company_id: i64,
    pub category_id: Option<i64>,
    pub job_type_id: Option<i64>,
    pub title: Option<String>,
    pub location: String,
    pub date_posted: Option<DateTime<Utc>>,
    pub link: Option<String>,
}

/// A listing row as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedListing {
    pub id: i64,
    pub identity: ListingIdentity,
    pub company_id: i64,
    pub category_id: Option<i64>,
    pub job_type_id: Option<i64>,
    pub title: Option<String>,
    pub location: String,
    pub date_posted: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub link: Option<String>,
    pub stale: bool,
    /// First-level administrative area resolved from `location`, filled in after scraping.
    pub state_location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Refreshed,
}
