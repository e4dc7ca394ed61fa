//! Stale-mark / crawl / prune reconciliation of one source against the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use jobscrape_adapters::{extract, CompiledSelectors, PageFetcher};
use jobscrape_core::{
    normalize_date, FetchMode, NewListing, RawListing, ScopeGranularity, ScopeKey, SourceConfig, SourceRegistry,
    UpsertOutcome, UNSPECIFIED_LOCATION,
};
use jobscrape_storage::ListingStore;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Serializes reconciliation of a company's listings across concurrent runs.
///
/// Locks are keyed by company, so a company-wide pass and a partitioned pass of the same
/// company never overlap either.
#[derive(Debug, Default)]
pub struct ScopeLocks {
    companies: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, scope: ScopeKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut companies = self.companies.lock().await;
            companies.entry(scope.company_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub fetch_mode: FetchMode,
    pub granularity: ScopeGranularity,
    pub refresh_fields: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            fetch_mode: FetchMode::Dynamic,
            granularity: ScopeGranularity::Category,
            refresh_fields: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePhase {
    MarkStale,
    Crawling,
    Prune,
}

impl fmt::Display for ScopePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopePhase::MarkStale => "mark_stale",
            ScopePhase::Crawling => "crawling",
            ScopePhase::Prune => "prune",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScopeStatus {
    Completed,
    /// Crawled and upserted, but nothing was marked or pruned.
    Unpruned { reason: String },
    Failed { phase: ScopePhase, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeReport {
    pub company: String,
    pub scope: ScopeKey,
    #[serde(flatten)]
    pub status: ScopeStatus,
    pub marked: u64,
    pub records: usize,
    pub created: usize,
    pub refreshed: usize,
    pub pruned: u64,
    pub listings: Vec<RawListing>,
}

impl ScopeReport {
    fn new(company: &str, scope: ScopeKey) -> Self {
        Self {
            company: company.to_string(),
            scope,
            status: ScopeStatus::Completed,
            marked: 0,
            records: 0,
            created: 0,
            refreshed: 0,
            pruned: 0,
            listings: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        !matches!(self.status, ScopeStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub company: String,
    /// Set when the source could not be planned at all; no listing was touched.
    pub skipped: Option<String>,
    pub scopes: Vec<ScopeReport>,
}

#[derive(Debug, Clone)]
struct GroupLabels {
    category_id: i64,
    category: String,
    job_type_id: i64,
    job_type: String,
}

#[derive(Debug, Clone)]
struct CrawlTarget {
    labels: Option<GroupLabels>,
    urls: Vec<String>,
}

#[derive(Debug, Clone)]
struct ScopePlan {
    key: ScopeKey,
    targets: Vec<CrawlTarget>,
    /// Part of the scope could not be crawled, so unseen listings cannot be told apart from gone ones.
    prune_blocked: Option<String>,
}

impl ScopePlan {
    fn url_count(&self) -> usize {
        self.targets.iter().map(|t| t.urls.len()).sum()
    }
}

pub struct ReconcileEngine {
    store: Arc<dyn ListingStore>,
    locks: Arc<ScopeLocks>,
    options: ReconcileOptions,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn ListingStore>, locks: Arc<ScopeLocks>, options: ReconcileOptions) -> Self {
        Self { store, locks, options }
    }

    /// Reconcile every scope of `source`. Scope failures are contained and reported, never raised.
    pub async fn reconcile_source(
        &self,
        fetcher: &mut dyn PageFetcher,
        registry: &SourceRegistry,
        source: &SourceConfig,
    ) -> SourceReport {
        let company = source.company_name.clone();
        let mut report = SourceReport {
            company: company.clone(),
            skipped: None,
            scopes: Vec::new(),
        };

        let selectors = match CompiledSelectors::compile(&source.selectors) {
            Ok(selectors) => selectors,
            Err(err) => {
                warn!(company = %company, error = %err, "source skipped: bad selector configuration");
                report.skipped = Some(err.to_string());
                return report;
            }
        };

        let plans = match self.plan(registry, source).await {
            Ok(plans) => plans,
            Err(err) => {
                warn!(company = %company, error = %format!("{err:#}"), "source skipped: could not resolve scopes");
                report.skipped = Some(format!("{err:#}"));
                return report;
            }
        };

        for plan in &plans {
            let scope = self.reconcile_scope(fetcher, source, &selectors, plan).await;
            report.scopes.push(scope);
        }
        report
    }

    async fn plan(&self, registry: &SourceRegistry, source: &SourceConfig) -> Result<Vec<ScopePlan>> {
        let company_id = self
            .store
            .ensure_company(&source.company_profile())
            .await
            .with_context(|| format!("ensuring company `{}`", source.company_name))?;

        let mut plans: Vec<ScopePlan> = Vec::new();
        if !source.has_url_groups() {
            plans.push(ScopePlan {
                key: ScopeKey::company(company_id),
                targets: vec![CrawlTarget {
                    labels: None,
                    urls: source.url.clone(),
                }],
                prune_blocked: None,
            });
        } else {
            let granularity = source.scope_granularity(self.options.granularity);
            let mut uncrawled = Vec::new();
            for group in &source.job_urls {
                let Some(category) = registry.category_name(&group.category_id) else {
                    warn!(company = %source.company_name, category_id = %group.category_id, "unknown category id; group skipped");
                    uncrawled.push(format!("unknown category id {}", group.category_id));
                    continue;
                };
                let Some(job_type) = registry.job_type_name(&group.type_id) else {
                    warn!(company = %source.company_name, type_id = %group.type_id, "unknown job type id; group skipped");
                    uncrawled.push(format!("unknown job type id {}", group.type_id));
                    continue;
                };
                if group.url.is_empty() {
                    uncrawled.push(format!("no urls for {category} / {job_type}"));
                }
                let category_id = self.store.ensure_category(category).await?;
                let job_type_id = self.store.ensure_job_type(job_type).await?;

                let key = match granularity {
                    ScopeGranularity::Company => ScopeKey::company(company_id),
                    ScopeGranularity::Category => ScopeKey::partitioned(company_id, category_id, job_type_id),
                };
                let target = CrawlTarget {
                    labels: Some(GroupLabels {
                        category_id,
                        category: category.to_string(),
                        job_type_id,
                        job_type: job_type.to_string(),
                    }),
                    urls: group.url.clone(),
                };
                match plans.iter_mut().find(|plan| plan.key == key) {
                    Some(plan) => plan.targets.push(target),
                    None => plans.push(ScopePlan {
                        key,
                        targets: vec![target],
                        prune_blocked: None,
                    }),
                }
            }

            if granularity == ScopeGranularity::Company && !uncrawled.is_empty() {
                let reason = format!("groups not crawled: {}", uncrawled.join("; "));
                warn!(company = %source.company_name, %reason, "company scope will not be pruned");
                for plan in &mut plans {
                    plan.prune_blocked = Some(reason.clone());
                }
            }
        }

        plans.retain(|plan| {
            let keep = plan.url_count() > 0;
            if !keep {
                warn!(company = %source.company_name, scope = %plan.key, "scope has no urls; left untouched");
            }
            keep
        });
        Ok(plans)
    }

    async fn reconcile_scope(
        &self,
        fetcher: &mut dyn PageFetcher,
        source: &SourceConfig,
        selectors: &CompiledSelectors,
        plan: &ScopePlan,
    ) -> ScopeReport {
        let span = info_span!("scope", company = %source.company_name, scope = %plan.key);
        async move {
            let _guard = self.locks.acquire(plan.key).await;
            let mut report = ScopeReport::new(&source.company_name, plan.key);

            match self.run_phases(fetcher, source, selectors, plan, &mut report).await {
                Ok(()) => info!(
                    records = report.records,
                    created = report.created,
                    refreshed = report.refreshed,
                    pruned = report.pruned,
                    "scope reconciled"
                ),
                Err((phase, err)) => {
                    error!(
                        %phase,
                        error = %format!("{err:#}"),
                        event = "ScopeReconciliationFailed",
                        "scope aborted; clearing stale flags"
                    );
                    if let Err(clear_err) = self.store.clear_stale(&plan.key).await {
                        error!(error = %format!("{clear_err:#}"), "clearing stale flags failed");
                    }
                    report.status = ScopeStatus::Failed {
                        phase,
                        error: format!("{err:#}"),
                    };
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn run_phases(
        &self,
        fetcher: &mut dyn PageFetcher,
        source: &SourceConfig,
        selectors: &CompiledSelectors,
        plan: &ScopePlan,
        report: &mut ScopeReport,
    ) -> std::result::Result<(), (ScopePhase, anyhow::Error)> {
        if let Some(reason) = &plan.prune_blocked {
            self.crawl(fetcher, source, selectors, plan, report)
                .await
                .map_err(|err| (ScopePhase::Crawling, err))?;
            report.status = ScopeStatus::Unpruned { reason: reason.clone() };
            return Ok(());
        }

        report.marked = self
            .store
            .mark_stale(&plan.key)
            .await
            .map_err(|err| (ScopePhase::MarkStale, err))?;
        debug!(marked = report.marked, "existing listings marked stale");

        self.crawl(fetcher, source, selectors, plan, report)
            .await
            .map_err(|err| (ScopePhase::Crawling, err))?;

        report.pruned = self
            .store
            .prune_stale(&plan.key)
            .await
            .map_err(|err| (ScopePhase::Prune, err))?;
        Ok(())
    }

    async fn crawl(
        &self,
        fetcher: &mut dyn PageFetcher,
        source: &SourceConfig,
        selectors: &CompiledSelectors,
        plan: &ScopePlan,
        report: &mut ScopeReport,
    ) -> Result<()> {
        let mode = source.fetch_mode(self.options.fetch_mode);
        for target in &plan.targets {
            let category = target.labels.as_ref().map(|l| l.category.as_str());
            let job_type = target.labels.as_ref().map(|l| l.job_type.as_str());

            for url in &target.urls {
                let pages = fetcher
                    .fetch(url, mode, &source.pagination)
                    .await
                    .with_context(|| format!("fetching {url}"))?;

                for page in &pages {
                    let records = extract(&page.body, selectors, category, job_type);
                    debug!(url = %page.url, records = records.len(), "page extracted");
                    for record in records {
                        self.persist(plan.key.company_id, target, record, report).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn persist(
        &self,
        company_id: i64,
        target: &CrawlTarget,
        record: RawListing,
        report: &mut ScopeReport,
    ) -> Result<()> {
        info!(
            title = ?record.title,
            location = ?record.location,
            date = ?record.date_text,
            link = ?record.link,
            "listing observed"
        );

        let date_posted = record.date_text.as_deref().and_then(|text| match normalize_date(text) {
            Ok(ts) => Some(ts),
            Err(err) => {
                warn!(error = %err, event = "UnparseableDate", "posting date left empty");
                None
            }
        });

        let listing = NewListing {
            identity: record.identity(),
            company_id,
            category_id: target.labels.as_ref().map(|l| l.category_id),
            job_type_id: target.labels.as_ref().map(|l| l.job_type_id),
            title: record.title.clone(),
            location: record
                .location
                .clone()
                .unwrap_or_else(|| UNSPECIFIED_LOCATION.to_string()),
            date_posted,
            link: record.link.clone(),
        };

        let outcome = self
            .store
            .upsert_listing(&listing, self.options.refresh_fields)
            .await?;
        match outcome {
            UpsertOutcome::Created => report.created += 1,
            UpsertOutcome::Refreshed => report.refreshed += 1,
        }
        report.records += 1;
        report.listings.push(record);
        Ok(())
    }
}
