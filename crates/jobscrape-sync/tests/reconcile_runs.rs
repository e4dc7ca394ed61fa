use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jobscrape_adapters::{FetchedPage, PageFetcher, ScrapeError};
use jobscrape_core::{FetchMode, PaginationConfig, ScopeKey};
use jobscrape_storage::{ListingStore, MemoryListingStore};
use jobscrape_sync::{ScopePhase, ScopeStatus, SyncConfig, SyncPipeline};
use serde_json::json;
use tempfile::TempDir;

#[derive(Default)]
struct ScriptedFetcher {
    pages: HashMap<String, String>,
    failing: HashSet<String>,
    fetched: Vec<String>,
    closes: usize,
}

impl ScriptedFetcher {
    fn serve(&mut self, url: &str, titles: &[&str]) {
        self.failing.remove(url);
        self.pages.insert(url.to_string(), listing_page(titles));
    }

    fn fail(&mut self, url: &str) {
        self.pages.remove(url);
        self.failing.insert(url.to_string());
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(
        &mut self,
        url: &str,
        _mode: FetchMode,
        _pagination: &PaginationConfig,
    ) -> Result<Vec<FetchedPage>, ScrapeError> {
        self.fetched.push(url.to_string());
        if self.failing.contains(url) {
            return Err(ScrapeError::FetchFailed {
                url: url.to_string(),
                attempts: 3,
                message: "connection reset".into(),
            });
        }
        let body = self.pages.get(url).cloned().unwrap_or_default();
        Ok(vec![FetchedPage {
            url: url.to_string(),
            body,
            fetched_at: Utc::now(),
        }])
    }

    async fn close(&mut self) -> Result<(), ScrapeError> {
        self.closes += 1;
        Ok(())
    }
}

fn listing_page(titles: &[&str]) -> String {
    let items: String = titles
        .iter()
        .map(|title| {
            let slug = title.to_lowercase().replace(' ', "-");
            format!(
                r#"<li class="job"><a class="title" href="/jobs/{slug}">{title}</a><span class="loc">Remote</span><span class="date">2 days ago</span></li>"#
            )
        })
        .collect();
    format!("<html><body><ul>{items}</ul></body></html>")
}

fn selectors() -> serde_json::Value {
    json!({
        "job_selector": "li.job",
        "title_selector": "a.title",
        "link_selector": "a.title",
        "location_selector": "span.loc",
        "date_selector": "span.date"
    })
}

fn source(name: &str, extra: serde_json::Value) -> serde_json::Value {
    let mut entry = selectors();
    entry["company_name"] = json!(name);
    if let (Some(entry), Some(extra)) = (entry.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            entry.insert(key.clone(), value.clone());
        }
    }
    entry
}

fn registry(websites: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "job_categories": { "1": "Engineering", "2": "Design" },
        "job_types": { "1": "Full-time" },
        "websites": websites
    })
}

struct Harness {
    dir: TempDir,
    store: Arc<MemoryListingStore>,
    pipeline: SyncPipeline,
}

fn harness(registry: serde_json::Value) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sources_path = dir.path().join("websites.json");
    std::fs::write(&sources_path, serde_json::to_vec_pretty(&registry).unwrap()).unwrap();

    let config = SyncConfig {
        sources_path,
        reports_dir: dir.path().join("reports"),
        fetch_mode: FetchMode::Static,
        ..SyncConfig::default()
    };
    let store = Arc::new(MemoryListingStore::new());
    let pipeline = SyncPipeline::new(config, store.clone());
    Harness { dir, store, pipeline }
}

async fn titles(store: &MemoryListingStore, scope: Option<&ScopeKey>) -> Vec<String> {
    let mut titles: Vec<String> = store
        .listings(scope)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|l| l.title)
        .collect();
    titles.sort();
    titles
}

#[tokio::test]
async fn listings_missing_from_a_full_crawl_are_pruned() {
    let h = harness(registry(vec![source("Acme", json!({ "url": "https://acme.example/jobs" }))]));
    let mut fetcher = ScriptedFetcher::default();

    fetcher.serve("https://acme.example/jobs", &["Alpha", "Beta", "Gamma"]);
    let first = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(first.created, 3);
    assert_eq!(titles(&h.store, None).await, ["Alpha", "Beta", "Gamma"]);

    fetcher.serve("https://acme.example/jobs", &["Alpha", "Beta"]);
    let second = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.refreshed, 2);
    assert_eq!(second.pruned, 1);
    assert_eq!(titles(&h.store, None).await, ["Alpha", "Beta"]);
}

#[tokio::test]
async fn failed_fetch_keeps_existing_listings_live() {
    let h = harness(registry(vec![source("Acme", json!({ "url": "https://acme.example/jobs" }))]));
    let mut fetcher = ScriptedFetcher::default();

    fetcher.serve("https://acme.example/jobs", &["Alpha", "Beta"]);
    h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();

    fetcher.fail("https://acme.example/jobs");
    let summary = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(summary.scopes_failed, 1);
    assert_eq!(summary.pruned, 0);

    let scope = &summary.details[0].scopes[0];
    assert!(matches!(
        scope.status,
        ScopeStatus::Failed {
            phase: ScopePhase::Crawling,
            ..
        }
    ));

    let listings = h.store.listings(None).await.unwrap();
    assert_eq!(listings.len(), 2);
    assert!(listings.iter().all(|l| !l.stale));
}

#[tokio::test]
async fn partitions_reconcile_independently() {
    let h = harness(registry(vec![source(
        "Acme",
        json!({
            "job_urls": [
                { "category_id": 1, "type_id": 1, "url": "https://acme.example/eng" },
                { "category_id": "2", "type_id": "1", "url": ["https://acme.example/design"] }
            ]
        }),
    )]));
    let mut fetcher = ScriptedFetcher::default();

    fetcher.serve("https://acme.example/eng", &["Backend Engineer", "Frontend Engineer"]);
    fetcher.serve("https://acme.example/design", &["Product Designer"]);
    let first = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(first.scopes_ok, 2);

    fetcher.serve("https://acme.example/eng", &["Backend Engineer"]);
    fetcher.fail("https://acme.example/design");
    let second = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(second.scopes_ok, 1);
    assert_eq!(second.scopes_failed, 1);
    assert_eq!(second.pruned, 1);

    assert_eq!(
        titles(&h.store, None).await,
        ["Backend Engineer", "Product Designer"]
    );
    let design = h
        .store
        .listings(None)
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.title.as_deref() == Some("Product Designer"))
        .unwrap();
    assert!(design.category_id.is_some());
    assert!(!design.stale);
}

#[tokio::test]
async fn rerunning_unchanged_pages_changes_nothing() {
    let h = harness(registry(vec![source("Acme", json!({ "url": "https://acme.example/jobs" }))]));
    let mut fetcher = ScriptedFetcher::default();
    fetcher.serve("https://acme.example/jobs", &["Alpha", "Beta"]);

    h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    let before = h.store.listings(None).await.unwrap();

    let summary = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    let after = h.store.listings(None).await.unwrap();

    assert_eq!(summary.created, 0);
    assert_eq!(summary.refreshed, 2);
    assert_eq!(before.len(), after.len());
    for (old, new) in before.iter().zip(after.iter()) {
        assert_eq!(old.identity, new.identity);
        assert_eq!(old.discovered_at, new.discovered_at);
        assert_eq!(old.location, "Remote");
    }
}

#[tokio::test]
async fn company_granularity_prunes_across_groups() {
    let h = harness(registry(vec![source(
        "Acme",
        json!({
            "scope": "company",
            "job_urls": [
                { "category_id": 1, "type_id": 1, "url": "https://acme.example/eng" },
                { "category_id": 2, "type_id": 1, "url": "https://acme.example/design" }
            ]
        }),
    )]));
    let mut fetcher = ScriptedFetcher::default();

    fetcher.serve("https://acme.example/eng", &["Backend Engineer"]);
    fetcher.serve("https://acme.example/design", &["Product Designer"]);
    let first = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(first.details[0].scopes.len(), 1);

    fetcher.serve("https://acme.example/design", &[]);
    let second = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(second.pruned, 1);
    assert_eq!(titles(&h.store, None).await, ["Backend Engineer"]);
}

#[tokio::test]
async fn groups_with_unknown_labels_are_skipped() {
    let h = harness(registry(vec![source(
        "Acme",
        json!({
            "job_urls": [
                { "category_id": 1, "type_id": 1, "url": "https://acme.example/eng" },
                { "category_id": 99, "type_id": 1, "url": "https://acme.example/mystery" }
            ]
        }),
    )]));
    let mut fetcher = ScriptedFetcher::default();
    fetcher.serve("https://acme.example/eng", &["Backend Engineer"]);

    let summary = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(summary.details[0].scopes.len(), 1);
    assert_eq!(fetcher.fetched, ["https://acme.example/eng"]);
}

#[tokio::test]
async fn company_scope_keeps_listings_of_skipped_groups() {
    let acme = source(
        "Acme",
        json!({
            "scope": "company",
            "job_urls": [
                { "category_id": 1, "type_id": 1, "url": "https://acme.example/eng" },
                { "category_id": 2, "type_id": 1, "url": "https://acme.example/design" }
            ]
        }),
    );
    let h = harness(registry(vec![acme.clone()]));
    let mut fetcher = ScriptedFetcher::default();
    fetcher.serve("https://acme.example/eng", &["Backend Engineer"]);
    fetcher.serve("https://acme.example/design", &["Product Designer"]);
    h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(titles(&h.store, None).await, ["Backend Engineer", "Product Designer"]);

    let mut without_design = registry(vec![acme]);
    without_design["job_categories"] = json!({ "1": "Engineering" });
    std::fs::write(
        h.dir.path().join("websites.json"),
        serde_json::to_vec_pretty(&without_design).unwrap(),
    )
    .unwrap();

    let second = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(second.pruned, 0);
    assert_eq!(second.scopes_ok, 1);
    assert_eq!(second.refreshed, 1);
    assert!(matches!(
        second.details[0].scopes[0].status,
        ScopeStatus::Unpruned { .. }
    ));
    assert_eq!(titles(&h.store, None).await, ["Backend Engineer", "Product Designer"]);
    assert!(h.store.listings(None).await.unwrap().iter().all(|l| !l.stale));
}

#[tokio::test]
async fn bad_selector_skips_only_that_source() {
    let mut broken = source("Broken", json!({ "url": "https://broken.example" }));
    broken["job_selector"] = json!("li[");
    let h = harness(registry(vec![
        broken,
        source("Acme", json!({ "url": "https://acme.example/jobs" })),
    ]));
    let mut fetcher = ScriptedFetcher::default();
    fetcher.serve("https://acme.example/jobs", &["Alpha"]);

    let summary = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(summary.sources, 2);
    assert_eq!(summary.sources_skipped, 1);
    assert_eq!(summary.created, 1);
    assert_eq!(fetcher.fetched, ["https://acme.example/jobs"]);
}

#[tokio::test]
async fn run_writes_reports_and_closes_the_fetcher() {
    let h = harness(registry(vec![source("Acme", json!({ "url": "https://acme.example/jobs" }))]));
    let mut fetcher = ScriptedFetcher::default();
    fetcher.serve("https://acme.example/jobs", &["Alpha"]);

    let summary = h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();
    assert_eq!(fetcher.closes, 1);

    let run_dir = h.dir.path().join("reports").join(summary.run_id.to_string());
    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(run_dir.join("run_summary.json")).unwrap()).unwrap();
    assert_eq!(json["created"], 1);
    assert_eq!(json["details"][0]["scopes"][0]["status"], "completed");

    let brief = std::fs::read_to_string(run_dir.join("run_brief.md")).unwrap();
    assert!(brief.contains("- Acme: 1 listings"));
}

#[tokio::test]
async fn missing_registry_fails_the_run_but_still_closes() {
    let h = harness(registry(vec![]));
    std::fs::remove_file(h.dir.path().join("websites.json")).unwrap();
    let mut fetcher = ScriptedFetcher::default();

    assert!(h.pipeline.run_with_fetcher(&mut fetcher).await.is_err());
    assert_eq!(fetcher.closes, 1);
    assert!(!Path::new(&h.dir.path().join("reports")).exists());
}

#[tokio::test]
async fn retention_cleanup_removes_old_listings() {
    let h = harness(registry(vec![source("Acme", json!({ "url": "https://acme.example/jobs" }))]));
    let mut fetcher = ScriptedFetcher::default();
    fetcher.serve("https://acme.example/jobs", &["Alpha"]);
    h.pipeline.run_with_fetcher(&mut fetcher).await.unwrap();

    assert_eq!(h.pipeline.clean_expired(30).await.unwrap(), 0);
    assert_eq!(h.pipeline.clean_expired(0).await.unwrap(), 1);
    assert!(h.store.listings(None).await.unwrap().is_empty());
}
