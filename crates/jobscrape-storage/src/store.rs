//! Persistence seam used by the reconciliation engine.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobscrape_core::{
    CompanyProfile, ListingIdentity, NewListing, PersistedListing, ScopeKey, UpsertOutcome, UNSPECIFIED_LOCATION,
};
use tokio::sync::Mutex;

/// Everything the pipeline writes. Reads for the query API happen elsewhere.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Get-or-create by name. Metadata and tags are written only when the company is created.
    async fn ensure_company(&self, profile: &CompanyProfile) -> Result<i64>;

    async fn ensure_category(&self, name: &str) -> Result<i64>;

    async fn ensure_job_type(&self, name: &str) -> Result<i64>;

    /// Flag every listing in `scope` as not yet re-observed.
    async fn mark_stale(&self, scope: &ScopeKey) -> Result<u64>;

    /// Clear the flag on every listing in `scope`.
    async fn clear_stale(&self, scope: &ScopeKey) -> Result<u64>;

    /// Delete listings in `scope` that still carry the flag.
    async fn prune_stale(&self, scope: &ScopeKey) -> Result<u64>;

    /// Insert by identity, or clear the flag on the existing row. Discovery time is never reset.
    async fn upsert_listing(&self, listing: &NewListing, refresh_fields: bool) -> Result<UpsertOutcome>;

    /// Delete listings posted before `cutoff`, or undated listings discovered before it.
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn listings(&self, scope: Option<&ScopeKey>) -> Result<Vec<PersistedListing>>;

    async fn count_listings(&self, scope: Option<&ScopeKey>) -> Result<usize> {
        Ok(self.listings(scope).await?.len())
    }

    /// Listings whose location is more specific than the country default and has no state yet.
    async fn unresolved_locations(&self) -> Result<Vec<UnresolvedLocation>>;

    /// Returns false when the listing no longer exists.
    async fn set_state_location(&self, listing_id: i64, state: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedLocation {
    pub listing_id: i64,
    pub location: String,
}

pub(crate) fn needs_state(location: &str, state_location: Option<&str>) -> bool {
    state_location.is_none() && !location.eq_ignore_ascii_case(UNSPECIFIED_LOCATION)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCompany {
    pub id: i64,
    pub profile: CompanyProfile,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    companies: BTreeMap<String, StoredCompany>,
    categories: BTreeMap<String, i64>,
    job_types: BTreeMap<String, i64>,
    listings: BTreeMap<ListingIdentity, PersistedListing>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn scoped_mut<'a>(&'a mut self, scope: &'a ScopeKey) -> impl Iterator<Item = &'a mut PersistedListing> + 'a {
        self.listings
            .values_mut()
            .filter(move |l| scope.contains(l.company_id, l.category_id, l.job_type_id))
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: Mutex<MemoryState>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn company(&self, name: &str) -> Option<StoredCompany> {
        self.state.lock().await.companies.get(name).cloned()
    }

    pub async fn listing(&self, identity: &ListingIdentity) -> Option<PersistedListing> {
        self.state.lock().await.listings.get(identity).cloned()
    }

    /// Seed a row directly, bypassing upsert semantics.
    pub async fn insert_listing(&self, listing: PersistedListing) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(listing.id);
        state.listings.insert(listing.identity.clone(), listing);
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn ensure_company(&self, profile: &CompanyProfile) -> Result<i64> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.companies.get(&profile.name) {
            return Ok(existing.id);
        }
        let id = state.allocate_id();
        state.companies.insert(
            profile.name.clone(),
            StoredCompany {
                id,
                profile: profile.clone(),
            },
        );
        Ok(id)
    }

    async fn ensure_category(&self, name: &str) -> Result<i64> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.categories.get(name) {
            return Ok(*id);
        }
        let id = state.allocate_id();
        state.categories.insert(name.to_string(), id);
        Ok(id)
    }

    async fn ensure_job_type(&self, name: &str) -> Result<i64> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.job_types.get(name) {
            return Ok(*id);
        }
        let id = state.allocate_id();
        state.job_types.insert(name.to_string(), id);
        Ok(id)
    }

    async fn mark_stale(&self, scope: &ScopeKey) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for listing in state.scoped_mut(scope) {
            listing.stale = true;
            count += 1;
        }
        Ok(count)
    }

    async fn clear_stale(&self, scope: &ScopeKey) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for listing in state.scoped_mut(scope) {
            listing.stale = false;
            count += 1;
        }
        Ok(count)
    }

    async fn prune_stale(&self, scope: &ScopeKey) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.listings.len();
        state
            .listings
            .retain(|_, l| !(l.stale && scope.contains(l.company_id, l.category_id, l.job_type_id)));
        Ok((before - state.listings.len()) as u64)
    }

    async fn upsert_listing(&self, listing: &NewListing, refresh_fields: bool) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.listings.get_mut(&listing.identity) {
            existing.stale = false;
            if refresh_fields {
                existing.location = listing.location.clone();
                if listing.date_posted.is_some() {
                    existing.date_posted = listing.date_posted;
                }
            }
            return Ok(UpsertOutcome::Refreshed);
        }

        let id = state.allocate_id();
        state.listings.insert(
            listing.identity.clone(),
            PersistedListing {
                id,
                identity: listing.identity.clone(),
                company_id: listing.company_id,
                category_id: listing.category_id,
                job_type_id: listing.job_type_id,
                title: listing.title.clone(),
                location: listing.location.clone(),
                date_posted: listing.date_posted,
                discovered_at: Utc::now(),
                link: listing.link.clone(),
                stale: false,
                state_location: None,
            },
        );
        Ok(UpsertOutcome::Created)
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.listings.len();
        state.listings.retain(|_, l| match l.date_posted {
            Some(posted) => posted >= cutoff,
            None => l.discovered_at >= cutoff,
        });
        Ok((before - state.listings.len()) as u64)
    }

    async fn listings(&self, scope: Option<&ScopeKey>) -> Result<Vec<PersistedListing>> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .values()
            .filter(|l| scope.map_or(true, |s| s.contains(l.company_id, l.category_id, l.job_type_id)))
            .cloned()
            .collect())
    }

    async fn unresolved_locations(&self) -> Result<Vec<UnresolvedLocation>> {
        let state = self.state.lock().await;
        let mut pending: Vec<_> = state
            .listings
            .values()
            .filter(|l| needs_state(&l.location, l.state_location.as_deref()))
            .map(|l| UnresolvedLocation {
                listing_id: l.id,
                location: l.location.clone(),
            })
            .collect();
        pending.sort_by_key(|p| p.listing_id);
        Ok(pending)
    }

    async fn set_state_location(&self, listing_id: i64, state_name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.listings.values_mut().find(|l| l.id == listing_id) {
            Some(listing) => {
                listing.state_location = Some(state_name.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
