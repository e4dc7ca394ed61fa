//! Postgres-backed [`ListingStore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobscrape_core::{
    CompanyProfile, ListingIdentity, NewListing, PersistedListing, ScopeKey, UpsertOutcome, UNSPECIFIED_LOCATION,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::store::{ListingStore, UnresolvedLocation};

#[derive(Debug, Clone, Copy)]
enum LabelTable {
    Categories,
    JobTypes,
}

impl LabelTable {
    fn as_str(self) -> &'static str {
        match self {
            LabelTable::Categories => "categories",
            LabelTable::JobTypes => "job_types",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    async fn ensure_named(&self, table: LabelTable, name: &str) -> Result<i64> {
        let table = table.as_str();
        let sql = format!(
            "INSERT INTO {table} (name) VALUES ($1) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING id"
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("ensuring {table} row `{name}`"))?;
        Ok(row.try_get("id")?)
    }
}

fn scope_params(scope: &ScopeKey) -> (Option<i64>, Option<i64>) {
    match scope.partition {
        Some(p) => (Some(p.category_id), Some(p.job_type_id)),
        None => (None, None),
    }
}

fn listing_from_row(row: &PgRow) -> Result<PersistedListing> {
    let hash: String = row.try_get("hash")?;
    Ok(PersistedListing {
        id: row.try_get("id")?,
        identity: ListingIdentity::from_hex(hash),
        company_id: row.try_get("company_id")?,
        category_id: row.try_get("category_id")?,
        job_type_id: row.try_get("job_type_id")?,
        title: row.try_get("title")?,
        location: row.try_get("location")?,
        date_posted: row.try_get("date_posted")?,
        discovered_at: row.try_get("discovered_at")?,
        link: row.try_get("link")?,
        stale: row.try_get("to_be_deleted")?,
        state_location: row.try_get("state_location")?,
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn ensure_company(&self, profile: &CompanyProfile) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("starting company transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO companies (name, logo, description, career_url, job_base_url)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&profile.name)
        .bind(&profile.logo)
        .bind(&profile.description)
        .bind(&profile.career_url)
        .bind(&profile.job_base_url)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("inserting company `{}`", profile.name))?;

        let Some(row) = inserted else {
            let row = sqlx::query("SELECT id FROM companies WHERE name = $1")
                .bind(&profile.name)
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("loading company `{}`", profile.name))?;
            tx.commit().await?;
            return Ok(row.try_get("id")?);
        };
        let company_id: i64 = row.try_get("id")?;

        for tag in &profile.tags {
            let tag_row = sqlx::query(
                r#"
                INSERT INTO tags (name) VALUES ($1)
                ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
                RETURNING id
                "#,
            )
            .bind(tag)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("ensuring tag `{tag}`"))?;
            let tag_id: i64 = tag_row.try_get("id")?;

            sqlx::query(
                r#"
                INSERT INTO company_tags (company_id, tag_id) VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(company_id)
            .bind(tag_id)
            .execute(&mut *tx)
            .await
            .context("attaching company tag")?;
        }

        tx.commit().await.context("committing company")?;
        debug!(company = %profile.name, company_id, tags = profile.tags.len(), "company created");
        Ok(company_id)
    }

    async fn ensure_category(&self, name: &str) -> Result<i64> {
        self.ensure_named(LabelTable::Categories, name).await
    }

    async fn ensure_job_type(&self, name: &str) -> Result<i64> {
        self.ensure_named(LabelTable::JobTypes, name).await
    }

    async fn mark_stale(&self, scope: &ScopeKey) -> Result<u64> {
        let (category_id, job_type_id) = scope_params(scope);
        let done = sqlx::query(
            r#"
            UPDATE job_listings
               SET to_be_deleted = TRUE
             WHERE company_id = $1
               AND ($2::bigint IS NULL OR (category_id = $2 AND job_type_id = $3))
            "#,
        )
        .bind(scope.company_id)
        .bind(category_id)
        .bind(job_type_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking {scope} stale"))?;
        Ok(done.rows_affected())
    }

    async fn clear_stale(&self, scope: &ScopeKey) -> Result<u64> {
        let (category_id, job_type_id) = scope_params(scope);
        let done = sqlx::query(
            r#"
            UPDATE job_listings
               SET to_be_deleted = FALSE
             WHERE company_id = $1
               AND ($2::bigint IS NULL OR (category_id = $2 AND job_type_id = $3))
            "#,
        )
        .bind(scope.company_id)
        .bind(category_id)
        .bind(job_type_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("clearing stale flags for {scope}"))?;
        Ok(done.rows_affected())
    }

    async fn prune_stale(&self, scope: &ScopeKey) -> Result<u64> {
        let (category_id, job_type_id) = scope_params(scope);
        let done = sqlx::query(
            r#"
            DELETE FROM job_listings
             WHERE to_be_deleted = TRUE
               AND company_id = $1
               AND ($2::bigint IS NULL OR (category_id = $2 AND job_type_id = $3))
            "#,
        )
        .bind(scope.company_id)
        .bind(category_id)
        .bind(job_type_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("pruning {scope}"))?;
        Ok(done.rows_affected())
    }

    async fn upsert_listing(&self, listing: &NewListing, refresh_fields: bool) -> Result<UpsertOutcome> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_listings
                (hash, company_id, category_id, job_type_id, title, location, date_posted, link)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (hash) DO UPDATE
               SET to_be_deleted = FALSE,
                   location = CASE WHEN $9 THEN EXCLUDED.location ELSE job_listings.location END,
                   date_posted = CASE
                       WHEN $9 THEN COALESCE(EXCLUDED.date_posted, job_listings.date_posted)
                       ELSE job_listings.date_posted
                   END
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(listing.identity.as_str())
        .bind(listing.company_id)
        .bind(listing.category_id)
        .bind(listing.job_type_id)
        .bind(&listing.title)
        .bind(&listing.location)
        .bind(listing.date_posted)
        .bind(&listing.link)
        .bind(refresh_fields)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting listing {}", listing.identity))?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Refreshed
        })
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query(
            r#"
            DELETE FROM job_listings
             WHERE date_posted < $1
                OR (date_posted IS NULL AND discovered_at < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("deleting expired listings")?;
        Ok(done.rows_affected())
    }

    async fn listings(&self, scope: Option<&ScopeKey>) -> Result<Vec<PersistedListing>> {
        let company_id = scope.map(|s| s.company_id);
        let (category_id, job_type_id) = scope.map(scope_params).unwrap_or((None, None));
        let rows = sqlx::query(
            r#"
            SELECT id, hash, company_id, category_id, job_type_id, title, location,
                   date_posted, discovered_at, link, to_be_deleted, state_location
              FROM job_listings
             WHERE ($1::bigint IS NULL OR company_id = $1)
               AND ($2::bigint IS NULL OR (category_id = $2 AND job_type_id = $3))
             ORDER BY id
            "#,
        )
        .bind(company_id)
        .bind(category_id)
        .bind(job_type_id)
        .fetch_all(&self.pool)
        .await
        .context("loading listings")?;

        rows.iter().map(listing_from_row).collect()
    }

    async fn unresolved_locations(&self) -> Result<Vec<UnresolvedLocation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, location
              FROM job_listings
             WHERE state_location IS NULL
               AND LOWER(location) <> LOWER($1)
             ORDER BY id
            "#,
        )
        .bind(UNSPECIFIED_LOCATION)
        .fetch_all(&self.pool)
        .await
        .context("loading unresolved locations")?;

        rows.iter()
            .map(|row| {
                Ok(UnresolvedLocation {
                    listing_id: row.try_get("id")?,
                    location: row.try_get("location")?,
                })
            })
            .collect()
    }

    async fn set_state_location(&self, listing_id: i64, state: &str) -> Result<bool> {
        let done = sqlx::query("UPDATE job_listings SET state_location = $2 WHERE id = $1")
            .bind(listing_id)
            .bind(state)
            .execute(&self.pool)
            .await
            .with_context(|| format!("saving state for listing {listing_id}"))?;
        Ok(done.rows_affected() == 1)
    }
}
