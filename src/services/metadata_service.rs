//! src/services/metadata_service.rs
//!
//! MetadataStore: SQLite-backed persistence for papers, the subjects they
//! reference, and the users and sessions that authenticate uploads.

use crate::models::{
    paper::{NewPaper, Paper},
    subject::{SubCategory, Subject},
    user::User,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Schema applied by [`MetadataStore::migrate`].
const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

/// Default subject catalogue: (name, has_subcategories, subcategories).
const DEFAULT_SUBJECTS: &[(&str, bool, &[&str])] = &[
    ("SST", true, &["History", "Geography", "Civics", "Economics"]),
    ("English", true, &["Literature", "Language"]),
    ("Science", false, &[]),
    ("Maths", false, &[]),
];

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Clone)]
pub struct MetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> MetadataResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Run the embedded schema statement by statement.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> MetadataResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn find_subject(&self, id: &str) -> MetadataResult<Option<Subject>> {
        Ok(sqlx::query_as::<_, Subject>(
            "SELECT id, name, has_subcategories FROM subjects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Look up a subcategory that belongs to `subject_id`.
    pub async fn find_sub_category(
        &self,
        subject_id: &str,
        id: &str,
    ) -> MetadataResult<Option<SubCategory>> {
        Ok(sqlx::query_as::<_, SubCategory>(
            "SELECT id, subject_id, name FROM sub_categories WHERE id = ? AND subject_id = ?",
        )
        .bind(id)
        .bind(subject_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn insert_subject(&self, subject: &Subject) -> MetadataResult<()> {
        sqlx::query("INSERT INTO subjects (id, name, has_subcategories) VALUES (?, ?, ?)")
            .bind(&subject.id)
            .bind(&subject.name)
            .bind(subject.has_subcategories)
            .execute(&*self.db)
            .await
            .map_err(|err| map_unique(err, &subject.name))?;
        Ok(())
    }

    pub async fn insert_sub_category(&self, sub_category: &SubCategory) -> MetadataResult<()> {
        sqlx::query("INSERT INTO sub_categories (id, subject_id, name) VALUES (?, ?, ?)")
            .bind(&sub_category.id)
            .bind(&sub_category.subject_id)
            .bind(&sub_category.name)
            .execute(&*self.db)
            .await
            .map_err(|err| map_unique(err, &sub_category.name))?;
        Ok(())
    }

    /// Insert the default subject catalogue, skipping subjects that exist.
    /// Returns how many subjects were added.
    pub async fn seed_subjects(&self) -> MetadataResult<usize> {
        let mut added = 0;
        for (name, has_subcategories, children) in DEFAULT_SUBJECTS {
            let subject = Subject {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                has_subcategories: *has_subcategories,
            };
            match self.insert_subject(&subject).await {
                Ok(()) => added += 1,
                Err(MetadataError::Duplicate(_)) => continue,
                Err(err) => return Err(err),
            }
            for child in *children {
                self.insert_sub_category(&SubCategory {
                    id: Uuid::new_v4().to_string(),
                    subject_id: subject.id.clone(),
                    name: child.to_string(),
                })
                .await?;
            }
        }
        Ok(added)
    }

    /// Insert a paper. `file_url` is unique, so re-recording the same stored
    /// object fails with [`MetadataError::Duplicate`].
    pub async fn create_paper(&self, paper: NewPaper) -> MetadataResult<Paper> {
        sqlx::query_as::<_, Paper>(
            r#"
            INSERT INTO papers (
                id, year, topic, file_url, subject_id, sub_category_id, user_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, year, topic, file_url, subject_id, sub_category_id, user_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(paper.year)
        .bind(&paper.topic)
        .bind(&paper.file_url)
        .bind(&paper.subject_id)
        .bind(&paper.sub_category_id)
        .bind(paper.user_id)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await
        .map_err(|err| map_unique(err, &paper.file_url))
    }

    #[cfg(test)]
    pub async fn find_paper_by_file_url(&self, file_url: &str) -> MetadataResult<Option<Paper>> {
        Ok(sqlx::query_as::<_, Paper>(
            "SELECT id, year, topic, file_url, subject_id, sub_category_id, user_id, created_at
             FROM papers WHERE file_url = ?",
        )
        .bind(file_url)
        .fetch_optional(&*self.db)
        .await?)
    }

    #[cfg(test)]
    pub async fn count_papers(&self) -> MetadataResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM papers")
            .fetch_one(&*self.db)
            .await?)
    }

    pub async fn find_user(&self, id: Uuid) -> MetadataResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT id, email, is_admin, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Create the user if needed and set its admin flag.
    pub async fn upsert_user(&self, email: &str, is_admin: bool) -> MetadataResult<User> {
        Ok(sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, is_admin, created_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET is_admin = excluded.is_admin
            RETURNING id, email, is_admin, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(is_admin)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?)
    }

    /// Issue an opaque bearer token for `user_id` valid for `ttl`.
    pub async fn create_session(&self, user_id: Uuid, ttl: Duration) -> MetadataResult<String> {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let expires_at: DateTime<Utc> = Utc::now() + ttl;
        sqlx::query("INSERT INTO sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(user_id)
            .bind(expires_at)
            .execute(&*self.db)
            .await?;
        Ok(token)
    }

    /// Resolve a bearer token to its user, ignoring expired sessions.
    pub async fn find_session_user(&self, token: &str) -> MetadataResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT u.id, u.email, u.is_admin, u.created_at
             FROM sessions s JOIN users u ON u.id = s.user_id
             WHERE s.token = ? AND s.expires_at > ?",
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&*self.db)
        .await?)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn map_unique(err: sqlx::Error, what: &str) -> MetadataError {
    if is_unique_violation(&err) {
        MetadataError::Duplicate(what.to_string())
    } else {
        MetadataError::Sqlx(err)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory store. A single connection keeps every query on the same
    /// in-memory database.
    pub(crate) async fn memory_store() -> MetadataStore {
        let store = MetadataStore::connect("sqlite::memory:", 1).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    pub(crate) async fn seed_subject(
        store: &MetadataStore,
        id: &str,
        has_subcategories: bool,
    ) -> Subject {
        let subject = Subject {
            id: id.to_string(),
            name: format!("Subject {id}"),
            has_subcategories,
        };
        store.insert_subject(&subject).await.unwrap();
        subject
    }

    fn new_paper(user_id: Uuid, url: &str) -> NewPaper {
        NewPaper {
            year: 2023,
            topic: Some("Mechanics".into()),
            file_url: url.into(),
            subject_id: "S1".into(),
            sub_category_id: None,
            user_id,
        }
    }

    #[tokio::test]
    async fn creates_and_reads_papers() {
        let store = memory_store().await;
        seed_subject(&store, "S1", false).await;
        let user = store.upsert_user("admin@example.com", true).await.unwrap();

        let paper = store
            .create_paper(new_paper(user.id, "http://x/papers/1_a.pdf"))
            .await
            .unwrap();
        assert_eq!(paper.year, 2023);
        assert_eq!(paper.user_id, user.id);

        let found = store
            .find_paper_by_file_url("http://x/papers/1_a.pdf")
            .await
            .unwrap();
        assert_eq!(found, Some(paper));
    }

    #[tokio::test]
    async fn duplicate_file_url_is_rejected() {
        let store = memory_store().await;
        seed_subject(&store, "S1", false).await;
        let user = store.upsert_user("admin@example.com", true).await.unwrap();

        store
            .create_paper(new_paper(user.id, "http://x/papers/1_a.pdf"))
            .await
            .unwrap();
        let err = store
            .create_paper(new_paper(user.id, "http://x/papers/1_a.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Duplicate(_)));
        assert_eq!(store.count_papers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_subject_violates_foreign_key() {
        let store = memory_store().await;
        let user = store.upsert_user("admin@example.com", true).await.unwrap();
        let err = store
            .create_paper(new_paper(user.id, "http://x/papers/1_a.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Sqlx(_)));
    }

    #[tokio::test]
    async fn sub_category_must_belong_to_subject() {
        let store = memory_store().await;
        seed_subject(&store, "S1", true).await;
        seed_subject(&store, "S2", true).await;
        store
            .insert_sub_category(&SubCategory {
                id: "C1".into(),
                subject_id: "S1".into(),
                name: "Algebra".into(),
            })
            .await
            .unwrap();

        assert!(store.find_sub_category("S1", "C1").await.unwrap().is_some());
        assert!(store.find_sub_category("S2", "C1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sessions_resolve_until_expiry() {
        let store = memory_store().await;
        let user = store.upsert_user("admin@example.com", true).await.unwrap();

        let live = store.create_session(user.id, Duration::hours(1)).await.unwrap();
        let expired = store
            .create_session(user.id, Duration::seconds(-1))
            .await
            .unwrap();

        assert_eq!(store.find_session_user(&live).await.unwrap(), Some(user));
        assert_eq!(store.find_session_user(&expired).await.unwrap(), None);
        assert_eq!(store.find_session_user("bogus").await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_user_toggles_admin_flag() {
        let store = memory_store().await;
        let first = store.upsert_user("someone@example.com", false).await.unwrap();
        let second = store.upsert_user("someone@example.com", true).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.is_admin);
    }

    #[tokio::test]
    async fn seeding_is_repeatable() {
        let store = memory_store().await;
        assert_eq!(store.seed_subjects().await.unwrap(), 4);
        assert_eq!(store.seed_subjects().await.unwrap(), 0);
    }
}
