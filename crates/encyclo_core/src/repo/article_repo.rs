//! Article store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide keyed reads and create-if-absent writes for finished articles.
//! - Persist the denormalized outgoing link set with the article row.
//!
//! # Invariants
//! - `insert_if_absent` is atomic: two racing inserts for one slug produce one
//!   row, and the loser observes `AlreadyExists`.
//! - An article and its link rows are written in one transaction.
//! - Articles are never updated or deleted through this store.

use crate::db::{ensure_migrated, DbError};
use crate::model::article::{Article, Slug};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

const ARTICLE_SELECT_SQL: &str = "SELECT
    slug,
    title,
    content,
    created_at
FROM articles";

pub type StoreResult<T> = Result<T, StoreError>;

/// Error shared by the article, lock and quota stores.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    /// Caller passed a value the store refuses to persist.
    InvalidInput(String),
    /// Persisted state violates a store invariant.
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidInput(message) => write!(f, "invalid store input: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InvalidInput(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Result of [`ArticleStore::insert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Durable keyed storage for finished articles.
pub trait ArticleStore {
    fn get(&self, slug: &str) -> StoreResult<Option<Article>>;
    fn insert_if_absent(&self, article: &Article) -> StoreResult<InsertOutcome>;
    /// Articles whose outgoing links contain `slug`, ordered by title.
    fn linking_to(&self, slug: &str) -> StoreResult<Vec<Article>>;
    fn count(&self) -> StoreResult<u64>;
}

/// SQLite-backed article store.
pub struct SqliteArticleStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteArticleStore<'conn> {
    /// Creates a store from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_migrated(conn)?;
        Ok(Self { conn })
    }
}

impl ArticleStore for SqliteArticleStore<'_> {
    fn get(&self, slug: &str) -> StoreResult<Option<Article>> {
        let row = self
            .conn
            .query_row(
                &format!("{ARTICLE_SELECT_SQL} WHERE slug = ?1;"),
                [slug],
                parse_article_row,
            )
            .optional()?;

        match row {
            Some(row) => Ok(Some(self.with_links(row)?)),
            None => Ok(None),
        }
    }

    fn insert_if_absent(&self, article: &Article) -> StoreResult<InsertOutcome> {
        validate_article(article)?;

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO articles (slug, title, content, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(slug) DO NOTHING;",
            params![
                article.slug.as_str(),
                article.title.as_str(),
                article.content.as_str(),
                article.created_at,
            ],
        )?;

        if inserted == 0 {
            return Ok(InsertOutcome::AlreadyExists);
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO article_links (source_slug, target_slug) VALUES (?1, ?2);",
            )?;
            for target in &article.outgoing_links {
                stmt.execute(params![article.slug.as_str(), target.as_str()])?;
            }
        }
        tx.commit()?;

        Ok(InsertOutcome::Inserted)
    }

    fn linking_to(&self, slug: &str) -> StoreResult<Vec<Article>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                articles.slug AS slug,
                articles.title AS title,
                articles.content AS content,
                articles.created_at AS created_at
             FROM article_links
             JOIN articles ON articles.slug = article_links.source_slug
             WHERE article_links.target_slug = ?1
               AND articles.slug <> ?1
             ORDER BY articles.title ASC, articles.slug ASC;",
        )?;
        let rows = stmt
            .query_map([slug], parse_article_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(|row| self.with_links(row)).collect()
    }

    fn count(&self) -> StoreResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM articles;", [], |row| row.get(0))?;
        u64::try_from(count)
            .map_err(|_| StoreError::InvalidData(format!("negative article count {count}")))
    }
}

impl SqliteArticleStore<'_> {
    fn with_links(&self, row: ArticleRow) -> StoreResult<Article> {
        let mut stmt = self.conn.prepare(
            "SELECT target_slug FROM article_links WHERE source_slug = ?1 ORDER BY target_slug;",
        )?;
        let outgoing_links = stmt
            .query_map([row.slug.as_str()], |link| link.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<Slug>>>()?;

        if outgoing_links.contains(&row.slug) {
            return Err(StoreError::InvalidData(format!(
                "article `{}` links to itself in article_links",
                row.slug
            )));
        }

        Ok(Article {
            slug: row.slug,
            title: row.title,
            content: row.content,
            outgoing_links,
            created_at: row.created_at,
        })
    }
}

struct ArticleRow {
    slug: String,
    title: String,
    content: String,
    created_at: i64,
}

fn parse_article_row(row: &Row<'_>) -> rusqlite::Result<ArticleRow> {
    Ok(ArticleRow {
        slug: row.get("slug")?,
        title: row.get("title")?,
        content: row.get("content")?,
        created_at: row.get("created_at")?,
    })
}

fn validate_article(article: &Article) -> StoreResult<()> {
    if article.slug.trim().is_empty() {
        return Err(StoreError::InvalidInput("article slug is empty".to_string()));
    }
    if article.title.trim().is_empty() {
        return Err(StoreError::InvalidInput(format!(
            "article `{}` has an empty title",
            article.slug
        )));
    }
    if article.outgoing_links.contains(&article.slug) {
        return Err(StoreError::InvalidInput(format!(
            "article `{}` links to itself",
            article.slug
        )));
    }
    Ok(())
}
