//! SQLite storage for site configurations and crawler access records

use crate::recorder::{Record, RecordSink};
use crate::site::SiteConfig;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Separator for the persisted find and replace lists
const LIST_SEPARATOR: &str = ";";

const SITE_COLUMNS: &str = "id, domain, url, index_title, index_keywords, index_description, \
    finds, replaces, h1replace, need_js, s2t, title_replace, cache_enable, cache_time, \
    baidu_push_key, sm_push_key";

/// Filter for access record queries; unset fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordFilter {
    pub domain: Option<String>,
    /// Inclusive lower bound on `created_time`
    pub start: Option<i64>,
    /// Exclusive upper bound on `created_time`
    pub end: Option<i64>,
}

impl RecordFilter {
    fn where_clause(&self) -> (String, Vec<rusqlite::types::Value>) {
        let mut conditions = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(domain) = self.domain.as_ref().filter(|d| !d.is_empty()) {
            conditions.push("domain = ?");
            values.push(domain.clone().into());
        }
        if let Some(start) = self.start.filter(|s| *s > 0) {
            conditions.push("created_time >= ?");
            values.push(start.into());
        }
        if let Some(end) = self.end.filter(|e| *e > 0) {
            conditions.push("created_time < ?");
            values.push(end.into());
        }
        if conditions.is_empty() {
            (String::new(), values)
        } else {
            (format!("WHERE {}", conditions.join(" AND ")), values)
        }
    }
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);
            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS website_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                index_title TEXT NOT NULL DEFAULT '',
                index_keywords TEXT NOT NULL DEFAULT '',
                index_description TEXT NOT NULL DEFAULT '',
                finds TEXT NOT NULL DEFAULT '',
                replaces TEXT NOT NULL DEFAULT '',
                h1replace TEXT NOT NULL DEFAULT '',
                need_js INTEGER NOT NULL DEFAULT 0,
                s2t INTEGER NOT NULL DEFAULT 0,
                title_replace INTEGER NOT NULL DEFAULT 0,
                cache_enable INTEGER NOT NULL DEFAULT 1,
                cache_time INTEGER NOT NULL DEFAULT 1440,
                baidu_push_key TEXT NOT NULL DEFAULT '',
                sm_push_key TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS record (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL,
                path TEXT NOT NULL DEFAULT '',
                user_agent TEXT NOT NULL DEFAULT '',
                spider TEXT NOT NULL DEFAULT '',
                created_time INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_record_domain ON record(domain);
            CREATE INDEX IF NOT EXISTS idx_record_created_time ON record(created_time);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    // ==================== Site configurations ====================

    fn row_to_site(row: &Row<'_>) -> rusqlite::Result<SiteConfig> {
        Ok(SiteConfig {
            id: row.get(0)?,
            domain: row.get(1)?,
            url: row.get(2)?,
            index_title: row.get(3)?,
            index_keywords: row.get(4)?,
            index_description: row.get(5)?,
            finds: split_list(&row.get::<_, String>(6)?),
            replaces: split_list(&row.get::<_, String>(7)?),
            h1_replace: row.get(8)?,
            need_js: row.get(9)?,
            s2t: row.get(10)?,
            title_replace: row.get(11)?,
            cache_enable: row.get(12)?,
            cache_time: row.get(13)?,
            baidu_push_key: row.get(14)?,
            sm_push_key: row.get(15)?,
        })
    }

    /// Get the configuration of one domain
    pub fn get_one(&self, domain: &str) -> Result<Option<SiteConfig>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {SITE_COLUMNS} FROM website_config WHERE domain = ?1"),
            params![domain],
            Self::row_to_site,
        )
        .optional()
        .context("Failed to get site config")
    }

    /// All site configurations, ordered by id
    pub fn get_all(&self) -> Result<Vec<SiteConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {SITE_COLUMNS} FROM website_config ORDER BY id"))?;
        let sites = stmt
            .query_map([], Self::row_to_site)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    /// One page of site configurations, newest first. `page` starts at 1.
    pub fn get_by_page(&self, page: u32, limit: u32) -> Result<Vec<SiteConfig>> {
        let offset = page.saturating_sub(1) as i64 * limit as i64;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SITE_COLUMNS} FROM website_config ORDER BY id DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let sites = stmt
            .query_map(params![limit as i64, offset], Self::row_to_site)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM website_config", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Insert a new configuration, returning its id
    pub fn add_one(&self, site: &SiteConfig) -> Result<i64> {
        let conn = self.conn.lock();
        insert_site(&conn, site, false)
            .with_context(|| format!("Failed to add site config for {}", site.domain))?;
        Ok(conn.last_insert_rowid())
    }

    /// Update the configuration with `site.id`; returns false when no row matched
    pub fn update_by_id(&self, site: &SiteConfig) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE website_config SET domain = ?1, url = ?2, index_title = ?3,
                    index_keywords = ?4, index_description = ?5, finds = ?6, replaces = ?7,
                    h1replace = ?8, need_js = ?9, s2t = ?10, title_replace = ?11,
                    cache_enable = ?12, cache_time = ?13, baidu_push_key = ?14, sm_push_key = ?15
                 WHERE id = ?16",
                params![
                    site.domain,
                    site.url,
                    site.index_title,
                    site.index_keywords,
                    site.index_description,
                    site.finds.join(LIST_SEPARATOR),
                    site.replaces.join(LIST_SEPARATOR),
                    site.h1_replace,
                    site.need_js,
                    site.s2t,
                    site.title_replace,
                    site.cache_enable,
                    site.cache_time,
                    site.baidu_push_key,
                    site.sm_push_key,
                    site.id,
                ],
            )
            .context("Failed to update site config")?;
        Ok(rows > 0)
    }

    pub fn delete_one(&self, domain: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM website_config WHERE domain = ?1", params![domain])?;
        Ok(rows > 0)
    }

    /// Delete several domains, returning how many rows were removed
    pub fn multi_delete(&self, domains: &[String]) -> Result<usize> {
        if domains.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; domains.len()].join(", ");
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!("DELETE FROM website_config WHERE domain IN ({placeholders})"),
            params_from_iter(domains.iter()),
        )?;
        Ok(rows)
    }

    /// Insert or update many configurations in one transaction
    pub fn add_multi(&self, sites: &[SiteConfig]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for site in sites {
            insert_site(&tx, site, true)
                .with_context(|| format!("Failed to import site config for {}", site.domain))?;
        }
        tx.commit()?;
        Ok(sites.len())
    }

    /// Replace `word` in index titles where it appears as a whole
    /// `separator`-delimited part. Returns `domain##new_title` per changed site.
    pub fn forbidden_word_replace(
        &self,
        word: &str,
        replacement: &str,
        separator: &str,
    ) -> Result<Vec<String>> {
        if word.is_empty() || separator.is_empty() {
            anyhow::bail!("forbidden word and separator must not be empty");
        }

        let mut conn = self.conn.lock();
        let candidates: Vec<(String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT domain, index_title FROM website_config WHERE instr(index_title, ?1) > 0",
            )?;
            let rows = stmt
                .query_map(params![word], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let tx = conn.transaction()?;
        let mut changed = Vec::new();
        for (domain, title) in candidates {
            let parts: Vec<&str> = title.split(separator).collect();
            if !parts.iter().any(|part| *part == word) {
                continue;
            }
            let new_title = parts
                .iter()
                .map(|part| if *part == word { replacement } else { *part })
                .collect::<Vec<_>>()
                .join(separator);
            tx.execute(
                "UPDATE website_config SET index_title = ?1 WHERE domain = ?2",
                params![new_title, domain],
            )?;
            changed.push(format!("{domain}##{new_title}"));
        }
        tx.commit()?;

        info!(word, sites = changed.len(), "Replaced forbidden word in index titles");
        Ok(changed)
    }

    // ==================== Access records ====================

    pub fn add_record(&self, record: &Record) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO record (domain, path, user_agent, spider, created_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.domain,
                record.path,
                record.user_agent,
                record.spider,
                record.created_time
            ],
        )
        .context("Failed to add access record")?;
        Ok(())
    }

    /// Records matching the filter, newest first. `page` starts at 1.
    pub fn list_records(&self, filter: &RecordFilter, page: u32, limit: u32) -> Result<Vec<Record>> {
        let (where_clause, mut values) = filter.where_clause();
        values.push((limit as i64).into());
        values.push((page.saturating_sub(1) as i64 * limit as i64).into());

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT domain, path, user_agent, spider, created_time FROM record {where_clause}
             ORDER BY id DESC LIMIT ? OFFSET ?"
        ))?;
        let records = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(Record {
                    domain: row.get(0)?,
                    path: row.get(1)?,
                    user_agent: row.get(2)?,
                    spider: row.get(3)?,
                    created_time: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_records(&self, filter: &RecordFilter) -> Result<i64> {
        let (where_clause, values) = filter.where_clause();
        let conn = self.conn.lock();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM record {where_clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete records with `start < created_time < end`
    pub fn delete_records_in_range(&self, start: i64, end: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM record WHERE created_time > ?1 AND created_time < ?2",
            params![start, end],
        )?;
        Ok(rows)
    }
}

impl RecordSink for Database {
    fn write(&self, record: &Record) -> Result<()> {
        self.add_record(record)
    }
}

fn split_list(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split(LIST_SEPARATOR).map(String::from).collect()
}

fn insert_site(conn: &Connection, site: &SiteConfig, upsert: bool) -> rusqlite::Result<usize> {
    let conflict = if upsert {
        " ON CONFLICT(domain) DO UPDATE SET url = excluded.url,
            index_title = excluded.index_title, index_keywords = excluded.index_keywords,
            index_description = excluded.index_description, finds = excluded.finds,
            replaces = excluded.replaces, h1replace = excluded.h1replace,
            need_js = excluded.need_js, s2t = excluded.s2t,
            title_replace = excluded.title_replace, cache_enable = excluded.cache_enable,
            cache_time = excluded.cache_time, baidu_push_key = excluded.baidu_push_key,
            sm_push_key = excluded.sm_push_key"
    } else {
        ""
    };
    conn.execute(
        &format!(
            "INSERT INTO website_config (domain, url, index_title, index_keywords,
                index_description, finds, replaces, h1replace, need_js, s2t, title_replace,
                cache_enable, cache_time, baidu_push_key, sm_push_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15){conflict}"
        ),
        params![
            site.domain,
            site.url,
            site.index_title,
            site.index_keywords,
            site.index_description,
            site.finds.join(LIST_SEPARATOR),
            site.replaces.join(LIST_SEPARATOR),
            site.h1_replace,
            site.need_js,
            site.s2t,
            site.title_replace,
            site.cache_enable,
            site.cache_time,
            site.baidu_push_key,
            site.sm_push_key,
        ],
    )
}
