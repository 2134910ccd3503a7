use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Deserialize;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// `companies_table` must already be a validated identifier.
pub fn init_schema(conn: &Connection, companies_table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS okved (
            code        TEXT PRIMARY KEY,
            parent_code TEXT,
            section     TEXT,
            name        TEXT NOT NULL,
            comment     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_okved_parent ON okved(parent_code);

        CREATE TABLE IF NOT EXISTS {table} (
            ogrn      TEXT PRIMARY KEY,
            inn       TEXT,
            kpp       TEXT,
            name      TEXT,
            full_name TEXT,
            okved     TEXT NOT NULL,
            loaded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_okved ON {table}(okved);

        CREATE TABLE IF NOT EXISTS vacancies (
            id              TEXT PRIMARY KEY,
            company_name    TEXT NOT NULL,
            position        TEXT NOT NULL,
            job_description TEXT,
            key_skills      TEXT NOT NULL DEFAULT '',
            loaded_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_vacancies_company ON vacancies(company_name);
        ",
        table = companies_table
    ))?;
    Ok(())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Classifier ──

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OkvedEntry {
    pub code: String,
    #[serde(default)]
    pub parent_code: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
}

pub fn insert_okved(conn: &Connection, entries: &[OkvedEntry]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO okved (code, parent_code, section, name, comment)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for e in entries {
            count += stmt.execute(rusqlite::params![
                e.code, e.parent_code, e.section, e.name, e.comment
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Companies ──

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompanyRow {
    pub ogrn: String,
    pub inn: Option<String>,
    pub kpp: Option<String>,
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub okved: String,
}

pub fn insert_companies(conn: &Connection, table: &str, rows: &[CompanyRow]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let loaded_at = now();
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT OR REPLACE INTO {}
             (ogrn, inn, kpp, name, full_name, okved, loaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            table
        ))?;
        for r in rows {
            count += stmt.execute(rusqlite::params![
                r.ogrn, r.inn, r.kpp, r.name, r.full_name, r.okved, loaded_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Vacancies ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacancyRow {
    pub id: String,
    pub company_name: String,
    pub position: String,
    pub job_description: String,
    pub key_skills: String,
}

pub fn insert_vacancies(conn: &Connection, rows: &[VacancyRow]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let loaded_at = now();
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO vacancies
             (id, company_name, position, job_description, key_skills, loaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for r in rows {
            count += stmt.execute(rusqlite::params![
                r.id, r.company_name, r.position, r.job_description, r.key_skills, loaded_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Key skills of vacancies whose employer name appears inside a loaded company name.
pub fn fetch_company_skills(conn: &Connection, companies_table: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT v.key_skills
         FROM vacancies v
         WHERE v.company_name != ''
           AND EXISTS (
               SELECT 1 FROM {} c WHERE c.name LIKE '%' || v.company_name || '%'
           )
         ORDER BY v.rowid",
        companies_table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub okved: usize,
    pub companies: usize,
    pub vacancies: usize,
    pub matched_vacancies: usize,
}

pub fn get_stats(conn: &Connection, companies_table: &str) -> Result<Stats> {
    let okved: usize = conn.query_row("SELECT COUNT(*) FROM okved", [], |r| r.get(0))?;
    let companies: usize = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", companies_table),
        [],
        |r| r.get(0),
    )?;
    let vacancies: usize = conn.query_row("SELECT COUNT(*) FROM vacancies", [], |r| r.get(0))?;
    let matched_vacancies = fetch_company_skills(conn, companies_table)?.len();
    Ok(Stats {
        okved,
        companies,
        vacancies,
        matched_vacancies,
    })
}
