use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub const REGISTRY_COMPANIES: &str = "registry_companies";
pub const REGISTRY_ESTABLISHMENTS: &str = "registry_establishments";
pub const REGISTRY_PARTNERS: &str = "registry_partners";
pub const MARKET_LOAD_PARCELS: &str = "market_load_parcels";
pub const MARKET_AGENT_PROFILES: &str = "market_agent_profiles";

pub const SOURCE_TABLES: [&str; 5] = [
    REGISTRY_COMPANIES,
    REGISTRY_ESTABLISHMENTS,
    REGISTRY_PARTNERS,
    MARKET_LOAD_PARCELS,
    MARKET_AGENT_PROFILES,
];

// ============================================================================
// RAW ROWS
// Values exactly as stored: identifiers unnormalized, numbers and dates as text.
// Aliases accept the original extract headers.
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCompanyRow {
    #[serde(alias = "cnpj_basico")]
    pub cnpj_root: String,
    #[serde(default, alias = "razao_social")]
    pub legal_name: Option<String>,
    #[serde(default, alias = "porte")]
    pub size_tier: Option<String>,
    #[serde(default, alias = "data_importacao")]
    pub imported_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEstablishmentRow {
    #[serde(alias = "cnpj_completo")]
    pub cnpj_full: String,
    #[serde(default, alias = "nome_fantasia")]
    pub trade_name: Option<String>,
    #[serde(default, alias = "cnae_fiscal_principal")]
    pub primary_activity: Option<String>,
    /// Comma separated list
    #[serde(default, alias = "cnae_fiscal_secundaria")]
    pub secondary_activities: Option<String>,
    #[serde(default, alias = "uf")]
    pub state_uf: Option<String>,
    #[serde(default, alias = "municipio")]
    pub city: Option<String>,
    #[serde(default, alias = "ddd1")]
    pub area_code_1: Option<String>,
    #[serde(default, alias = "telefone1")]
    pub phone_1: Option<String>,
    #[serde(default, alias = "ddd2")]
    pub area_code_2: Option<String>,
    #[serde(default, alias = "telefone2")]
    pub phone_2: Option<String>,
    #[serde(default, alias = "ddd_fax")]
    pub fax_area_code: Option<String>,
    #[serde(default)]
    pub fax: Option<String>,
    #[serde(default, alias = "correio_eletronico")]
    pub email: Option<String>,
    #[serde(default, alias = "data_importacao")]
    pub imported_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPartnerRow {
    #[serde(alias = "cnpj_basico")]
    pub cnpj_root: String,
    #[serde(alias = "cnpj_cpf_socio")]
    pub partner_id: String,
    #[serde(default, alias = "nome_socio")]
    pub partner_name: Option<String>,
    #[serde(default, alias = "qualificacao_socio")]
    pub partner_role: Option<String>,
    #[serde(default, alias = "data_entrada_sociedade")]
    pub entry_date: Option<String>,
    #[serde(default, alias = "data_saida_sociedade")]
    pub exit_date: Option<String>,
    #[serde(default, alias = "data_importacao")]
    pub imported_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLoadParcelRow {
    #[serde(alias = "cnpj_carga")]
    pub cnpj_full: String,
    #[serde(alias = "mes_referencia")]
    pub period: String,
    #[serde(default, alias = "sigla_perfil_agente")]
    pub agent_profile: Option<String>,
    #[serde(default, alias = "consumo_total")]
    pub consumption_total: Option<String>,
    #[serde(default, alias = "estado_uf")]
    pub state_uf: Option<String>,
    #[serde(default, alias = "cidade")]
    pub city: Option<String>,
    #[serde(default, alias = "submercado")]
    pub submarket: Option<String>,
    #[serde(default, alias = "ramo_atividade")]
    pub activity_code: Option<String>,
    #[serde(default, alias = "data_migracao")]
    pub migration_marker: Option<String>,
    #[serde(default, alias = "data_importacao")]
    pub imported_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAgentProfileRow {
    #[serde(alias = "cnpj")]
    pub cnpj_root: String,
    #[serde(default, alias = "cod_agente")]
    pub agent_code: Option<String>,
    #[serde(default, alias = "nome_empresarial")]
    pub legal_name: Option<String>,
    #[serde(default, alias = "classe_perfil_agente")]
    pub profile: Option<String>,
    #[serde(default)]
    pub trc: Option<String>,
    #[serde(default)]
    pub tggc: Option<String>,
    #[serde(default, alias = "data_importacao")]
    pub imported_at: Option<String>,
}

/// The five logical tables as read from storage
#[derive(Debug, Clone, Default)]
pub struct SourceTables {
    pub companies: Vec<RawCompanyRow>,
    pub establishments: Vec<RawEstablishmentRow>,
    pub partners: Vec<RawPartnerRow>,
    pub load_parcels: Vec<RawLoadParcelRow>,
    pub agent_profiles: Vec<RawAgentProfileRow>,
}

impl SourceTables {
    pub fn total_rows(&self) -> usize {
        self.companies.len()
            + self.establishments.len()
            + self.partners.len()
            + self.load_parcels.len()
            + self.agent_profiles.len()
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode so readers never block the loader
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // No UNIQUE constraints: the sources are duplicate-laden by nature and the
    // engine, not the store, decides what a duplicate is.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS registry_companies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cnpj_root TEXT NOT NULL,
            legal_name TEXT,
            size_tier TEXT,
            imported_at TEXT
        );

        CREATE TABLE IF NOT EXISTS registry_establishments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cnpj_full TEXT NOT NULL,
            trade_name TEXT,
            primary_activity TEXT,
            secondary_activities TEXT,
            state_uf TEXT,
            city TEXT,
            area_code_1 TEXT,
            phone_1 TEXT,
            area_code_2 TEXT,
            phone_2 TEXT,
            fax_area_code TEXT,
            fax TEXT,
            email TEXT,
            imported_at TEXT
        );

        CREATE TABLE IF NOT EXISTS registry_partners (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cnpj_root TEXT NOT NULL,
            partner_id TEXT NOT NULL,
            partner_name TEXT,
            partner_role TEXT,
            entry_date TEXT,
            exit_date TEXT,
            imported_at TEXT
        );

        CREATE TABLE IF NOT EXISTS market_load_parcels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cnpj_full TEXT NOT NULL,
            period TEXT NOT NULL,
            agent_profile TEXT,
            consumption_total TEXT,
            state_uf TEXT,
            city TEXT,
            submarket TEXT,
            activity_code TEXT,
            migration_marker TEXT,
            imported_at TEXT
        );

        CREATE TABLE IF NOT EXISTS market_agent_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cnpj_root TEXT NOT NULL,
            agent_code TEXT,
            legal_name TEXT,
            profile TEXT,
            trc TEXT,
            tggc TEXT,
            imported_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_companies_root ON registry_companies(cnpj_root);
        CREATE INDEX IF NOT EXISTS idx_establishments_full ON registry_establishments(cnpj_full);
        CREATE INDEX IF NOT EXISTS idx_partners_root ON registry_partners(cnpj_root);
        CREATE INDEX IF NOT EXISTS idx_parcels_full ON market_load_parcels(cnpj_full);
        CREATE INDEX IF NOT EXISTS idx_parcels_period ON market_load_parcels(period);
        CREATE INDEX IF NOT EXISTS idx_agent_profiles_root ON market_agent_profiles(cnpj_root);",
    )?;

    Ok(())
}

// ============================================================================
// LOADING (CLI import and tests; the engine itself only reads)
// ============================================================================

pub fn load_csv<T: DeserializeOwned>(csv_path: &Path) -> Result<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file: {:?}", csv_path))?;

    let mut rows = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: T = result
            .with_context(|| format!("Failed to deserialize {:?} line {}", csv_path, line + 2))?;
        rows.push(row);
    }

    Ok(rows)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportStats {
    pub companies: usize,
    pub establishments: usize,
    pub partners: usize,
    pub load_parcels: usize,
    pub agent_profiles: usize,
    pub missing_files: Vec<String>,
}

/// Import `<table>.csv` files from a directory. Missing files are reported, not fatal.
pub fn import_csv_dir(conn: &mut Connection, dir: &Path) -> Result<ImportStats> {
    setup_database(conn)?;
    let mut stats = ImportStats::default();

    let path_for = |table: &str| dir.join(format!("{}.csv", table));
    let present = |table: &str, stats: &mut ImportStats| {
        let exists = path_for(table).exists();
        if !exists {
            warn!(table, "CSV extract not found, skipping");
            stats.missing_files.push(format!("{}.csv", table));
        }
        exists
    };

    let tx = conn.transaction()?;

    if present(REGISTRY_COMPANIES, &mut stats) {
        let rows: Vec<RawCompanyRow> = load_csv(&path_for(REGISTRY_COMPANIES))?;
        stats.companies = insert_companies(&tx, &rows)?;
    }
    if present(REGISTRY_ESTABLISHMENTS, &mut stats) {
        let rows: Vec<RawEstablishmentRow> = load_csv(&path_for(REGISTRY_ESTABLISHMENTS))?;
        stats.establishments = insert_establishments(&tx, &rows)?;
    }
    if present(REGISTRY_PARTNERS, &mut stats) {
        let rows: Vec<RawPartnerRow> = load_csv(&path_for(REGISTRY_PARTNERS))?;
        stats.partners = insert_partners(&tx, &rows)?;
    }
    if present(MARKET_LOAD_PARCELS, &mut stats) {
        let rows: Vec<RawLoadParcelRow> = load_csv(&path_for(MARKET_LOAD_PARCELS))?;
        stats.load_parcels = insert_load_parcels(&tx, &rows)?;
    }
    if present(MARKET_AGENT_PROFILES, &mut stats) {
        let rows: Vec<RawAgentProfileRow> = load_csv(&path_for(MARKET_AGENT_PROFILES))?;
        stats.agent_profiles = insert_agent_profiles(&tx, &rows)?;
    }

    tx.commit()?;

    info!(
        companies = stats.companies,
        establishments = stats.establishments,
        partners = stats.partners,
        load_parcels = stats.load_parcels,
        agent_profiles = stats.agent_profiles,
        "CSV import complete"
    );

    Ok(stats)
}

pub fn insert_companies(conn: &Connection, rows: &[RawCompanyRow]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO registry_companies (cnpj_root, legal_name, size_tier, imported_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for row in rows {
        stmt.execute(params![row.cnpj_root, row.legal_name, row.size_tier, row.imported_at])?;
    }
    Ok(rows.len())
}

pub fn insert_establishments(conn: &Connection, rows: &[RawEstablishmentRow]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO registry_establishments (
            cnpj_full, trade_name, primary_activity, secondary_activities, state_uf, city,
            area_code_1, phone_1, area_code_2, phone_2, fax_area_code, fax, email, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.cnpj_full,
            row.trade_name,
            row.primary_activity,
            row.secondary_activities,
            row.state_uf,
            row.city,
            row.area_code_1,
            row.phone_1,
            row.area_code_2,
            row.phone_2,
            row.fax_area_code,
            row.fax,
            row.email,
            row.imported_at,
        ])?;
    }
    Ok(rows.len())
}

pub fn insert_partners(conn: &Connection, rows: &[RawPartnerRow]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO registry_partners (
            cnpj_root, partner_id, partner_name, partner_role, entry_date, exit_date, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.cnpj_root,
            row.partner_id,
            row.partner_name,
            row.partner_role,
            row.entry_date,
            row.exit_date,
            row.imported_at,
        ])?;
    }
    Ok(rows.len())
}

pub fn insert_load_parcels(conn: &Connection, rows: &[RawLoadParcelRow]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO market_load_parcels (
            cnpj_full, period, agent_profile, consumption_total, state_uf, city,
            submarket, activity_code, migration_marker, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.cnpj_full,
            row.period,
            row.agent_profile,
            row.consumption_total,
            row.state_uf,
            row.city,
            row.submarket,
            row.activity_code,
            row.migration_marker,
            row.imported_at,
        ])?;
    }
    Ok(rows.len())
}

pub fn insert_agent_profiles(conn: &Connection, rows: &[RawAgentProfileRow]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO market_agent_profiles (
            cnpj_root, agent_code, legal_name, profile, trc, tggc, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.cnpj_root,
            row.agent_code,
            row.legal_name,
            row.profile,
            row.trc,
            row.tggc,
            row.imported_at,
        ])?;
    }
    Ok(rows.len())
}

// ============================================================================
// READ PATH (engine)
// ============================================================================

/// Column as text whatever its storage class. Numeric CNPJ columns are the
/// reason leading zeros go missing, so integers and reals are accepted here
/// and repaired by the normalizer.
fn text(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    })
}

fn required_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(text(row, idx)?.unwrap_or_default())
}

pub fn table_exists(conn: &Connection, table: &str) -> EngineResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_table(conn: &Connection, table: &str) -> EngineResult<()> {
    if table_exists(conn, table)? {
        Ok(())
    } else {
        Err(EngineError::source_unavailable(table, "table not found in store"))
    }
}

/// Read and map every row of one source table. Any failure on a table is fatal
/// for the query that needed it.
fn read_table<T, F>(conn: &Connection, table: &str, sql: &str, map: F) -> EngineResult<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    ensure_table(conn, table)?;
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| EngineError::source_unavailable(table, e))?;
    let rows = stmt
        .query_map([], map)
        .map_err(|e| EngineError::source_unavailable(table, e))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn read_companies(conn: &Connection) -> EngineResult<Vec<RawCompanyRow>> {
    read_table(
        conn,
        REGISTRY_COMPANIES,
        "SELECT cnpj_root, legal_name, size_tier, imported_at FROM registry_companies ORDER BY id",
        |row| {
            Ok(RawCompanyRow {
                cnpj_root: required_text(row, 0)?,
                legal_name: text(row, 1)?,
                size_tier: text(row, 2)?,
                imported_at: text(row, 3)?,
            })
        },
    )
}

pub fn read_establishments(conn: &Connection) -> EngineResult<Vec<RawEstablishmentRow>> {
    read_table(
        conn,
        REGISTRY_ESTABLISHMENTS,
        "SELECT cnpj_full, trade_name, primary_activity, secondary_activities, state_uf, city,
                area_code_1, phone_1, area_code_2, phone_2, fax_area_code, fax, email, imported_at
         FROM registry_establishments ORDER BY id",
        |row| {
            Ok(RawEstablishmentRow {
                cnpj_full: required_text(row, 0)?,
                trade_name: text(row, 1)?,
                primary_activity: text(row, 2)?,
                secondary_activities: text(row, 3)?,
                state_uf: text(row, 4)?,
                city: text(row, 5)?,
                area_code_1: text(row, 6)?,
                phone_1: text(row, 7)?,
                area_code_2: text(row, 8)?,
                phone_2: text(row, 9)?,
                fax_area_code: text(row, 10)?,
                fax: text(row, 11)?,
                email: text(row, 12)?,
                imported_at: text(row, 13)?,
            })
        },
    )
}

pub fn read_partners(conn: &Connection) -> EngineResult<Vec<RawPartnerRow>> {
    read_table(
        conn,
        REGISTRY_PARTNERS,
        "SELECT cnpj_root, partner_id, partner_name, partner_role, entry_date, exit_date, imported_at
         FROM registry_partners ORDER BY id",
        |row| {
            Ok(RawPartnerRow {
                cnpj_root: required_text(row, 0)?,
                partner_id: required_text(row, 1)?,
                partner_name: text(row, 2)?,
                partner_role: text(row, 3)?,
                entry_date: text(row, 4)?,
                exit_date: text(row, 5)?,
                imported_at: text(row, 6)?,
            })
        },
    )
}

pub fn read_load_parcels(conn: &Connection) -> EngineResult<Vec<RawLoadParcelRow>> {
    read_table(
        conn,
        MARKET_LOAD_PARCELS,
        "SELECT cnpj_full, period, agent_profile, consumption_total, state_uf, city,
                submarket, activity_code, migration_marker, imported_at
         FROM market_load_parcels ORDER BY id",
        |row| {
            Ok(RawLoadParcelRow {
                cnpj_full: required_text(row, 0)?,
                period: required_text(row, 1)?,
                agent_profile: text(row, 2)?,
                consumption_total: text(row, 3)?,
                state_uf: text(row, 4)?,
                city: text(row, 5)?,
                submarket: text(row, 6)?,
                activity_code: text(row, 7)?,
                migration_marker: text(row, 8)?,
                imported_at: text(row, 9)?,
            })
        },
    )
}

pub fn read_agent_profiles(conn: &Connection) -> EngineResult<Vec<RawAgentProfileRow>> {
    read_table(
        conn,
        MARKET_AGENT_PROFILES,
        "SELECT cnpj_root, agent_code, legal_name, profile, trc, tggc, imported_at
         FROM market_agent_profiles ORDER BY id",
        |row| {
            Ok(RawAgentProfileRow {
                cnpj_root: required_text(row, 0)?,
                agent_code: text(row, 1)?,
                legal_name: text(row, 2)?,
                profile: text(row, 3)?,
                trc: text(row, 4)?,
                tggc: text(row, 5)?,
                imported_at: text(row, 6)?,
            })
        },
    )
}

/// Read all five tables. A missing table fails the whole load.
pub fn load_sources(conn: &Connection) -> EngineResult<SourceTables> {
    let tables = SourceTables {
        companies: read_companies(conn)?,
        establishments: read_establishments(conn)?,
        partners: read_partners(conn)?,
        load_parcels: read_load_parcels(conn)?,
        agent_profiles: read_agent_profiles(conn)?,
    };

    info!(rows = tables.total_rows(), "Source tables loaded");
    Ok(tables)
}

/// Row count of one source table (feeds the progress reporter)
pub fn count_rows(conn: &Connection, table: &str) -> EngineResult<i64> {
    if !SOURCE_TABLES.contains(&table) {
        return Err(EngineError::InvalidQuery(format!("unknown table `{}`", table)));
    }
    ensure_table(conn, table)?;
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}
