#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashSet},
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use flatfile_bridge::{
    error::WarehouseError,
    gateway::{Connection, Connector},
    retry::RetryPolicy,
    transfer::TransferConfig,
};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }
}

/// Default transfer settings without the retry delay.
pub fn fast_config() -> TransferConfig {
    TransferConfig::new(1000, RetryPolicy::new(3, Duration::ZERO).expect("policy"))
        .expect("config")
}

/// CSV with an `id,label,sold_at` header and `rows` well-formed rows.
pub fn sales_csv(rows: usize) -> String {
    let mut csv = String::from("id,label,sold_at\n");
    for i in 0..rows {
        csv.push_str(&format!("{i},item {i},2024-01-{:02}\n", i % 28 + 1));
    }
    csv
}

#[derive(Debug, Default)]
pub struct WarehouseState {
    pub tables: BTreeMap<String, Vec<String>>,
    pub statements: Vec<String>,
    pub inserts: Vec<(String, String)>,
    pub insert_attempts: usize,
    pub failing_insert_attempts: HashSet<usize>,
    pub fail_execute: bool,
    pub fail_queries: bool,
    pub refuse_connections: usize,
    pub query_response: Option<String>,
    pub opened: usize,
    pub released: usize,
}

/// In-memory stand-in for the warehouse with scripted failures.
#[derive(Debug, Clone, Default)]
pub struct MockWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, WarehouseState> {
        self.state.lock().expect("mock state")
    }

    /// Makes the given 1-based insert attempts (counted across the whole run) fail.
    pub fn fail_insert_attempts(&self, attempts: impl IntoIterator<Item = usize>) {
        self.state().failing_insert_attempts.extend(attempts);
    }

    pub fn respond_with(&self, body: &str) {
        self.state().query_response = Some(body.to_string());
    }

    pub fn rows(&self, quoted_table: &str) -> Vec<String> {
        self.state()
            .tables
            .get(quoted_table)
            .cloned()
            .unwrap_or_default()
    }

    /// Row counts of every accepted insert payload, in submission order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state()
            .inserts
            .iter()
            .map(|(_, payload)| payload.lines().count())
            .collect()
    }
}

fn between<'a>(statement: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let rest = statement.strip_prefix(prefix)?;
    let end = rest.find(suffix).unwrap_or(rest.len());
    Some(&rest[..end])
}

pub struct MockConnection {
    state: Arc<Mutex<WarehouseState>>,
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.released += 1;
        }
    }
}

impl Connection for MockConnection {
    fn execute(&mut self, statement: &str) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().expect("mock state");
        state.statements.push(statement.to_string());
        if state.fail_execute {
            return Err(WarehouseError::Operation("simulated DDL failure".into()));
        }
        if let Some(table) = between(statement, "DROP TABLE IF EXISTS ", " ") {
            state.tables.remove(table);
        } else if let Some(table) = between(statement, "CREATE TABLE IF NOT EXISTS ", " (") {
            state.tables.entry(table.to_string()).or_default();
        }
        Ok(())
    }

    fn insert(&mut self, statement: &str, payload: &str) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().expect("mock state");
        state.insert_attempts += 1;
        let attempt = state.insert_attempts;
        if state.failing_insert_attempts.contains(&attempt) {
            return Err(WarehouseError::Operation(format!(
                "simulated insert failure on attempt {attempt}"
            )));
        }
        let table = between(statement, "INSERT INTO ", " FORMAT")
            .ok_or_else(|| WarehouseError::Operation("malformed insert".into()))?
            .to_string();
        let Some(rows) = state.tables.get_mut(&table) else {
            return Err(WarehouseError::Operation(format!(
                "table {table} does not exist"
            )));
        };
        rows.extend(payload.lines().map(str::to_string));
        state
            .inserts
            .push((statement.to_string(), payload.to_string()));
        Ok(())
    }

    fn query(&mut self, statement: &str) -> Result<String, WarehouseError> {
        let mut state = self.state.lock().expect("mock state");
        state.statements.push(statement.to_string());
        if state.fail_queries {
            return Err(WarehouseError::Operation("simulated query failure".into()));
        }
        if let Some(body) = &state.query_response {
            return Ok(body.clone());
        }
        if let Some(table) = between(statement, "SELECT count() FROM ", " FORMAT") {
            let rows = state.tables.get(table).ok_or_else(|| {
                WarehouseError::Operation(format!("table {table} does not exist"))
            })?;
            return Ok(format!("{}\n", rows.len()));
        }
        if statement.contains("system.tables") {
            let names = state
                .tables
                .keys()
                .map(|name| format!("{}\n", name.trim_matches('`')))
                .collect::<String>();
            return Ok(names);
        }
        Err(WarehouseError::Operation(format!(
            "unsupported query: {statement}"
        )))
    }
}

impl Connector for MockWarehouse {
    type Conn = MockConnection;

    fn connect(&self) -> Result<MockConnection, WarehouseError> {
        let mut state = self.state();
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(WarehouseError::Connect("connection refused".into()));
        }
        state.opened += 1;
        Ok(MockConnection {
            state: Arc::clone(&self.state),
        })
    }
}
