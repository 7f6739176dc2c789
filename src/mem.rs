// ============================================================================
// In-memory driver
// ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};

use crate::connection::config::PoolConfig;
use crate::connection::{Connection, Driver};
use crate::core::{DbError, Result, Row, Value};

type Tables = HashMap<String, Vec<Vec<Value>>>;

/// In-memory driver for tests and demos. Connections created by clones of
/// one driver share a single table store. Transactions read from a private
/// snapshot taken at `BEGIN` and publish their writes by replaying a log
/// on commit, so concurrent transactions on the same table merge instead
/// of overwriting each other.
///
/// The command dialect is a single verb plus one argument:
/// `create <table>`, `drop <table>`, `insert <table>` (params become the
/// row), `select <table>`, `count <table>` and `sqrt <number>`.
#[derive(Clone, Default)]
pub struct MemDriver {
    shared: Arc<MemShared>,
}

#[derive(Default)]
struct MemShared {
    store: Mutex<Tables>,
    next_conn_id: AtomicU64,
}

impl MemDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for MemDriver {
    type Conn = MemConn;

    async fn connect(&self, _config: &PoolConfig) -> Result<MemConn> {
        let id = self.shared.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Opened in-memory connection {}", id);
        Ok(MemConn {
            id,
            shared: Arc::clone(&self.shared),
            tx: None,
            closed: false,
        })
    }
}

/// One write recorded while a transaction is open, replayed into the
/// shared store on commit.
enum TxOp {
    Create(String),
    Drop(String),
    Insert(String, Vec<Value>),
}

struct Savepoint {
    name: String,
    working: Tables,
    log_len: usize,
}

struct TxState {
    /// Private copy of the store taken at `BEGIN`. Statements inside the
    /// transaction read and validate against this.
    working: Tables,
    log: Vec<TxOp>,
    savepoints: Vec<Savepoint>,
}

pub struct MemConn {
    id: u64,
    shared: Arc<MemShared>,
    tx: Option<TxState>,
    closed: bool,
}

#[derive(Clone, Copy)]
enum Verb<'a> {
    Create(&'a str),
    Drop(&'a str),
    Insert(&'a str),
    Select(&'a str),
    Count(&'a str),
    Sqrt(f64),
}

fn parse_command(command: &str) -> Result<Verb<'_>> {
    let mut parts = command.split_whitespace();
    let verb = parts
        .next()
        .ok_or_else(|| DbError::QueryError("empty command".to_string()))?;
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(DbError::QueryError(format!(
            "too many arguments in '{}'",
            command
        )));
    }
    let arg = arg.ok_or_else(|| DbError::QueryError(format!("'{}' needs an argument", verb)))?;

    match verb {
        "create" => Ok(Verb::Create(arg)),
        "drop" => Ok(Verb::Drop(arg)),
        "insert" => Ok(Verb::Insert(arg)),
        "select" => Ok(Verb::Select(arg)),
        "count" => Ok(Verb::Count(arg)),
        "sqrt" => {
            let operand = arg.parse::<f64>().map_err(|_| {
                DbError::QueryError(format!("sqrt needs a numeric argument, got '{}'", arg))
            })?;
            Ok(Verb::Sqrt(operand))
        }
        other => Err(DbError::QueryError(format!(
            "unrecognized command '{}'",
            other
        ))),
    }
}

fn make_row(values: Vec<Value>) -> Row {
    let columns = (0..values.len()).map(|i| format!("c{}", i)).collect();
    Row::new(columns, values)
}

fn apply_in(tables: &mut Tables, verb: Verb<'_>, params: &[Value]) -> Result<(u64, Vec<Row>)> {
    match verb {
        Verb::Create(name) => {
            if tables.contains_key(name) {
                return Err(DbError::TableExists(name.to_string()));
            }
            tables.insert(name.to_string(), Vec::new());
            Ok((0, Vec::new()))
        }
        Verb::Drop(name) => {
            if tables.remove(name).is_none() {
                return Err(DbError::TableNotFound(name.to_string()));
            }
            Ok((0, Vec::new()))
        }
        Verb::Insert(name) => {
            let rows = tables
                .get_mut(name)
                .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
            rows.push(params.to_vec());
            Ok((1, vec![make_row(params.to_vec())]))
        }
        Verb::Select(name) => {
            let rows = tables
                .get(name)
                .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
            let result: Vec<Row> = rows.iter().cloned().map(make_row).collect();
            Ok((result.len() as u64, result))
        }
        Verb::Count(name) => {
            let rows = tables
                .get(name)
                .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
            let row = Row::new(
                vec!["count".to_string()],
                vec![Value::Integer(rows.len() as i64)],
            );
            Ok((1, vec![row]))
        }
        Verb::Sqrt(operand) => {
            if operand < 0.0 {
                return Err(DbError::QueryError(format!(
                    "sqrt of negative number {}",
                    operand
                )));
            }
            let row = Row::new(
                vec!["sqrt".to_string()],
                vec![Value::Float(operand.sqrt())],
            );
            Ok((1, vec![row]))
        }
    }
}

fn verify_innermost(savepoints: &[Savepoint], name: &str) -> Result<()> {
    match savepoints.last() {
        Some(sp) if sp.name == name => Ok(()),
        Some(sp) => Err(DbError::TransactionError(format!(
            "savepoint '{}' is not the innermost (found '{}')",
            name, sp.name
        ))),
        None => Err(DbError::TransactionError(format!(
            "no savepoint named '{}'",
            name
        ))),
    }
}

impl MemConn {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DbError::ConnectionError(format!(
                "Connection {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn require_tx(&mut self, savepoint: &str) -> Result<&mut TxState> {
        self.tx.as_mut().ok_or_else(|| {
            DbError::TransactionError(format!("savepoint '{}' outside a transaction", savepoint))
        })
    }

    /// A failed statement leaves the transaction usable; nothing is logged
    /// unless the statement succeeded.
    fn run(&mut self, command: &str, params: &[Value]) -> Result<(u64, Vec<Row>)> {
        self.ensure_open()?;
        let verb = parse_command(command)?;

        match &mut self.tx {
            Some(tx) => {
                let (affected, rows) = apply_in(&mut tx.working, verb, params)?;
                match verb {
                    Verb::Create(name) => tx.log.push(TxOp::Create(name.to_string())),
                    Verb::Drop(name) => tx.log.push(TxOp::Drop(name.to_string())),
                    Verb::Insert(name) => {
                        tx.log.push(TxOp::Insert(name.to_string(), params.to_vec()))
                    }
                    Verb::Select(_) | Verb::Count(_) | Verb::Sqrt(_) => {}
                }
                Ok((affected, rows))
            }
            None => {
                let mut store = self.shared.store.lock()?;
                apply_in(&mut store, verb, params)
            }
        }
    }
}

#[async_trait]
impl Connection for MemConn {
    fn id(&self) -> u64 {
        self.id
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    async fn execute(&mut self, command: &str, params: &[Value]) -> Result<u64> {
        let (affected, _) = self.run(command, params)?;
        Ok(affected)
    }

    async fn fetch(&mut self, command: &str, params: &[Value]) -> Result<Vec<Row>> {
        let (_, rows) = self.run(command, params)?;
        Ok(rows)
    }

    async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.tx.is_some() {
            return Err(DbError::TransactionError(
                "transaction already active".to_string(),
            ));
        }
        let working = self.shared.store.lock()?.clone();
        self.tx = Some(TxState {
            working,
            log: Vec::new(),
            savepoints: Vec::new(),
        });
        debug!("Connection {}: BEGIN", self.id);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DbError::TransactionError("no active transaction".to_string()))?;

        let mut store = self.shared.store.lock()?;
        for op in tx.log {
            match op {
                TxOp::Create(name) => {
                    store.entry(name).or_default();
                }
                TxOp::Drop(name) => {
                    store.remove(&name);
                }
                TxOp::Insert(name, row) => {
                    store.entry(name).or_default().push(row);
                }
            }
        }
        debug!("Connection {}: COMMIT", self.id);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        // Rolling back with no transaction open is a no-op, matching SQL
        // convention.
        if self.tx.take().is_some() {
            debug!("Connection {}: ROLLBACK", self.id);
        }
        Ok(())
    }

    async fn begin_nested(&mut self, savepoint: &str) -> Result<()> {
        self.ensure_open()?;
        let tx = self.require_tx(savepoint)?;
        tx.savepoints.push(Savepoint {
            name: savepoint.to_string(),
            working: tx.working.clone(),
            log_len: tx.log.len(),
        });
        debug!("Connection {}: SAVEPOINT {}", self.id, savepoint);
        Ok(())
    }

    async fn release_nested(&mut self, savepoint: &str) -> Result<()> {
        self.ensure_open()?;
        let tx = self.require_tx(savepoint)?;
        verify_innermost(&tx.savepoints, savepoint)?;
        tx.savepoints.pop();
        debug!("Connection {}: RELEASE {}", self.id, savepoint);
        Ok(())
    }

    async fn rollback_nested(&mut self, savepoint: &str) -> Result<()> {
        self.ensure_open()?;
        let tx = self.require_tx(savepoint)?;
        verify_innermost(&tx.savepoints, savepoint)?;
        if let Some(sp) = tx.savepoints.pop() {
            tx.working = sp.working;
            tx.log.truncate(sp.log_len);
        }
        debug!("Connection {}: ROLLBACK TO {}", self.id, savepoint);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.tx.take().is_some() {
            warn!("Connection {} closed with an open transaction", self.id);
        }
        self.closed = true;
        Ok(())
    }
}
