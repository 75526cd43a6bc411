//! The storage-engine facade: tables, indexes, the metadata page, CRUD on
//! records, and the transaction lifecycle. This is the single owned object
//! the design notes call for — it holds the transaction flag, the
//! journaled-pages map (via `TxLedger`), and the one `Locker` for its
//! directory, but is never exposed as a process-wide singleton.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{de::DeserializeOwned, Serialize};

use crate::btree::{self, Node};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::journal::{self, TxLedger, TxState};
use crate::lock::Locker;
use crate::page::{decode_page, encode_page, PageFile};
use crate::storage::metadata::{ColumnType, IndexMeta, TableMeta};
use crate::value::{Record, Value};

const LOCK_FILE_NAME: &str = ".db_lock";

pub struct StorageEngine {
    dir: PathBuf,
    cfg: EngineConfig,
    locker: Locker,
    ledger: TxLedger,
}

fn read_meta<T: DeserializeOwned>(pf: &mut PageFile, not_found: impl FnOnce() -> Error) -> Result<T> {
    let bytes = pf.read_raw(0)?.ok_or_else(not_found)?;
    decode_page(bytes.as_slice())
}

fn write_meta<T: Serialize>(pf: &mut PageFile, ledger: &mut TxLedger, meta: &T) -> Result<()> {
    ledger.before_write(pf, 0)?;
    let bytes = encode_page(meta, pf.page_size())?;
    pf.write_raw(0, &bytes)
}

impl StorageEngine {
    /// Opens (creating if absent) the database directory at `dir`, running
    /// crash recovery against any orphaned journal files before returning.
    pub fn open(dir: impl AsRef<Path>, cfg: EngineConfig) -> Result<StorageEngine> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut locker = Locker::new(dir.join(LOCK_FILE_NAME));
        locker.lock(true, cfg.lock_timeout, cfg.lock_poll_interval)?;
        journal::recover_dir(&dir, cfg.page_size)?;
        locker.unlock()?;

        Ok(StorageEngine {
            dir,
            cfg,
            locker,
            ledger: TxLedger::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn in_transaction(&self) -> bool {
        self.ledger.state() == TxState::Active
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.db", name))
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.idx", name))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        PageFile::exists(self.table_path(name))
    }

    /// Lists the base names of every `.db` file in the directory, for the
    /// shell's `.tables` meta-command.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("db") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    // ---- transaction control -------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        if self.ledger.state() == TxState::Active {
            return Err(Error::TransactionState(
                "BEGIN while a transaction is already active".into(),
            ));
        }
        self.locker
            .lock(true, self.cfg.lock_timeout, self.cfg.lock_poll_interval)?;
        self.ledger.begin()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ledger.commit()?;
        self.locker.unlock()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ledger.rollback(self.cfg.page_size)?;
        self.locker.unlock()
    }

    /// Runs `body` under a shared directory lock, unless a transaction is
    /// already active (in which case the exclusive lock already held by
    /// the transaction covers it and no extra lock is taken).
    fn with_read_lock<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let need_lock = self.ledger.state() == TxState::Idle;
        if need_lock {
            self.locker
                .lock(false, self.cfg.lock_timeout, self.cfg.lock_poll_interval)?;
        }
        let result = body(self);
        if need_lock {
            let _ = self.locker.unlock();
        }
        result
    }

    // ---- DDL --------------------------------------------------------------

    pub fn create_table(
        &mut self,
        name: &str,
        columns: Vec<(String, ColumnType)>,
        primary_key: String,
    ) -> Result<()> {
        let path = self.table_path(name);
        if PageFile::exists(&path) {
            return Err(Error::schema(format!("table {} already exists", name)));
        }
        if columns.is_empty() {
            return Err(Error::schema("a table must declare at least one column"));
        }
        if !columns.iter().any(|(c, _)| c == &primary_key) {
            return Err(Error::schema(format!(
                "primary key column {} is not declared in the column list",
                primary_key
            )));
        }

        let mut pf = PageFile::open(&path, self.cfg.page_size)?;
        let meta = TableMeta {
            schema: columns,
            primary_key,
            indexes: BTreeMap::new(),
            root_page: 1,
            next_page: 2,
        };
        write_meta(&mut pf, &mut self.ledger, &meta)?;
        let leaf: Node<Record> = Node::new_leaf();
        btree::write_fresh(&mut pf, 1, &leaf)?;
        debug!("created table {}", name);
        Ok(())
    }

    pub fn create_index(&mut self, index_name: &str, table_name: &str, column: &str) -> Result<()> {
        let ipath = self.index_path(index_name);
        if PageFile::exists(&ipath) {
            return Err(Error::schema(format!("index {} already exists", index_name)));
        }

        let mut table_meta = self.read_table_meta(table_name)?;
        if !table_meta.has_column(column) {
            return Err(Error::schema(format!(
                "column {} is not part of table {}",
                column, table_name
            )));
        }

        let mut ipf = PageFile::open(&ipath, self.cfg.page_size)?;
        let mut imeta = IndexMeta {
            root_page: 1,
            next_page: 2,
        };
        write_meta(&mut ipf, &mut self.ledger, &imeta)?;
        let leaf: Node<Value> = Node::new_leaf();
        btree::write_fresh(&mut ipf, 1, &leaf)?;

        for row in self.scan_table_raw(table_name)? {
            if let Some(v) = row.get(column) {
                if !v.is_null() {
                    let pk = row.get(&table_meta.primary_key).cloned().unwrap_or(Value::Null);
                    imeta.root_page = btree::insert(
                        &mut ipf,
                        &mut self.ledger,
                        &self.cfg,
                        imeta.root_page,
                        &mut imeta.next_page,
                        v.clone(),
                        pk,
                    )?;
                }
            }
        }
        write_meta(&mut ipf, &mut self.ledger, &imeta)?;

        table_meta
            .indexes
            .insert(index_name.to_string(), column.to_string());
        let mut tpf = PageFile::open(self.table_path(table_name), self.cfg.page_size)?;
        write_meta(&mut tpf, &mut self.ledger, &table_meta)?;
        debug!("created index {} on {}.{}", index_name, table_name, column);
        Ok(())
    }

    // ---- metadata -----------------------------------------------------

    fn read_table_meta(&mut self, table: &str) -> Result<TableMeta> {
        let path = self.table_path(table);
        if !PageFile::exists(&path) {
            return Err(Error::schema(format!("table {} not found", table)));
        }
        let mut pf = PageFile::open(&path, self.cfg.page_size)?;
        read_meta(&mut pf, || Error::schema(format!("table {} not found", table)))
    }

    pub fn get_table_metadata(&mut self, table: &str) -> Result<TableMeta> {
        self.with_read_lock(|eng| eng.read_table_meta(table))
    }

    // ---- CRUD -----------------------------------------------------------

    pub fn insert_record(&mut self, table: &str, record: Record) -> Result<()> {
        let mut meta = self.read_table_meta(table)?;
        let pk_val = record
            .get(&meta.primary_key)
            .cloned()
            .ok_or_else(|| Error::constraint(format!("missing value for primary key column {}", meta.primary_key)))?;
        if pk_val.is_null() {
            return Err(Error::constraint("primary key value must not be null"));
        }
        if self.search_pk_raw(table, &pk_val)?.is_some() {
            return Err(Error::constraint(format!(
                "duplicate primary key value {}",
                pk_val
            )));
        }

        let mut tpf = PageFile::open(self.table_path(table), self.cfg.page_size)?;
        meta.root_page = btree::insert(
            &mut tpf,
            &mut self.ledger,
            &self.cfg,
            meta.root_page,
            &mut meta.next_page,
            pk_val.clone(),
            record.clone(),
        )?;
        write_meta(&mut tpf, &mut self.ledger, &meta)?;

        for (index_name, column) in meta.indexes.clone() {
            if let Some(v) = record.get(&column) {
                if !v.is_null() {
                    self.insert_index_entry(&index_name, v.clone(), pk_val.clone())?;
                }
            }
        }
        Ok(())
    }

    fn insert_index_entry(&mut self, index_name: &str, key: Value, pk: Value) -> Result<()> {
        let ipath = self.index_path(index_name);
        let mut ipf = PageFile::open(&ipath, self.cfg.page_size)?;
        let mut imeta: IndexMeta = read_meta(&mut ipf, || {
            Error::schema(format!("index {} not found", index_name))
        })?;
        imeta.root_page = btree::insert(
            &mut ipf,
            &mut self.ledger,
            &self.cfg,
            imeta.root_page,
            &mut imeta.next_page,
            key,
            pk,
        )?;
        write_meta(&mut ipf, &mut self.ledger, &imeta)
    }

    fn delete_index_entry(&mut self, index_name: &str, key: &Value) -> Result<()> {
        let ipath = self.index_path(index_name);
        let mut ipf = PageFile::open(&ipath, self.cfg.page_size)?;
        let mut imeta: IndexMeta = read_meta(&mut ipf, || {
            Error::schema(format!("index {} not found", index_name))
        })?;
        let (new_root, _) = btree::delete::<Value>(&mut ipf, &mut self.ledger, imeta.root_page, key)?;
        imeta.root_page = new_root;
        write_meta(&mut ipf, &mut self.ledger, &imeta)
    }

    pub fn update_record(&mut self, table: &str, pk: &Value, patch: Record) -> Result<()> {
        let existing = self
            .search_pk_raw(table, pk)?
            .ok_or_else(|| Error::schema(format!("no row with primary key {} in {}", pk, table)))?;
        self.delete_record(table, pk, Some(existing.clone()))?;
        let mut merged = existing;
        for (k, v) in patch {
            merged.insert(k, v);
        }
        self.insert_record(table, merged)
    }

    pub fn delete_record(&mut self, table: &str, pk: &Value, record: Option<Record>) -> Result<()> {
        let row = match record {
            Some(r) => r,
            None => match self.search_pk_raw(table, pk)? {
                Some(r) => r,
                None => return Ok(()),
            },
        };

        let mut meta = self.read_table_meta(table)?;
        for (index_name, column) in meta.indexes.clone() {
            if let Some(v) = row.get(&column) {
                if !v.is_null() {
                    self.delete_index_entry(&index_name, v)?;
                }
            }
        }

        let mut tpf = PageFile::open(self.table_path(table), self.cfg.page_size)?;
        let (new_root, _found) = btree::delete::<Record>(&mut tpf, &mut self.ledger, meta.root_page, pk)?;
        meta.root_page = new_root;
        write_meta(&mut tpf, &mut self.ledger, &meta)
    }

    fn search_pk_raw(&mut self, table: &str, pk: &Value) -> Result<Option<Record>> {
        let path = self.table_path(table);
        if !PageFile::exists(&path) {
            return Err(Error::schema(format!("table {} not found", table)));
        }
        let mut pf = PageFile::open(&path, self.cfg.page_size)?;
        let meta: TableMeta = read_meta(&mut pf, || Error::schema(format!("table {} not found", table)))?;
        btree::search::<Record>(&mut pf, meta.root_page, pk)
    }

    pub fn search_pk(&mut self, table: &str, pk: &Value) -> Result<Option<Record>> {
        self.with_read_lock(|eng| eng.search_pk_raw(table, pk))
    }

    pub fn search_index(&mut self, index: &str, key: &Value) -> Result<Option<Value>> {
        self.with_read_lock(|eng| {
            let path = eng.index_path(index);
            if !PageFile::exists(&path) {
                return Err(Error::schema(format!("index {} not found", index)));
            }
            let mut pf = PageFile::open(&path, eng.cfg.page_size)?;
            let meta: IndexMeta = read_meta(&mut pf, || Error::schema(format!("index {} not found", index)))?;
            btree::search::<Value>(&mut pf, meta.root_page, key)
        })
    }

    fn scan_table_raw(&mut self, table: &str) -> Result<Vec<Record>> {
        let path = self.table_path(table);
        if !PageFile::exists(&path) {
            return Err(Error::schema(format!("table {} not found", table)));
        }
        let mut pf = PageFile::open(&path, self.cfg.page_size)?;
        let meta: TableMeta = read_meta(&mut pf, || Error::schema(format!("table {} not found", table)))?;
        let cursor = btree::Cursor::<Record>::new(&mut pf, meta.root_page)?;
        let mut out = Vec::new();
        for item in cursor {
            let (_, record) = item?;
            out.push(record);
        }
        Ok(out)
    }

    pub fn get_all_records(&mut self, table: &str) -> Result<Vec<Record>> {
        self.with_read_lock(|eng| eng.scan_table_raw(table))
    }
}
