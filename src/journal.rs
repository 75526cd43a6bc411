//! Undo journal and the transaction state machine built on top of it.
//!
//! Before a page is mutated for the first time within a transaction, its
//! current bytes are appended to `<file>-journal` as a `(page_number,
//! pre-image)` entry. Commit simply deletes the journal files; rollback (or
//! startup recovery for an orphaned journal) replays every entry back onto
//! the data file, undoing whatever was written since the transaction began.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::page::PageFile;

const PAGE_NUM_BYTES: usize = 4;

fn journal_path(data_path: &Path) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push("-journal");
    PathBuf::from(s)
}

/// Appends one `(page_num, pre_image)` entry to `data_path`'s journal,
/// creating the journal file if this is its first entry, then fsyncs it —
/// the pre-image must reach disk before the caller is allowed to mutate the
/// data file.
fn append_entry(data_path: &Path, page_num: u32, pre_image: &[u8]) -> Result<()> {
    let path = journal_path(data_path);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(&page_num.to_be_bytes())?;
    file.write_all(pre_image)?;
    file.sync_all()?;
    Ok(())
}

/// Replays every entry of `data_path`'s journal (if any) back onto the data
/// file, then deletes the journal. Used by both `Transaction::rollback` and
/// startup recovery.
fn replay_and_delete(data_path: &Path, page_size: usize) -> Result<()> {
    let path = journal_path(data_path);
    if !path.is_file() {
        return Ok(());
    }

    let mut journal = File::open(&path)?;
    let mut data = PageFile::open(data_path, page_size)?;

    let entry_size = PAGE_NUM_BYTES + page_size;
    let mut buf = vec![0u8; entry_size];
    loop {
        let mut filled = 0usize;
        while filled < entry_size {
            let n = journal.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        if filled < entry_size {
            // Trailing partial entry from a crash mid-append; nothing more
            // to safely replay.
            break;
        }
        let page_num = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        data.write_raw(page_num, &buf[PAGE_NUM_BYTES..])?;
    }

    fs::remove_file(&path)?;
    Ok(())
}

/// Scans `dir` for orphaned `-journal` files left by a crashed process and
/// replays each one before the engine serves any request.
pub fn recover_dir(dir: &Path, page_size: usize) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some(stem) = name.strip_suffix("-journal") {
            let data_path = path.with_file_name(stem);
            info!("recovering orphan journal for {:?}", data_path);
            replay_and_delete(&data_path, page_size)?;
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxState {
    Idle,
    Active,
}

/// Tracks which pages have already been journaled within the transaction
/// currently open on an `Engine`. Owned directly by the engine — never a
/// process-wide singleton — per the "single owned object" design note.
#[derive(Default)]
pub struct TxLedger {
    state: Option<TxStateHolder>,
}

struct TxStateHolder {
    journaled: HashMap<PathBuf, HashSet<u32>>,
}

impl TxLedger {
    pub fn new() -> TxLedger {
        TxLedger { state: None }
    }

    pub fn state(&self) -> TxState {
        match self.state {
            Some(_) => TxState::Active,
            None => TxState::Idle,
        }
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::TransactionState(
                "BEGIN while a transaction is already active".into(),
            ));
        }
        self.state = Some(TxStateHolder {
            journaled: HashMap::new(),
        });
        Ok(())
    }

    /// Before-write hook: journals the pre-image of `page_num` in `pf` the
    /// first time it is touched by the active transaction. No-op if there is
    /// no active transaction (the caller writes directly in that case).
    pub fn before_write(&mut self, pf: &mut PageFile, page_num: u32) -> Result<()> {
        let holder = match &mut self.state {
            Some(h) => h,
            None => return Ok(()),
        };
        let set = holder
            .journaled
            .entry(pf.path().to_path_buf())
            .or_insert_with(HashSet::new);
        if set.contains(&page_num) {
            return Ok(());
        }
        let pre_image = pf
            .read_raw(page_num)?
            .unwrap_or_else(|| vec![0u8; pf.page_size()]);
        append_entry(pf.path(), page_num, &pre_image)?;
        set.insert(page_num);
        debug!("journaled page {} of {:?}", page_num, pf.path());
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        let holder = self.state.take().ok_or_else(|| {
            Error::TransactionState("COMMIT while no transaction is active".into())
        })?;
        for path in holder.journaled.keys() {
            let jpath = journal_path(path);
            if jpath.is_file() {
                fs::remove_file(&jpath)?;
            }
        }
        Ok(())
    }

    pub fn rollback(&mut self, page_size: usize) -> Result<()> {
        let holder = self.state.take().ok_or_else(|| {
            Error::TransactionState("ROLLBACK while no transaction is active".into())
        })?;
        for path in holder.journaled.keys() {
            replay_and_delete(path, page_size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{decode_page, encode_page};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Dummy(u32);

    #[test]
    fn rollback_restores_pre_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut pf = PageFile::open(&path, 4096).unwrap();
        pf.write_raw(0, &encode_page(&Dummy(1), 4096).unwrap())
            .unwrap();

        let mut ledger = TxLedger::new();
        ledger.begin().unwrap();
        ledger.before_write(&mut pf, 0).unwrap();
        pf.write_raw(0, &encode_page(&Dummy(2), 4096).unwrap())
            .unwrap();
        ledger.rollback(4096).unwrap();

        let mut pf2 = PageFile::open(&path, 4096).unwrap();
        let back: Dummy = decode_page(&pf2.read_raw(0).unwrap().unwrap()).unwrap();
        assert_eq!(back, Dummy(1));
    }

    #[test]
    fn commit_deletes_journal_and_keeps_new_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut pf = PageFile::open(&path, 4096).unwrap();
        pf.write_raw(0, &encode_page(&Dummy(1), 4096).unwrap())
            .unwrap();

        let mut ledger = TxLedger::new();
        ledger.begin().unwrap();
        ledger.before_write(&mut pf, 0).unwrap();
        pf.write_raw(0, &encode_page(&Dummy(2), 4096).unwrap())
            .unwrap();
        ledger.commit().unwrap();

        assert!(!journal_path(&path).is_file());
        let mut pf2 = PageFile::open(&path, 4096).unwrap();
        let back: Dummy = decode_page(&pf2.read_raw(0).unwrap().unwrap()).unwrap();
        assert_eq!(back, Dummy(2));
    }

    #[test]
    fn recovery_replays_orphan_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut pf = PageFile::open(&path, 4096).unwrap();
        pf.write_raw(0, &encode_page(&Dummy(1), 4096).unwrap())
            .unwrap();

        let mut ledger = TxLedger::new();
        ledger.begin().unwrap();
        ledger.before_write(&mut pf, 0).unwrap();
        pf.write_raw(0, &encode_page(&Dummy(2), 4096).unwrap())
            .unwrap();
        // Simulate a crash: the journal is left on disk, never committed or
        // rolled back.
        std::mem::forget(ledger);

        recover_dir(dir.path(), 4096).unwrap();
        assert!(!journal_path(&path).is_file());

        let mut pf2 = PageFile::open(&path, 4096).unwrap();
        let back: Dummy = decode_page(&pf2.read_raw(0).unwrap().unwrap()).unwrap();
        assert_eq!(back, Dummy(1));
    }
}
