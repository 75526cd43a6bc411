//! Crash recovery: a transaction that journals writes but is never
//! committed or rolled back (the process is simulated as having died by
//! dropping the `Engine` without calling either) must be undone the next
//! time the directory is opened.

use std::collections::BTreeMap;

use tinybase::{EngineConfig, QueryResult, StorageEngine, Value};

#[test]
fn orphan_journal_is_replayed_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = EngineConfig::default();

    {
        let mut engine = tinybase::Engine::new(StorageEngine::open(dir.path(), cfg).unwrap());
        engine
            .execute(
                tinybase::parse("CREATE TABLE accounts (acc_id INT PRIMARY KEY, balance INT)")
                    .unwrap(),
            )
            .unwrap();
        engine
            .execute(tinybase::parse("INSERT INTO accounts VALUES (101, 1000)").unwrap())
            .unwrap();

        // Begin a transaction and mutate a page through it, but never commit
        // or roll back: dropping `engine` here releases the OS lock (via
        // `Locker`'s `Drop`) the same way process death would, while the
        // journal file written by the in-progress transaction stays on disk.
        let storage = engine.storage_mut();
        storage.begin().unwrap();
        let mut patch = BTreeMap::new();
        patch.insert("balance".to_string(), Value::Int(50));
        storage
            .update_record("accounts", &Value::Int(101), patch)
            .unwrap();
    }

    let journal_path = dir.path().join("accounts.db-journal");
    assert!(
        journal_path.is_file(),
        "the crashed transaction should have left an orphan journal"
    );

    let mut engine = tinybase::Engine::new(StorageEngine::open(dir.path(), cfg).unwrap());
    assert!(
        !journal_path.is_file(),
        "opening the engine should have replayed and deleted the orphan journal"
    );

    let result = engine
        .execute(
            tinybase::parse("SELECT balance FROM accounts WHERE acc_id = 101").unwrap(),
        )
        .unwrap();
    match result {
        QueryResult::Rows { rows, .. } => {
            assert_eq!(rows[0].get("balance"), Some(&Value::Int(1000)));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
