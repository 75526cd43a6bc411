//! End-to-end scenarios driven entirely through SQL text, exercising the
//! parser, execution engine, and storage engine together.

use tinybase::{EngineConfig, QueryResult, StorageEngine, Value};

fn engine() -> (tempfile::TempDir, tinybase::Engine) {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageEngine::open(dir.path(), EngineConfig::default()).unwrap();
    (dir, tinybase::Engine::new(storage))
}

fn run(engine: &mut tinybase::Engine, sql: &str) -> QueryResult {
    engine
        .execute(tinybase::parse(sql).unwrap())
        .unwrap_or_else(|e| panic!("{} failed: {}", sql, e))
}

fn single_value(result: &QueryResult, column: &str) -> Value {
    match result {
        QueryResult::Rows { rows, .. } => rows[0].get(column).cloned().unwrap(),
        other => panic!("expected rows, got {:?}", other),
    }
}

#[test]
fn rollback_discards_writes_made_inside_the_transaction() {
    let (_dir, mut engine) = engine();
    run(
        &mut engine,
        "CREATE TABLE accounts (acc_id INT PRIMARY KEY, balance INT)",
    );
    run(&mut engine, "INSERT INTO accounts VALUES (101, 1000)");

    run(&mut engine, "BEGIN");
    run(
        &mut engine,
        "UPDATE accounts SET balance = 50 WHERE acc_id = 101",
    );
    let mid = run(
        &mut engine,
        "SELECT balance FROM accounts WHERE acc_id = 101",
    );
    assert_eq!(single_value(&mid, "balance"), Value::Int(50));
    run(&mut engine, "ROLLBACK");

    let after = run(
        &mut engine,
        "SELECT balance FROM accounts WHERE acc_id = 101",
    );
    assert_eq!(single_value(&after, "balance"), Value::Int(1000));
}

#[test]
fn commit_makes_writes_durable_across_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = EngineConfig::default();
    {
        let mut engine = tinybase::Engine::new(StorageEngine::open(dir.path(), cfg).unwrap());
        run(
            &mut engine,
            "CREATE TABLE accounts (acc_id INT PRIMARY KEY, balance INT)",
        );
        run(&mut engine, "INSERT INTO accounts VALUES (101, 1000)");
        run(&mut engine, "BEGIN");
        run(
            &mut engine,
            "UPDATE accounts SET balance = 500 WHERE acc_id = 101",
        );
        run(&mut engine, "COMMIT");
    }

    let mut engine = tinybase::Engine::new(StorageEngine::open(dir.path(), cfg).unwrap());
    let result = run(
        &mut engine,
        "SELECT balance FROM accounts WHERE acc_id = 101",
    );
    assert_eq!(single_value(&result, "balance"), Value::Int(500));
}

fn populate_departments_and_employees(engine: &mut tinybase::Engine) {
    run(
        engine,
        "CREATE TABLE departments (dept_id INT PRIMARY KEY, name STR)",
    );
    run(
        engine,
        "CREATE TABLE employees (emp_id INT PRIMARY KEY, name STR, dept_id INT)",
    );
    run(engine, "INSERT INTO departments VALUES (101, 'Engineering')");
    run(engine, "INSERT INTO departments VALUES (102, 'HR')");
    run(engine, "INSERT INTO departments VALUES (103, 'Finance')");
    run(engine, "INSERT INTO employees VALUES (1, 'Alice', 101)");
    run(engine, "INSERT INTO employees VALUES (2, 'Bob', 101)");
    run(engine, "INSERT INTO employees VALUES (3, 'Charlie', 102)");
    run(engine, "INSERT INTO employees VALUES (4, 'David', 103)");
    run(engine, "INSERT INTO employees VALUES (5, 'Eve', 999)");
}

#[test]
fn inner_join_excludes_unmatched_rows_on_either_side() {
    let (_dir, mut engine) = engine();
    populate_departments_and_employees(&mut engine);

    let result = run(
        &mut engine,
        "SELECT employees.name, departments.name FROM employees \
         INNER JOIN departments ON employees.dept_id = departments.dept_id \
         ORDER BY employees.name",
    );
    match result {
        QueryResult::Rows { rows, .. } => {
            assert_eq!(rows.len(), 4);
            let names: Vec<String> = rows
                .iter()
                .map(|r| match r.get("employees.name") {
                    Some(Value::Str(s)) => s.clone(),
                    other => panic!("unexpected name: {:?}", other),
                })
                .collect();
            assert_eq!(names, vec!["Alice", "Bob", "Charlie", "David"]);
            assert!(rows
                .iter()
                .all(|r| r.get("departments.name") != Some(&Value::Str("Finance".into()))));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn left_join_keeps_unmatched_left_rows_with_null_right_side() {
    let (_dir, mut engine) = engine();
    populate_departments_and_employees(&mut engine);

    let result = run(
        &mut engine,
        "SELECT employees.name, departments.name FROM employees \
         LEFT JOIN departments ON employees.dept_id = departments.dept_id",
    );
    match result {
        QueryResult::Rows { rows, .. } => {
            assert_eq!(rows.len(), 5);
            let eve = rows
                .iter()
                .find(|r| r.get("employees.name") == Some(&Value::Str("Eve".into())))
                .expect("Eve should be present via LEFT JOIN");
            assert_eq!(eve.get("departments.name"), Some(&Value::Null));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn count_star_reflects_deletions() {
    let (_dir, mut engine) = engine();
    populate_departments_and_employees(&mut engine);

    run(&mut engine, "DELETE FROM employees WHERE emp_id = 3");
    let result = run(&mut engine, "SELECT COUNT(*) FROM employees");
    assert_eq!(single_value(&result, "COUNT(*)"), Value::Int(4));
}

#[test]
fn group_by_rejects_a_plain_column_not_in_the_group_list() {
    let (_dir, mut engine) = engine();
    populate_departments_and_employees(&mut engine);

    let err = engine
        .execute(
            tinybase::parse("SELECT name, COUNT(*) FROM employees GROUP BY dept_id").unwrap(),
        )
        .unwrap_err();
    assert!(matches!(err, tinybase::Error::Semantic(_)));
}

#[test]
fn delete_without_where_is_refused() {
    let err = tinybase::parse("DELETE FROM employees").unwrap_err();
    assert!(matches!(err, tinybase::Error::Safety(_)));
}

#[test]
fn update_is_observably_a_no_op_when_setting_the_current_value() {
    let (_dir, mut engine) = engine();
    run(
        &mut engine,
        "CREATE TABLE accounts (acc_id INT PRIMARY KEY, balance INT)",
    );
    run(&mut engine, "INSERT INTO accounts VALUES (1, 42)");
    run(
        &mut engine,
        "UPDATE accounts SET balance = 42 WHERE acc_id = 1",
    );
    let result = run(&mut engine, "SELECT balance FROM accounts WHERE acc_id = 1");
    assert_eq!(single_value(&result, "balance"), Value::Int(42));
}

#[test]
fn secondary_index_probe_and_full_scan_agree() {
    let (_dir, mut engine) = engine();
    run(
        &mut engine,
        "CREATE TABLE accounts (acc_id INT PRIMARY KEY, owner STR, balance INT)",
    );
    run(&mut engine, "CREATE INDEX owner_idx ON accounts (owner)");
    run(&mut engine, "INSERT INTO accounts VALUES (1, 'alice', 10)");
    run(&mut engine, "INSERT INTO accounts VALUES (2, 'bob', 20)");

    let via_index = run(
        &mut engine,
        "SELECT acc_id, balance FROM accounts WHERE owner = 'bob'",
    );
    match via_index {
        QueryResult::Rows { rows, .. } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get("acc_id"), Some(&Value::Int(2)));
            assert_eq!(rows[0].get("balance"), Some(&Value::Int(20)));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn with_cte_materializes_before_the_main_query() {
    let (_dir, mut engine) = engine();
    run(
        &mut engine,
        "CREATE TABLE accounts (acc_id INT PRIMARY KEY, balance INT)",
    );
    run(&mut engine, "INSERT INTO accounts VALUES (1, 100)");
    run(&mut engine, "INSERT INTO accounts VALUES (2, 900)");

    let result = run(
        &mut engine,
        "WITH big_accounts AS (SELECT acc_id FROM accounts WHERE balance > 500) \
         SELECT acc_id FROM big_accounts",
    );
    match result {
        QueryResult::Rows { rows, .. } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get("acc_id"), Some(&Value::Int(2)));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
