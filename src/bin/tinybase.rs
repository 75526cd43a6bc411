//! Interactive shell: reads a line, hands it to the parser, executes the
//! resulting command against one open `Engine`, and prints the result as a
//! table. The only process-level glue the storage/execution stack needs.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use log::{debug, warn};

use tinybase::{parse, Engine, EngineConfig, QueryResult, Record, StorageEngine};

const PROMPT: &str = "pysqlite> ";
const HISTORY_FILE: &str = ".tinybase_history";

fn init_log() {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format_timestamp_secs()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] [{}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}

fn load_history(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(contents) => contents.lines().map(|l| l.to_string()).collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!("could not read history file {:?}: {}", path, e);
            Vec::new()
        }
    }
}

fn append_history(path: &Path, line: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(e) = result {
        warn!("could not append to history file {:?}: {}", path, e);
    }
}

fn main() -> ExitCode {
    init_log();

    let db_dir = match env::args().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => {
            eprintln!("usage: tinybase <db_dir>");
            return ExitCode::FAILURE;
        }
    };

    let storage = match StorageEngine::open(&db_dir, EngineConfig::default()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut engine = Engine::new(storage);

    let history_path = db_dir.join(HISTORY_FILE);
    let mut history = load_history(&history_path);
    debug!("loaded {} history entries", history.len());

    let stdin = io::stdin();
    loop {
        print!("{}", PROMPT);
        if io::stdout().flush().is_err() {
            break;
        }

        let mut line = String::new();
        let n = match stdin.read_line(&mut line) {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            // EOF (Ctrl-D).
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        history.push(line.to_string());
        append_history(&history_path, line);

        if line == ".exit" {
            break;
        }
        if line == ".tables" {
            match engine.storage_mut().list_tables() {
                Ok(names) => {
                    for name in names {
                        println!("{}", name);
                    }
                }
                Err(e) => println!("Error: {}", e),
            }
            continue;
        }

        match parse(line).and_then(|cmd| engine.execute(cmd)) {
            Ok(result) => print_result(&result),
            Err(e) => println!("Error: {}", e),
        }
    }

    ExitCode::SUCCESS
}

/// Prints a `QueryResult` the way the shell contract requires: row sets as a
/// fixed-width `col | col | ...` table with a `---+---+...` separator under
/// the header, everything else as-is.
fn print_result(result: &QueryResult) {
    match result {
        QueryResult::Rows { columns, rows } => print_table(columns, rows),
        QueryResult::Affected(n) => println!("{} row(s) affected", n),
        QueryResult::Ack(msg) => println!("{}", msg),
    }
}

fn print_table(columns: &[String], rows: &[Record]) {
    if columns.is_empty() {
        println!("(no columns)");
        return;
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    let rendered: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| {
                    row.get(c.as_str())
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "null".to_string())
                })
                .collect()
        })
        .collect();
    for row in &rendered {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let header: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
        .collect();
    println!("{}", header.join(" | "));

    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", separator.join("-+-"));

    for row in &rendered {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:width$}", cell, width = widths[i]))
            .collect();
        println!("{}", cells.join(" | "));
    }
}
