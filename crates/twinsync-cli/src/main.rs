//! # TwinSync CLI
//!
//! Command-line utilities for inspecting a mirror's session database.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use twinsync_core::TwinKey;
use twinsync_subscriber::SqliteSessionStore;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "list" => {
            let store = open_store()?;
            let states = store.list().context("Failed to list session records")?;
            if states.is_empty() {
                println!("no twins cached");
            }
            for state in states {
                println!(
                    "{}  version={}  payload={}B",
                    state.key,
                    state.last_applied_version,
                    state.cached_payload.len()
                );
            }
        }
        "show" => {
            if args.len() < 3 {
                eprintln!("Usage: twinsync show <namespace> [location]");
                std::process::exit(1);
            }
            let key = TwinKey::new(args[2].clone(), args.get(3).cloned());

            let store = open_store()?;
            let state = store.load(&key).context("Failed to load session record")?;
            if !state.has_cache() {
                eprintln!("no cached state for {key}");
                std::process::exit(1);
            }

            println!("key:     {key}");
            println!("version: {}", state.last_applied_version);
            match serde_json::from_slice::<serde_json::Value>(&state.cached_payload) {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", String::from_utf8_lossy(&state.cached_payload)),
            }
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn open_store() -> Result<SqliteSessionStore> {
    let path = env::var("TWINSYNC_DB_PATH").unwrap_or_else(|_| "./twinsync.db".to_string());
    SqliteSessionStore::open(&PathBuf::from(&path))
        .with_context(|| format!("Failed to open session database at {path}"))
}

fn print_help() {
    println!(
        r#"TwinSync CLI

USAGE:
    twinsync <COMMAND> [OPTIONS]

COMMANDS:
    list                        List cached twins with their versions
    show <namespace> [location] Print the cached payload for one key
    help                        Show this help message

The session database is read from TWINSYNC_DB_PATH (default ./twinsync.db).

EXAMPLES:
    twinsync list
    twinsync show trapd.listener.config
    twinsync show trapd.listener.config zone-1
"#
    );
}
