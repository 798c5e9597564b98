//! Patchbay command-line tools.
//!
//! Provides the `patchbay` binary for inspecting and editing a patch graph
//! stored in a SQLite database. Every subcommand loads the document through
//! the same [`Persister`] the editor uses, so migrations and fallbacks apply
//! identically.
//!
//! Exit codes: 0 = success, 1 = validation failure, 3 = I/O or storage error.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use patchbay_core::flow::processing_order;
use patchbay_core::{
    Direction, GraphStore, NodeId, NodeRegistry, NodeType, PersistedDocument, Position, StoreConfig,
};
use patchbay_storage::{hash_state, Persister, SaveOutcome, SqliteStorage, StorageError};

/// Patch graph inspection and editing tools.
#[derive(Parser)]
#[command(name = "patchbay", about = "Patch graph inspection and editing tools")]
struct Cli {
    /// Path to the graph database file.
    #[arg(long, env = "PATCHBAY_DB", default_value = "patchbay.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print the nodes and connections of one level as JSON.
    Inspect {
        /// Container node whose interior to show (default: root level).
        #[arg(short, long)]
        level: Option<u32>,
    },
    /// Check structural invariants of the stored graph.
    Validate,
    /// Replace the stored graph with a keyboard, piano and speaker patch.
    Demo,
    /// Write the stored document to a JSON file.
    Export {
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Load a JSON document (migrating legacy shapes) and store it.
    Import {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Undo the last stored edit.
    Undo,
    /// Redo the last undone edit.
    Redo,
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let exit_code = match open(&cli.db) {
        Ok(persister) => run(persister, cli.command),
        Err(e) => {
            eprintln!("Error: failed to open database '{}': {}", cli.db.display(), e);
            3
        }
    };
    process::exit(exit_code);
}

fn open(path: &Path) -> Result<Persister<SqliteStorage>, StorageError> {
    Ok(Persister::new(SqliteStorage::open(path)?))
}

fn load(persister: &mut Persister<SqliteStorage>) -> GraphStore {
    persister.load(NodeRegistry::builtin(), StoreConfig::default())
}

/// Dispatches a subcommand and returns its exit code.
fn run(mut persister: Persister<SqliteStorage>, command: Commands) -> i32 {
    match command {
        Commands::Inspect { level } => run_inspect(&mut persister, level.map(NodeId)),
        Commands::Validate => run_validate(&mut persister),
        Commands::Demo => {
            let store = demo_patch();
            save(&mut persister, &store)
        }
        Commands::Export { out } => run_export(&mut persister, &out),
        Commands::Import { input } => run_import(&mut persister, &input),
        Commands::Undo => run_step(&mut persister, GraphStore::undo, "undo"),
        Commands::Redo => run_step(&mut persister, GraphStore::redo, "redo"),
    }
}

fn run_inspect(persister: &mut Persister<SqliteStorage>, level: Option<NodeId>) -> i32 {
    let store = load(persister);
    if let Some(id) = level {
        if store.node(id).is_none() {
            eprintln!("Error: node {} not found", id);
            return 1;
        }
    }

    let nodes: Vec<Value> = store
        .nodes_at_level(level)
        .into_iter()
        .map(|node| {
            let ports: Vec<Value> = node
                .ports
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id.as_str(),
                        "name": p.name,
                        "direction": p.direction,
                        "type": p.port_type,
                        "bundled": p.is_bundled,
                    })
                })
                .collect();
            json!({
                "id": node.id,
                "type": node.node_type,
                "label": node.label(),
                "children": node.child_ids.len(),
                "ports": ports,
            })
        })
        .collect();
    let connections: Vec<Value> = store
        .connections_at_level(level)
        .into_iter()
        .map(|c| {
            json!({
                "id": c.id,
                "from": format!("{}.{}", c.source_node_id, c.source_port_id.as_str()),
                "to": format!("{}.{}", c.target_node_id, c.target_port_id.as_str()),
                "type": c.conn_type,
                "bundled": c.is_bundled,
            })
        })
        .collect();
    let order = match processing_order(store.state(), level) {
        Ok(order) => json!(order),
        Err(e) => json!(e.to_string()),
    };
    let fingerprint = match hash_state(store.state()) {
        Ok(hash) => hash.to_hex().to_string(),
        Err(e) => {
            eprintln!("Error: {}", e);
            return 3;
        }
    };

    let summary = json!({
        "level": level,
        "totalNodes": store.nodes().len(),
        "totalConnections": store.connections().len(),
        "undoSteps": store.history().index(),
        "fingerprint": fingerprint,
        "nodes": nodes,
        "connections": connections,
        "processingOrder": order,
    });
    print_json(&summary);
    0
}

fn run_validate(persister: &mut Persister<SqliteStorage>) -> i32 {
    let store = load(persister);
    let violations = store.validate();
    if violations.is_empty() {
        println!(
            "ok: {} nodes, {} connections",
            store.nodes().len(),
            store.connections().len()
        );
        0
    } else {
        eprintln!("Validation failed with {} violation(s):", violations.len());
        for v in &violations {
            eprintln!("  - {}", v);
        }
        1
    }
}

fn run_export(persister: &mut Persister<SqliteStorage>, out: &Path) -> i32 {
    let document = persister.load_document();
    let json = match serde_json::to_string_pretty(&document) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Error: failed to serialize document: {}", e);
            return 3;
        }
    };
    if let Err(e) = std::fs::write(out, json) {
        eprintln!("I/O error: {}", e);
        return 3;
    }
    info!(path = %out.display(), nodes = document.state.nodes.len(), "exported graph");
    0
}

fn run_import(persister: &mut Persister<SqliteStorage>, input: &Path) -> i32 {
    let text = match std::fs::read_to_string(input) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("I/O error: {}", e);
            return 3;
        }
    };
    let store = PersistedDocument::from_json(&text).into_store(NodeRegistry::builtin(), StoreConfig::default());
    let violations = store.validate();
    if !violations.is_empty() {
        eprintln!("Refusing to import: {} violation(s):", violations.len());
        for v in &violations {
            eprintln!("  - {}", v);
        }
        return 1;
    }
    save(persister, &store)
}

fn run_step(persister: &mut Persister<SqliteStorage>, step: fn(&mut GraphStore) -> bool, name: &str) -> i32 {
    let mut store = load(persister);
    if !step(&mut store) {
        println!("nothing to {}", name);
        return 0;
    }
    save(persister, &store)
}

fn save(persister: &mut Persister<SqliteStorage>, store: &GraphStore) -> i32 {
    match persister.save(store) {
        Ok(outcome) => {
            let note = match outcome {
                SaveOutcome::Written => "saved",
                SaveOutcome::Unchanged => "unchanged",
                SaveOutcome::WrittenWithoutHistory => "saved without history",
            };
            println!(
                "{}: {} nodes, {} connections",
                note,
                store.nodes().len(),
                store.connections().len()
            );
            0
        }
        Err(e) => {
            eprintln!("Error: failed to save graph: {}", e);
            3
        }
    }
}

fn print_json(value: &Value) {
    let json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize result: {}\"}}", e));
    println!("{}", json);
}

/// A keyboard bundled into a piano, whose output drives a speaker.
fn demo_patch() -> GraphStore {
    let mut store = GraphStore::new();
    let keyboard = store.add_node(NodeType::Keyboard, Position::new(0.0, 0.0), None, None);
    let piano = store.add_node(NodeType::Piano, Position::new(300.0, 0.0), None, None);
    let speaker = store.add_node(NodeType::Speaker, Position::new(600.0, 0.0), None, None);
    if let (Some(keyboard), Some(piano), Some(speaker)) = (keyboard, piano, speaker) {
        connect_first(&mut store, keyboard, piano);
        connect_first(&mut store, piano, speaker);
    }
    store
}

/// Wires the first output of `source` to the first unbundled input of `target`.
fn connect_first(store: &mut GraphStore, source: NodeId, target: NodeId) {
    let output = store
        .node(source)
        .and_then(|n| n.ports.iter().find(|p| p.direction == Direction::Output))
        .map(|p| p.id.clone());
    let input = store
        .node(target)
        .and_then(|n| {
            n.ports
                .iter()
                .find(|p| p.direction == Direction::Input && !p.is_bundled)
        })
        .map(|p| p.id.clone());
    if let (Some(output), Some(input)) = (output, input) {
        store.add_connection(source, &output, target, &input);
    }
}
