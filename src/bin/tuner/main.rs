//! Relevance Tuner - CLI
//!
//! Loads judgments, generates and runs experiments, and drives the
//! genetic search against a search backend. Everything is persisted in
//! one SQLite database.

mod commands;
mod config;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use log::error;

use relevance_tuner::db::SqliteStore;

use config::{Args, Command, Config};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config::load(&args.config);
    let database = args.database.clone().unwrap_or(config.paths.database.clone());

    print_banner(&database);

    let store = match SqliteStore::open(&database) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open database {}: {}", database, e);
            std::process::exit(1);
        }
    };

    // Set up Ctrl+C handler
    let interrupt_flag = Arc::new(AtomicBool::new(false));
    setup_interrupt_handler(interrupt_flag.clone());

    let result = match &args.command {
        Command::LoadJudgments { file, clear } => {
            let path = file.clone().unwrap_or(config.paths.judgments.clone());
            commands::load_judgments(&store, &path, *clear)
        }
        Command::Generate {
            factory,
            permute,
            max,
            prefix,
        } => commands::generate(&store, factory, *permute, *max, prefix),
        Command::Run { factory, names } => {
            commands::run(&store, &config, factory.as_deref(), names, &interrupt_flag)
        }
        Command::Ga { factory, seeds } => {
            commands::ga(&store, &config, factory, seeds.as_deref(), interrupt_flag.clone())
        }
        Command::Dump {
            scorer,
            prefix,
            limit,
        } => commands::dump(&store, scorer, prefix.as_deref(), *limit),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn print_banner(database: &str) {
    println!("═══════════════════════════════════════════════════════════════");
    println!("  RELEVANCE TUNER");
    println!("  Database: {}", database);
    println!("═══════════════════════════════════════════════════════════════");
    println!();
}

fn setup_interrupt_handler(interrupt_flag: Arc<AtomicBool>) {
    let interrupt_count = Arc::new(AtomicUsize::new(0));
    let ic = interrupt_count.clone();
    let if_clone = interrupt_flag.clone();

    let installed = ctrlc::set_handler(move || {
        let count = ic.fetch_add(1, Ordering::SeqCst);
        if_clone.store(true, Ordering::SeqCst);
        if count == 0 {
            eprintln!("\nInterrupt received, will stop after the current generation...");
        } else {
            eprintln!("\nForce quit.");
            std::process::exit(1);
        }
    });
    if let Err(e) = installed {
        log::warn!("Could not install Ctrl-C handler: {}", e);
    }
}
