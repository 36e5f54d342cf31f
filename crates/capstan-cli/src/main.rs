//! `capstan` – interactive shell over the capability engine.
//!
//! 1. Checks for `~/.capstan/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Builds the [`Engine`] and registers the demo capabilities.
//! 3. Drops the user into an **interactive REPL** (`/list`, `/exec`,
//!    `/stream`, `/audit`, `/help`, …).
//! 4. Intercepts **Ctrl-C**: a running call is cancelled; at the prompt the
//!    shell exits.

mod builtins;
mod config;
mod repl;

use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use capstan_runtime::{CallerIdentity, Engine, init_tracing};
use capstan_types::PermissionLevel;

fn main() -> ExitCode {
    // Held until exit so pending spans are flushed.
    let _telemetry = init_tracing("capstan-cli");

    print_banner();

    // ── Shared shutdown flag and in-flight call ───────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let in_flight = repl::InFlight::default();

    let shutdown_clone = shutdown.clone();
    let in_flight_clone = in_flight.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        if in_flight_clone.cancel() {
            println!("{}", "⚠  Ctrl-C received – cancelling the running call …".yellow().bold());
        } else {
            println!("{}", "⚠  Ctrl-C received – press Enter to leave Capstan.".yellow().bold());
            shutdown_clone.store(true, Ordering::SeqCst);
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; running calls cannot be cancelled");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Engine ────────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let engine = Arc::new(Engine::new(cfg.engine.clone()));
    match builtins::register_all(engine.registry()) {
        Ok(n) => info!(count = n, "builtin capabilities registered"),
        Err(e) => {
            eprintln!("{}: {}", "Failed to register capabilities".red(), e);
            return ExitCode::FAILURE;
        }
    }

    println!(
        "  Operating as {} ({}), validation level {}.",
        cfg.caller_id.bold(),
        cfg.permission.to_string().yellow(),
        cfg.engine.validation_level.to_string().yellow()
    );
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    let session = repl::Session::new(
        engine,
        CallerIdentity::new(cfg.caller_id, cfg.permission),
        runtime.handle().clone(),
        in_flight,
    );
    repl::run(session, shutdown);
    ExitCode::SUCCESS
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       Capstan First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up Capstan.\n");

    let mut cfg = config::Config::default();

    let caller = prompt_line(&format!("  Caller id [{}]: ", cfg.caller_id), &cfg.caller_id);
    cfg.caller_id = caller;

    println!("  Which tier should the shell start at?");
    println!("    1) guest  (read-only)");
    println!("    2) user   (read, write, execute; default)");
    println!("    3) admin  (everything; executions are audited)");
    cfg.permission = match prompt_line("  Enter choice [2]: ", "2").as_str() {
        "1" => PermissionLevel::Guest,
        "3" => PermissionLevel::Admin,
        _ => PermissionLevel::User,
    };

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ______                 __            "#.bold().cyan());
    println!("{}", r#"  / ____/___ _____  _____/ /_____ _____ "#.bold().cyan());
    println!("{}", r#" / /   / __ `/ __ \/ ___/ __/ __ `/ __ \"#.bold().cyan());
    println!("{}", r#"/ /___/ /_/ / /_/ (__  ) /_/ /_/ / / / /"#.bold().cyan());
    println!("{}", r#"\____/\__,_/ .___/____/\__/\__,_/_/ /_/ "#.bold().cyan());
    println!("{}", r#"          /_/                           "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Capstan".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Capability dispatch engine");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
