//! REPL – Read-Eval-Print Loop for the Capstan interactive shell.
//!
//! Supported slash-commands:
//!   /help                  – show this list
//!   /list [category]       – capabilities the current tier may run
//!   /search <text>         – case-insensitive search
//!   /info <name>           – full descriptor
//!   /exec <name> [json]    – execute with a JSON object of parameters
//!   /dry <name> [json]     – simulate without side effects
//!   /stream <name> [json]  – execute and print every envelope
//!   /validate <name> [json]– validate without executing
//!   /stats | /reset-stats  – executor and registry counters
//!   /audit [n]             – most recent audit records
//!   /level [basic|standard|strict]
//!   /as <guest|user|admin> – switch the session's tier
//!   /schema                – JSON Schema of an execution request
//!   /quit | /exit          – leave the shell

use colored::Colorize;
use futures_util::StreamExt;
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tracing::debug;

use capstan_kernel::CancelFlag;
use capstan_runtime::{
    CallerIdentity, Engine, ExecutionRequest, ExecutionResponse, ListQuery, request_schema,
};
use capstan_types::{Params, PermissionLevel, StreamPhase, ValidationLevel};

const DEFAULT_AUDIT_ROWS: usize = 10;

/// One parsed slash-command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    List(Option<String>),
    Search(String),
    Info(String),
    Exec { name: String, params: Params, dry_run: bool },
    Stream { name: String, params: Params },
    Validate { name: String, params: Params },
    Stats,
    ResetStats,
    Audit(usize),
    Level(Option<ValidationLevel>),
    As(PermissionLevel),
    Schema,
    Quit,
}

/// Parse one input line.  The error is a message for the operator.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (line, ""),
    };

    let named = |usage: &str| -> Result<(String, Params), String> {
        let (name, json) = match rest.split_once(char::is_whitespace) {
            Some((n, j)) => (n, j.trim()),
            None => (rest, ""),
        };
        if name.is_empty() {
            return Err(format!("usage: {usage}"));
        }
        Ok((name.to_string(), parse_params(json)?))
    };

    match head {
        "/help" => Ok(Command::Help),
        "/list" => Ok(Command::List((!rest.is_empty()).then(|| rest.to_string()))),
        "/search" if !rest.is_empty() => Ok(Command::Search(rest.to_string())),
        "/search" => Err("usage: /search <text>".into()),
        "/info" if !rest.is_empty() => Ok(Command::Info(rest.to_string())),
        "/info" => Err("usage: /info <name>".into()),
        "/exec" | "/dry" => {
            let (name, params) = named(&format!("{head} <name> [json]"))?;
            Ok(Command::Exec { name, params, dry_run: head == "/dry" })
        }
        "/stream" => {
            let (name, params) = named("/stream <name> [json]")?;
            Ok(Command::Stream { name, params })
        }
        "/validate" => {
            let (name, params) = named("/validate <name> [json]")?;
            Ok(Command::Validate { name, params })
        }
        "/stats" => Ok(Command::Stats),
        "/reset-stats" => Ok(Command::ResetStats),
        "/audit" if rest.is_empty() => Ok(Command::Audit(DEFAULT_AUDIT_ROWS)),
        "/audit" => rest
            .parse()
            .map(Command::Audit)
            .map_err(|_| format!("'{rest}' is not a row count")),
        "/level" if rest.is_empty() => Ok(Command::Level(None)),
        "/level" => rest.parse().map(|l| Command::Level(Some(l))),
        "/as" => rest.parse().map(Command::As),
        "/schema" => Ok(Command::Schema),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_params(raw: &str) -> Result<Params, String> {
    if raw.is_empty() {
        return Ok(Params::new());
    }
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("parameters must be a JSON object".into()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-flight call tracking
// ─────────────────────────────────────────────────────────────────────────────

/// Cancel handle of the call currently running, if any.  Shared with the
/// Ctrl-C handler.
#[derive(Clone, Default)]
pub struct InFlight(Arc<Mutex<Option<CancelFlag>>>);

impl InFlight {
    fn begin(&self) -> CancelFlag {
        let flag = CancelFlag::new();
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(flag.clone());
        flag
    }

    fn end(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Cancel the running call.  Returns `false` when nothing was running.
    pub fn cancel(&self) -> bool {
        match self.0.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Shell state: the engine, who is calling, and the runtime to block on.
pub struct Session {
    engine: Arc<Engine>,
    caller: CallerIdentity,
    handle: Handle,
    in_flight: InFlight,
}

impl Session {
    pub fn new(engine: Arc<Engine>, caller: CallerIdentity, handle: Handle, in_flight: InFlight) -> Self {
        Self { engine, caller, handle, in_flight }
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(mut session: Session, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let prompt = format!("capstan[{}]>", session.caller.permission);
        print!("{} ", prompt.bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        let command = match parse(&line) {
            Ok(c) => c,
            Err(e) => {
                println!("{} {}. Type {} for available commands.", "Error:".red(), e, "/help".bold());
                continue;
            }
        };
        debug!(?command, "repl command");

        match command {
            Command::Help => cmd_help(),
            Command::List(category) => cmd_list(&session, category),
            Command::Search(q) => cmd_search(&session, &q),
            Command::Info(name) => cmd_info(&session, &name),
            Command::Exec { name, params, dry_run } => cmd_exec(&session, name, params, dry_run),
            Command::Stream { name, params } => cmd_stream(&session, name, params),
            Command::Validate { name, params } => cmd_validate(&session, &name, &params),
            Command::Stats => cmd_stats(&session),
            Command::ResetStats => {
                session.engine.registry().executor().reset_stats();
                println!("{}", "✓ Execution counters cleared.".green());
            }
            Command::Audit(n) => cmd_audit(&session, n),
            Command::Level(None) => println!(
                "  Validation level: {}",
                session.engine.registry().validation_level().to_string().yellow()
            ),
            Command::Level(Some(level)) => {
                session.engine.set_validation_level(level);
                println!("{} {}", "✓ Validation level set to".green(), level.to_string().bold());
            }
            Command::As(tier) => {
                session.caller.permission = tier;
                println!("{} {}", "✓ Now operating as".green(), tier.to_string().bold());
            }
            Command::Schema => print_json(&request_schema()),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Capstan Commands".bold().underline());
    let rows = [
        ("/list [category]", "capabilities your tier may run"),
        ("/search <text>", "search names, descriptions, tags"),
        ("/info <name>", "show a descriptor"),
        ("/exec <name> [json]", "execute a capability"),
        ("/dry <name> [json]", "simulate without side effects"),
        ("/stream <name> [json]", "execute and print progress"),
        ("/validate <name> [json]", "check parameters only"),
        ("/stats  /reset-stats", "execution counters"),
        ("/audit [n]", "recent admin executions"),
        ("/level [level]", "show or set the validation level"),
        ("/as <tier>", "switch to guest, user or admin"),
        ("/schema", "JSON Schema of a request"),
        ("/quit  /exit", "exit the CLI"),
    ];
    for (cmd, what) in rows {
        println!("  {:<26} – {}", cmd.bold().cyan(), what);
    }
    println!("  Ctrl-C cancels a running call.");
    println!();
}

fn cmd_list(session: &Session, category: Option<String>) {
    let query = ListQuery { category, ..ListQuery::default() };
    let found = session.engine.list(&session.caller, &query);
    if found.is_empty() {
        println!("  {}", "no capabilities visible at this tier".dimmed());
        return;
    }
    for d in found {
        let streaming = if d.streaming { " (streaming)" } else { "" };
        println!(
            "  {:<14} {:<12} {:<8} {}{}",
            d.name.bold(),
            d.category.dimmed(),
            d.required_permission.to_string().yellow(),
            d.description,
            streaming.dimmed()
        );
    }
}

fn cmd_search(session: &Session, query: &str) {
    let found = session.engine.search(&session.caller, query);
    if found.is_empty() {
        println!("  {} '{}'", "no match for".dimmed(), query.yellow());
    }
    for d in found {
        println!("  {:<14} {}", d.name.bold(), d.description);
    }
}

fn cmd_info(session: &Session, name: &str) {
    match session.engine.registry().info(name) {
        Some(d) => print_json(&d),
        None => println!("{} '{}'", "Unknown capability:".red(), name.yellow()),
    }
}

fn cmd_exec(session: &Session, name: String, params: Params, dry_run: bool) {
    let mut request = ExecutionRequest::new(name, params);
    request.dry_run = dry_run;
    let ctx = match session.engine.context_for(&session.caller, &request) {
        Ok(ctx) => ctx.with_cancel_flag(session.in_flight.begin()),
        Err(response) => return print_response(&response),
    };
    let response = session
        .handle
        .block_on(session.engine.handle_with(&ctx, &request));
    session.in_flight.end();
    print_response(&response);
}

fn cmd_stream(session: &Session, name: String, params: Params) {
    let request = ExecutionRequest::new(name, params);
    let cancel = session.in_flight.begin();
    session.handle.block_on(async {
        match session
            .engine
            .handle_streaming(&session.caller, request, Some(cancel))
            .await
        {
            Ok(mut stream) => {
                while let Some(envelope) = stream.next().await {
                    let phase = format!("{:?}", envelope.phase).to_lowercase();
                    let phase = match envelope.phase {
                        StreamPhase::Completed => phase.green(),
                        StreamPhase::Error => phase.red(),
                        _ => phase.cyan(),
                    };
                    println!(
                        "  #{:<3} {:<12} {:>5.1}%  {}",
                        envelope.sequence,
                        phase,
                        envelope.completion * 100.0,
                        envelope.status
                    );
                    if envelope.is_final {
                        print_response(&ExecutionResponse::from(envelope.result));
                    }
                }
            }
            Err(response) => print_response(&response),
        }
    });
    session.in_flight.end();
}

fn cmd_validate(session: &Session, name: &str, params: &Params) {
    match session.engine.registry().validate_parameters(name, params, None) {
        Ok(report) => {
            let verdict = if report.outcome.valid { "valid".green() } else { "invalid".red() };
            println!("  {} at level {}", verdict.bold(), report.level.to_string().yellow());
            print_json(&report.outcome);
        }
        Err(e) => println!("{} {}", "Error:".red(), e.public_message()),
    }
}

fn cmd_stats(session: &Session) {
    let registry = session.engine.registry();
    let exec = registry.executor().stats();
    println!("{}", "Execution".bold().underline());
    println!(
        "  total {}  ok {}  failed {}  timed out {}  resource-limited {}",
        exec.total, exec.successful, exec.failed, exec.timed_out, exec.resource_exhausted
    );
    match exec.success_rate() {
        Some(rate) => println!(
            "  success rate {:.1}%  average {:.3}s",
            rate * 100.0,
            exec.average_elapsed_seconds
        ),
        None => println!("  {}", "no executions yet".dimmed()),
    }
    println!("{}", "Registry".bold().underline());
    print_json(&registry.stats());
}

fn cmd_audit(session: &Session, n: usize) {
    let records = session.engine.registry().audit_log().recent(n);
    if records.is_empty() {
        println!("  {}", "audit log is empty".dimmed());
    }
    for r in records {
        println!(
            "  {} {:<10} {:<12} {:?} {}",
            r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            r.caller_id.bold(),
            r.capability.yellow(),
            r.event,
            serde_json::Value::Object(r.parameters)
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_response(response: &ExecutionResponse) {
    let head = if response.success {
        format!("✓ {}", response.status.http_code()).green().bold()
    } else {
        format!("✗ {}", response.status.http_code()).red().bold()
    };
    println!("{} {}", head, response.error.as_deref().unwrap_or(""));
    print_json(response);
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => println!("{}: {}", "Serialization error".red(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse("/help"), Ok(Command::Help));
        assert_eq!(parse("  /stats  "), Ok(Command::Stats));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
        assert_eq!(parse("/list"), Ok(Command::List(None)));
        assert_eq!(parse("/list utility"), Ok(Command::List(Some("utility".into()))));
    }

    #[test]
    fn exec_takes_optional_json_object() {
        assert_eq!(
            parse("/exec echo"),
            Ok(Command::Exec { name: "echo".into(), params: Params::new(), dry_run: false })
        );
        let Ok(Command::Exec { name, params, dry_run }) = parse(r#"/dry echo {"msg": "hi there"}"#) else {
            panic!("expected exec");
        };
        assert_eq!(name, "echo");
        assert!(dry_run);
        assert_eq!(params.get("msg"), Some(&json!("hi there")));
    }

    #[test]
    fn non_object_parameters_are_rejected() {
        assert!(parse("/exec echo [1,2]").unwrap_err().contains("JSON object"));
        assert!(parse("/exec echo {broken").unwrap_err().contains("invalid JSON"));
        assert!(parse("/exec").unwrap_err().starts_with("usage"));
    }

    #[test]
    fn level_and_tier_parse() {
        assert_eq!(parse("/level"), Ok(Command::Level(None)));
        assert_eq!(parse("/level strict"), Ok(Command::Level(Some(ValidationLevel::Strict))));
        assert!(parse("/level paranoid").is_err());
        assert_eq!(parse("/as admin"), Ok(Command::As(PermissionLevel::Admin)));
        assert!(parse("/as root").is_err());
    }

    #[test]
    fn audit_row_count() {
        assert_eq!(parse("/audit"), Ok(Command::Audit(DEFAULT_AUDIT_ROWS)));
        assert_eq!(parse("/audit 3"), Ok(Command::Audit(3)));
        assert!(parse("/audit many").is_err());
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(parse("/start").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn in_flight_cancel_reaches_the_running_call() {
        let in_flight = InFlight::default();
        assert!(!in_flight.cancel());
        let flag = in_flight.begin();
        assert!(in_flight.cancel());
        assert!(flag.is_cancelled());
        assert!(!in_flight.cancel());
    }

    #[test]
    fn finished_call_is_not_cancelled() {
        let in_flight = InFlight::default();
        let flag = in_flight.begin();
        in_flight.end();
        assert!(!in_flight.cancel());
        assert!(!flag.is_cancelled());
    }
}
