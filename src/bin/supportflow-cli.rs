//! supportflow CLI - Local inspection and maintenance tool
//!
//! Provides command-line access to:
//! - Session inspection and stale-session expiry
//! - Open-ticket lookup
//! - Feedback statistics
//!
//! Usage:
//!   supportflow-cli sessions show <user> <session>
//!   supportflow-cli sessions expire-stale
//!   supportflow-cli tickets show <user> <session>
//!   supportflow-cli feedback stats

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use supportflow::config::SessionConfig;
use supportflow::db::Database;
use supportflow::feedback;
use supportflow::session::{MemoryStore, SessionKey};

#[derive(Debug)]
enum Command {
    Sessions(SessionsCommand),
    Tickets(TicketsCommand),
    Feedback(FeedbackCommand),
    Help,
    Version,
}

#[derive(Debug)]
enum SessionsCommand {
    Show { user: String, session: String },
    ExpireStale,
}

#[derive(Debug)]
enum TicketsCommand {
    Show { user: String, session: String },
}

#[derive(Debug)]
enum FeedbackCommand {
    Stats,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    match parse_args(&args) {
        Ok(cmd) => match run_command(cmd) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),

        "sessions" => {
            if args.len() < 3 {
                return Err("Missing sessions subcommand. Use: show, expire-stale".to_string());
            }
            match args[2].as_str() {
                "show" => {
                    let user = args.get(3).ok_or("Missing user id")?.clone();
                    let session = args.get(4).ok_or("Missing session id")?.clone();
                    Ok(Command::Sessions(SessionsCommand::Show { user, session }))
                }
                "expire-stale" => Ok(Command::Sessions(SessionsCommand::ExpireStale)),
                _ => Err(format!("Unknown sessions subcommand: {}", args[2])),
            }
        }

        "tickets" => {
            if args.len() < 3 {
                return Err("Missing tickets subcommand. Use: show".to_string());
            }
            match args[2].as_str() {
                "show" => {
                    let user = args.get(3).ok_or("Missing user id")?.clone();
                    let session = args.get(4).ok_or("Missing session id")?.clone();
                    Ok(Command::Tickets(TicketsCommand::Show { user, session }))
                }
                _ => Err(format!("Unknown tickets subcommand: {}", args[2])),
            }
        }

        "feedback" => {
            if args.len() < 3 {
                return Err("Missing feedback subcommand. Use: stats".to_string());
            }
            match args[2].as_str() {
                "stats" => Ok(Command::Feedback(FeedbackCommand::Stats)),
                _ => Err(format!("Unknown feedback subcommand: {}", args[2])),
            }
        }

        _ => Err(format!("Unknown command: {}", args[1])),
    }
}

fn run_command(cmd: Command) -> Result<(), String> {
    match cmd {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Version => {
            println!("supportflow-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Sessions(sessions_cmd) => run_sessions_command(sessions_cmd),
        Command::Tickets(tickets_cmd) => run_tickets_command(tickets_cmd),
        Command::Feedback(feedback_cmd) => run_feedback_command(feedback_cmd),
    }
}

fn print_help() {
    println!(
        r#"supportflow CLI - Local inspection and maintenance tool

USAGE:
    supportflow-cli <COMMAND> [OPTIONS]

COMMANDS:
    sessions show <USER> <SESSION>   Show a session's state
    sessions expire-stale            Remove sessions past their TTL

    tickets show <USER> <SESSION>    Show the open ticket for a session

    feedback stats                   Show response/feedback statistics

    help                             Show this help message
    version                          Show version information

ENVIRONMENT:
    SUPPORTFLOW_DB    Path to the database file (default: ./supportflow.db)

EXAMPLES:
    supportflow-cli sessions show alice session-42
    supportflow-cli sessions expire-stale
    supportflow-cli feedback stats
"#
    );
}

fn get_db_path() -> PathBuf {
    env::var("SUPPORTFLOW_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("supportflow.db"))
}

fn open_database() -> Result<Database, String> {
    let db_path = get_db_path();
    if !db_path.exists() {
        return Err(format!(
            "Database not found at {:?}. Run the orchestrator first to initialize.",
            db_path
        ));
    }
    let db = Database::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))?;
    db.initialize()
        .map_err(|e| format!("Failed to migrate database: {}", e))?;
    Ok(db)
}

fn run_sessions_command(cmd: SessionsCommand) -> Result<(), String> {
    let db = open_database()?;
    let store = MemoryStore::new(db, SessionConfig::default());

    match cmd {
        SessionsCommand::Show { user, session } => {
            let key = SessionKey::new(user, session);
            let s = store
                .get(&key)
                .map_err(|e| format!("Failed to load session: {}", e))?;

            println!("Session: {}", s.key);
            println!("Version: {}", s.version);
            println!("Created: {}", s.created_at.to_rfc3339());
            println!("Last activity: {}", s.last_activity.to_rfc3339());
            println!("TTL: {}s", s.ttl_secs);
            println!("Summarized: {}", s.summarized);
            if let Some(ticket) = &s.active_ticket {
                println!("Active ticket: {}", ticket);
            }
            if let Some(in_flight) = &s.in_flight {
                println!("In-flight turn: {} ({:?})", in_flight.turn.id, in_flight.state);
            }

            if s.turns.is_empty() {
                println!("\nNo turns recorded.");
            } else {
                println!("\nTurns:");
                for turn in &s.turns {
                    let intent = turn
                        .intent
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let outcome = turn
                        .outcome
                        .map(|o| format!("{:?}", o))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  [{}] {:<9} {:<16} {}",
                        turn.timestamp.to_rfc3339(),
                        intent,
                        outcome,
                        turn.brief
                    );
                }
            }
            Ok(())
        }
        SessionsCommand::ExpireStale => {
            let removed = store
                .expire_stale()
                .map_err(|e| format!("Expiry failed: {}", e))?;
            if removed.is_empty() {
                println!("No stale sessions.");
            } else {
                for key in &removed {
                    println!("Removed {}", key);
                }
                println!("{} session(s) removed.", removed.len());
            }
            Ok(())
        }
    }
}

fn run_tickets_command(cmd: TicketsCommand) -> Result<(), String> {
    let db = open_database()?;

    match cmd {
        TicketsCommand::Show { user, session } => {
            // Read-only lookup; no backend needed
            let row: Option<(String, String, Option<String>, String, u32)> = db
                .with_conn(|c| {
                    let result = c.query_row(
                        "SELECT idempotency_key, status, external_id, summary, attempts
                         FROM tickets
                         WHERE user_id = ?1 AND session_id = ?2
                           AND status IN ('pending', 'created')
                         ORDER BY created_at DESC LIMIT 1",
                        rusqlite::params![user, session],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                    );
                    match result {
                        Ok(row) => Ok(Some(row)),
                        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                        Err(e) => Err(e),
                    }
                })
                .map_err(|e| format!("Query failed: {}", e))?;

            match row {
                Some((key, status, external_id, summary, attempts)) => {
                    println!("Ticket: {}", key);
                    println!("Status: {}", status);
                    println!("External id: {}", external_id.as_deref().unwrap_or("-"));
                    println!("Summary: {}", summary);
                    println!("Attempts: {}", attempts);
                }
                None => println!("No open ticket for {}/{}.", user, session),
            }
            Ok(())
        }
    }
}

fn run_feedback_command(cmd: FeedbackCommand) -> Result<(), String> {
    let db = open_database()?;

    match cmd {
        FeedbackCommand::Stats => {
            let stats = feedback::stats(&db).map_err(|e| format!("Stats failed: {}", e))?;

            println!("Feedback Statistics");
            println!("{}", "-".repeat(30));
            println!("Responses: {}", stats.total_responses);
            println!("Feedback:  {}", stats.total_feedback);
            println!("Avg rating: {:.2}", stats.average_rating);

            if !stats.by_intent.is_empty() {
                println!("\n{:<12} {:<10} {:<10} {:<10}", "INTENT", "RESPONSES", "FEEDBACK", "AVG");
                for stat in &stats.by_intent {
                    println!(
                        "{:<12} {:<10} {:<10} {:<10.2}",
                        stat.intent, stat.response_count, stat.feedback_count, stat.average_rating
                    );
                }
            }
            Ok(())
        }
    }
}
