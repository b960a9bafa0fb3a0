//! Command surface for the UCCS decision matrix.
//!
//! Hosts can embed the CLI through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteDecisionStore`].

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use uccs_matrix_core::{
    format_rfc3339, parse_look_back, Decision, DecisionForm, DecisionKey, DecisionLevel,
    LiveDecisionView, Offense, SessionConfig,
};
use uccs_matrix_store_sqlite::{IntegrityCheck, IntegrityIssueSeverity, SqliteDecisionStore};

#[derive(Debug, Parser)]
#[command(name = "uccs")]
#[command(about = "UCCS decision matrix CLI")]
pub struct Cli {
    #[arg(long, default_value = "./uccs_matrix.sqlite3")]
    db: PathBuf,

    #[command(flatten)]
    session: SessionArgs,

    /// Tracing filter directive, e.g. `info` or `uccs_matrix_core=debug`.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Operator identity shared by every command.
#[derive(Debug, Clone, Default, Args)]
pub struct SessionArgs {
    #[arg(long, env = "UCCS_MATRIX_ID")]
    matrix_id: Option<String>,

    #[arg(long, env = "UCCS_COLLABORATOR_EMAIL")]
    collaborator_email: Option<String>,
}

impl SessionArgs {
    #[must_use]
    pub fn new(matrix_id: Option<String>, collaborator_email: Option<String>) -> Self {
        Self {
            matrix_id,
            collaborator_email,
        }
    }

    /// # Errors
    /// Returns an error when no non-blank matrix id was given.
    pub fn matrix_id(&self) -> Result<&str> {
        match self.matrix_id.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(anyhow!("--matrix-id (or UCCS_MATRIX_ID) is required")),
        }
    }

    /// # Errors
    /// Returns an error when the matrix id or collaborator email is missing or
    /// rejected by [`SessionConfig::new`].
    pub fn config(&self) -> Result<SessionConfig> {
        let matrix_id = self.matrix_id()?;
        let Some(collaborator_email) = self.collaborator_email.as_deref() else {
            return Err(anyhow!(
                "--collaborator-email (or UCCS_COLLABORATOR_EMAIL) is required"
            ));
        };

        Ok(SessionConfig::new(matrix_id, collaborator_email)?)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Offenses {
        #[command(subcommand)]
        command: Box<OffensesCommand>,
    },
    Decision {
        #[command(subcommand)]
        command: Box<DecisionCommand>,
    },
    Decisions {
        #[command(subcommand)]
        command: Box<DecisionsCommand>,
    },
    /// Reads `<uccs_code|-> <level> [look_back]` lines from stdin and
    /// submits each one through the decision form.
    Session,
}

#[derive(Debug, Subcommand)]
pub enum OffensesCommand {
    List(JsonArgs),
    Import(ImportArgs),
}

#[derive(Debug, Subcommand)]
pub enum DecisionCommand {
    Submit(SubmitArgs),
    Show(ShowArgs),
}

#[derive(Debug, Subcommand)]
pub enum DecisionsCommand {
    List(JsonArgs),
    Check(JsonArgs),
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// JSON array of `{"uccs_code": .., "uccs_desc": ..}` entries.
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(long)]
    uccs_code: Option<i64>,
    #[arg(long)]
    level: LevelArg,
    /// Whole years; blank means not specified.
    #[arg(long)]
    look_back: Option<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    uccs_code: i64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LevelArg {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ImportReport {
    contract_version: String,
    imported: usize,
    total_offenses: usize,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, &cli.session, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, session: &SessionArgs, command: Command) -> Result<()> {
    let mut store = SqliteDecisionStore::open(db_path)?;
    store.migrate()?;
    run_command(command, session, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when operator identity is missing, a submission fails, or
/// an integrity check is unhealthy.
pub fn run_command(
    command: Command,
    session: &SessionArgs,
    store: &mut SqliteDecisionStore,
) -> Result<()> {
    match command {
        Command::Offenses { command } => run_offenses(*command, store),
        Command::Decision { command } => run_decision(*command, session, store),
        Command::Decisions { command } => run_decisions(*command, session, store),
        Command::Session => {
            let config = session.config()?;
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            run_session(stdin.lock(), &mut stdout.lock(), config, store)
        }
    }
}

fn run_offenses(command: OffensesCommand, store: &mut SqliteDecisionStore) -> Result<()> {
    match command {
        OffensesCommand::List(args) => {
            let offenses = store.list_offenses()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&offenses)?);
            } else {
                print_offense_table(&offenses);
            }
            Ok(())
        }
        OffensesCommand::Import(args) => {
            let offenses = read_catalog(&args.file)?;
            let imported = store.import_offenses(&offenses)?;
            let report = ImportReport {
                contract_version: "offense_import.v1".to_string(),
                imported,
                total_offenses: store.list_offenses()?.len(),
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "imported={} total_offenses={}",
                    report.imported, report.total_offenses
                );
            }
            Ok(())
        }
    }
}

fn run_decision(
    command: DecisionCommand,
    session: &SessionArgs,
    store: &mut SqliteDecisionStore,
) -> Result<()> {
    match command {
        DecisionCommand::Submit(args) => {
            let mut form = DecisionForm::new(session.config()?);
            form.select_offense(args.uccs_code);
            form.set_decision_level(map_level(args.level));
            if let Some(raw) = args.look_back.as_deref() {
                form.set_look_back_text(raw)?;
            }

            let result = form.submit(store);
            if let Some(status) = form.status_message() {
                println!("{status}");
            }
            result?;
            Ok(())
        }
        DecisionCommand::Show(args) => {
            let config = session.config()?;
            let key = DecisionKey {
                matrix_id: config.matrix_id().to_string(),
                collaborator_email: config.collaborator_email().to_string(),
                uccs_code: args.uccs_code,
            };

            let Some(decision) = store.find_decision(&key)? else {
                return Err(anyhow!("decision not found for {key}"));
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                let offenses = offenses_or_empty(store);
                let stdout = std::io::stdout();
                write_decision_table(&mut stdout.lock(), &[decision], &offenses)?;
            }
            Ok(())
        }
    }
}

fn run_decisions(
    command: DecisionsCommand,
    session: &SessionArgs,
    store: &SqliteDecisionStore,
) -> Result<()> {
    match command {
        DecisionsCommand::List(args) => {
            let mut view = LiveDecisionView::activate(store, session.matrix_id()?)?;
            view.pump();

            if args.json {
                println!("{}", serde_json::to_string_pretty(view.records())?);
            } else {
                let offenses = offenses_or_empty(store);
                let stdout = std::io::stdout();
                write_decision_table(&mut stdout.lock(), view.records(), &offenses)?;
            }
            Ok(())
        }
        DecisionsCommand::Check(args) => {
            let matrix_id = session
                .matrix_id
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty());
            let check = store.integrity_check(matrix_id)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_integrity_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "decision integrity check failed: {}",
                    check
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
    }
}

/// One parsed `session` input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    pub uccs_code: Option<i64>,
    pub decision_level: DecisionLevel,
    pub look_back_period: Option<u32>,
}

/// Parses `<uccs_code|-> <level> [look_back]`. `-` submits with no offense
/// selected.
///
/// # Errors
/// Returns an error when a field is malformed or the line has extra fields.
pub fn parse_session_line(line: &str) -> Result<SessionEntry> {
    let mut fields = line.split_whitespace();
    let (Some(code_raw), Some(level_raw)) = (fields.next(), fields.next()) else {
        return Err(anyhow!(
            "expected `<uccs_code|-> <level> [look_back]`, got `{line}`"
        ));
    };
    let look_back_raw = fields.next();
    if fields.next().is_some() {
        return Err(anyhow!("too many fields in `{line}`"));
    }

    let uccs_code = if code_raw == "-" {
        None
    } else {
        Some(
            code_raw
                .parse::<i64>()
                .with_context(|| format!("invalid uccs_code: {code_raw}"))?,
        )
    };

    let level_lower = level_raw.to_ascii_lowercase();
    let decision_level = DecisionLevel::parse(&level_lower)
        .ok_or_else(|| anyhow!("invalid decision level: {level_raw}"))?;

    let look_back_period = match look_back_raw {
        Some(raw) => parse_look_back(raw)?,
        None => None,
    };

    Ok(SessionEntry {
        uccs_code,
        decision_level,
        look_back_period,
    })
}

/// Drives a [`DecisionForm`] from line-oriented input while a
/// [`LiveDecisionView`] follows the store's change feed.
///
/// # Errors
/// Returns an error when the input or output stream fails or the live view
/// cannot subscribe. Rejected lines and failed submissions are reported
/// inline and do not stop the session.
pub fn run_session<R, W>(
    input: R,
    output: &mut W,
    config: SessionConfig,
    store: &mut SqliteDecisionStore,
) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let matrix_id = config.matrix_id().to_string();
    let mut view = LiveDecisionView::activate(&*store, &matrix_id)?;
    let mut form = DecisionForm::new(config);
    let offense_count = form.load_offenses(&*store);
    writeln!(
        output,
        "matrix={matrix_id} offenses={offense_count} decisions={}",
        view.len()
    )?;

    let mut submitted = 0_usize;
    let mut failed = 0_usize;
    for (index, line) in input.lines().enumerate() {
        let line = line.context("failed to read session input")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let entry = match parse_session_line(trimmed) {
            Ok(entry) => entry,
            Err(err) => {
                failed += 1;
                writeln!(output, "line {}: {err:#}", index + 1)?;
                continue;
            }
        };

        form.select_offense(entry.uccs_code);
        form.set_decision_level(entry.decision_level);
        form.set_look_back_period(entry.look_back_period);
        if form.submit(store).is_ok() {
            submitted += 1;
        } else {
            failed += 1;
        }
        writeln!(output, "{}", form.status_message().unwrap_or_default())?;

        view.pump();
        write_decision_table(output, view.records(), form.offenses())?;
    }

    tracing::info!(matrix_id = %matrix_id, submitted, failed, "session finished");
    writeln!(output, "submitted={submitted} failed={failed}")?;
    Ok(())
}

fn read_catalog(path: &Path) -> Result<Vec<Offense>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read offense catalog {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("offense catalog must be valid JSON: {}", path.display()))?;
    Ok(Offense::catalog_from_json(&value)?)
}

/// Catalog for table rendering. A failed read is logged and rendered as
/// unknown descriptions.
fn offenses_or_empty(store: &SqliteDecisionStore) -> Vec<Offense> {
    match store.list_offenses() {
        Ok(offenses) => offenses,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "offense catalog unavailable");
            Vec::new()
        }
    }
}

fn map_level(value: LevelArg) -> DecisionLevel {
    match value {
        LevelArg::Green => DecisionLevel::Green,
        LevelArg::Yellow => DecisionLevel::Yellow,
        LevelArg::Red => DecisionLevel::Red,
    }
}

fn print_offense_table(offenses: &[Offense]) {
    println!("{:<10} uccs_desc", "uccs_code");
    println!("{}", "-".repeat(60));
    for offense in offenses {
        println!("{:<10} {}", offense.uccs_code, offense.uccs_desc);
    }
}

fn write_decision_table<W: Write>(
    output: &mut W,
    records: &[Decision],
    offenses: &[Offense],
) -> std::io::Result<()> {
    let descriptions: BTreeMap<i64, &str> = offenses
        .iter()
        .map(|offense| (offense.uccs_code, offense.uccs_desc.as_str()))
        .collect();

    writeln!(
        output,
        "{:<10} {:<28} {:<7} {:<10} {:<24} updated_at",
        "uccs_code", "offense", "level", "look_back", "collaborator"
    )?;
    writeln!(output, "{}", "-".repeat(110))?;
    for record in records {
        writeln!(
            output,
            "{:<10} {:<28} {:<7} {:<10} {:<24} {}",
            record.uccs_code,
            descriptions.get(&record.uccs_code).copied().unwrap_or("?"),
            record.decision_level.label(),
            record
                .look_back_period
                .map_or_else(|| "-".to_string(), |value| value.to_string()),
            record.collaborator_email,
            format_rfc3339(record.updated_at).unwrap_or_else(|_| record.updated_at.to_string())
        )?;
    }
    Ok(())
}

fn print_integrity_check(check: &IntegrityCheck) {
    println!(
        "contract={} matrix={} offenses={} decisions={}",
        check.contract_version,
        check.matrix_id.as_deref().unwrap_or("all"),
        check.offense_count,
        check.decision_count
    );
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    IntegrityIssueSeverity::Warning => "warning",
                    IntegrityIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
    }

    for item in &check.duplicate_keys {
        println!(
            "duplicate matrix={} collaborator={} uccs_code={} records={} ids={}",
            item.matrix_id,
            item.collaborator_email,
            item.uccs_code,
            item.record_count,
            item.decision_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
    }
}
