use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use things_sync::builder::build_todo;
use things_sync::codec::CallbackRequest;
use things_sync::commands::{Outcome, ThingsSync};
use things_sync::extract::extract_target;
use things_sync::host::{Editor, Host, MemoryEditor};
use things_sync::queue::{MAX_AGE_DAYS, PendingQueue};
use things_sync::settings::Settings;
use things_sync::todo::Position;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const STATE_DIR: &str = ".things-sync";
const SETTINGS_FILE: &str = "data.json";
const PENDING_FILE: &str = "pending.json";

#[derive(Debug, Parser)]
#[command(
    name = "things-sync",
    about = "Sync to-do lines in a markdown vault with Things through its URL scheme",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a single line and print the to-do it would create.
    Parse(ParseArgs),

    /// Create a Things to-do from a line (or a range of lines) of a note.
    Create(CreateArgs),

    /// Create a Things to-do that links to the note itself.
    CreateFromNote(NoteArgs),

    /// Toggle a tracked line and push its new status to Things.
    Toggle(ToggleArgs),

    /// Apply a Things callback URL to a note.
    Callback(CallbackArgs),

    /// List lines still waiting for a Things callback.
    Pending(NoteArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// The line to parse.
    line: String,
    /// File name used as the date fallback.
    #[arg(long, default_value = "")]
    file_name: String,
    /// Default tags appended to the parsed tags.
    #[arg(long, default_value = "")]
    default_tags: String,
    /// Emit JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct NoteArgs {
    /// Markdown note to operate on.
    note: PathBuf,
    /// Vault directory; defaults to the note's parent directory.
    #[arg(long)]
    vault_dir: Option<PathBuf>,
    /// Print outbound URLs instead of opening them.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[command(flatten)]
    note: NoteArgs,
    /// 1-based line to create the to-do from.
    #[arg(long)]
    line: usize,
    /// Last line (inclusive) for batch creation.
    #[arg(long)]
    to: Option<usize>,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    #[command(flatten)]
    note: NoteArgs,
    /// 1-based line holding the tracked to-do.
    #[arg(long)]
    line: usize,
}

#[derive(Debug, Args)]
struct CallbackArgs {
    #[command(flatten)]
    note: NoteArgs,
    /// Callback URL as opened by Things.
    url: String,
    /// 1-based cursor line; required unless the callback carries a token.
    #[arg(long)]
    line: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Create(args) => run_create(args).map(|o| report(&o)),
        Commands::CreateFromNote(args) => run_create_from_note(args).map(|o| report(&o)),
        Commands::Toggle(args) => run_toggle(args).map(|o| report(&o)),
        Commands::Callback(args) => run_callback(args).map(|o| report(&o)),
        Commands::Pending(args) => handle_pending(args),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/* ------------------------------ Note host ------------------------------ */

/// A markdown file on disk standing in for the editor.
struct NoteHost {
    path: PathBuf,
    vault_name: String,
    original: String,
    editor: MemoryEditor,
    dry_run: bool,
    opened: Vec<String>,
}

impl NoteHost {
    fn open(path: &Path, vault_name: String, dry_run: bool) -> Result<Self> {
        let original = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            vault_name,
            editor: MemoryEditor::from_text(&original),
            original,
            dry_run,
            opened: Vec::new(),
        })
    }

    fn place_cursor(&mut self, line: usize) -> Result<usize> {
        let ix = zero_based(line)?;
        if ix >= self.editor.line_count() {
            anyhow::bail!("line {line} is past the end of {:?}", self.path);
        }
        self.editor.set_cursor(Position { line: ix, ch: 0 });
        Ok(ix)
    }

    fn save(&self) -> Result<bool> {
        let text = self.editor.to_text();
        if text == self.original {
            return Ok(false);
        }
        fs::write(&self.path, text.as_bytes()).with_context(|| format!("writing {:?}", self.path))?;
        Ok(true)
    }
}

impl Host for NoteHost {
    fn active_file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    fn vault_name(&self) -> String {
        self.vault_name.clone()
    }

    fn editor(&mut self) -> Option<&mut dyn Editor> {
        Some(&mut self.editor)
    }

    fn open_url(&mut self, url: &str) -> Result<()> {
        self.opened.push(url.to_string());
        if self.dry_run {
            println!("{url}");
            return Ok(());
        }
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        };
        let status = Command::new(opener)
            .arg(url)
            .status()
            .with_context(|| format!("running {opener}"))?;
        if !status.success() {
            anyhow::bail!("{opener} exited with {status}");
        }
        Ok(())
    }

    fn notify(&mut self, message: &str) {
        eprintln!("{message}");
    }
}

/* ------------------------------- Session ------------------------------- */

struct VaultPaths {
    settings: PathBuf,
    pending: PathBuf,
}

/// Host, plugin state and the files they were loaded from.
struct Session {
    host: NoteHost,
    plugin: ThingsSync,
    paths: VaultPaths,
}

impl Session {
    fn open(args: &NoteArgs) -> Result<Self> {
        let note = fs::canonicalize(&args.note)
            .with_context(|| format!("resolving path {:?}", args.note))?;
        let vault_dir = match &args.vault_dir {
            Some(dir) => fs::canonicalize(dir).with_context(|| format!("resolving path {:?}", dir))?,
            None => note
                .parent()
                .map(Path::to_path_buf)
                .with_context(|| format!("{:?} has no parent directory", note))?,
        };
        let vault_name = vault_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let state_dir = vault_dir.join(STATE_DIR);
        let paths = VaultPaths {
            settings: state_dir.join(SETTINGS_FILE),
            pending: state_dir.join(PENDING_FILE),
        };
        debug!(?note, vault = %vault_name, "opening session");

        let settings = Settings::load(&paths.settings)?;
        let mut pending = PendingQueue::load(&paths.pending)?;
        for entry in pending.expire_stale(Utc::now()) {
            warn!(
                token = %entry.token,
                file = %entry.file,
                line = entry.line + 1,
                "dropping pending line with no callback after {MAX_AGE_DAYS} days"
            );
        }
        Ok(Self {
            host: NoteHost::open(&note, vault_name, args.dry_run)?,
            plugin: ThingsSync::with_pending(settings, pending),
            paths,
        })
    }

    fn finish(&self) -> Result<()> {
        if self.host.save()? {
            debug!(path = ?self.host.path, "note updated");
        }
        if !self.plugin.pending.is_empty() || self.paths.pending.exists() {
            self.plugin.pending.save(&self.paths.pending)?;
        }
        Ok(())
    }
}

fn zero_based(line: usize) -> Result<usize> {
    line.checked_sub(1).context("line numbers start at 1")
}

/* ------------------------------ Handlers ------------------------------ */

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs {
        line,
        file_name,
        default_tags,
        json,
    } = args;
    let settings = Settings {
        default_tags,
        ..Settings::default()
    };
    let todo = build_todo(&line, &settings, &file_name);
    let target = extract_target(&line);

    if json {
        let payload = serde_json::json!({ "todo": todo, "target": target });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("title:  {}", todo.title);
        println!("tags:   {}", todo.tags);
        println!("date:   {}", todo.date);
        if target.is_tracked() {
            println!(
                "target: {} (toggle -> completed:{})",
                target.todo_id, target.after_status
            );
        }
    }
    Ok(())
}

fn run_create(args: CreateArgs) -> Result<Outcome> {
    let CreateArgs { note, line, to } = args;
    let mut session = Session::open(&note)?;
    let first = session.host.place_cursor(line)?;
    if let Some(to) = to {
        let last = session.host.place_cursor(to)?;
        session.host.editor.select_lines(first, last);
    }
    let outcome = session.plugin.create_todo(&mut session.host)?;
    session.finish()?;
    Ok(outcome)
}

fn run_create_from_note(args: NoteArgs) -> Result<Outcome> {
    let mut session = Session::open(&args)?;
    let outcome = session.plugin.create_todo_from_note(&mut session.host)?;
    session.finish()?;
    Ok(outcome)
}

fn run_toggle(args: ToggleArgs) -> Result<Outcome> {
    let ToggleArgs { note, line } = args;
    let mut session = Session::open(&note)?;
    session.host.place_cursor(line)?;
    let outcome = session.plugin.toggle_todo(&mut session.host)?;
    session.finish()?;
    Ok(outcome)
}

fn run_callback(args: CallbackArgs) -> Result<Outcome> {
    let CallbackArgs { note, url, line } = args;
    let request =
        CallbackRequest::parse(&url).with_context(|| format!("decoding callback {url}"))?;
    let mut session = Session::open(&note)?;
    match line {
        Some(line) => {
            session.host.place_cursor(line)?;
        }
        None if request.token.is_none() => {
            anyhow::bail!("--line is required for callbacks without a correlation token");
        }
        None => {}
    }
    let outcome = session.plugin.handle_callback(&mut session.host, &request)?;
    session.finish()?;
    Ok(outcome)
}

fn handle_pending(args: NoteArgs) -> Result<()> {
    let session = Session::open(&args)?;
    if session.plugin.pending.is_empty() {
        eprintln!("No lines are waiting for a Things callback.");
        return Ok(());
    }
    for entry in session.plugin.pending.iter() {
        println!(
            "{:>5}  {}  {}  {}",
            entry.line + 1,
            entry.dispatched_at.format("%Y-%m-%d %H:%M"),
            entry.token,
            entry.title
        );
    }
    Ok(())
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Skipped(reason) => eprintln!("Nothing done: {:?}", reason),
        Outcome::Dispatched(urls) => eprintln!("Dispatched {} URL(s)", urls.len()),
        Outcome::Notified(_) => {}
        Outcome::Replaced(replacement) => {
            eprintln!("Linked line {}", replacement.range.from.line + 1)
        }
    }
}
