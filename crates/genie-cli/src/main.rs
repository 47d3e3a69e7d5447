use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use genie_core::config::{load_config, resolve_paths, resolve_workspace_root, GenieConfig};
use genie_core::process::SystemProbe;
use genie_core::status::{list_views, RecordView};
use genie_core::store::{self, now_rfc3339, LoadedStore, StoreKind, StoreLocation};
use genie_core::version;
use genie_service::logging::init_tracing;
use genie_service::stream::{
    ErrorHandler, MessageHandler, StreamError, StreamMessage, StreamPool,
    DEFAULT_MAX_RECONNECT_ATTEMPTS,
};
use tokio::sync::mpsc;

/// Store warnings are printed by the CLI itself, so keep them out of the log.
const LOG_DIRECTIVES: &str = "warn,genie_core::store=error";

#[derive(Parser)]
#[command(name = "genie", version = version::FULL, about = "Genie task and session registry")]
struct Cli {
    /// Workspace root (defaults to GENIE_HOME or the nearest directory with .genie/)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Which registry to operate on
    #[arg(long, value_enum, default_value_t = KindArg::Tasks, global = true)]
    kind: KindArg,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Sessions,
    Tasks,
}

impl From<KindArg> for StoreKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Sessions => StoreKind::Session,
            KindArg::Tasks => StoreKind::Task,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// List records with their reconciled status
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one record
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Upgrade the store file to the current schema
    Migrate {
        #[arg(long)]
        dry_run: bool,
    },
    /// Record a status change for one record
    Mark {
        id: String,
        status: String,
        #[arg(long, allow_negative_numbers = true)]
        exit_code: Option<i32>,
    },
    /// Follow a live event stream, one JSON value per line
    Stream {
        url: String,
        #[arg(long, default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
        max_reconnect: u32,
    },
    /// Print version information
    Version,
}

struct Workspace {
    kind: StoreKind,
    config: GenieConfig,
    defaults: GenieConfig,
    location: StoreLocation,
}

impl Workspace {
    fn open(root: Option<PathBuf>, kind: StoreKind) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None => {
                let cwd = std::env::current_dir().context("resolve current directory")?;
                resolve_workspace_root(&cwd)
            }
        };
        let config = load_config(&root)
            .with_context(|| format!("load config under {}", root.display()))?;
        let location = resolve_paths(&root, &config.paths).store_location(kind);
        Ok(Self {
            kind,
            config,
            defaults: GenieConfig::builtin(),
            location,
        })
    }

    fn load(&self) -> Result<LoadedStore> {
        let loaded = store::load(&self.location, self.kind, &self.config, &self.defaults)
            .with_context(|| format!("load {} store", self.kind))?;
        for warning in &loaded.warnings {
            eprintln!("warning: {warning}");
        }
        Ok(loaded)
    }
}

fn list(workspace: &Workspace, json: bool) -> Result<()> {
    let loaded = workspace.load()?;
    let views = list_views(&loaded.store.sessions, &SystemProbe);
    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    if views.is_empty() {
        println!("No {} found.", workspace.kind);
        return Ok(());
    }
    for view in views {
        println!("{}", view.render_line());
    }
    Ok(())
}

fn show(workspace: &Workspace, id: &str, json: bool) -> Result<()> {
    let loaded = workspace.load()?;
    let (id, record) = loaded
        .store
        .sessions
        .get_key_value(id)
        .ok_or_else(|| anyhow!("Session not found: {id}"))?;
    let view = RecordView::new(id, record, &SystemProbe);
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        for line in view.render_details() {
            println!("{line}");
        }
    }
    Ok(())
}

fn migrate(workspace: &Workspace, dry_run: bool) -> Result<()> {
    if !workspace.location.read_path().is_some_and(|path| path.exists()) {
        println!("No {} store found.", workspace.kind);
        return Ok(());
    }
    let loaded = workspace.load()?;
    let count = loaded.store.sessions.len();
    if dry_run {
        println!("{count} {}(s) would be written (dry run)", workspace.kind.noun());
        return Ok(());
    }
    let written = store::save(&workspace.location, &loaded.store)
        .with_context(|| format!("save {} store", workspace.kind))?;
    match written {
        Some(path) => println!(
            "{count} {}(s) written to {}",
            workspace.kind.noun(),
            path.display()
        ),
        None => println!("{count} {}(s) loaded; nowhere to write", workspace.kind.noun()),
    }
    Ok(())
}

fn mark(workspace: &Workspace, id: &str, status: &str, exit_code: Option<i32>) -> Result<()> {
    if !workspace.location.read_path().is_some_and(|path| path.exists()) {
        bail!("Session not found: {id}");
    }
    let now = now_rfc3339();
    let (loaded, marked) = store::update(
        &workspace.location,
        workspace.kind,
        &workspace.config,
        &workspace.defaults,
        |store| {
            let record = store.sessions.get_mut(id)?;
            record.status = Some(status.to_string());
            if exit_code.is_some() {
                record.exit_code = exit_code;
            }
            record.touch(&now);
            Some(())
        },
    )
    .with_context(|| format!("update {} store", workspace.kind))?;
    for warning in &loaded.warnings {
        eprintln!("warning: {warning}");
    }
    if marked.is_none() {
        bail!("Session not found: {id}");
    }
    println!("{id}: {status}");
    Ok(())
}

async fn follow_stream(url: String, max_reconnect: u32) -> Result<()> {
    let pool = StreamPool::tungstenite();
    let (errors_tx, mut errors) = mpsc::unbounded_channel::<StreamError>();
    let on_message: MessageHandler =
        Arc::new(|message: StreamMessage| println!("{}", message.to_value()));
    let on_error: ErrorHandler = Arc::new(move |err| {
        let _ = errors_tx.send(err);
    });
    let id = pool.subscribe(url, on_message, Some(on_error), max_reconnect);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                pool.unsubscribe(&id);
                return Ok(());
            }
            err = errors.recv() => match err {
                Some(err @ StreamError::ReconnectExhausted { .. }) => return Err(err.into()),
                Some(err) => eprintln!("warning: {err}"),
                None => return Ok(()),
            }
        }
    }
}

fn stream(url: String, max_reconnect: u32) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(follow_stream(url, max_reconnect))
}

fn main() -> Result<()> {
    init_tracing(LOG_DIRECTIVES);
    let cli = Cli::parse();
    let kind = StoreKind::from(cli.kind);
    match cli.command {
        Some(Command::List { json }) => list(&Workspace::open(cli.root, kind)?, json),
        Some(Command::Show { id, json }) => show(&Workspace::open(cli.root, kind)?, &id, json),
        Some(Command::Migrate { dry_run }) => migrate(&Workspace::open(cli.root, kind)?, dry_run),
        Some(Command::Mark {
            id,
            status,
            exit_code,
        }) => mark(&Workspace::open(cli.root, kind)?, &id, &status, exit_code),
        Some(Command::Stream { url, max_reconnect }) => stream(url, max_reconnect),
        Some(Command::Version) => {
            println!("genie {}", version::FULL);
            Ok(())
        }
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
