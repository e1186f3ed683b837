use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stageshare::{
    DatabaseLayerProvider, DefaultHost, EngineOpts, EngineServices, EvalContext, HostSnapshot,
    JsonFileSource, LayerDatabase, LayerStore, PersistedConsumer, StageCache, StageConsumer,
};

#[derive(Parser, Debug)]
#[command(name = "stageshare", version)]
struct Cli {
    /// Engine options JSON; defaults apply when omitted.
    #[arg(long, global = true)]
    opts: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the stage a host snapshot describes and print a summary.
    Resolve(ResolveArgs),
    /// Restore a saved consumer, resolve it and print a summary.
    Restore(RestoreArgs),
}

#[derive(Parser, Debug)]
struct ResolveArgs {
    /// Host snapshot JSON.
    #[arg(long)]
    snapshot: PathBuf,

    /// Save the consumer and its layers to this JSON file after resolving.
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RestoreArgs {
    /// Saved consumer JSON written by `resolve --save`.
    #[arg(long)]
    state: PathBuf,

    /// Directory relative file paths resolve against; defaults to the state file's directory.
    #[arg(long)]
    document_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let opts = match &cli.opts {
        Some(path) => EngineOpts::from_path(path)
            .with_context(|| format!("load engine options '{}'", path.display()))?,
        None => EngineOpts::default(),
    };
    match cli.cmd {
        Command::Resolve(args) => cmd_resolve(args, opts),
        Command::Restore(args) => cmd_restore(args, opts),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn services(document_dir: &Path, opts: EngineOpts) -> (EngineServices, Arc<LayerDatabase>) {
    let store = Arc::new(LayerStore::new(Arc::new(JsonFileSource)));
    let db = Arc::new(LayerDatabase::new(store.clone()));
    let services = EngineServices::new(Arc::new(StageCache::new(store)))
        .with_host(Arc::new(DefaultHost::with_document_dir(document_dir)))
        .with_provider(Arc::new(DatabaseLayerProvider::new(db.clone())))
        .with_opts(opts);
    (services, db)
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn cmd_resolve(args: ResolveArgs, opts: EngineOpts) -> anyhow::Result<()> {
    let snapshot = HostSnapshot::from_path(&args.snapshot)
        .with_context(|| format!("load snapshot '{}'", args.snapshot.display()))?;
    let (services, db) = services(&parent_dir(&args.snapshot), opts);
    let mut consumer = StageConsumer::new(services, snapshot);
    consumer
        .compute(EvalContext::Normal, None)
        .context("resolve stage")?;

    if let Some(out) = &args.save {
        consumer
            .persist(&db)
            .to_path(out)
            .with_context(|| format!("save consumer '{}'", out.display()))?;
        eprintln!("wrote {}", out.display());
    }
    print_summary(&mut consumer)
}

fn cmd_restore(args: RestoreArgs, opts: EngineOpts) -> anyhow::Result<()> {
    let state = PersistedConsumer::from_path(&args.state)
        .with_context(|| format!("load saved consumer '{}'", args.state.display()))?;
    let dir = args
        .document_dir
        .unwrap_or_else(|| parent_dir(&args.state));
    let (services, db) = services(&dir, opts);
    let mut consumer = state.restore(services, &db);
    consumer
        .compute(EvalContext::Normal, None)
        .context("resolve restored stage")?;
    print_summary(&mut consumer)
}

fn print_summary(consumer: &mut StageConsumer) -> anyhow::Result<()> {
    let stage = consumer
        .stage()
        .cloned()
        .context("no stage exposed")?;
    let time = consumer.snapshot().time_code();
    let bounds = consumer.compute_bounds(time);
    let summary = serde_json::json!({
        "root_layer": stage.root_layer().identifier(),
        "session_layer": stage.session_layer().identifier(),
        "layer_stack": stage
            .layer_stack()
            .iter()
            .map(|l| l.identifier().to_string())
            .collect::<Vec<_>>(),
        "edit_target": stage.edit_target().identifier(),
        "muted_layers": stage.muted_layers(),
        "load_rules": stage.load_rules(),
        "share_mode": consumer.share_mode(),
        "prim_path": consumer.prim_path().map(|p| p.to_string()),
        "prim_count": stage.prims().len(),
        "bounds": (!bounds.is_empty()).then_some(bounds),
        "stage_cache_id": consumer.outputs().out_stage_cache_id.as_raw(),
    });
    let s = serde_json::to_string_pretty(&summary).context("serialize summary")?;
    println!("{s}");
    Ok(())
}
