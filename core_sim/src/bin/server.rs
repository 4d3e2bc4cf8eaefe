use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use core_sim::{
    build_engine, serve, ConnectionRegistry, FileStore, PersistenceGateway, SaveOutcome,
    ServerConfig, TickScheduler,
};

#[derive(Parser, Debug)]
#[command(name = "server", about = "Surge headless world server")]
struct Cli {
    /// JSON config file; omitted fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the listen address.
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Override the tick interval in milliseconds.
    #[arg(long = "tick-ms")]
    tick_ms: Option<u64>,
    /// Override the store file.
    #[arg(long)]
    data: Option<PathBuf>,
    /// Wipe the store before loading.
    #[arg(long)]
    reset: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let store = FileStore::open(&config.data_path)
        .wrap_err_with(|| format!("opening store at {}", config.data_path.display()))?;
    let mut gateway = PersistenceGateway::new(Box::new(store));
    if config.reset_on_start {
        gateway.reset().wrap_err("resetting store")?;
    }

    let engine = Arc::new(build_engine(&config, &mut gateway).wrap_err("loading world")?);
    let registry = Arc::new(ConnectionRegistry::new());
    let listener = TcpListener::bind(config.bind_addr)
        .wrap_err_with(|| format!("binding {}", config.bind_addr))?;

    info!(
        target: "surge::net",
        bind = %config.bind_addr,
        tick_ms = config.tick_duration_ms,
        grid = %format!("{}x{}", config.grid_width, config.grid_height),
        tick = engine.tick(),
        players = engine.player_count(),
        "Surge server ready"
    );

    let (shutdown, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!(target: "surge::net", "shutdown.requested");
        let _ = on_signal.try_send(());
    })
    .wrap_err("installing signal handler")?;

    let scheduler = TickScheduler::new(
        Arc::clone(&engine),
        gateway,
        Arc::clone(&registry),
        config.tick_duration(),
        config.persistence_backoff.clone(),
    );
    let ticker = thread::Builder::new()
        .name("tick-scheduler".into())
        .spawn(move || scheduler.run(shutdown_rx))?;

    // The accept loop only returns on a listener failure; stop ticking then too.
    thread::Builder::new()
        .name("accept-loop".into())
        .spawn(move || {
            if let Err(err) = serve(listener, engine, registry) {
                error!(target: "surge::net", %err, "accept.failed");
            }
            let _ = shutdown.try_send(());
        })?;

    let summary = ticker
        .join()
        .map_err(|_| eyre!("tick scheduler thread panicked"))?;
    info!(
        target: "surge::tick",
        cycles = summary.cycles,
        overruns = summary.overruns,
        skipped = summary.skipped,
        final_save = ?summary.final_save,
        "Surge server stopped"
    );
    if summary.final_save != SaveOutcome::Saved {
        return Err(eyre!("final save failed; state since the last saved tick is lost"));
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::builtin(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(tick_ms) = cli.tick_ms {
        config.tick_duration_ms = tick_ms;
    }
    if let Some(data) = &cli.data {
        config.data_path = data.clone();
    }
    config.reset_on_start |= cli.reset;
    config.validate()?;
    Ok(config)
}
