use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, error, info};
use serde_json::{Map, Value, json};

use sluice_runner::protocol::{Catalog, ConfiguredCatalog, State};
use sluice_runner::runner::{CATALOG_FILE_NAME, CONFIG_FILE_NAME, STATE_FILE_NAME};
use sluice_runner::settings::default_config_path;
use sluice_runner::{
    DataConsumer, ImageRuntime, LogTaskLogger, Runner, Settings, StreamRepresentation,
    TaskCloser, representation,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common)?;

    let config_path = match &cli.common.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    debug!("using config file {}", config_path.display());

    match cli.command {
        Command::Config { command } => handle_config(&config_path, command, &cli.common),
        Command::Connector(cmd) => {
            let settings = Settings::load(Some(&config_path))?;
            let _span = tracing::info_span!("connector", image = %cmd.image()).entered();
            async_connector(settings, cmd, cli.common.json)
        }
    }
}

#[tokio::main]
async fn async_connector(settings: Settings, cmd: ConnectorCommand, json: bool) -> Result<()> {
    handle_connector(&settings, cmd, json).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sluice - run containerized data connectors.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
}

impl CommonOpts {
    fn effective_log_level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Error;
        }
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(flatten)]
    Connector(ConnectorCommand),
    /// Inspect or initialize the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ImageOpts {
    /// Connector image, with or without the registry prefix
    #[arg(long)]
    image: String,
    /// Image tag
    #[arg(long = "image-version", value_name = "TAG", default_value = "latest")]
    tag: String,
}

#[derive(Debug, Subcommand)]
enum ConnectorCommand {
    /// Print the connector's specification
    Spec {
        #[command(flatten)]
        image: ImageOpts,
    },
    /// Validate a connector configuration
    Check {
        #[command(flatten)]
        image: ImageOpts,
        /// JSON file with the connector configuration
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },
    /// Print the streams the connector can extract
    Discover {
        #[command(flatten)]
        image: ImageOpts,
        /// JSON file with the connector configuration
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
        /// Deadline in seconds, overriding the configured one
        #[arg(long, value_name = "SECONDS")]
        timeout: Option<u64>,
    },
    /// Extract records, printing them as JSON lines on stdout
    Read {
        #[command(flatten)]
        image: ImageOpts,
        /// Identifier of the source; selects the workspace directory
        #[arg(long)]
        source_id: String,
        /// Copy this connector configuration into the workspace first
        #[arg(long, value_name = "PATH")]
        config_file: Option<PathBuf>,
        /// Copy this catalog into the workspace first
        #[arg(long, value_name = "PATH")]
        catalog_file: Option<PathBuf>,
        /// Copy this checkpoint into the workspace and resume from it
        #[arg(long, value_name = "PATH")]
        state_file: Option<PathBuf>,
        /// Task identifier used in log lines
        #[arg(long)]
        task_id: Option<String>,
    },
}

impl ConnectorCommand {
    fn image(&self) -> &str {
        match self {
            ConnectorCommand::Spec { image }
            | ConnectorCommand::Check { image, .. }
            | ConnectorCommand::Discover { image, .. }
            | ConnectorCommand::Read { image, .. } => &image.image,
        }
    }
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(common: &CommonOpts) -> Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = match common.effective_log_level() {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sluice={level},sluice_runner={level}")));

    // stdout carries connector data, so every log layer writes to stderr
    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(common.effective_log_level());
    builder.try_init().ok();

    Ok(())
}

fn handle_config(path: &Path, command: ConfigCommand, common: &CommonOpts) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let settings = Settings::load(Some(path))?;
            if common.json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&settings).context("serializing settings")?
                );
            }
            Ok(())
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "config file {} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Settings::write_default(path)?;
            info!("wrote default config to {}", path.display());
            Ok(())
        }
    }
}

fn read_json_file(path: &Path) -> Result<Value> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {} as JSON", path.display()))
}

/// Load the catalog handed to `read --catalog`. A discovered catalog is
/// accepted too: every stream is selected and the file is rewritten in
/// configured form, which is what connectors expect.
fn load_configured_catalog(path: &Path) -> Result<ConfiguredCatalog> {
    let value = read_json_file(path)?;
    if let Ok(configured) = serde_json::from_value::<ConfiguredCatalog>(value.clone()) {
        return Ok(configured);
    }

    let discovered: Catalog = serde_json::from_value(value)
        .with_context(|| format!("parsing {} as a catalog", path.display()))?;
    let configured = ConfiguredCatalog::from_discovered(discovered);
    info!(
        "selecting all {} streams of discovered catalog {}",
        configured.streams.len(),
        path.display()
    );
    let text = serde_json::to_string_pretty(&configured)?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(configured)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

async fn handle_connector(settings: &Settings, cmd: ConnectorCommand, json: bool) -> Result<()> {
    let runtime: Arc<dyn ImageRuntime> = Arc::new(settings.container_runtime()?);
    let build = |image: &ImageOpts| {
        Runner::builder(&image.image, &image.tag, runtime.clone())
            .timeouts(settings.timeouts())
            .build()
    };

    match cmd {
        ConnectorCommand::Spec { image } => {
            let spec = build(&image).spec().await.context("running spec")?;
            print_json(&spec)
        }
        ConnectorCommand::Check { image, config_file } => {
            let config = read_json_file(&config_file)?;
            build(&image).check(&config).await.context("running check")?;
            if json {
                print_json(&json!({"status": "SUCCEEDED"}))
            } else {
                println!("connection check succeeded");
                Ok(())
            }
        }
        ConnectorCommand::Discover {
            image,
            config_file,
            timeout,
        } => {
            let config = read_json_file(&config_file)?;
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.discover_timeout());
            let catalog = build(&image)
                .discover(&config, timeout)
                .await
                .context("running discover")?;
            print_json(&catalog)
        }
        ConnectorCommand::Read {
            image,
            source_id,
            config_file,
            catalog_file,
            state_file,
            task_id,
        } => {
            let source_dir = settings
                .config_dir()?
                .join(&source_id)
                .join(&image.image);
            fs::create_dir_all(&source_dir)
                .with_context(|| format!("creating {}", source_dir.display()))?;

            let provided = [
                (config_file, CONFIG_FILE_NAME),
                (catalog_file, CATALOG_FILE_NAME),
                (state_file, STATE_FILE_NAME),
            ];
            for (src, name) in provided
                .into_iter()
                .filter_map(|(src, name)| src.map(|s| (s, name)))
            {
                fs::copy(&src, source_dir.join(name))
                    .with_context(|| format!("copying {} into the workspace", src.display()))?;
            }

            let catalog = load_configured_catalog(&source_dir.join(CATALOG_FILE_NAME))?;
            let representations = Arc::new(representation::index(
                catalog
                    .streams
                    .iter()
                    .map(StreamRepresentation::from_configured),
            ));

            let state_path = if source_dir.join(STATE_FILE_NAME).exists() {
                STATE_FILE_NAME
            } else {
                ""
            };

            let runner = build(&image);
            let closer = Arc::new(CliTaskCloser::new(
                task_id.unwrap_or_else(|| runner.identifier().to_string()),
            ));
            let summary = runner
                .read(
                    Arc::new(StdoutConsumer),
                    representations,
                    Arc::new(LogTaskLogger::default()),
                    closer.clone(),
                    &source_id,
                    state_path,
                )
                .await;

            if let Some((message, fatal)) = closer.failure() {
                error!("task failed{}: {}", if fatal { " (fatal)" } else { "" }, message);
            }
            let summary = summary.context("running read")?;
            info!(
                "read finished: {} records, {} dropped, {} checkpoints",
                summary.records, summary.dropped_records, summary.states
            );
            if json {
                let mut err = io::stderr().lock();
                serde_json::to_writer(&mut err, &summary)?;
                writeln!(err)?;
            }
            Ok(())
        }
    }
}

/// Prints records and checkpoints as JSON lines on stdout.
struct StdoutConsumer;

impl DataConsumer for StdoutConsumer {
    fn consume_record(&self, stream: &str, record: Map<String, Value>) -> Result<()> {
        let mut out = io::stdout().lock();
        serde_json::to_writer(&mut out, &json!({"stream": stream, "record": record}))?;
        writeln!(out).map_err(|e| anyhow!("writing record: {e}"))
    }

    fn consume_state(&self, state: &State) -> Result<()> {
        let mut out = io::stdout().lock();
        serde_json::to_writer(&mut out, &json!({"state": state}))?;
        writeln!(out).map_err(|e| anyhow!("writing state: {e}"))
    }
}

/// Remembers the first failure reported for the task.
struct CliTaskCloser {
    task_id: String,
    failure: Mutex<Option<(String, bool)>>,
}

impl CliTaskCloser {
    fn new(task_id: String) -> Self {
        Self {
            task_id,
            failure: Mutex::new(None),
        }
    }

    fn failure(&self) -> Option<(String, bool)> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TaskCloser for CliTaskCloser {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn close_with_error(&self, message: &str, fatal: bool) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some((message.to_string(), fatal));
        }
    }
}
