use std::env;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;

use agora::hub::{
    AddChannelParams, AddHubParams, DeleteChannelParams, DeleteHubParams, GetChannelsCountParams,
    GetHubOfChannelParams, GetHubParams, GetHubsCountParams, GetHubsParams, Hub, HubId,
    HubService,
};
use agora::relay::{DispatchConfig, RelayDispatcher, StdioGateway, run_relay, spawn_stdin_reader};
use agora::settings::{AppConfig, ENV_PREFIX, RelaySettings};
use agora::store::{self, StoreKind};

const APP_NAME: &str = "agora";

/// Inbound events buffered between the reader and the relay loop.
const EVENT_QUEUE_DEPTH: usize = 256;

/// How long runtime shutdown waits for leftover tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

/// Drive `future` on a fresh runtime.
///
/// Shutdown does not wait on stragglers past [`SHUTDOWN_GRACE`].
fn block_on<F>(future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let result = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Run(cmd) => block_on(handle_run(&ctx, cmd)),
        Command::Hub { command } => block_on(handle_hub(&ctx, command)),
        Command::Channel { command } => block_on(handle_channel(&ctx, command)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Agora - relay messages between channels grouped into hubs.",
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
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relay events read from stdin, writing sends to stdout
    Run(RunCommand),
    /// Manage hubs
    Hub {
        #[command(subcommand)]
        command: HubCommand,
    },
    /// Manage hub channel membership
    Channel {
        #[command(subcommand)]
        command: ChannelCommand,
    },
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Override the store backend (memory, persistent)
    #[arg(long, value_name = "TYPE")]
    store: Option<String>,
    /// Override the relay's own author ID
    #[arg(long, value_name = "ID")]
    self_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum HubCommand {
    /// Create a hub
    Add(HubAddCommand),
    /// List all hubs
    List,
    /// Show one hub
    Get {
        /// Hub ID
        id: String,
    },
    /// Delete a hub and release its channels
    Delete {
        /// Hub ID
        id: String,
    },
    /// Print the number of hubs
    Count,
    /// Show the hub a channel belongs to
    OfChannel {
        /// Channel ID
        channel: String,
    },
}

#[derive(Debug, Clone, Args)]
struct HubAddCommand {
    /// Owner user ID
    #[arg(long)]
    owner: String,
    /// Display name
    #[arg(long)]
    name: String,
    /// Explicit hub ID (generated when omitted)
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ChannelCommand {
    /// Add a channel to a hub
    Add {
        /// Hub ID
        hub: String,
        /// Channel ID
        channel: String,
    },
    /// Remove a channel from a hub
    Remove {
        /// Hub ID
        hub: String,
        /// Channel ID
        channel: String,
    },
    /// Print the number of channels in a hub
    Count {
        /// Hub ID
        hub: String,
    },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
    /// The default config file was written during startup.
    created_config: bool,
}

impl RuntimeContext {
    /// Resolve paths and config, start logging, then prepare the disk.
    ///
    /// Logging is up before anything is written so dry-run notices are seen.
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_config(&paths)?;
        let mut ctx = Self {
            common,
            paths,
            config,
            created_config: false,
        };
        ctx.init_logging();
        ctx.created_config = ctx.ensure_default_config()?;
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        // stdout carries gateway commands and command output; logs go to stderr.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = env::var_os("FORCE_COLOR").is_some();
            let disable_color = env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(false),
                )
                .try_init()
                .ok();
        }
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::TRACE
        } else if self.common.debug {
            LevelFilter::DEBUG
        } else if self.common.quiet {
            LevelFilter::ERROR
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::INFO),
                1 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            }
        }
    }

    /// Write the default config if none exists. Returns whether it did.
    fn ensure_default_config(&self) -> Result<bool> {
        if self.paths.config_file.exists() {
            return Ok(false);
        }
        if self.common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                self.paths.config_file.display()
            );
            return Ok(false);
        }
        write_default_config(&self.paths.config_file)?;
        info!("created default config at {}", self.paths.config_file.display());
        Ok(true)
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {}",
                self.paths.data_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        Ok(())
    }

    /// Open the configured store and wrap it in a hub service.
    async fn hub_service(&self, relay: &RelaySettings) -> Result<HubService> {
        let database_url = self.config.persistent.resolve_url(&self.paths.data_dir);
        let store = store::load_store(&relay.store_type, &database_url, &self.config.persistent)
            .await
            .with_context(|| format!("opening {} hub store", relay.store_type))?;
        Ok(HubService::from_settings(
            store,
            relay,
            &self.config.timeouts,
        ))
    }

    /// Hub service for one-shot admin commands.
    async fn admin_service(&self) -> Result<HubService> {
        match self.config.relay.store_type.parse::<StoreKind>() {
            Ok(StoreKind::Memory) => warn!(
                "store_type is \"memory\": changes are lost when this command exits \
                 (set relay.store_type = \"persistent\")"
            ),
            Ok(StoreKind::Persistent) if self.common.dry_run => {
                let url = self.config.persistent.resolve_url(&self.paths.data_dir);
                let missing = url
                    .strip_prefix("sqlite://")
                    .is_some_and(|path| !Path::new(path).exists());
                if missing {
                    return Err(anyhow!("dry-run: no hub database at {url}"));
                }
            }
            _ => {}
        }
        self.hub_service(&self.config.relay).await
    }

    /// Print `value` as JSON when requested, otherwise the text form.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else {
            text()
        };
        println!("{output}");
        Ok(())
    }

    /// Report a mutation skipped under `--dry-run`.
    fn skip_dry_run(&self, action: String) -> Result<()> {
        info!("dry-run: would {action}");
        self.emit(
            &serde_json::json!({ "dry_run": true, "action": action }),
            || format!("dry-run: would {action}"),
        )
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    let mut relay = ctx.config.relay.clone();
    if let Some(store_type) = cmd.store {
        relay.store_type = store_type;
    }
    if let Some(self_id) = cmd.self_id {
        relay.self_id = self_id;
    }
    if relay.self_id.is_empty() {
        warn!("relay.self_id is not set; the relay's own messages will not be filtered");
    }

    let service = ctx.hub_service(&relay).await?;
    let gateway = Arc::new(StdioGateway::stdout(relay.self_id.clone()));
    let dispatcher = Arc::new(RelayDispatcher::new(
        service,
        gateway,
        DispatchConfig::from_settings(&ctx.config.timeouts),
    ));

    let shutdown = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let reader = spawn_stdin_reader(events_tx).context("starting stdin reader")?;

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
            signal_shutdown.cancel();
        }
    });

    info!(
        store = %relay.store_type,
        max_hubs = relay.max_hubs,
        max_channels_per_hub = relay.max_channels_per_hub,
        "relay started"
    );
    let stats = run_relay(dispatcher, events_rx, shutdown.clone()).await;
    shutdown.cancel();
    debug!(?stats, "final relay stats");

    // A reader still blocked on stdin is left behind; it ends with the process.
    if reader.is_finished() {
        match reader.join() {
            Ok(Ok(count)) => debug!(events = count, "event reader finished"),
            Ok(Err(err)) => warn!(error = %err, "event reader failed"),
            Err(_) => warn!("event reader thread panicked"),
        }
    }
    Ok(())
}

async fn handle_hub(ctx: &RuntimeContext, cmd: HubCommand) -> Result<()> {
    if ctx.common.dry_run {
        match &cmd {
            HubCommand::Add(add) => {
                return ctx.skip_dry_run(format!(
                    "create hub {:?} owned by {}",
                    add.name, add.owner
                ));
            }
            HubCommand::Delete { id } => {
                return ctx.skip_dry_run(format!("delete hub {id}"));
            }
            _ => {}
        }
    }
    let service = ctx.admin_service().await?;

    match cmd {
        HubCommand::Add(add) => {
            let hub = match add.id {
                Some(id) => Hub::with_id(HubId::from(id), add.owner, add.name),
                None => Hub::new(add.owner, add.name),
            };
            let hub = service.add_hub(AddHubParams { hub }).await?;
            ctx.emit(&hub, || format!("Created hub {} ({})", hub.id, hub.name))
        }
        HubCommand::List => {
            let mut hubs = service.get_hubs(GetHubsParams::default()).await?;
            hubs.sort_by(|a, b| a.id.cmp(&b.id));
            ctx.emit(&hubs, || hub_table(&hubs))
        }
        HubCommand::Get { id } => {
            let hub = service.get_hub(GetHubParams { id: id.into() }).await?;
            ctx.emit(&hub, || hub_details(&hub))
        }
        HubCommand::Delete { id } => {
            let id = HubId::from(id);
            let deleted = service.delete_hub(DeleteHubParams { id: id.clone() }).await?;
            ctx.emit(
                &serde_json::json!({ "id": id, "deleted": deleted }),
                || {
                    if deleted {
                        format!("Deleted hub {id}")
                    } else {
                        format!("Hub {id} does not exist")
                    }
                },
            )
        }
        HubCommand::Count => {
            let count = service
                .get_hubs_count(GetHubsCountParams::default())
                .await?;
            ctx.emit(&serde_json::json!({ "hubs": count }), || count.to_string())
        }
        HubCommand::OfChannel { channel } => {
            let hub = service
                .get_hub_of_channel(GetHubOfChannelParams {
                    channel_id: channel.into(),
                })
                .await?;
            ctx.emit(&hub, || hub_details(&hub))
        }
    }
}

async fn handle_channel(ctx: &RuntimeContext, cmd: ChannelCommand) -> Result<()> {
    if ctx.common.dry_run {
        match &cmd {
            ChannelCommand::Add { hub, channel } => {
                return ctx.skip_dry_run(format!("add channel {channel} to hub {hub}"));
            }
            ChannelCommand::Remove { hub, channel } => {
                return ctx.skip_dry_run(format!("remove channel {channel} from hub {hub}"));
            }
            ChannelCommand::Count { .. } => {}
        }
    }
    let service = ctx.admin_service().await?;

    match cmd {
        ChannelCommand::Add { hub, channel } => {
            let params = AddChannelParams {
                hub_id: hub.into(),
                channel_id: channel.into(),
            };
            service.add_channel(params.clone()).await?;
            ctx.emit(&params, || {
                format!("Added channel {} to hub {}", params.channel_id, params.hub_id)
            })
        }
        ChannelCommand::Remove { hub, channel } => {
            let params = DeleteChannelParams {
                hub_id: hub.into(),
                channel_id: channel.into(),
            };
            let removed = service.delete_channel(params.clone()).await?;
            ctx.emit(
                &serde_json::json!({
                    "hub_id": params.hub_id,
                    "channel_id": params.channel_id,
                    "removed": removed,
                }),
                || {
                    if removed {
                        format!(
                            "Removed channel {} from hub {}",
                            params.channel_id, params.hub_id
                        )
                    } else {
                        format!(
                            "Channel {} is not in hub {}",
                            params.channel_id, params.hub_id
                        )
                    }
                },
            )
        }
        ChannelCommand::Count { hub } => {
            let hub_id = HubId::from(hub);
            let count = service
                .get_channels_count(GetChannelsCountParams {
                    hub_id: hub_id.clone(),
                })
                .await?;
            ctx.emit(
                &serde_json::json!({ "hub_id": hub_id, "channels": count }),
                || count.to_string(),
            )
        }
    }
}

fn hub_table(hubs: &[Hub]) -> String {
    let mut out = format!("{:<18} {:<24} {:<20} {:>8}\n", "ID", "NAME", "OWNER", "CHANNELS");
    out.push_str(&"-".repeat(73));
    for hub in hubs {
        out.push_str(&format!(
            "\n{:<18} {:<24} {:<20} {:>8}",
            hub.id,
            hub.name,
            hub.owner_id,
            hub.channels.len()
        ));
    }
    out.push_str(&format!("\n\nTotal: {} hubs", hubs.len()));
    out
}

fn hub_details(hub: &Hub) -> String {
    let mut out = format!(
        "Hub:      {}\nName:     {}\nOwner:    {}\nChannels:",
        hub.id, hub.name, hub.owner_id
    );
    if hub.channels.is_empty() {
        out.push_str(" (none)");
    }
    for channel in &hub.channels {
        out.push_str(&format!("\n  {channel}"));
    }
    out
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.created_config {
        return Ok(());
    }
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.emit(&ctx.config, || format!("{:#?}", ctx.config)),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

/// Load the config file (if present) plus environment overrides.
fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let mut config = AppConfig::load(&paths.config_file)?;

    let sqlite_path = config
        .persistent
        .database_url
        .as_deref()
        .and_then(|url| url.strip_prefix("sqlite://"))
        .map(expand_str_path)
        .transpose()?;
    if let Some(path) = sqlite_path {
        config.persistent.database_url = Some(format!("sqlite://{}", path.display()));
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n\
         # File: {}\n\
         # Environment overrides use the {ENV_PREFIX}__ prefix, e.g. {ENV_PREFIX}__RELAY__MAX_HUBS=50\n\n",
        path.display()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}
