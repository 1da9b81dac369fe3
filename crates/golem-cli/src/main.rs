//! golem — manage and invoke MCP servers from the command line.
//!
//! Servers registered with `add` live in the JSON manifest; session
//! commands spawn them, run the requested operation, and shut the fleet
//! down again before exiting.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use golem_guard::{AuditLog, PermissionGuard, SecretProvider};
use golem_manifest::ManifestStore;
use golem_mcp::config::{ServerConfig, load_server_config_file};
use golem_mcp::manager::{ServerManager, ServerStatus};
use golem_router::ToolRouter;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "golem", version, about = "Host-side manager for MCP servers")]
struct Cli {
    /// Path to the manifest file
    #[arg(long, default_value = golem_manifest::DEFAULT_MANIFEST_PATH)]
    manifest: PathBuf,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a server in the manifest
    Add {
        name: String,
        command: String,
        /// Arguments passed to the server command (after `--`)
        #[arg(last = true)]
        args: Vec<String>,
        /// KEY=VALUE environment entries for the server process
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Exclude this server from `start --all`
        #[arg(long)]
        no_auto_start: bool,
    },
    /// Remove a server from the manifest
    Remove { name: String },
    /// Start servers, refresh their cached capabilities and tools
    Start {
        /// Server to start; omit with --all or --file
        name: Option<String>,
        /// Start every auto-start server in the manifest
        #[arg(long)]
        all: bool,
        /// Start servers from a JSON config file ({"servers": [...]})
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Stop a server started in this session
    Stop {
        name: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Restart a server (fresh spawn + handshake)
    Restart { name: String },
    /// List known servers
    #[command(alias = "ls")]
    List,
    /// List tools, optionally for one server
    Tools { server: Option<String> },
    /// Invoke a tool with optional JSON arguments
    Call { tool: String, json: Option<String> },
    /// Show audit entries recorded in this session
    Audit { server: Option<String> },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = ManifestStore::load(&cli.manifest).await;

    match cli.command {
        Command::Add {
            name,
            command,
            args,
            env,
            no_auto_start,
        } => add(store, name, command, args, env, no_auto_start).await,
        Command::Remove { name } => remove(store, name).await,
        other => {
            let session = Session::new(store);
            let result = session.dispatch(other).await;
            session.shutdown().await;
            result
        }
    }
}

async fn add(
    mut store: ManifestStore,
    name: String,
    command: String,
    args: Vec<String>,
    env: Vec<String>,
    no_auto_start: bool,
) -> Result<()> {
    let mut config = ServerConfig::new(&name, command);
    config.args = args;
    config.env = parse_env_pairs(&env)?;
    config.auto_start = !no_auto_start;
    store.add_server(config);
    store.save().await.context("failed to save manifest")?;
    println!("Added server '{name}'");
    Ok(())
}

async fn remove(mut store: ManifestStore, name: String) -> Result<()> {
    if !store.remove_server(&name) {
        bail!("server '{name}' not found in manifest");
    }
    store.save().await.context("failed to save manifest")?;
    println!("Removed server '{name}'");
    Ok(())
}

/// One CLI invocation's worth of running servers, routed and audited.
struct Session {
    manager: Arc<ServerManager>,
    manifest: Arc<Mutex<ManifestStore>>,
    router: ToolRouter,
}

impl Session {
    fn new(store: ManifestStore) -> Self {
        let mut secrets = SecretProvider::new();
        let loaded = secrets.load_from_env();
        if loaded > 0 {
            tracing::debug!("loaded {loaded} secrets from the environment");
        }

        let manager = Arc::new(ServerManager::with_secrets(secrets));
        let manifest = Arc::new(Mutex::new(store));
        let router = ToolRouter::new(
            Arc::clone(&manager),
            Arc::clone(&manifest),
            PermissionGuard::permissive(),
            Arc::new(AuditLog::new()),
        );
        Self {
            manager,
            manifest,
            router,
        }
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        match command {
            Command::Start { name, all, file } => self.start(name, all, file).await,
            Command::Stop { name, all } => self.stop(name, all).await,
            Command::Restart { name } => self.restart(name).await,
            Command::List => self.list().await,
            Command::Tools { server } => self.tools(server).await,
            Command::Call { tool, json } => self.call(tool, json).await,
            Command::Audit { server } => self.audit(server),
            Command::Add { .. } | Command::Remove { .. } => unreachable!("handled before a session"),
        }
    }

    async fn start(&self, name: Option<String>, all: bool, file: Option<PathBuf>) -> Result<()> {
        let states = if let Some(path) = file {
            let configs = load_server_config_file(&path)?;
            self.manager.start_all(configs).await
        } else if all {
            let configs: Vec<ServerConfig> = {
                let manifest = self.manifest.lock().await;
                manifest.list_servers().iter().map(|e| e.config.clone()).collect()
            };
            if configs.is_empty() {
                bail!("no servers in manifest; use 'golem add' first");
            }
            self.manager.start_all(configs).await
        } else if let Some(name) = name {
            let config = self.config_for(&name).await?;
            let state = self.manager.start(config).await?;
            HashMap::from([(name, state)])
        } else {
            bail!("specify a server name, --all, or --file <path>");
        };

        self.after_start().await?;
        for state in self.manager.list().await {
            print_state(&state);
        }
        for (name, state) in &states {
            if state.status == ServerStatus::Error {
                println!(
                    "{name}: error ({})",
                    state.error.as_deref().unwrap_or("unknown")
                );
            }
        }
        Ok(())
    }

    async fn stop(&self, name: Option<String>, all: bool) -> Result<()> {
        if all {
            self.manager.stop_all().await;
            println!("Stopped all servers");
            return Ok(());
        }
        let name = name.ok_or_else(|| anyhow!("specify a server name or --all"))?;
        self.manager.stop(&name).await?;
        println!("Stopped server '{name}'");
        Ok(())
    }

    async fn restart(&self, name: String) -> Result<()> {
        // In a one-shot invocation nothing is running yet, so a restart
        // is a fresh spawn of the manifest config.
        let state = if self.manager.get(&name).await.is_some() {
            self.manager.restart(&name).await?
        } else {
            let config = self.config_for(&name).await?;
            self.manager.start(config).await?
        };
        self.after_start().await?;
        print_state(&state);
        Ok(())
    }

    async fn list(&self) -> Result<()> {
        let running: HashMap<String, ServerStatus> = self
            .manager
            .list()
            .await
            .into_iter()
            .map(|s| (s.name.clone(), s.status))
            .collect();

        let manifest = self.manifest.lock().await;
        if manifest.list_servers().is_empty() {
            println!("No servers registered");
            return Ok(());
        }
        for entry in manifest.list_servers() {
            let status = running
                .get(entry.name())
                .copied()
                .unwrap_or(ServerStatus::Stopped);
            let tools = entry.tools.as_ref().map(Vec::len).unwrap_or(0);
            println!(
                "{}  {:?}  command={}  tools={}",
                entry.name(),
                status,
                entry.config.command,
                tools
            );
        }
        Ok(())
    }

    async fn tools(&self, server: Option<String>) -> Result<()> {
        let configs: Vec<ServerConfig> = {
            let manifest = self.manifest.lock().await;
            let entries = manifest.list_servers();
            match &server {
                Some(name) => entries
                    .iter()
                    .filter(|e| e.name() == name)
                    .map(|e| e.config.clone())
                    .collect(),
                None => entries.iter().map(|e| e.config.clone()).collect(),
            }
        };
        if configs.is_empty() {
            bail!(match server {
                Some(name) => format!("server '{name}' not found in manifest"),
                None => "no servers in manifest; use 'golem add' first".to_string(),
            });
        }

        self.manager.start_all(configs).await;
        self.after_start().await?;

        let tools = self.router.list_all_tools().await;
        if tools.is_empty() {
            println!("No tools discovered");
        }
        for (server, tool) in tools {
            println!("{server}.{}  {}", tool.name, tool.description);
        }
        self.save_manifest().await
    }

    async fn call(&self, tool: String, json: Option<String>) -> Result<()> {
        let arguments = json
            .map(|raw| serde_json::from_str(&raw).context("invalid JSON arguments"))
            .transpose()?;

        // Bring up the fleet so resolution can see running servers.
        let configs: Vec<ServerConfig> = {
            let manifest = self.manifest.lock().await;
            manifest.list_servers().iter().map(|e| e.config.clone()).collect()
        };
        self.manager.start_all(configs).await;
        self.after_start().await?;

        let outcome = self.router.invoke(&tool, arguments).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome.result)
                .unwrap_or_else(|_| "<unprintable result>".to_string())
        );
        tracing::info!(
            "invoked {}.{} in {}ms",
            outcome.server,
            outcome.tool,
            outcome.duration_ms
        );
        Ok(())
    }

    fn audit(&self, server: Option<String>) -> Result<()> {
        let entries = match server {
            Some(name) => self.router.audit().for_server(&name),
            None => self.router.audit().recent(golem_guard::audit::DEFAULT_RECENT),
        };
        if entries.is_empty() {
            println!("No audit entries in this session");
            return Ok(());
        }
        for entry in entries {
            println!(
                "{}",
                serde_json::to_string(&entry).unwrap_or_else(|_| "<unprintable entry>".to_string())
            );
        }
        Ok(())
    }

    async fn config_for(&self, name: &str) -> Result<ServerConfig> {
        let manifest = self.manifest.lock().await;
        manifest
            .get_server(name)
            .map(|e| e.config.clone())
            .ok_or_else(|| anyhow!("server '{name}' not found in manifest"))
    }

    /// Post-start housekeeping: forward server log notifications into
    /// tracing and refresh the manifest's capability/tool caches.
    async fn after_start(&self) -> Result<()> {
        for state in self.manager.list().await {
            if state.status != ServerStatus::Running {
                continue;
            }
            if let Some(client) = self.manager.get_client(&state.name).await {
                let server = state.name.clone();
                client.on_notification("notifications/message", move |params| {
                    tracing::info!("[{server}] {params}");
                });
            }
            let mut manifest = self.manifest.lock().await;
            if manifest.get_server(&state.name).is_some() {
                if let Some(capabilities) = state.capabilities.clone() {
                    let _ = manifest.update_capabilities(&state.name, capabilities);
                }
            }
        }
        self.router.list_all_tools().await;
        self.save_manifest().await
    }

    async fn save_manifest(&self) -> Result<()> {
        let manifest = self.manifest.lock().await;
        manifest.save().await.context("failed to save manifest")?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.manager.stop_all().await;
    }
}

fn parse_env_pairs(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --env '{pair}': expected KEY=VALUE"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn print_state(state: &golem_mcp::manager::ServerState) {
    let pid = state
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:?}  pid={}  tools={}",
        state.name, state.status, pid, state.tool_count
    );
}
