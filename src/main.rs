mod doctor;

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use finflow_agent::{assemble, GraphFlow, Node, RequestOutcome, RunLogger, SessionContext};
use finflow_core::config::{parse_override, AppConfig, ModelConfig};
use finflow_core::text::truncate;
use finflow_core::traits::LlmClient;
use finflow_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "finflow", version, about = "Multi-agent financial advisory workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "finflow.toml")]
    config: PathBuf,

    /// Override a config value, e.g. `--set engine.request_timeout_secs=30`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// User email, passed to workers as the `user_email` fact
    #[arg(short, long, env = "FINFLOW_USER")]
    user: Option<String>,

    /// Extra request facts, e.g. `--hint portfolio_id=10`
    #[arg(long = "hint", value_name = "KEY=VALUE")]
    hints: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single request and print the merged answer
    Run {
        /// The request text; read from stdin when omitted
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show how a request would be routed and planned, without running it
    Route {
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Print the workflow graph
    Graph,
    /// Show the effective configuration
    Config,
    /// Run configuration health checks
    Doctor,
    /// Create the portfolio database tables
    InitDb {
        /// Database file; defaults to `tools.database` from the config
        #[arg(long)]
        path: Option<PathBuf>,
        /// Seed a demo user and portfolio
        #[arg(long)]
        sample: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("finflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "finflow", &mut io::stdout());
        return Ok(());
    }

    let overrides = cli
        .overrides
        .iter()
        .map(|o| parse_override(o))
        .collect::<finflow_core::Result<Vec<_>>>()?;
    let config = load_config(&cli.config, &overrides)?;

    match &cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            let healthy = doctor::run_doctor(&config);
            if !healthy {
                std::process::exit(1);
            }
        }
        Commands::InitDb { path, sample } => {
            let Some(path) = path
                .clone()
                .or_else(|| config.tools.database.as_ref().map(PathBuf::from))
            else {
                anyhow::bail!("No database path: pass --path or set tools.database");
            };
            let portfolios = finflow_tools::builtin::initialize_store(&path, *sample)?;
            println!("{} ready ({} portfolios)", path.display(), portfolios);
        }
        Commands::Graph => {
            let flow = build_flow(&config)?;
            print_graph(&flow);
        }
        Commands::Route { query } => {
            let flow = build_flow(&config)?;
            let text = query_text(query);
            let (decision, plan) = flow.plan(&text);
            match decision {
                Ok(d) => {
                    println!("intent: {}", d.intent);
                    println!("entry:  {}", d.entry);
                    println!("broad:  {}", d.hint.broad);
                    for (intent, score) in &d.hint.scores {
                        println!("  {:<20} {:.2}", intent, score);
                    }
                }
                Err(e) => println!("routing failed ({}), default entry {}", e, plan.entry),
            }
            for (i, stage) in plan.stages.iter().enumerate() {
                let names: Vec<&str> = stage.iter().map(|id| id.as_str()).collect();
                println!("stage {}: {}", i, names.join(", "));
            }
        }
        Commands::Run { query, json } => {
            let flow = build_flow(&config)?;
            let text = query_text(query);
            let session = session_facts(cli.user.as_deref(), &cli.hints)?;
            let outcome = run_once(&flow, &config, &text, session).await;

            if *json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            if !outcome.is_completed() {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load the config file, or fall back to an environment-only config when it
/// does not exist.
fn load_config(path: &Path, overrides: &[(String, String)]) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load_with_overrides(path, overrides)?);
    }
    eprintln!(
        "Warning: {} not found. Using the built-in workflow; set OPENAI_API_KEY or create a config.",
        path.display()
    );
    eprintln!("See finflow.example.toml for reference.");
    let mut config = AppConfig::parse_with_overrides("", overrides)?;
    if config.model.is_none() {
        config.model = env_model();
    }
    Ok(config)
}

fn env_model() -> Option<ModelConfig> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    Some(ModelConfig {
        provider: "openai".into(),
        model_id: std::env::var("FINFLOW_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        api_key: Some(api_key),
        base_url: None,
        max_tokens: 2048,
        temperature: 0.2,
        retry: Some(Default::default()),
    })
}

fn build_flow(config: &AppConfig) -> anyhow::Result<GraphFlow> {
    let registry = ToolRegistry::from_config(&config.tools)?;
    info!(tools = registry.len(), "Tool registry ready");
    let llm: Option<Arc<dyn LlmClient>> = config.model.as_ref().map(finflow_llm::create_client);
    Ok(assemble(config, Arc::new(registry), llm)?)
}

fn query_text(words: &[String]) -> String {
    let text = words.join(" ");
    if !text.is_empty() {
        return text;
    }
    io::stdin()
        .lock()
        .lines()
        .map_while(|l| l.ok())
        .collect::<Vec<_>>()
        .join("\n")
}

fn session_facts(user: Option<&str>, hints: &[String]) -> anyhow::Result<Option<SessionContext>> {
    let mut session = SessionContext::new();
    if let Some(email) = user {
        session.insert("user_email".into(), serde_json::Value::String(email.into()));
    }
    for hint in hints {
        let (key, raw) = parse_override(hint)?;
        // Numbers and booleans keep their JSON type
        let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
        session.insert(key, value);
    }
    Ok((!session.is_empty()).then_some(session))
}

async fn run_once(
    flow: &GraphFlow,
    config: &AppConfig,
    query: &str,
    session: Option<SessionContext>,
) -> RequestOutcome {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupted, cancelling the request");
        cancel_clone.cancel();
    });

    let logger = config.engine.log.as_ref().filter(|l| l.enabled).map(|log| {
        let dir = PathBuf::from(log.log_dir.clone().unwrap_or_else(|| "logs".into()));
        let rx = flow.event_bus().subscribe();
        tokio::spawn(RunLogger::new(dir, log.level).run(rx, CancellationToken::new(), Some(1)))
    });

    let outcome = flow.submit_with_cancel(query, session, cancel).await;

    if let Some(handle) = logger {
        handle.await.ok();
    }
    outcome
}

fn print_outcome(outcome: &RequestOutcome) {
    eprintln!(
        "[{} -> {} | {} in {}ms]",
        outcome.intent, outcome.plan.entry, outcome.state, outcome.elapsed_ms
    );
    if outcome.routing_fallback {
        if let Some(err) = &outcome.routing_error {
            eprintln!("[routing fell back to the default entry: {}]", err);
        }
    }
    println!("{}", outcome.response());
    for failure in &outcome.result.failures {
        eprintln!(
            "[{}: {}] {}",
            failure.node_id,
            failure.kind,
            truncate(&failure.message, 200)
        );
    }
}

fn print_graph(flow: &GraphFlow) {
    let graph = flow.graph();
    println!("nodes:");
    for node in graph.nodes() {
        let optional = if node.is_optional() { " (optional)" } else { "" };
        println!("  {:<20} {:<18} {}{}", node.id(), node.kind_label(), node.name(), optional);
        if let Node::Team(team) = node {
            for edge in graph.members(&team.id) {
                let guard = edge
                    .guard
                    .as_ref()
                    .map(|g| format!(" [{}]", g))
                    .unwrap_or_default();
                println!("    -> {}{}", edge.to, guard);
            }
        }
    }
    println!("edges:");
    for node in graph.nodes() {
        for edge in graph.continuations(node.id()) {
            let guard = edge
                .guard
                .as_ref()
                .map(|g| format!(" when {}", g))
                .unwrap_or_default();
            println!("  {} -> {}{}", edge.from, edge.to, guard);
        }
    }
    println!("entries:");
    let mut entries: Vec<_> = graph.entries().iter().collect();
    entries.sort();
    for (intent, entry) in entries {
        println!("  {:<20} {}", intent, entry);
    }
    println!("  {:<20} {}", "(default)", graph.default_entry());
    if !graph.broad_fanout().is_empty() {
        let fanout: Vec<&str> = graph.broad_fanout().iter().map(|id| id.as_str()).collect();
        println!("  {:<20} {}", "(broad)", fanout.join(", "));
    }
}
