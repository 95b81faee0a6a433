//! CLI binary for routing, planning and running duckagent requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use duckagent_core::{
    Agent, AgentConfig, AgentResponse, CancelHandle, JsonFileSink, LlmProvider, ResultSink,
    RunOptions,
};
use duckagent_llm::{DynModel, MeteredModel, MockModel, OpenAiChat, TokenLedger};
use duckagent_types::RunContext;

#[derive(Parser)]
#[command(name = "duckagent", version, about = "Natural-language analytics agent pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Language model used for SQL, summaries, classification and planning
    #[arg(long, global = true, value_enum)]
    llm: Option<LlmChoice>,

    /// Model name passed to the provider
    #[arg(long, global = true)]
    model: Option<String>,

    /// Base URL of the hosted run service
    #[arg(long, global = true)]
    hosted_endpoint: Option<String>,

    /// Never run steps on a separate local task
    #[arg(long, global = true)]
    no_local_runtime: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LlmChoice {
    None,
    Mock,
    Openai,
}

#[derive(clap::Args)]
struct RequestArgs {
    /// The natural-language request
    prompt: String,

    /// Force an intent (analyze, summarize, sql, explore, or a custom mode)
    #[arg(short, long)]
    mode: Option<String>,

    /// JSON object used as the initial run context
    #[arg(long)]
    context_file: Option<PathBuf>,

    /// JSON rows to analyze directly
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Table name for the supplied data
    #[arg(long)]
    table: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Route, plan and execute a request
    Run {
        #[command(flatten)]
        request: RequestArgs,

        /// Directory to write the run result to as <run_id>.json
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the decision for a request without executing it
    Plan {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Show the detected intent for a request
    Route {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// List the registered steps and their capabilities
    Capabilities,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so --json output stays parseable.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let ledger = match config.llm.token_budget {
        Some(budget) => TokenLedger::with_budget(budget),
        None => TokenLedger::new(),
    };
    let mut builder = Agent::builder().config(config.clone());
    if let Some(model) = build_model(&config, &ledger)? {
        builder = builder.model(model);
    }
    let agent = builder.build()?;

    match cli.command {
        Commands::Run {
            request,
            output,
            json,
        } => {
            cmd_run(&agent, request, output.as_deref(), json, &ledger).await?;
        }
        Commands::Plan { request } => {
            cmd_plan(&agent, request).await?;
        }
        Commands::Route { request } => {
            cmd_route(&agent, request).await?;
        }
        Commands::Capabilities => {
            cmd_capabilities(&agent);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(choice) = cli.llm {
        config.llm.provider = match choice {
            LlmChoice::None => LlmProvider::None,
            LlmChoice::Mock => LlmProvider::Mock,
            LlmChoice::Openai => LlmProvider::Openai,
        };
    }
    if let Some(model) = &cli.model {
        config.llm.model = Some(model.clone());
    }
    if let Some(endpoint) = &cli.hosted_endpoint {
        config.backends.hosted_endpoint = Some(endpoint.clone());
    }
    if cli.no_local_runtime {
        config.backends.local_runtime = false;
    }
    config.validate()?;
    Ok(config)
}

fn build_model(config: &AgentConfig, ledger: &TokenLedger) -> anyhow::Result<Option<DynModel>> {
    let inner = match config.llm.provider {
        LlmProvider::None => return Ok(None),
        LlmProvider::Mock => DynModel::new(MockModel::new()),
        LlmProvider::Openai => {
            let mut chat = OpenAiChat::from_env()?;
            if let Some(model) = &config.llm.model {
                chat = chat.with_model(model.clone());
            }
            if let Some(url) = &config.llm.base_url {
                chat = chat.with_base_url(url.clone());
            }
            DynModel::new(chat)
        }
    };
    tracing::debug!(provider = %inner.name(), "Language model configured");
    Ok(Some(DynModel::new(MeteredModel::new(inner, ledger.clone()))))
}

async fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

async fn run_options(request: &RequestArgs) -> anyhow::Result<RunOptions> {
    let context: HashMap<String, Value> = match &request.context_file {
        Some(path) => match read_json(path).await? {
            Value::Object(map) => map.into_iter().collect(),
            _ => anyhow::bail!("context file {} must hold a JSON object", path.display()),
        },
        None => HashMap::new(),
    };
    let data = match &request.data_file {
        Some(path) => Some(read_json(path).await?),
        None => None,
    };
    Ok(RunOptions {
        mode: request.mode.clone(),
        context,
        data,
        table_name: request.table.clone(),
    })
}

async fn cmd_run(
    agent: &Agent,
    request: RequestArgs,
    output: Option<&Path>,
    json: bool,
    ledger: &TokenLedger,
) -> anyhow::Result<()> {
    let options = run_options(&request).await?;

    let cancel = CancelHandle::new();
    let token = cancel.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let response = agent.run_with_cancel(&request.prompt, options, token).await;

    if let Some(dir) = output {
        let location = JsonFileSink::new(dir).store(&response.result).await?;
        eprintln!("Run result written to {location}");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response, ledger);
    }

    if !response.result.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_response(response: &AgentResponse, ledger: &TokenLedger) {
    let run = &response.result;
    println!(
        "Intent: {} ({:.2})",
        response.intent.tag, response.intent.confidence
    );
    if let Some(decision) = &response.decision {
        println!("Plan: {}", decision.step_names().join(" -> "));
    }
    if let Some(backend) = run.backend {
        println!("Backend: {backend}");
    }
    println!("Status: {}", run.status.as_str());

    println!("\nNodes:");
    for node in &run.nodes {
        match &node.substitute_for {
            Some(original) => println!(
                "  {} [{}] (substitute for {original})",
                node.node_id,
                node.status.as_str()
            ),
            None => println!("  {} [{}]", node.node_id, node.status.as_str()),
        }
    }

    for downgrade in &run.downgrades {
        println!(
            "Downgraded {} -> {} at {}: {}",
            downgrade.from, downgrade.to, downgrade.node_id, downgrade.reason
        );
    }
    for warning in &run.warnings {
        println!("Warning: {warning}");
    }
    if let Some(reason) = &run.failure_reason {
        println!("Failure: {reason}");
    }
    if let Some(summary) = run.summary() {
        println!("\n{summary}");
    }
    if ledger.total_tokens() > 0 {
        println!(
            "\nTokens: {} in / {} out",
            ledger.total_input_tokens(),
            ledger.total_output_tokens()
        );
    }
    println!("Duration: {}ms", run.duration_ms());
}

async fn cmd_plan(agent: &Agent, request: RequestArgs) -> anyhow::Result<()> {
    let options = run_options(&request).await?;
    let (intent, decision) = agent.plan(&request.prompt, options).await?;
    tracing::debug!(intent = %intent.tag, steps = decision.steps.len(), "Planned");
    println!("{}", serde_json::to_string_pretty(&decision.to_json())?);
    Ok(())
}

async fn cmd_route(agent: &Agent, request: RequestArgs) -> anyhow::Result<()> {
    let options = run_options(&request).await?;
    let context = RunContext::from_values(options.context);
    let intent = agent
        .router()
        .detect_intent(&request.prompt, options.mode.as_deref(), &context)
        .await;
    println!("{}", serde_json::to_string_pretty(&intent)?);
    Ok(())
}

fn cmd_capabilities(agent: &Agent) {
    let registry = agent.registry();
    println!("Steps: {}", registry.len());
    for name in registry.names() {
        let Some(d) = registry.descriptor(name) else {
            continue;
        };
        let mut flags = Vec::new();
        if d.requires_query_engine {
            flags.push("query-engine");
        }
        if d.can_run_on_sample {
            flags.push("sample");
        }
        if d.requires_sandbox {
            flags.push("sandbox");
        }
        println!(
            "  {name:<20} tier={:<6} ~{:.1}s [{}] provides={:?} consumes={:?}",
            format!("{:?}", d.cost_tier).to_lowercase(),
            d.estimated_seconds,
            flags.join(","),
            d.provides,
            d.consumes
        );
    }
}
