//! Run one message through the agent and stream the reply to stdout.
//!
//! # Examples
//!
//! ```sh
//! # One message against the providers in kestrel.toml
//! kestrel --config kestrel.toml "what's on my calendar?"
//!
//! # Pin a model by name
//! kestrel --model opus "review this diff" < diff.patch
//!
//! # Show which names resolve to which model
//! kestrel --list-models
//! ```
//!
//! Logs go to stderr; set `KESTREL_LOG` (e.g. `KESTREL_LOG=kestrel=debug`).

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use kestrel::agent::tools::json_schema_for;
use kestrel::prelude::*;
use kestrel::routing::FuzzyMatcher;
use schemars::JsonSchema;
use serde::Deserialize;
use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run one message through the agent and stream the reply.
#[derive(Parser)]
#[command(name = "kestrel", version)]
struct Cli {
    /// Provider configuration file.
    #[arg(long, default_value = "kestrel.toml")]
    config: PathBuf,

    /// Conversation key; messages with the same key share history.
    #[arg(long, default_value = "default")]
    session: String,

    /// Channel the message is delivered on (affects tone guidance).
    #[arg(long, default_value = "cli")]
    channel: String,

    /// Model override: `provider/model` or a name such as "opus".
    #[arg(long)]
    model: Option<String>,

    /// Maximum model calls for this run.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Skip background fact extraction.
    #[arg(long)]
    no_extract: bool,

    /// Emit JSON logs.
    #[arg(long)]
    json: bool,

    /// Print every configured model with the names that resolve to it.
    #[arg(long)]
    list_models: bool,

    /// The message. Read from stdin when omitted.
    message: Vec<String>,
}

#[derive(Deserialize, JsonSchema)]
struct ReadFileArgs {
    /// Path of the file to read.
    path: String,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("KESTREL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn builtin_tools() -> ToolSet {
    ToolSet::new().with(FnTool::new(
        ToolDefinition::new(
            "read_file",
            "Read a UTF-8 text file from the local filesystem.",
            json_schema_for::<ReadFileArgs>(),
        ),
        |args: ReadFileArgs| async move {
            tokio::fs::read_to_string(&args.path)
                .await
                .map_err(|e| format!("cannot read {}: {e}", args.path))
        },
    ))
}

fn list_models(config: &KestrelConfig) {
    let matcher = FuzzyMatcher::from_config(config);
    for (provider, model) in config.active_models() {
        let r = ModelRef::new(&provider.id, &model.id);
        let names = matcher.aliases_for(&r);
        println!("{r}\t{}", names.join(", "));
    }
}

fn read_message(cli: &Cli) -> Result<String> {
    if !cli.message.is_empty() {
        return Ok(cli.message.join(" "));
    }
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        bail!("no message given; pass it as an argument or on stdin");
    }
    let mut text = String::new();
    stdin.read_to_string(&mut text).context("failed to read stdin")?;
    if text.trim().is_empty() {
        bail!("empty message on stdin");
    }
    Ok(text)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let catalog = KestrelConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.list_models {
        list_models(&catalog);
        return Ok(());
    }
    let message = read_message(&cli)?;

    let mut config = RunnerConfig::default()
        .with_overrides(&catalog.runner)
        .with_channel(&cli.channel);
    if let Some(n) = cli.max_iterations {
        config = config.with_max_iterations(n);
    }
    if cli.no_extract {
        config = config.with_extract_facts(false);
    }

    let runner = Runner::builder(catalog)
        .with_config(config)
        .with_store(Arc::new(InMemoryStore::new()))
        .with_tools(Arc::new(builtin_tools()))
        .build()?;

    let mut request = RunRequest::new(&cli.session, whoami(), message).with_channel(&cli.channel);
    if let Some(model) = &cli.model {
        request = request.with_model(model);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut events = runner.run(cancel, request);
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Text(t) => {
                print!("{t}");
                stdout.flush().ok();
            }
            StreamEvent::ToolCall(call) => eprintln!("\n[tool] {} {}", call.name, call.input),
            StreamEvent::ToolResult(r) if r.is_error => eprintln!("[tool error] {}", r.content),
            StreamEvent::Done(usage) => {
                println!();
                tracing::info!(
                    "done: input_tokens={}, output_tokens={}",
                    usage.input_tokens,
                    usage.output_tokens
                );
            }
            StreamEvent::Error(e) => {
                println!();
                bail!(e);
            }
            _ => {}
        }
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".into())
}
