use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use pagewright::engine::{DirectoryTaskContext, EngineError, NoTaskContext, TaskContext};
use pagewright::prelude::*;
use pagewright::recipe::{RecipeListing, MAX_TIMEOUT_SECS};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "pagewright")]
#[command(about = "Drive a browser and run automation recipes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory holding `.pagewright/`
    #[arg(short = 'C', long, global = true, default_value = ".")]
    project: PathBuf,

    /// Remote-debugging host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Remote-debugging port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommand,
    },

    /// Send single commands to the browser
    Browser {
        #[command(subcommand)]
        command: BrowserCommand,
    },
}

#[derive(Subcommand)]
enum RecipeCommand {
    /// Run a recipe and deliver its outcome
    Run {
        #[arg(value_name = "NAME")]
        name: String,

        /// Parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Environment override, KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Output destination: stdout, clipboard, file or file:<path> (repeatable)
        #[arg(short, long = "output", value_name = "DEST")]
        output: Vec<String>,

        /// Directory for file outputs and recipe artifacts
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Timeout in seconds
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..=MAX_TIMEOUT_SECS))]
        timeout: Option<u64>,
    },

    /// List recipes across all tiers
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show a recipe's metadata
    Info {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

#[derive(Subcommand)]
enum BrowserCommand {
    /// Load a URL
    Navigate {
        url: String,

        /// Wait until this selector matches
        #[arg(short, long)]
        wait_for: Option<String>,
    },

    /// Evaluate a JavaScript expression and print the result
    Eval {
        expression: String,

        /// Timeout in seconds
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..=MAX_TIMEOUT_SECS))]
        timeout: Option<u64>,
    },

    /// Capture a PNG screenshot
    Screenshot {
        /// Clip to the first element matching this selector
        #[arg(short, long)]
        selector: Option<String>,

        /// Output file; base64 on stdout when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[cfg(feature = "otel")]
fn init_otel_tracing(verbose: bool) {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let filter = if verbose {
        "pagewright=debug"
    } else {
        "pagewright=info"
    };

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("OTLP exporter unavailable ({}), logging to stderr only", e);
            init_tracing(verbose);
            return;
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("pagewright");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "pagewright=debug"
    } else {
        "pagewright=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    #[cfg(feature = "otel")]
    init_otel_tracing(cli.verbose);

    #[cfg(not(feature = "otel"))]
    init_tracing(cli.verbose);

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "pagewright failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = EngineConfig::load(&cli.project)
        .with_context(|| format!("loading config for {}", cli.project.display()))?;
    if let Some(host) = cli.host {
        config.cdp.host = host;
    }
    if let Some(port) = cli.port {
        config.cdp.port = port;
    }

    match cli.command {
        Commands::Recipe { command } => match command {
            RecipeCommand::Run {
                name,
                params,
                env,
                output,
                output_dir,
                timeout,
            } => run_recipe(&config, &name, &params, &env, &output, output_dir, timeout).await,
            RecipeCommand::List { json } => list_recipes(&config, json),
            RecipeCommand::Info { name } => recipe_info(&config, &name),
        },
        Commands::Browser { command } => {
            let session = connect(&config).await?;
            let result = browser_command(&session, command).await;
            session.close().await;
            result
        }
    }
}

async fn connect(config: &EngineConfig) -> anyhow::Result<Session> {
    let manager = ConnectionManager::new(config.connection_options())?;
    let session = manager
        .connect(&config.address(), config.retry_policy())
        .await?;
    Ok(session)
}

fn parse_overrides(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", pair))
        })
        .collect()
}

async fn run_recipe(
    config: &EngineConfig,
    name: &str,
    params: &str,
    env: &[String],
    outputs: &[String],
    output_dir: Option<PathBuf>,
    timeout: Option<u64>,
) -> anyhow::Result<bool> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("--params must be a JSON document")?;
    let overrides = parse_overrides(env)?;

    let registry = config.registry();
    let task: Arc<dyn TaskContext> = match output_dir {
        Some(dir) => Arc::new(DirectoryTaskContext::new(dir)),
        None => Arc::new(NoTaskContext),
    };
    let mut executor = RecipeExecutor::new(registry.clone(), config.env_resolver())
        .with_settings(config.executor_settings())
        .with_task_context(task.clone());

    let mut request = RunRequest::new(params).with_overrides(overrides);
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let bundle = match registry.resolve(name) {
        Ok(bundle) => bundle,
        Err(_) => {
            let outcome = executor.run_named(name, request).await;
            println!("{}", outcome.to_json_pretty()?);
            return Ok(outcome.success);
        }
    };

    if bundle.runtime() == Runtime::ChromeJs || bundle.is_workflow() {
        let started = Instant::now();
        match connect(config).await {
            Ok(session) => executor = executor.with_session(session),
            Err(e) if bundle.runtime() == Runtime::ChromeJs => {
                let error = match e.downcast::<CdpError>() {
                    Ok(cdp) => EngineError::Cdp(cdp),
                    Err(other) => EngineError::NoSession(format!("{}: {:#}", name, other)),
                };
                let outcome = ExecutionOutcome::failure(
                    bundle.name(),
                    Some(bundle.runtime()),
                    &error,
                    started.elapsed(),
                );
                println!("{}", outcome.to_json_pretty()?);
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(error = %e, "No browser session; in-page steps will fail");
            }
        }
    }

    let outcome = executor.run(&bundle, request).await;
    if let Some(session) = executor.session() {
        session.close().await;
    }

    let handler = OutputHandler::new(task);
    match handler.deliver(&bundle, &outcome, outputs) {
        Ok(report) => {
            for file in &report.files {
                eprintln!("Wrote {}", file.display());
            }
            Ok(outcome.success)
        }
        Err(e) => {
            let failed = outcome.with_output_error(&e);
            eprintln!("{}", failed.to_json_pretty()?);
            Ok(false)
        }
    }
}

fn list_recipes(config: &EngineConfig, json: bool) -> anyhow::Result<bool> {
    let listings = config.registry().list();
    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(true);
    }

    if listings.is_empty() {
        println!("No recipes found");
        return Ok(true);
    }
    for listing in &listings {
        println!("{}", format_listing(listing));
    }
    Ok(listings.iter().all(|l| l.error.is_none()))
}

fn format_listing(listing: &RecipeListing) -> String {
    let mut line = format!("{:<32} {:<9}", listing.name, listing.tier.to_string());
    match (&listing.runtime, &listing.error) {
        (_, Some(error)) => line.push_str(&format!(" invalid: {}", error)),
        (Some(runtime), None) => {
            let kind = listing.kind.map(|k| k.to_string()).unwrap_or_default();
            line.push_str(&format!(" {:<9} {:<8}", runtime.as_str(), kind));
            if let Some(description) = &listing.description {
                line.push_str(&format!(" {}", description));
            }
        }
        (None, None) => {}
    }
    if listing.shadowed {
        line.push_str(" (shadowed)");
    }
    line
}

fn recipe_info(config: &EngineConfig, name: &str) -> anyhow::Result<bool> {
    let bundle = config.registry().resolve(name)?;
    println!("# {} ({} tier)", bundle.name(), bundle.tier);
    println!("# metadata: {}", bundle.metadata_path.display());
    println!("# payload:  {}", bundle.payload_path.display());
    print!("{}", serde_yaml::to_string(&bundle.metadata)?);
    Ok(true)
}

async fn browser_command(session: &Session, command: BrowserCommand) -> anyhow::Result<bool> {
    match command {
        BrowserCommand::Navigate { url, wait_for } => {
            let result = session.navigate(&url, wait_for.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "url": result.url,
                "frameId": result.frame_id,
            }))?);
        }
        BrowserCommand::Eval {
            expression,
            timeout,
        } => {
            let options = match timeout {
                Some(secs) => EvaluateOptions::with_timeout(Duration::from_secs(secs)),
                None => EvaluateOptions::default(),
            };
            let value = session.evaluate(&expression, options).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        BrowserCommand::Screenshot { selector, out } => {
            let png = session.screenshot(selector.as_deref()).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &png)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("Wrote {} ({} bytes)", path.display(), png.len());
                }
                None => println!("{}", base64::engine::general_purpose::STANDARD.encode(&png)),
            }
        }
    }
    Ok(true)
}
