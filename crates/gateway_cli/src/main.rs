use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use config::{ConfigStore, GatewayConfig};
use core_types::{ChatCompletionRequest, ChatMessage};
use gateway::Gateway;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "llm-gateway", version, about = "Rate-limited gateway to hosted LLM providers")]
struct Cli {
    /// Configuration file. Defaults to `gateway.json` in the user config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write JSON logs to a daily rolling file in this directory instead of stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured providers and whether they can serve requests.
    Providers,
    /// List the models of every available provider.
    Models,
    /// Send one prompt and print the reply.
    Complete(CompleteArgs),
    /// Write the default configuration file.
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
struct CompleteArgs {
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
    prompt: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logger(cli.log_dir.as_deref());

    let store = match &cli.config {
        Some(path) => ConfigStore::from_file(path.clone()),
        None => ConfigStore::from_default_location()?,
    };

    if let Command::Init { force } = cli.command {
        return init_config(&store, force);
    }

    let config = store
        .load_or_init()
        .with_context(|| format!("failed to load `{}`", store.path().display()))?;
    let gateway = Gateway::from_config(&config)?;

    match cli.command {
        Command::Providers => print_providers(&gateway),
        Command::Models => print_models(&gateway),
        Command::Complete(args) => {
            let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
            runtime.block_on(complete(&gateway, args))?;
        }
        Command::Init { .. } => {}
    }
    Ok(())
}

fn init_config(store: &ConfigStore, force: bool) -> Result<()> {
    if store.path().exists() && !force {
        bail!(
            "`{}` already exists, pass --force to overwrite",
            store.path().display()
        );
    }
    store.save(&GatewayConfig::default())?;
    println!("wrote {}", store.path().display());
    Ok(())
}

fn print_providers(gateway: &Gateway) {
    for name in gateway.provider_names() {
        let Some(service) = gateway.get_service(name, None) else {
            continue;
        };
        println!(
            "{name}\t{}\tmodel={}\trpm={}",
            if service.is_available() {
                "available"
            } else {
                "unavailable"
            },
            service.identity().model.as_deref().unwrap_or("-"),
            service.max_requests_per_minute(),
        );
    }
}

fn print_models(gateway: &Gateway) {
    for entry in gateway.list_all_models() {
        for model in entry.models {
            println!(
                "{}/{}\t{}\tctx={}",
                entry.provider, model.id, model.display_name, model.context_window
            );
        }
    }
}

async fn complete(gateway: &Gateway, args: CompleteArgs) -> Result<()> {
    let cancellation = CancellationToken::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling request");
            on_interrupt.cancel();
        }
    });

    let mut request = ChatCompletionRequest::new(vec![ChatMessage::user(args.prompt)]);
    if let Some(system) = args.system {
        request = request.with_system_prompt(system);
    }
    if let Some(model) = args.model {
        request = request.with_model(model);
    }
    if let Some(temperature) = args.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }

    let response = gateway
        .complete_via(args.provider.as_deref(), &request, &cancellation)
        .await
        .inspect_err(|err| error!("completion failed: {err}"))?;

    println!("{}", response.message.text);
    if let Some(usage) = response.usage {
        eprintln!(
            "[{} {}] tokens in={} out={} total={}",
            response.provider,
            response.model,
            usage.input_tokens,
            usage.output_tokens,
            usage.total()
        );
    }
    Ok(())
}

fn init_logger(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gateway=debug"));

    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "gateway.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    Some(guard)
}
