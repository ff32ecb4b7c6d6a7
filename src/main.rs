use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use courseflow::{
    behavior::BehaviorRegistry,
    config::{ConfigManager, EngineConfig, EnvConfigManager, engine_keys},
    entity::{EntityRef, InMemoryEntityStore},
    flow::{
        FlowStore,
        loader::{load_entities_file, publish_dir, validate_flow_file},
    },
    logger::init_tracing,
    message::Step,
    orchestrator::Reply,
    schema::write_schema,
    tutor::Tutor,
};
use std::{env, path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "courseflow",
    about = "Data-driven tutoring flows",
    version = "0.1.0"
)]
struct Cli {
    /// Log level (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Write logs under `<root>/logs` instead of stderr
    #[arg(long, global = true, default_value_t = false)]
    log_files: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Emit JSON‐Schema for flow documents and steps into `<root>/schemas`
    Schema,

    /// Manage flows
    Flow(FlowArgs),

    /// Run an interactive session on stdin
    Play(PlayArgs),

    /// Show or change engine settings in `<root>/.env`
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    Show,
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    Validate { file: PathBuf },
    /// Validate and publish every flow in a directory
    Publish { dir: PathBuf },
}

#[derive(Args, Debug)]
struct PlayArgs {
    /// Directory of flow documents
    #[arg(long)]
    flows: PathBuf,

    /// YAML or JSON list of entities
    #[arg(long)]
    entities: PathBuf,

    /// Seed entity, as `Kind:id`
    #[arg(long)]
    seed: EntityRef,

    #[arg(long, default_value = "student")]
    owner: String,
}

/// Resolve the courseflow root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("COURSEFLOW_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./courseflow")
    }
}

fn flow_store() -> FlowStore {
    FlowStore::new(Arc::new(BehaviorRegistry::with_builtins()))
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    if cli.log_files {
        let logs = root.join("logs");
        init_tracing(
            &cli.log_level,
            Some(&logs.join("courseflow.log")),
            Some(&logs.join("courseflow.json")),
        )?;
    } else {
        init_tracing(&cli.log_level, None, None)?;
    }

    match cli.command {
        Commands::Schema => {
            let out_dir = root.join("schemas");
            write_schema(&out_dir)?;
            println!("Schemas written to {}", out_dir.display());
        }
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => {
                validate_flow_file(&file)?;
                println!("✅ Flow file is valid.");
            }
            FlowCommands::Publish { dir } => {
                let store = flow_store();
                for flow in publish_dir(&store, &dir)? {
                    println!("📦 {} ({})", flow.name, flow.id);
                }
            }
        },
        Commands::Config(args) => {
            let config = ConfigManager(EnvConfigManager::new(root.join(".env")));
            match args.command {
                ConfigCommands::Show => {
                    for (key, value) in engine_keys(&config).await {
                        println!("{key}={value}");
                    }
                }
                ConfigCommands::Set { key, value } => {
                    config.0.set(&key, &value).await?;
                    EngineConfig::load(&config)
                        .await
                        .context("Setting produced an invalid configuration")?;
                    println!("✅ Config updated.");
                }
                ConfigCommands::Delete { key } => {
                    config.0.del(&key).await;
                    println!("✅ Config deleted.");
                }
            }
        }
        Commands::Play(args) => {
            let config = ConfigManager(EnvConfigManager::new(root.join(".env")));
            let engine_config = EngineConfig::load(&config)
                .await
                .context("Invalid configuration")?;
            play(args, engine_config).await?;
        }
    }
    Ok(())
}

fn print_step(step: &Step) {
    let kind = match step.sub_kind {
        Some(sub) => format!("{:?}/{:?}", step.kind, sub),
        None => format!("{:?}", step.kind),
    };
    println!("[{kind}] {}", step.text.as_deref().unwrap_or_default());
    if !step.options.is_empty() {
        println!("    options: {}", step.options.join(", "));
    }
}

fn print_reply(reply: &Reply) {
    for step in &reply.batch {
        print_step(step);
    }
    match &reply.next {
        Some(step) => print_step(step),
        None => println!("🏁 done"),
    }
}

async fn play(args: PlayArgs, config: EngineConfig) -> anyhow::Result<()> {
    let flows = Arc::new(flow_store());
    publish_dir(&flows, &args.flows)?;
    let entities = Arc::new(InMemoryEntityStore::new());
    load_entities_file(&entities, &args.entities)?;

    let tutor = Tutor::new(flows, entities, config);
    let reply = tutor.start_session(&args.owner, args.seed.clone()).await?;
    let session: Uuid = reply.session;
    info!("session {session} started");
    print_reply(&reply);

    println!("(answer, or /help <text>, /resource Kind:id, /update Kind:id, /quit)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let result = if line == "/quit" {
            break;
        } else if let Some(text) = line.strip_prefix("/help ") {
            tutor.request_help(session, text).await.map(|item| {
                println!("queued help item {item}");
                None
            })
        } else if let Some(thread) = line.strip_prefix("/resource ") {
            match thread.parse::<EntityRef>() {
                Ok(thread) => tutor.open_resource(session, thread).await.map(Some),
                Err(e) => {
                    println!("🛑 {e}");
                    continue;
                }
            }
        } else if let Some(thread) = line.strip_prefix("/update ") {
            match thread.parse::<EntityRef>() {
                Ok(thread) => tutor.flag_update(session, thread).await.map(|_| None),
                Err(e) => {
                    println!("🛑 {e}");
                    continue;
                }
            }
        } else {
            tutor.submit_input(session, line).await.map(Some)
        };

        match result {
            Ok(Some(reply)) => {
                print_reply(&reply);
                if reply.next.is_none() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => println!("🛑 {e}"),
        }
    }

    if tutor.session(session).await.is_none() {
        bail!("session {session} expired");
    }
    tutor.end_session(session).await?;
    Ok(())
}
