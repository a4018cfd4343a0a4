use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use serde_json::json;
use serde_json::Value;
use tmxed_core::Config;
use tmxed_core::GateChoice;
use tmxed_core::JobError;
use tmxed_core::Payload;
use tmxed_exec::EngineProcess;
use tmxed_exec::HttpChannel;
use tmxed_exec::JobController;
use tracing_subscriber::EnvFilter;

mod ui;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Parser)]
#[command(name = "tmxed", version, about = "Drive a TMX engine from the command line")]
struct Cli {
    /// Config file (defaults to the user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,
    /// Show busy transitions and the activity log.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Engine version information.
    Info,
    /// Character sets known to the engine.
    Charsets,
    /// All language codes known to the engine.
    Languages,
    Validate {
        file: PathBuf,
    },
    /// Strip invalid characters from a file.
    Clean {
        file: PathBuf,
    },
    Split {
        file: PathBuf,
        #[arg(long, default_value_t = 2)]
        parts: u64,
    },
    Merge {
        output: PathBuf,
        #[arg(required = true, num_args = 2..)]
        files: Vec<PathBuf>,
    },
    /// Open a document and report its unit count.
    Open(DocumentArgs),
    Replace {
        #[command(flatten)]
        doc: DocumentArgs,
        #[arg(long)]
        search: String,
        #[arg(long)]
        replace: String,
        #[arg(long)]
        regex: bool,
        /// Restrict the replacement to one language.
        #[arg(long)]
        lang: Option<String>,
    },
    RemoveTags(DocumentArgs),
    RemoveDuplicates(DocumentArgs),
    RemoveUntranslated(DocumentArgs),
    RemoveSpaces(DocumentArgs),
    RemoveSameAsSource(DocumentArgs),
    ChangeLanguage {
        #[command(flatten)]
        doc: DocumentArgs,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    Consolidate(DocumentArgs),
    ExportDelimited {
        #[command(flatten)]
        doc: DocumentArgs,
        output: PathBuf,
    },
    ExportExcel {
        #[command(flatten)]
        doc: DocumentArgs,
        output: PathBuf,
    },
}

#[derive(Debug, Args)]
struct DocumentArgs {
    file: PathBuf,
    /// Save the document after the operation.
    #[arg(long)]
    save: bool,
    /// Save to a new location (implies --save).
    #[arg(long)]
    save_as: Option<PathBuf>,
}

/// What a subcommand asks of the engine.
enum Job {
    Single(&'static str, Payload),
    Document(DocumentArgs, Option<(&'static str, Payload)>),
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        if let Some(message) = exit_message(err.as_ref()) {
            eprintln!("{message}");
        }
        std::process::exit(1);
    }
}

/// Job failures were already reported through the notification stream.
fn exit_message(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    if err.is::<JobError>() {
        return None;
    }
    Some(format!("error: {err}"))
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    let channel = Arc::new(HttpChannel::from_config(&config.engine)?);
    let engine = match &config.engine.launch {
        Some(launch) => {
            let engine =
                EngineProcess::launch(launch, channel.as_ref(), config.engine.startup_timeout())
                    .await?;
            tracing::info!(
                pid = ?engine.id(),
                version = ?engine.info().version,
                build = ?engine.info().build,
                "engine launched"
            );
            Some(engine)
        }
        None => None,
    };

    let (controller, mut notifications) = JobController::new(channel.clone(), &config);
    let verbose = cli.verbose;
    let printer = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            ui::emit(&notification, verbose);
        }
    });

    let result = execute(&controller, job_for(cli.command)).await;

    if verbose {
        ui::print_activity(&controller.activity());
    }
    drop(controller);
    // Spawned round trips may still hold the controller for a moment.
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    if let Some(engine) = engine {
        engine.shutdown().await;
    }
    result
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TMXED_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> CliResult<Config> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => dirs::config_dir().map(|dir| dir.join("tmxed").join("config.toml")),
    };
    let mut config = match path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    if let Some(host) = &cli.host {
        config.engine.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.engine.port = port;
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.polling.interval_ms = interval;
    }
    Ok(config)
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn path_arg(path: &std::path::Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn job_for(command: Command) -> Job {
    match command {
        Command::Info => Job::Single("systemInfo", Payload::new()),
        Command::Charsets => Job::Single("getCharsets", Payload::new()),
        Command::Languages => Job::Single("getAllLanguages", Payload::new()),
        Command::Validate { file } => {
            Job::Single("validateFile", payload(json!({ "file": path_arg(&file) })))
        }
        Command::Clean { file } => {
            Job::Single("cleanCharacters", payload(json!({ "file": path_arg(&file) })))
        }
        Command::Split { file, parts } => Job::Single(
            "splitFile",
            payload(json!({ "file": path_arg(&file), "parts": parts })),
        ),
        Command::Merge { output, files } => {
            let files: Vec<Value> = files.iter().map(|file| path_arg(file)).collect();
            Job::Single(
                "mergeFiles",
                payload(json!({ "merged": path_arg(&output), "files": files })),
            )
        }
        Command::Open(doc) => Job::Document(doc, None),
        Command::Replace {
            doc,
            search,
            replace,
            regex,
            lang,
        } => {
            let mut args = payload(json!({
                "search": search,
                "replace": replace,
                "regExp": regex,
            }));
            if let Some(lang) = lang {
                args.insert("lang".to_string(), Value::String(lang));
            }
            Job::Document(doc, Some(("replaceText", args)))
        }
        Command::RemoveTags(doc) => Job::Document(doc, Some(("removeTags", Payload::new()))),
        Command::RemoveDuplicates(doc) => {
            Job::Document(doc, Some(("removeDuplicates", Payload::new())))
        }
        Command::RemoveUntranslated(doc) => {
            Job::Document(doc, Some(("removeUntranslated", Payload::new())))
        }
        Command::RemoveSpaces(doc) => Job::Document(doc, Some(("removeSpaces", Payload::new()))),
        Command::RemoveSameAsSource(doc) => {
            Job::Document(doc, Some(("removeSameAsSource", Payload::new())))
        }
        Command::ChangeLanguage { doc, from, to } => Job::Document(
            doc,
            Some((
                "changeLanguage",
                payload(json!({ "oldLanguage": from, "newLanguage": to })),
            )),
        ),
        Command::Consolidate(doc) => {
            Job::Document(doc, Some(("consolidateUnits", Payload::new())))
        }
        Command::ExportDelimited { doc, output } => Job::Document(
            doc,
            Some(("exportDelimited", payload(json!({ "output": path_arg(&output) })))),
        ),
        Command::ExportExcel { doc, output } => Job::Document(
            doc,
            Some(("exportExcel", payload(json!({ "output": path_arg(&output) })))),
        ),
    }
}

async fn execute(controller: &JobController, job: Job) -> CliResult<()> {
    match job {
        Job::Single(name, args) => {
            let data = controller.run(name, args).await?;
            ui::print_result(name, &data);
            Ok(())
        }
        Job::Document(doc, step) => run_document(controller, doc, step).await,
    }
}

/// Open, run one operation, optionally save, then close. Unsaved changes are
/// discarded on close unless `--save` was given.
async fn run_document(
    controller: &JobController,
    doc: DocumentArgs,
    step: Option<(&'static str, Payload)>,
) -> CliResult<()> {
    let opened = controller.open(doc.file.clone()).outcome().await?;
    ui::print_result("openFile", &opened);

    let outcome = match step {
        Some((name, args)) => controller.run(name, args).await.map(|data| {
            ui::print_result(name, &data);
        }),
        None => Ok(()),
    };

    let saved = match (&outcome, doc.save || doc.save_as.is_some()) {
        (Ok(()), true) => controller.save(doc.save_as.clone()).outcome().await.map(|_| ()),
        _ => Ok(()),
    };

    let close = controller.close();
    if controller.awaiting_gate_choice() {
        controller.resolve_gate(GateChoice::Discard);
    }
    close.outcome().await?;

    outcome?;
    saved?;
    Ok(())
}
