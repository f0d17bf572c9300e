use std::fmt::Display;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Args, Parser, Subcommand};
use gemchat_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use gemchat_contracts::session::{
    AttachmentKind, ConfigUpdate, ModelName, Role, SessionConfig, SessionState, Turn,
    DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE,
};
use gemchat_contracts::ChatError;
use gemchat_engine::{
    AttachProgress, CancelToken, ChatEngine, Exchange, GeminiGateway, Progress, RawUpload,
    UploadStage,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gemchat", version, about = "Terminal chat with Gemini models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat session.
    Chat(ChatArgs),
    /// Send one prompt and print the reply.
    Ask(AskArgs),
    /// Print a saved conversation file.
    Show(ShowArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long, default_value = "gemchat-session")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "gemini-exp-1206")]
    model: String,
    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    temperature: f64,
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
    system_prompt: String,
    /// `gemini` or `dryrun`.
    #[arg(long, default_value = "gemini")]
    gateway: String,
    #[arg(long)]
    load: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long, default_value = "")]
    prompt: String,
    #[arg(long)]
    image: Vec<PathBuf>,
    #[arg(long)]
    video: Vec<PathBuf>,
    #[arg(long)]
    save: Option<PathBuf>,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct ShowArgs {
    file: PathBuf,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gemchat error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Ask(args) => run_ask(args),
        Command::Show(args) => run_show(args),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .try_init();
}

fn build_engine(args: &SessionArgs) -> Result<ChatEngine> {
    let config = SessionConfig {
        model_name: ModelName::from_str(&args.model)?,
        temperature: SessionConfig::validate_temperature(args.temperature)?,
        system_prompt: args.system_prompt.clone(),
    };
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = ChatEngine::new(&args.out, Some(events_path), config)?;
    engine.select_gateway(&args.gateway)?;
    if engine.gateway_name() == "gemini" && !GeminiGateway::from_env().has_api_key() {
        eprintln!(
            "warning: GEMINI_API_KEY or GOOGLE_API_KEY is not set; sends will fail. \
             Use --gateway dryrun to try gemchat offline."
        );
    }
    if let Some(path) = args.load.as_deref() {
        engine
            .load(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    tracing::info!(
        session_id = engine.session_id(),
        gateway = engine.gateway_name(),
        out_dir = %args.out.display(),
        "session ready"
    );
    Ok(engine)
}

/// Ctrl-C state for the whole process. While an operation runs it trips
/// `cancel`; at an idle prompt it ends the process.
#[derive(Clone, Default)]
struct Interrupts {
    cancel: CancelToken,
    at_prompt: Arc<AtomicBool>,
}

impl Interrupts {
    fn install() -> Result<Self> {
        let interrupts = Self::default();
        let handler = interrupts.clone();
        ctrlc::set_handler(move || {
            if handler.interrupt() {
                println!();
                println!("Interrupted.");
                std::process::exit(130);
            }
        })
        .context("failed to install Ctrl-C handler")?;
        Ok(interrupts)
    }

    /// Returns true when nothing is running and the process should exit.
    fn interrupt(&self) -> bool {
        self.cancel.cancel();
        self.at_prompt.load(Ordering::SeqCst)
    }

    fn waiting_for_input(&self, waiting: bool) {
        if waiting {
            self.cancel.reset();
        }
        self.at_prompt.store(waiting, Ordering::SeqCst);
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let mut engine = build_engine(&args.session)?;
    let interrupts = Interrupts::install()?;
    let cancel = interrupts.cancel.clone();

    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "gemchat started ({}, temperature {:.1}). Type /help for commands.",
        engine.config().model_name,
        engine.config().temperature
    );
    if !engine.turns().is_empty() {
        print_history(engine.turns());
    }

    loop {
        interrupts.waiting_for_input(true);
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = stdin.read_line(&mut line);
        interrupts.waiting_for_input(false);
        let read = match read {
            Ok(read) => Some(read),
            Err(err) if err.kind() == ErrorKind::Interrupted => None,
            Err(err) => return Err(err.into()),
        };
        if cancel.is_cancelled() {
            println!("Interrupted.");
            break;
        }
        match read {
            Some(0) => break,
            Some(_) => {}
            None => continue,
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "quit" => break,
            "set_model" => handle_set_model(&mut engine, &intent),
            "set_temperature" => handle_set_temperature(&mut engine, &intent),
            "set_system_prompt" => match system_prompt_arg(&intent) {
                Some(prompt) => {
                    let cleared = prompt.is_empty();
                    report_outcome(
                        engine.set_config(&ConfigUpdate::system_prompt(prompt)),
                        |_| {
                            if cleared {
                                println!("System prompt cleared.");
                            } else {
                                println!("System prompt updated.");
                            }
                        },
                    );
                }
                None => println!("System prompt: {}", engine.config().system_prompt),
            },
            "attach_image" | "attach_video" | "attach" => {
                let expected = match intent.action.as_str() {
                    "attach_image" => Some(AttachmentKind::Image),
                    "attach_video" => Some(AttachmentKind::Video),
                    _ => None,
                };
                let Some(path) = intent.arg_str("path") else {
                    println!("/{} requires a path", command_name(&intent));
                    continue;
                };
                handle_attach(&mut engine, Path::new(path), expected, &cancel);
            }
            "detach" => {
                let dropped = engine.detach();
                println!("Dropped {dropped} staged attachment(s).");
            }
            "save" => {
                let destination = intent.arg_str("path").map(PathBuf::from);
                report_outcome(engine.save(destination.as_deref()), |path| {
                    println!("Saved conversation to {}", path.display())
                });
            }
            "load" => {
                let Some(path) = intent.arg_str("path") else {
                    println!("/load requires a path");
                    continue;
                };
                report_outcome(engine.load(Path::new(path)), |_| {
                    println!("Loaded {} turn(s) from {path}", engine.turns().len());
                    print_history(engine.turns());
                });
            }
            "clear" => {
                engine.clear();
                println!("Conversation cleared.");
            }
            "history" => {
                if engine.turns().is_empty() {
                    println!("No messages yet.");
                } else {
                    print_history(engine.turns());
                }
            }
            "show_config" => {
                let config = engine.config();
                println!("Model: {}", config.model_name);
                println!("Temperature: {:.2}", config.temperature);
                println!("System prompt: {}", config.system_prompt);
                println!("Gateway: {}", engine.gateway_name());
                println!("Staged attachments: {}", engine.staged().len());
                if let Some(reason) = engine.last_fallback_reason() {
                    println!("Last routing: {reason}");
                }
            }
            "list_models" => {
                let current = engine.config().model_name.as_str().to_string();
                for spec in engine.models() {
                    let marker = if spec.name == current { "*" } else { " " };
                    let selectable = ModelName::from_str(&spec.name).is_ok();
                    println!(
                        "{marker} {} [{}]{}",
                        spec.name,
                        spec.capabilities.join(", "),
                        if selectable { "" } else { " (video fallback only)" }
                    );
                }
            }
            "retry" => {
                let outcome = engine.retry(&cancel);
                report_outcome(outcome, print_exchange);
            }
            "send" => {
                let prompt = intent.prompt.clone().unwrap_or_default();
                println!("Thinking... (Ctrl-C to cancel)");
                let outcome = engine.submit(&prompt, &cancel);
                report_outcome(outcome, print_exchange);
            }
            "unknown" => {
                println!("Unknown command /{}. Type /help.", command_name(&intent));
            }
            other => {
                println!("Unhandled action: {other}");
            }
        }
    }

    engine.finish()?;
    Ok(())
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let mut engine = build_engine(&args.session)?;
    let cancel = Interrupts::install()?.cancel;

    let uploads = args
        .image
        .iter()
        .map(|path| (path, Some(AttachmentKind::Image)))
        .chain(args.video.iter().map(|path| (path, Some(AttachmentKind::Video))));
    for (path, expected) in uploads {
        let upload = RawUpload::from_path(path);
        let file_name = upload.file_name.clone();
        engine
            .attach(upload, expected, &cancel, |progress| {
                if let AttachProgress::Upload(stage) = progress {
                    eprintln!("{}", stage_line(&file_name, stage));
                }
            })
            .with_context(|| format!("failed to attach {}", path.display()))?;
    }

    let exchange = engine.submit(&args.prompt, &cancel)?;
    if let Some(reason) = exchange.fallback_reason.as_deref() {
        eprintln!("note: {reason} Using {}.", exchange.model);
    }
    println!("{}", exchange.reply.text());

    if let Some(destination) = args.save.as_deref() {
        engine.save(Some(destination))?;
    }
    engine.finish()?;
    Ok(0)
}

fn run_show(args: ShowArgs) -> Result<i32> {
    let mut state = SessionState::new();
    state
        .load(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let config = state.config();
    println!(
        "Model: {} | Temperature: {:.2} | System prompt: {}",
        config.model_name, config.temperature, config.system_prompt
    );
    print_history(state.turns());
    Ok(0)
}

fn handle_set_model(engine: &mut ChatEngine, intent: &Intent) {
    let Some(raw) = intent
        .settings_update
        .get("model_name")
        .and_then(Value::as_str)
    else {
        println!("Model: {}", engine.config().model_name);
        return;
    };
    let update = ModelName::from_str(raw).map(ConfigUpdate::model);
    report_outcome(
        update.and_then(|update| engine.set_config(&update)),
        |_| println!("Model set to {raw}"),
    );
}

fn handle_set_temperature(engine: &mut ChatEngine, intent: &Intent) {
    if let Some(value) = intent
        .settings_update
        .get("temperature")
        .and_then(Value::as_f64)
    {
        report_outcome(engine.set_config(&ConfigUpdate::temperature(value)), |_| {
            println!("Temperature set to {value:.2}")
        });
        return;
    }
    match intent.arg_str("temperature") {
        Some(raw) => println!("Invalid temperature '{raw}'. Expected a number in [0, 1]."),
        None => println!("Temperature: {:.2}", engine.config().temperature),
    }
}

fn handle_attach(
    engine: &mut ChatEngine,
    path: &Path,
    expected: Option<AttachmentKind>,
    cancel: &CancelToken,
) {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let mut mid_line = false;
    let outcome = engine.attach(RawUpload::from_path(path), expected, cancel, |progress| {
        match progress {
            AttachProgress::Reading(progress) => {
                print!("\r{}", progress_line(&file_name, progress));
                let _ = io::stdout().flush();
                mid_line = true;
            }
            AttachProgress::Upload(stage) => {
                if mid_line {
                    println!();
                    mid_line = false;
                }
                println!("{}", stage_line(&file_name, stage));
            }
        }
    });
    if mid_line {
        println!();
    }
    report_outcome(outcome, |attachment| {
        println!(
            "Staged {} ({}, {}). It will be sent with your next message.",
            file_name,
            attachment.mime_type(),
            human_bytes(attachment.size_bytes())
        )
    });
}

/// `/system` alone shows the prompt; `/system ""` or `/system ''` clears it.
fn system_prompt_arg(intent: &Intent) -> Option<String> {
    let raw = intent
        .command_args
        .get("prompt")
        .and_then(Value::as_str)?
        .trim();
    match raw {
        "" => None,
        "\"\"" | "''" => Some(String::new()),
        prompt => Some(prompt.to_string()),
    }
}

fn report_outcome<T>(outcome: Result<T, ChatError>, on_ok: impl FnOnce(T)) {
    match outcome {
        Ok(value) => on_ok(value),
        Err(err) => println!("{}", describe_error(&err)),
    }
}

fn describe_error(err: &ChatError) -> String {
    match err {
        ChatError::Cancelled => "Cancelled. Nothing was added to the conversation.".to_string(),
        ChatError::Provider(provider) if provider.is_transient() => {
            format!("Error: {provider}. Type /retry to resend.")
        }
        ChatError::Provider(provider) => {
            format!("Error: {provider}. Check your input, model or API key.")
        }
        other => format!("Error [{}]: {other}", other.code()),
    }
}

fn print_exchange(exchange: Exchange) {
    if let Some(reason) = exchange.fallback_reason.as_deref() {
        println!("({reason} Used {}.)", exchange.model);
    }
    println!("{}", render_turn(&exchange.reply, &Local));
    if exchange.context.alert_level != "ok" {
        println!(
            "Context usage {:.0}% ({}).",
            exchange.context.pct * 100.0,
            exchange.context.alert_level
        );
    }
}

fn print_history(turns: &[Turn]) {
    for turn in turns {
        println!("{}", render_turn(turn, &Local));
    }
}

fn command_name(intent: &Intent) -> String {
    intent
        .arg_str("command")
        .map(str::to_string)
        .unwrap_or_else(|| {
            intent
                .raw
                .trim()
                .trim_start_matches('/')
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string()
        })
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "You",
        Role::Assistant => "Gemini",
        Role::System => "System",
    }
}

fn render_turn<Tz>(turn: &Turn, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let clock = turn.timestamp().with_timezone(tz).format("%I:%M %p");
    let mut out = format!("[{clock}] {}: {}", role_label(turn.role()), turn.text());
    for attachment in turn.attachments() {
        let marker = match attachment.kind() {
            AttachmentKind::Image => "[Image attached]",
            AttachmentKind::Video => "[Video attached]",
        };
        out.push(' ');
        out.push_str(marker);
    }
    out
}

fn progress_line(file_name: &str, progress: Progress) -> String {
    format!(
        "Reading {file_name}: {:>3.0}% ({} / {})",
        progress.percent(),
        human_bytes(progress.processed_bytes),
        human_bytes(progress.total_bytes)
    )
}

fn stage_line(file_name: &str, stage: UploadStage) -> String {
    match stage {
        UploadStage::Uploading { total_bytes } => {
            format!("Uploading {file_name} ({})...", human_bytes(total_bytes))
        }
        UploadStage::Uploaded => "Upload completed.".to_string(),
        UploadStage::Processing { check } => format!("Processing video... (check {check})"),
        UploadStage::Ready => format!("{file_name} is ready."),
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
