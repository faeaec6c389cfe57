//! Interactive terminal chat with the financial assistant.

#[macro_use]
extern crate tracing;

use std::io::Write as _;
use std::process::ExitCode;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use market_agent::config::{Credentials, Settings};
use market_agent::core::{AgentEvent, CancellationToken, ErrorKind};
use market_agent::usage::{JsonFileStore, UsageTracker};
use market_agent::{Error, Session, SessionBuilder};
use owo_colors::OwoColorize;
use tokio::io::{self, AsyncBufReadExt};
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::sleep;

const BAR_CHAR: &str = "▎";
const MAX_RESULT_PREVIEW_CHARS: usize = 120;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let session = match start_session(move |event| {
        event_tx.send(event).ok();
    }) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{} {err}", "error:".bright_red().bold());
            return ExitCode::FAILURE;
        }
    };

    println!(
        "{}📈 Financial assistant ready. Type {} for tool usage, {} to quit.",
        BAR_CHAR.bright_cyan(),
        "/stats".bold(),
        "/exit".bold()
    );
    match repl(session, event_rx).await {
        Exit::Quit => ExitCode::SUCCESS,
        Exit::Interrupted => {
            // The pending stdin read would keep the runtime from shutting
            // down.
            std::process::exit(130);
        }
    }
}

enum Exit {
    Quit,
    Interrupted,
}

fn start_session(
    on_event: impl Fn(AgentEvent) + Send + Sync + 'static,
) -> Result<Session, Error> {
    let settings = Settings::load()?;
    let credentials = Credentials::from_env()?;
    let usage =
        UsageTracker::load(JsonFileStore::new(settings.analytics.path.clone()))?;
    info!("using model {}", settings.llm.openai.model_name);

    let session = SessionBuilder::new(settings, credentials)
        .with_usage_tracker(usage)
        .on_event(on_event)
        .build()?;
    Ok(session)
}

async fn repl(
    mut session: Session,
    mut event_rx: UnboundedReceiver<AgentEvent>,
) -> Exit {
    let progress_style = ProgressStyle::with_template("{spinner} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        // Once the handler is installed Ctrl-C no longer kills the
        // process, so the prompt has to watch for it too.
        let line = match prompt(read_line(), tokio::signal::ctrl_c()).await {
            Input::Line(line) => line,
            Input::Eof => return Exit::Quit,
            Input::Interrupted => {
                println!();
                return Exit::Interrupted;
            }
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => return Exit::Quit,
            "/stats" => {
                println!("\n{}\n", session.usage().stats().await);
                continue;
            }
            _ => {}
        }

        let cancel = CancellationToken::new();
        let turn = session.ask(line, &cancel);
        tokio::pin!(turn);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut progress_bar: Option<ProgressBar> = None;
        let mut streaming = false;
        let result = loop {
            if !streaming {
                // Create a new progress bar if it has been finished.
                progress_bar
                    .get_or_insert_with(|| {
                        let progress_bar = ProgressBar::new_spinner();
                        progress_bar.set_style(progress_style.clone());
                        progress_bar.set_message("🤔 Thinking...");
                        progress_bar
                    })
                    .inc(1);
            }

            let event = select! {
                biased;
                Some(event) = event_rx.recv() => event,
                result = &mut turn => break result,
                _ = &mut ctrl_c, if !cancel.is_cancelled() => {
                    cancel.cancel();
                    continue;
                }
                _ = sleep(Duration::from_millis(100)) => continue,
            };

            // Finish the progress bar before printing anything else.
            if let Some(progress_bar) = progress_bar.take() {
                progress_bar.finish_and_clear();
            }
            print_event(event, &mut streaming);
        };

        if let Some(progress_bar) = progress_bar.take() {
            progress_bar.finish_and_clear();
        }
        while let Ok(event) = event_rx.try_recv() {
            print_event(event, &mut streaming);
        }
        if streaming {
            println!();
        }

        match result {
            Ok(_) => println!(),
            Err(err) if err.kind() == ErrorKind::Cancelled => {
                println!("{}⏹  Cancelled.\n", BAR_CHAR.bright_yellow());
            }
            Err(err) => {
                println!("{}❌ {err}\n", BAR_CHAR.bright_red());
            }
        }
    }
}

enum Input {
    Line(String),
    Eof,
    Interrupted,
}

async fn prompt<R, I>(read: R, interrupt: I) -> Input
where
    R: Future<Output = Option<String>>,
    I: Future<Output = std::io::Result<()>>,
{
    select! {
        line = read => line.map_or(Input::Eof, Input::Line),
        // A failed handler disables this branch.
        Ok(()) = interrupt => Input::Interrupted,
    }
}

fn print_event(event: AgentEvent, streaming: &mut bool) {
    match event {
        AgentEvent::MessageDelta(delta) => {
            if !*streaming {
                print!("{}🤖 ", BAR_CHAR.bright_cyan());
                *streaming = true;
            }
            print!("{}", delta.bright_white());
            std::io::stdout().flush().ok();
        }
        AgentEvent::ToolCall(req) => {
            if std::mem::take(streaming) {
                println!();
            }
            println!(
                "{}🔧 {} {}",
                BAR_CHAR.bright_yellow(),
                req.name.bold(),
                req.arguments.dimmed()
            );
        }
        AgentEvent::ToolResult { result, is_error } => {
            let preview: String = result
                .content
                .chars()
                .take(MAX_RESULT_PREVIEW_CHARS)
                .collect::<String>()
                .replace('\n', " ");
            if is_error {
                println!("{}⚠️  {}", BAR_CHAR.bright_red(), preview.red());
            } else {
                println!("{}✅ {}", BAR_CHAR.bright_green(), preview.dimmed());
            }
        }
    }
}

async fn read_line() -> Option<String> {
    let mut stdin = io::BufReader::new(io::stdin());
    let mut line = String::new();

    match stdin.read_line(&mut line).await {
        Ok(count) => {
            if count == 0 {
                return None;
            }
            Some(line)
        }
        Err(err) => {
            error!("error reading input: {}", err);
            None
        }
    }
}
