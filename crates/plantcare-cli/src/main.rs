//! Terminal client for the plant-care chat endpoint.

mod render;
mod replay;

use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use plantcare_chat::{
    Anonymous, ChatConfig, ChatSession, CredentialProvider, HttpChatTransport,
    RefreshingCredentials, RequestMethod, SubmissionResult, SubmitOutcome, init_observability,
    require_auth,
};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::info;

use crate::render::StagedPrinter;

#[derive(Parser)]
#[command(author, version, about = "Ask for plant recommendations from the terminal", long_about = None)]
struct Cli {
    /// Backend base URL (overrides PLANTCARE_API_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// `post` sends the conversation as JSON, `get` sends only the prompt as `?q=`
    #[arg(long, global = true)]
    method: Option<RequestMethod>,
    /// Refuse to start without an access token
    #[arg(long, global = true)]
    require_auth: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat; one prompt per line, `/quit` to leave
    Chat,
    /// Sends a single prompt and prints the reply
    Ask { prompt: String },
    /// Runs a captured reply body through the segmenter
    Replay {
        file: PathBuf,
        #[arg(long, default_value_t = 16)]
        chunk_size: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_observability();

    let Cli {
        base_url,
        method,
        require_auth,
        command,
    } = Cli::parse();

    if let Command::Replay { file, chunk_size } = &command {
        replay::replay_file(file, *chunk_size, &mut io::stdout()).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = ChatConfig::from_env()?;
    if let Some(url) = base_url {
        config = config.base_url(url);
    }
    if let Some(method) = method {
        config = config.method(method);
    }
    if require_auth {
        config = config.require_auth(true);
    }
    config.validate()?;
    let session = connect(&config).await?;

    let code = match command {
        Command::Ask { prompt } => {
            let result = run_prompt(&session, &prompt).await?;
            if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Chat => {
            chat_loop(&session).await?;
            ExitCode::SUCCESS
        }
        Command::Replay { .. } => ExitCode::SUCCESS,
    };
    session.close();
    Ok(code)
}

async fn connect(config: &ChatConfig) -> anyhow::Result<ChatSession> {
    let credentials: Arc<dyn CredentialProvider> =
        if config.access_token.is_some() || config.refresh_token.is_some() {
            Arc::new(RefreshingCredentials::from_config(config)?)
        } else {
            Arc::new(Anonymous)
        };
    if config.require_auth {
        require_auth(credentials.as_ref())
            .await
            .context("sign in first: set PLANTCARE_ACCESS_TOKEN")?;
    }

    let transport = HttpChatTransport::new(config, credentials)?;
    let session = ChatSession::builder(Arc::new(transport))
        .stream_buffer_capacity(config.stream_buffer_capacity)
        .build()?;
    info!(url = %config.chat_url(), method = %config.method, "chat session ready");
    Ok(session)
}

async fn chat_loop(session: &ChatSession) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if matches!(prompt, "/quit" | "/exit") {
            break;
        }
        if let Err(err) = run_prompt(session, prompt).await {
            eprintln!("error: {err:#}");
        }
    }
    Ok(())
}

/// Submits one prompt and renders the reply as it streams. Ctrl-C cancels the reply.
async fn run_prompt(session: &ChatSession, prompt: &str) -> anyhow::Result<SubmissionResult> {
    let mut watch = session.subscribe();
    let submission = match session.submit(prompt) {
        SubmitOutcome::Accepted(submission) => submission,
        SubmitOutcome::Ignored(reason) => anyhow::bail!("prompt ignored: {reason:?}"),
    };
    let message_id = submission.message_id().to_string();
    let mut printer = StagedPrinter::default();
    let mut stdout = io::stdout();

    let wait = submission.wait();
    tokio::pin!(wait);
    loop {
        tokio::select! {
            result = &mut wait => {
                if let Some(message) = session.snapshot().find(&message_id) {
                    printer.render(message, &mut stdout)?;
                }
                let result = result?;
                if let Some(failure) = &result.failure {
                    eprintln!("reply failed: {failure}");
                } else if let Some(degradation) = &result.degradation {
                    eprintln!("note: {degradation}");
                }
                return Ok(result);
            }
            changed = watch.changed() => {
                changed?;
                if let Some(message) = watch.snapshot().find(&message_id) {
                    printer.render(message, &mut stdout)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                session.cancel();
            }
        }
    }
}
