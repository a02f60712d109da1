mod logging;
mod settings;
mod token_store;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use log::{debug, error};
use qwen_client::config::ProfileKind;
use qwen_client::{
    extract_token, ChatOutput, QwenClient, QwenError, SendOptions, ToolCallAccumulator,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::token_store::TokenStore;

#[derive(Parser)]
#[command(name = "qwen-cli")]
#[command(about = "Chat with Qwen from the terminal")]
#[command(version)]
struct Cli {
    /// Wire profile: portal or web
    #[arg(long)]
    profile: Option<String>,

    /// Model to use instead of the profile default
    #[arg(long)]
    model: Option<String>,

    /// Ask the model to think before answering
    #[arg(long)]
    thinking: bool,

    /// Config file (default: ~/.qwen-client/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize this machine with the device-code flow
    Login,
    /// Send a single message and print the reply
    Ask {
        /// Message content
        prompt: String,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        /// Wait for the whole reply and show finish reason and token usage
        #[arg(long)]
        no_stream: bool,
    },
    /// Store a session token copied from the browser (a JWT or a whole
    /// `Cookie` header containing `token=...`)
    SetToken {
        value: String,
    },
    /// Start an interactive chat (`q` quits, `new` starts a new thread)
    Chat,
    /// Forget stored tokens
    Logout,
    /// Show the stored login and settings
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.debug);

    let config_path = cli.config.clone().unwrap_or_else(settings::default_config_path);
    let mut config = settings::load_config(&config_path)?;
    if let Some(profile) = cli.profile.as_deref() {
        config.profile = ProfileKind::parse(profile)
            .with_context(|| format!("Unknown profile '{profile}', expected portal or web"))?;
    }
    if let Some(model) = cli.model.clone() {
        config.model = Some(model);
    }
    debug!("Using config {:?}", config);

    let client = QwenClient::new(config).context("Failed to build client")?;
    let store = TokenStore::default_location();
    client.set_token_lease(store.load().await).await;

    let options = SendOptions {
        thinking: cli.thinking.then_some(true),
        ..SendOptions::default()
    };

    let outcome = match cli.command {
        Commands::Login => login(&client).await,
        Commands::Ask {
            prompt,
            system,
            no_stream,
        } => {
            let options = SendOptions { system, ..options };
            if no_stream {
                ask_buffered(&client, &prompt, options).await
            } else {
                ask(&client, &prompt, options).await
            }
        }
        Commands::SetToken { value } => {
            let token = extract_token(&value).unwrap_or_else(|| value.trim().to_string());
            client.set_tokens(token, None).await;
            println!("{}", "Token stored.".green());
            Ok(())
        }
        Commands::Chat => chat_loop(&client, &options).await,
        Commands::Logout => {
            client.logout().await;
            println!("{}", "Logged out.".green());
            Ok(())
        }
        Commands::Status => status(&client, &store).await,
    };

    // Refreshes may have rotated the lease even when the command failed.
    let saved = store.sync(client.token_lease().await.as_ref()).await;
    merge_outcome(outcome, saved)
}

/// The command's own error wins; a failed token save is then only logged.
fn merge_outcome(outcome: Result<()>, saved: Result<()>) -> Result<()> {
    match (outcome, saved) {
        (Err(command), Err(save)) => {
            error!("Failed to save tokens: {save:#}");
            Err(command)
        }
        (Err(command), Ok(())) => Err(command),
        (Ok(()), saved) => saved,
    }
}

async fn login(client: &QwenClient) -> Result<()> {
    let lease = client
        .authenticate(|code| {
            println!();
            println!("  Open this URL to authorize:");
            println!("     {}", code.verification_url.cyan());
            println!();
            println!("  Code: {}", code.user_code.bold());
            if let Some(expires_in) = code.expires_in {
                println!("  (expires in {expires_in} seconds)");
            }
            println!();
            println!("  Waiting for authorization...");
        })
        .await
        .context("Login failed")?;

    println!(
        "{}",
        format!("Authenticated, token valid until {}", lease.expires_at).green()
    );
    Ok(())
}

async fn ask(client: &QwenClient, prompt: &str, options: SendOptions) -> Result<()> {
    stream_reply(client, prompt, options).await?;
    println!();
    Ok(())
}

async fn ask_buffered(client: &QwenClient, prompt: &str, options: SendOptions) -> Result<()> {
    let completion = client.complete(prompt, options).await.map_err(explain)?;
    println!("{}", completion.text());
    for call in completion.tool_calls() {
        println!("{} {}({})", "tool call:".yellow(), call.name.bold(), call.arguments);
    }

    let finish = completion.finish_reason().unwrap_or("unknown");
    match completion.usage {
        Some(usage) => println!(
            "{}",
            format!(
                "[{finish}] {} prompt + {} completion = {} tokens",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            )
            .dimmed()
        ),
        None => println!("{}", format!("[{finish}]").dimmed()),
    }
    Ok(())
}

async fn chat_loop(client: &QwenClient, options: &SendOptions) -> Result<()> {
    println!(
        "{}",
        format!("Chatting with {} (q to quit, new for a new thread)", client.model()).dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".bold());
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "q" => break,
            "new" => {
                client.new_thread().await;
                println!("{}", "Started a new thread.".dimmed());
                continue;
            }
            prompt => {
                if let Err(e) = stream_reply(client, prompt, options.clone()).await {
                    eprintln!("{}", format!("Error: {e:#}").red());
                }
                println!();
            }
        }
    }
    Ok(())
}

/// Print text deltas as they arrive, then any completed tool calls.
async fn stream_reply(client: &QwenClient, prompt: &str, options: SendOptions) -> Result<()> {
    let mut stream = client.send(prompt, options).await.map_err(explain)?;
    let mut tools = ToolCallAccumulator::new();

    while let Some(output) = stream.next().await {
        match output.map_err(explain)? {
            ChatOutput::Text(delta) => {
                print!("{delta}");
                std::io::stdout().flush().ok();
            }
            ChatOutput::ToolCall(delta) => tools.push(&delta),
        }
    }

    for call in tools.into_tool_calls() {
        println!();
        println!(
            "{} {}({})",
            "tool call:".yellow(),
            call.name.bold(),
            call.arguments
        );
    }
    Ok(())
}

async fn status(client: &QwenClient, store: &TokenStore) -> Result<()> {
    println!("Profile:    {:?}", client.profile().kind());
    println!("Model:      {}", client.model());
    println!("Token file: {}", store.path().display());

    match client.token_lease().await {
        Some(lease) => {
            let remaining = lease.expires_at - chrono::Utc::now();
            if remaining > chrono::Duration::zero() {
                println!(
                    "Login:      {} (expires in {} min)",
                    "active".green(),
                    remaining.num_minutes()
                );
            } else if lease.can_refresh() {
                println!("Login:      {} (will refresh on next use)", "expired".yellow());
            } else {
                println!("Login:      {} (run `qwen-cli login`)", "expired".red());
            }
        }
        None => println!("Login:      {} (run `qwen-cli login`)", "none".red()),
    }
    Ok(())
}

fn explain(err: QwenError) -> anyhow::Error {
    if err.is_unauthorized() {
        anyhow::Error::new(err).context("Not logged in or session expired, run `qwen-cli login`")
    } else {
        anyhow::Error::new(err)
    }
}
