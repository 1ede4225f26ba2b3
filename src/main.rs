//! Entry point for `jrpc`.
//!
//! Parses CLI arguments and dispatches into either **call** or **serve** mode. Protocol work is
//! delegated to the library; `main.rs` owns prompting, logging setup and printing outcomes.

use std::{io::Write, path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use jrpc::{
    Address, Client, Config, Envelope, FixedReply, Outcome, ReplyMode, Result, RpcError, Server,
    DEFAULT_CONFIG_PATH,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Send one JSON request to a server and print the reply.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send a single request. Missing fields are prompted for.
    Call {
        /// Configuration file providing `server_address`.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Server address, overriding the configuration file.
        #[arg(short, long)]
        address: Option<String>,
        /// Give up after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Read the reply until the server closes instead of taking the first chunk.
        #[arg(long)]
        until_close: bool,
        #[arg(short, long)]
        method: Option<String>,
        /// Params separated by spaces.
        #[arg(short, long, allow_hyphen_values = true)]
        params: Option<String>,
        /// Param types separated by spaces.
        #[arg(short = 't', long, allow_hyphen_values = true)]
        param_types: Option<String>,
    },
    /// Run a server that answers every request with a fixed message.
    Serve {
        /// Configuration file providing `server_address`.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Address to listen on, overriding the configuration file.
        #[arg(short, long)]
        address: Option<String>,
        /// Reply sent for every request.
        #[arg(long, default_value = "Have a nice day!")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "jrpc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.mode {
        Mode::Call {
            config,
            address,
            timeout_ms,
            until_close,
            method,
            params,
            param_types,
        } => {
            let input = RequestInput {
                method,
                params,
                param_types,
            };
            call(config, address, timeout_ms, until_close, input).await
        }
        Mode::Serve {
            config,
            address,
            message,
        } => serve(config, address, message).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("An error occurred: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Request fields given on the command line.
struct RequestInput {
    method: Option<String>,
    params: Option<String>,
    param_types: Option<String>,
}

async fn call(
    config_path: PathBuf,
    address: Option<String>,
    timeout_ms: Option<u64>,
    until_close: bool,
    input: RequestInput,
) -> Result<ExitCode> {
    let mut client = match address {
        Some(address) => Client::new(address.parse()?),
        None => Config::load(&config_path)?.client()?,
    };
    if let Some(ms) = timeout_ms {
        client = client.with_timeout(Duration::from_millis(ms));
    }
    if until_close {
        client = client.with_reply_mode(ReplyMode::UntilClose);
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let method = answer(input.method, &mut stdin, "Please enter a method --> ").await?;
    let params = answer(
        input.params,
        &mut stdin,
        "Please enter params separated by spaces. --> ",
    )
    .await?;
    let param_types = answer(
        input.param_types,
        &mut stdin,
        "Please enter params_type separated by spaces. --> ",
    )
    .await?;

    if method.is_empty() {
        return Err(RpcError::Validation("method must not be empty".into()));
    }
    let envelope = Envelope::build(&method, &params, &param_types)?;
    println!("{}", serde_json::to_string_pretty(&envelope)?);

    Ok(match client.execute(envelope).await {
        Outcome::Reply(payload) => {
            println!("Received: {}", String::from_utf8_lossy(&payload));
            ExitCode::SUCCESS
        }
        Outcome::Disconnected => {
            println!("Client: disconnected from server");
            ExitCode::SUCCESS
        }
        Outcome::TransportError(e) => {
            eprintln!("Transport error ({}): {}", client.address(), e);
            ExitCode::FAILURE
        }
    })
}

/// Returns `given`, or prompts for a line on stdin.
async fn answer(
    given: Option<String>,
    stdin: &mut Lines<BufReader<Stdin>>,
    question: &str,
) -> Result<String> {
    if let Some(value) = given {
        return Ok(value);
    }
    print!("{}", question);
    std::io::stdout().flush()?;
    Ok(stdin.next_line().await?.unwrap_or_default())
}

async fn serve(config_path: PathBuf, address: Option<String>, message: String) -> Result<ExitCode> {
    let address: Address = match address {
        Some(address) => address.parse()?,
        None => Config::load(&config_path)?.address()?,
    };
    let server = Server::new(FixedReply::new(message)).bind(&address).await?;
    println!("Server listening on {}", address);
    server.run().await?;
    Ok(ExitCode::SUCCESS)
}
