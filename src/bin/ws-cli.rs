use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;

use websocket_resources::dispatch::{DispatchError, DispatchResponse, Dispatcher};
use websocket_resources::net::{close_code, connect, ClientConfig};
use websocket_resources::observability::RequestLogger;
use websocket_resources::protocol::{RequestMessage, ResponseMessage};
use websocket_resources::session::SessionContext;

#[derive(Parser)]
#[command(name = "ws-cli")]
#[command(about = "Command-line client for the WebSocket resource protocol", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "ws://localhost:8080/v1/websocket/")]
    url: String,

    /// Username as `account` or `account.device`.
    #[arg(short, long)]
    login: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    /// Send `X-Receive-Stories: true`.
    #[arg(long)]
    receive_stories: bool,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Request {
        path: String,

        #[arg(short = 'X', long, default_value = "GET")]
        verb: String,

        /// `Name: value`, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        #[arg(short, long)]
        body: Option<String>,
    },
    /// Print requests pushed by the server and acknowledge them
    Listen,
}

/// Prints every inbound request and answers 200.
struct PrintingDispatcher;

impl Dispatcher for PrintingDispatcher {
    fn dispatch(
        &self,
        _context: Arc<SessionContext>,
        request: RequestMessage,
    ) -> BoxFuture<'_, Result<DispatchResponse, DispatchError>> {
        async move {
            let id = request.id.map_or_else(|| "-".to_string(), |id| id.to_string());
            println!("<= {} {} (id {})", request.verb, request.path, id);
            for header in &request.headers {
                println!("   {}", header);
            }
            if let Some(body) = &request.body {
                println!("{}", render_body(body));
            }
            Ok(DispatchResponse::ok())
        }
        .boxed()
    }
}

fn render_body(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(json) => serde_json::to_string_pretty(&json).unwrap_or_default(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

fn print_response(response: &ResponseMessage) {
    println!("{} {}", response.status, response.message);
    for header in &response.headers {
        println!("{}", header);
    }
    if let Some(body) = &response.body {
        println!();
        println!("{}", render_body(body));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = ClientConfig::new(&cli.url).with_receive_stories(cli.receive_stories);
    if let (Some(login), Some(password)) = (&cli.login, &cli.password) {
        config = config.with_credentials(login, password);
    }

    let dispatcher: Arc<dyn Dispatcher> = match cli.command {
        Commands::Listen => Arc::new(PrintingDispatcher),
        Commands::Request { .. } => Arc::new(websocket_resources::dispatch::NoDispatcher),
    };
    let client = connect(config, dispatcher, RequestLogger::disabled()).await?;

    match cli.command {
        Commands::Request {
            path,
            verb,
            headers,
            body,
        } => {
            let mut request = RequestMessage::new(verb.to_uppercase(), path);
            request.headers = headers;
            if let Some(body) = body {
                request = request.with_body(body.into_bytes());
            }

            let response = client
                .handle
                .send_request_with_timeout(request, Duration::from_secs(cli.timeout_secs))
                .await?;
            print_response(&response);
            client.handle.close(close_code::NORMAL, "Done");
        }
        Commands::Listen => {
            println!("Connected to {}; waiting for requests (Ctrl+C to quit)", cli.url);
            tokio::select! {
                _ = client.handle.closed() => println!("Connection closed by server"),
                _ = tokio::signal::ctrl_c() => client.handle.close(close_code::NORMAL, "Bye"),
            }
        }
    }

    client.task.await?;
    Ok(())
}
