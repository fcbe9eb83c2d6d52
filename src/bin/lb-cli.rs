use clap::{Parser, Subcommand, ValueEnum};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "lb-cli")]
#[command(about = "Management CLI for adaptive-lb", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "LB_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check balancer status
    Status,
    /// List every pool with its servers
    Pools,
    /// Show one pool
    Pool { id: String },
    /// Show one server
    Server { id: String },
    /// Drain and remove a server
    Drain {
        id: String,
        /// Remove immediately, even with calls in flight
        #[arg(long)]
        force: bool,
    },
    /// Toggle maintenance mode for a server
    Maintenance { id: String, mode: Toggle },
    /// Probe a server immediately
    Probe { id: String },
    /// Show a pool's alert history
    Alerts { pool: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", cli.key))?);

    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Pools => client.get(format!("{}/admin/pools", base)),
        Commands::Pool { id } => client.get(format!("{}/admin/pools/{}", base, id)),
        Commands::Server { id } => client.get(format!("{}/admin/servers/{}", base, id)),
        Commands::Drain { id, force } => client
            .delete(format!("{}/admin/servers/{}", base, id))
            .query(&[("force", force)]),
        Commands::Maintenance { id, mode } => client
            .put(format!("{}/admin/servers/{}/maintenance", base, id))
            .json(&json!({ "enabled": matches!(mode, Toggle::On) })),
        Commands::Probe { id } => client.post(format!("{}/admin/servers/{}/probe", base, id)),
        Commands::Alerts { pool } => client.get(format!("{}/admin/pools/{}/alerts", base, pool)),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    if status == reqwest::StatusCode::NO_CONTENT {
        println!("OK");
        return Ok(());
    }
    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
