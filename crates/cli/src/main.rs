use {
    clap::{Args, Parser, Subcommand},
    serde_json::{Value, json},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "tiller", about = "Tiller — remote device control gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Override the configured bind address.
        #[arg(long)]
        bind: Option<String>,
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Log the service session in through the admin surface.
    Login {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        token: String,
        #[command(flatten)]
        admin: AdminArgs,
    },
    /// Tear the service session down.
    Logout {
        #[command(flatten)]
        admin: AdminArgs,
    },
    /// Send a command to the device through the service session.
    Send {
        /// Command code.
        #[arg(long)]
        code: u32,
        /// Command data as JSON.
        #[arg(short, long, default_value = "null")]
        data: String,
        /// Explicit recipient, tried before all other candidates.
        #[arg(long)]
        to: Option<String>,
        #[command(flatten)]
        admin: AdminArgs,
    },
    /// Show service session status.
    Status {
        #[command(flatten)]
        admin: AdminArgs,
    },
}

/// How to reach a running gateway's administrative surface.
#[derive(Args)]
struct AdminArgs {
    /// Gateway base URL.
    #[arg(long, env = "TILLER_GATEWAY_URL", default_value = "http://127.0.0.1:18790")]
    gateway_url: String,

    /// Admin bearer token.
    #[arg(long, env = "TILLER_ADMIN_TOKEN")]
    admin_token: Option<String>,
}

impl AdminArgs {
    async fn get(&self, path: &str) -> anyhow::Result<()> {
        let req = reqwest::Client::new().get(self.url(path));
        self.finish(req).await
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<()> {
        let req = reqwest::Client::new().post(self.url(path)).json(&body);
        self.finish(req).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.gateway_url.trim_end_matches('/'))
    }

    async fn finish(&self, mut req: reqwest::RequestBuilder) -> anyhow::Result<()> {
        if let Some(token) = &self.admin_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        println!("{}", serde_json::to_string_pretty(&body)?);
        if !status.is_success() {
            anyhow::bail!("gateway returned {status}");
        }
        Ok(())
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command {
        Commands::Gateway { bind, port } => {
            info!(version = env!("CARGO_PKG_VERSION"), "tiller starting");
            let mut config = tiller_config::discover_and_load();
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            tiller_gateway::server::start_gateway(config).await
        },
        Commands::Login {
            identity,
            token,
            admin,
        } => {
            admin
                .post(
                    "/api/service/login",
                    json!({ "identity": identity, "token": token }),
                )
                .await
        },
        Commands::Logout { admin } => admin.post("/api/service/logout", json!({})).await,
        Commands::Send {
            code,
            data,
            to,
            admin,
        } => {
            let data: Value = serde_json::from_str(&data)
                .map_err(|e| anyhow::anyhow!("--data is not valid JSON: {e}"))?;
            let mut body = json!({ "payload": { "code": code, "data": data } });
            if let Some(to) = to {
                body["recipientOverride"] = Value::String(to);
            }
            admin.post("/api/service/command", body).await
        },
        Commands::Status { admin } => admin.get("/api/service/status").await,
    }
}
