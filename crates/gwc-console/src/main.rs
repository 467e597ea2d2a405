use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gwc_core::approvals::ApprovalStatus;
use gwc_core::credentials::{CredentialState, ModelList};
use gwc_live::config::parse_bool_flag;
use gwc_live::connectivity::{ConnectivityPublisher, HeartbeatMonitor};
use gwc_live::credentials::CredentialChecker;
use gwc_live::dashboard::{Dashboard, DashboardOptions, DashboardView};
use gwc_live::pairing::{ChannelSpec, PairingOptions, PairingSession, PairingView};
use gwc_live::push::{PushConnector, ReconnectPolicy, SseConnector, WebSocketConnector};
use gwc_live::visibility::VisibilitySignal;
use gwc_live::{ConsoleConfig, GatewayClient};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gwc-console", about = "Live gateway status and channel pairing")]
struct Args {
    /// Gateway base url; overrides GWC_GATEWAY_URL.
    #[arg(long, global = true)]
    gateway: Option<String>,
    #[arg(long, global = true)]
    poll_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow gateway connectivity, issues and machine metrics.
    Status {
        #[arg(long, value_enum, default_value_t = Transport::Sse)]
        transport: Transport,
    },
    /// Pair a messaging channel.
    Pair {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        account: Option<String>,
        /// Connect a token-based channel instead of scanning a code.
        #[arg(long)]
        token: Option<String>,
        /// Poll for inbound contact requests once connected.
        #[arg(long, default_value_t = false)]
        inbound: bool,
    },
    /// Validate a provider key and list its models.
    CheckKey {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Sse,
    Ws,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    let config = load_config(&args)?;
    info!(event = "console_start", gateway = %config.gateway_url);
    let client = Arc::new(GatewayClient::new(config.clone()).context("building http client")?);

    match args.command {
        Command::Status { transport } => {
            let url = client.metric_stream_url();
            match transport {
                Transport::Sse => {
                    let http = SseConnector::streaming_client(config.request_timeout)?;
                    run_status(client, SseConnector::new(http, url), &config).await
                }
                Transport::Ws => {
                    let connector = WebSocketConnector::from_http(&url)?;
                    run_status(client, connector, &config).await
                }
            }
        }
        Command::Pair {
            channel,
            account,
            token,
            inbound,
        } => {
            let mut spec = match token {
                Some(_) => ChannelSpec::token(channel),
                None => ChannelSpec::qr(channel),
            };
            if let Some(account) = account {
                spec = spec.with_account(account);
            }
            if inbound {
                spec = spec.with_inbound_approval();
            }
            run_pair(client, spec, token, &config).await
        }
        Command::CheckKey { provider, key } => run_check_key(client, &provider, &key, &config).await,
    }
}

fn load_config(args: &Args) -> Result<ConsoleConfig> {
    let mut config = ConsoleConfig::from_env().context("reading GWC_* environment")?;
    if let Some(url) = args.gateway.as_deref() {
        config.set_gateway_url(url)?;
    }
    if let Some(ms) = args.poll_ms.filter(|ms| *ms > 0) {
        config.poll_interval = Duration::from_millis(ms);
    }
    Ok(config)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = std::env::var("GWC_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false);
    if stdout_enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

async fn run_status<C: PushConnector>(
    client: Arc<GatewayClient>,
    metrics: C,
    config: &ConsoleConfig,
) -> Result<()> {
    let signal = VisibilitySignal::default();
    let (publisher, shared) = ConnectivityPublisher::new();
    let _heartbeat = HeartbeatMonitor::spawn(
        client.clone(),
        publisher,
        signal.subscribe(),
        config.heartbeat_interval,
        config.heartbeat_misses,
    );
    let options = DashboardOptions {
        poll_interval: config.poll_interval,
        metric_policy: ReconnectPolicy::Fixed(config.reconnect_delay),
        suspend_metrics_when_hidden: config.suspend_metrics_when_hidden,
    };
    let dashboard = Dashboard::spawn(client, metrics, shared, signal.subscribe(), options);

    let mut views = dashboard.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut last = Vec::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                let lines = status_lines(&view);
                if lines != last {
                    for line in &lines {
                        println!("{line}");
                    }
                    last = lines;
                }
            }
        }
    }
    info!(event = "console_stop");
    Ok(())
}

fn status_lines(view: &DashboardView) -> Vec<String> {
    let gateway = view.snapshot.as_ref().map(|snapshot| &snapshot.gateway);
    let latency = gateway
        .and_then(|gateway| gateway.latency_ms)
        .map(|ms| format!("{ms}ms"))
        .unwrap_or_else(|| "-".to_string());
    let version = gateway
        .and_then(|gateway| gateway.version.clone())
        .unwrap_or_else(|| "-".to_string());
    let gauges = if view.gauges.is_empty() {
        "no metrics".to_string()
    } else {
        view.gauges
            .iter()
            .map(|gauge| format!("{} {:.0}% {}", gauge.label, gauge.percent, gauge.level.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut lines = vec![format!(
        "gateway {} latency={latency} version={version} metrics={} [{gauges}]",
        view.verdict,
        if view.metrics_connected { "live" } else { "down" },
    )];
    lines.extend(view.issues.iter().map(|issue| {
        format!("  [{}] {}: {}", issue.severity, issue.title, issue.detail)
    }));
    lines
}

async fn run_pair(
    client: Arc<GatewayClient>,
    spec: ChannelSpec,
    token: Option<String>,
    config: &ConsoleConfig,
) -> Result<()> {
    let http = SseConnector::streaming_client(config.request_timeout)?;
    client
        .pairing_stream_url(&spec.id, spec.account.as_deref())
        .context("building pairing stream url")?;
    let streams = client.clone();
    let connectors = move |spec: &ChannelSpec| {
        let url = match streams.pairing_stream_url(&spec.id, spec.account.as_deref()) {
            Ok(url) => url.to_string(),
            Err(err) => {
                warn!(event = "pairing_url_invalid", channel = %spec.id, error = %err);
                streams.config().endpoint(&streams.config().pairing_stream_path)
            }
        };
        SseConnector::new(http.clone(), url)
    };
    let signal = VisibilitySignal::default();
    let options = PairingOptions {
        approval_poll_interval: config.approval_poll_interval,
        ..PairingOptions::default()
    };
    let session = PairingSession::spawn(client, connectors, signal.subscribe(), options);

    session.select_channel(spec).await?;
    if let Some(token) = token {
        session.connect_with_token(token).await?;
    }
    println!("commands: approve <code> | retry | quit");

    let mut views = session.subscribe();
    let mut printer = PairingPrinter::default();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                printer.print(&view);
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let mut words = line.split_whitespace();
                match (words.next(), words.next()) {
                    (Some("approve"), Some(code)) => session.approve(code).await?,
                    (Some("retry"), None) => session.retry(true).await?,
                    (Some("quit"), None) => break,
                    (None, _) => {}
                    _ => println!("unknown command: {}", line.trim()),
                }
            }
        }
    }
    session.close().await?;
    info!(event = "console_stop");
    Ok(())
}

#[derive(Default)]
struct PairingPrinter {
    phase: Option<String>,
    code: Option<String>,
    last_log: Option<String>,
    error: Option<String>,
    approval_error: Option<String>,
    approvals: HashMap<String, ApprovalStatus>,
}

impl PairingPrinter {
    fn print(&mut self, view: &PairingView) {
        if let Some(attempt) = view.attempt.as_ref() {
            let phase = attempt.phase.to_string();
            if self.phase.as_deref() != Some(phase.as_str()) {
                println!("phase: {phase}");
                self.phase = Some(phase);
            }
            if attempt.code.is_some() && attempt.code != self.code {
                if let Some(code) = attempt.code.as_deref() {
                    println!("code: {code}");
                }
            }
            self.code = attempt.code.clone();
            let last_log = attempt.log_tail.back().cloned();
            if last_log.is_some() && last_log != self.last_log {
                if let Some(line) = last_log.as_deref() {
                    println!("log: {line}");
                }
            }
            self.last_log = last_log;
            if attempt.error_message.is_some() && attempt.error_message != self.error {
                if let Some(error) = attempt.error_message.as_deref() {
                    println!("error: {error}");
                }
            }
            self.error = attempt.error_message.clone();
        }

        for entry in &view.approvals {
            let code = &entry.request.code;
            if self.approvals.get(code) == Some(&entry.status) {
                continue;
            }
            let sender = entry.request.sender_name.as_deref().unwrap_or("unknown sender");
            println!("contact {code} ({sender}): {}", entry.status.as_str());
            self.approvals.insert(code.clone(), entry.status);
        }
        if view.approval_error.is_some() && view.approval_error != self.approval_error {
            if let Some(error) = view.approval_error.as_deref() {
                println!("approval failed: {error}");
            }
        }
        self.approval_error = view.approval_error.clone();
    }
}

async fn run_check_key(
    client: Arc<GatewayClient>,
    provider: &str,
    key: &str,
    config: &ConsoleConfig,
) -> Result<()> {
    let checker = CredentialChecker::spawn(client, config.key_debounce);
    checker.edit(provider, key).await?;
    let state = tokio::select! {
        state = checker.settled() => state?,
        _ = tokio::signal::ctrl_c() => return Ok(()),
    };

    match state {
        CredentialState::Idle => println!("no key given"),
        CredentialState::Pending { provider } => println!("{provider}: still checking"),
        CredentialState::Invalid { provider, error } => println!("{provider}: invalid ({error})"),
        CredentialState::Valid { provider, models } => {
            println!("{provider}: valid");
            match models {
                ModelList::Ready(models) if models.is_empty() => println!("  no models listed"),
                ModelList::Ready(models) => {
                    for model in models {
                        println!("  {} ({})", model.id, model.name);
                    }
                }
                ModelList::Failed(error) => println!("  model listing failed: {error}"),
                ModelList::Loading => println!("  models still loading"),
            }
        }
    }
    Ok(())
}
