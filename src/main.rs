use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use ssc_signal_lib::config::ServerConfig;
use ssc_signal_lib::peer::ice::probe_ice_server;
use ssc_signal_lib::{
    init_logging, ConfigError, EngineFactory, LogConfig, LoopbackFactory, Orchestrator,
    OrchestratorConfig, OrchestratorStatus, PeerId, Role, SessionError, SignalingBus,
    WebRtcEngineFactory,
};

const PROBE_WAIT: Duration = Duration::from_secs(10);
const POLL_PERIOD: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "ssc-signal")]
#[command(version, about = "Teacher/student signaling orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Teacher and student in one process on a shared bus
    Demo {
        /// Use the in-memory engine instead of webrtc
        #[arg(long)]
        loopback: bool,

        /// Seconds to wait for the connection
        #[arg(long, default_value_t = 15)]
        timeout: u64,

        /// JSON config (ids, ICE servers, timings)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Student id, overrides the config
        #[arg(long)]
        student: Option<String>,
    },

    /// Check that a STUN/TURN server answers
    ProbeIce {
        /// Server address, scheme is optional
        #[arg(long)]
        url: String,

        #[arg(long = "type", value_enum, default_value_t = ServerKind::Stun)]
        kind: ServerKind,

        #[arg(long, env = "SSC_TURN_USERNAME")]
        username: Option<String>,

        #[arg(long, env = "SSC_TURN_CREDENTIAL")]
        credential: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ServerKind {
    Stun,
    Turn,
}

impl ServerKind {
    fn as_str(self) -> &'static str {
        match self {
            ServerKind::Stun => "stun",
            ServerKind::Turn => "turn",
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to render status: {0}")]
    Render(#[from] serde_json::Error),
    #[error("ice server {0} is not reachable")]
    Unreachable(String),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    init_logging(&LogConfig::default());
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            loopback,
            timeout,
            config,
            student,
        } => {
            let config = match config {
                Some(path) => OrchestratorConfig::load(path)?,
                None => OrchestratorConfig::default(),
            };
            let student = student
                .map(PeerId::new)
                .unwrap_or_else(|| config.local_id.clone());
            run_demo(config, student, loopback, Duration::from_secs(timeout)).await
        }
        Commands::ProbeIce {
            url,
            kind,
            username,
            credential,
        } => {
            let server = ServerConfig {
                id: "probe".into(),
                r#type: kind.as_str().into(),
                url: url.clone(),
                username,
                credential,
            };
            if probe_ice_server(&server, PROBE_WAIT).await {
                println!("{} server {} is reachable", kind.as_str(), url);
                Ok(())
            } else {
                Err(CliError::Unreachable(url))
            }
        }
    }
}

async fn run_demo(
    config: OrchestratorConfig,
    student: PeerId,
    loopback: bool,
    timeout: Duration,
) -> Result<(), CliError> {
    let factory: Arc<dyn EngineFactory> = if loopback {
        Arc::new(LoopbackFactory::new())
    } else {
        let ice = config.ice.clone().with_env_fallback();
        ice.validate()?;
        Arc::new(WebRtcEngineFactory::new(ice))
    };

    let bus = SignalingBus::new();
    let coordinator_id = config.coordinator_id.clone();
    let teacher = Orchestrator::new(
        bus.clone(),
        factory.clone(),
        OrchestratorConfig {
            local_id: coordinator_id.clone(),
            roles: vec![Role::Coordinator],
            ..config.clone()
        },
    )?;
    let pupil = Orchestrator::new(
        bus,
        factory,
        OrchestratorConfig {
            local_id: student.clone(),
            roles: vec![Role::Subordinate],
            ..config
        },
    )?;
    teacher.spawn_refresh_loop();
    pupil.spawn_refresh_loop();

    teacher.start_serving().await?;
    pupil.connect(&coordinator_id).await?;
    info!(student = %student, coordinator = %coordinator_id, "waiting for connection");

    let (t, p) = (&teacher, &pupil);
    let connected = poll_until(timeout, || async move {
        t.refresh().await;
        p.refresh().await;
        p.get_state().is_connected && !t.get_state().active_sessions.is_empty()
    })
    .await;
    print_status("teacher", &teacher.get_state())?;
    print_status("student", &pupil.get_state())?;
    if !connected {
        warn!(timeout_s = timeout.as_secs(), "connection not established in time");
    }

    teacher.stop_serving().await?;
    let dropped = poll_until(Duration::from_secs(2), || async move {
        p.get_state().local_session_info.is_none()
    })
    .await;
    info!(dropped, "student after server stop");
    print_status("student", &pupil.get_state())?;

    pupil.shutdown().await;
    teacher.shutdown().await;
    Ok(())
}

async fn poll_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_PERIOD).await;
    }
}

fn print_status(label: &str, status: &OrchestratorStatus) -> Result<(), CliError> {
    println!("{label}: {}", serde_json::to_string_pretty(status)?);
    Ok(())
}
