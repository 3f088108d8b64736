//! `clawbody-cli` – ClawBody Command Line Interface
//!
//! The `clawbody` binary puts an agent into a robot body.  It:
//!
//! 1. Checks for `~/.clawbody/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Builds the collaborators for the configured mode: the simulated robot
//!    with a keyboard console standing in for speech, or the behavior daemon
//!    with the realtime speech provider and a microphone pump.
//! 3. Starts a [`Session`] and runs until the session ends or **Ctrl-C**
//!    asks for a graceful shutdown.

mod config;
mod console;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clawbody_hal::{DaemonCamera, SimCamera};
use clawbody_middleware::{DaemonPlatform, RealtimeConfig, RealtimeWsTransport, SimPlatform};
use clawbody_perception::{BrightSpotDetector, RemoteDetector, TargetDetector};
use clawbody_runtime::{
    GatewayClient, GatewayConfig, GatewaySceneDescriber, Session, SessionConfig, SessionDeps,
    SpeechHandle, agent_persona, init_tracing,
};
use clawbody_types::{BodyError, SPEECH_SAMPLE_RATE};

use config::{Config, RunMode};

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(120);
const PERSONA_TIMEOUT: Duration = Duration::from_secs(20);
const CAMERA_TIMEOUT: Duration = Duration::from_secs(2);
const DETECTOR_TIMEOUT: Duration = Duration::from_secs(1);
const MIC_BLOCK_MS: u32 = 100;
const MIC_RETRY: Duration = Duration::from_millis(500);

fn main() {
    let telemetry = init_tracing("clawbody");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    debug!(config = ?cfg, "effective configuration");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            drop(telemetry);
            std::process::exit(1);
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let stop = CancellationToken::new();
    let stop_on_signal = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        stop_on_signal.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let result = runtime.block_on(run(cfg, stop));
    // The console reader thread may still be parked on stdin.
    runtime.shutdown_timeout(Duration::from_secs(2));

    match result {
        Ok(()) => println!("{}", "  ✓ Body released. Goodbye.".green()),
        Err(e) => {
            println!("{}: {}", "Session failed".red().bold(), e);
            drop(telemetry);
            std::process::exit(1);
        }
    }
}

async fn run(cfg: Config, stop: CancellationToken) -> Result<(), BodyError> {
    let gateway = Arc::new(GatewayClient::new(GatewayConfig {
        base_url: cfg.gateway_url.clone(),
        token: Some(cfg.gateway_token.as_str().to_owned()).filter(|t| !t.is_empty()),
        agent_id: cfg.agent_id.clone(),
        session_key: cfg.session_key.clone(),
        timeout: GATEWAY_TIMEOUT,
    })?);

    let mut session_config = SessionConfig::default();
    session_config.perception.rate_hz = cfg.perception_hz;
    session_config.registry_refresh = Duration::from_secs(cfg.registry_refresh_secs);

    println!(
        "\n  Starting in {} mode (agent {} at {})",
        cfg.mode.to_string().bold(),
        cfg.agent_id.bold(),
        cfg.gateway_url.dimmed()
    );

    let (deps, microphone) = match cfg.mode {
        RunMode::Sim => (sim_deps(gateway), None),
        RunMode::Hardware => {
            let (deps, daemon) = hardware_deps(&cfg, gateway).await?;
            (deps, Some(daemon))
        }
    };

    let session = Session::start(session_config, deps).await?;
    println!(
        "  {} {} behaviors available",
        "✓".green().bold(),
        session.registry().snapshot().len()
    );

    let pump = microphone.map(|daemon| {
        tokio::spawn(pump_microphone(daemon, session.speech().clone(), stop.clone()))
    });

    let reason = tokio::select! {
        _ = stop.cancelled() => "operator interrupt",
        _ = session.closed() => "session ended",
    };
    info!(reason, "shutting down");

    stop.cancel();
    if let Some(pump) = pump {
        let _ = pump.await;
    }
    session.shutdown(reason).await;
    Ok(())
}

fn sim_deps(gateway: Arc<GatewayClient>) -> SessionDeps {
    let platform = Arc::new(SimPlatform::with_demo_catalog());
    let (camera, _control) = SimCamera::new(320, 240);
    SessionDeps {
        platform: platform.clone(),
        store: platform,
        camera: Box::new(camera),
        detector: Box::new(BrightSpotDetector::default()),
        describer: None,
        transport: Box::new(console::ConsoleTransport::new()),
        gateway,
    }
}

async fn hardware_deps(
    cfg: &Config,
    gateway: Arc<GatewayClient>,
) -> Result<(SessionDeps, Arc<DaemonPlatform>), BodyError> {
    if cfg.speech_api_key.is_empty() {
        return Err(BodyError::Config(
            "hardware mode needs speech_api_key (or CLAWBODY_SPEECH_API_KEY)".into(),
        ));
    }
    let daemon = Arc::new(DaemonPlatform::new(cfg.daemon_url.clone())?);
    let camera = DaemonCamera::new(&cfg.daemon_url, &cfg.camera, CAMERA_TIMEOUT)?;
    let detector: Box<dyn TargetDetector> = match &cfg.detector_url {
        Some(url) => Box::new(RemoteDetector::new(url.clone(), DETECTOR_TIMEOUT)?),
        None => Box::new(BrightSpotDetector::default()),
    };

    print!("  Fetching agent persona … ");
    let _ = std::io::stdout().flush();
    let persona = agent_persona(gateway.as_ref(), PERSONA_TIMEOUT).await;
    println!("{}", "done".green());

    let transport = RealtimeWsTransport::new(RealtimeConfig {
        url: cfg.speech_url.clone(),
        api_key: cfg.speech_api_key.as_str().to_owned(),
        model: cfg.speech_model.clone(),
        voice: cfg.speech_voice.clone(),
        instructions: persona,
        ..RealtimeConfig::default()
    });

    let deps = SessionDeps {
        platform: daemon.clone(),
        store: daemon.clone(),
        camera: Box::new(camera),
        detector,
        describer: Some(Arc::new(GatewaySceneDescriber(Arc::clone(&gateway)))),
        transport: Box::new(transport),
        gateway,
    };
    Ok((deps, daemon))
}

/// Stream the robot's microphone into the speech channel until `stop`.
async fn pump_microphone(daemon: Arc<DaemonPlatform>, speech: SpeechHandle, stop: CancellationToken) {
    loop {
        let block = tokio::select! {
            _ = stop.cancelled() => break,
            block = daemon.read_microphone(MIC_BLOCK_MS) => block,
        };
        match block {
            Ok(samples) if samples.is_empty() => {}
            Ok(samples) => {
                if !speech.send_audio(samples, SPEECH_SAMPLE_RATE) {
                    debug!("microphone block dropped");
                }
            }
            Err(e) => {
                warn!(error = %e, "microphone read failed");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(MIC_RETRY) => {}
                }
            }
        }
    }
    debug!("microphone pump stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      ClawBody First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's give your agent a body.\n");

    let mut cfg = Config::default();

    println!("  Which body should the agent drive?");
    println!("    1) Simulated robot, type to talk  (default)");
    println!("    2) Real robot via the behavior daemon");
    if prompt_line("  Enter choice [1]: ", "1").trim() == "2" {
        cfg.mode = RunMode::Hardware;
    }

    cfg.gateway_url = prompt_line(
        &format!("  Agent gateway URL [{}]: ", cfg.gateway_url),
        &cfg.gateway_url,
    );
    let token = prompt_line("  Gateway token (leave empty for none): ", "");
    cfg.gateway_token = token.into();

    if cfg.mode == RunMode::Hardware {
        cfg.daemon_url = prompt_line(
            &format!("  Behavior daemon URL [{}]: ", cfg.daemon_url),
            &cfg.daemon_url,
        );
        let key = prompt_line("  Speech provider API key: ", "");
        cfg.speech_api_key = key.into();
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }

    config::apply_env_overrides(&mut cfg);
    cfg
}

/// Print `prompt`, read one line, and return it trimmed (or `default` when
/// the line is empty or stdin is closed).
fn prompt_line(prompt: &str, default: &str) -> String {
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
    let mut buf = String::new();
    match std::io::stdin().read_line(&mut buf) {
        Ok(_) if !buf.trim().is_empty() => buf.trim().to_string(),
        _ => default.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    ________                ____            __     "#.bold().cyan());
    println!("{}", r#"   / ____/ /___ __      __/ __ )____  ____/ /_  __"#.bold().cyan());
    println!("{}", r#"  / /   / / __ `/ | /| / / __  / __ \/ __  / / / /"#.bold().cyan());
    println!("{}", r#" / /___/ / /_/ /| |/ |/ / /_/ / /_/ / /_/ / /_/ / "#.bold().cyan());
    println!("{}", r#" \____/_/\__,_/ |__/|__/_____/\____/\__,_/\__, /  "#.bold().cyan());
    println!("{}", r#"                                         /____/   "#.bold().cyan());
    println!();
    println!(
        "  {}  v{}",
        "An agent, embodied.".dimmed(),
        env!("CARGO_PKG_VERSION")
    );
    println!();
}
