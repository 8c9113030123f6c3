use crate::channels::{
    run_message_dispatch_loop, spawn_supervised_listener, BridgeChannel, Channel, ConsoleChannel,
    MessageHandler, Replier, DEFAULT_MAX_IN_FLIGHT_MESSAGES,
};
use crate::commands::{CommandResult, Dispatcher, StatusReporter};
use crate::config::Config;
use crate::deploy::{DeployCoordinator, DeployGate, DeployPlan, FileLockProvider};
use crate::gateway::AppState;
use crate::runtime::{CommandRunner, NativeCommandRunner};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const SUPERVISOR_INITIAL_BACKOFF_SECS: u64 = 2;
const SUPERVISOR_MAX_BACKOFF_SECS: u64 = 60;
const INBOUND_QUEUE_CAPACITY: usize = 100;
/// Identity the one-shot `deploy` subcommand reports to.
const OPERATOR_IDENTITY: &str = "operator";

fn build_coordinator(
    config: &Config,
    runner: Arc<dyn CommandRunner>,
    replier: Replier,
) -> DeployCoordinator {
    DeployCoordinator::new(
        DeployGate::new(),
        Arc::new(FileLockProvider::new(config.lock_file_path())),
        runner,
        replier,
        DeployPlan::from_config(config),
    )
}

/// Wire the dispatcher with its status reporter and deploy coordinator,
/// replying through `channel`.
pub fn build_dispatcher(config: &Config, channel: Arc<dyn Channel>) -> Arc<Dispatcher> {
    let runner: Arc<dyn CommandRunner> = Arc::new(NativeCommandRunner::new());
    let replier = Replier::new(channel, config.reply.max_chars);
    let coordinator = build_coordinator(config, Arc::clone(&runner), replier.clone());

    Arc::new(Dispatcher::new(
        config.allowlist(),
        StatusReporter::from_config(config, runner),
        Arc::new(coordinator),
        replier,
    ))
}

/// Run the agent until ctrl-c: gateway, bridge listener and dispatch loop.
pub async fn run(config: Config) -> Result<()> {
    let (bridge_url, secret) = config.validate_bridge()?;

    crate::health::mark_component_ok("daemon");

    let bridge: Arc<dyn Channel> = Arc::new(BridgeChannel::new(
        bridge_url.to_string(),
        secret.to_string(),
        config.agent.jid.clone(),
    ));
    let dispatcher = build_dispatcher(&config, Arc::clone(&bridge));
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

    let handler: Arc<dyn MessageHandler> = dispatcher.clone();
    let dispatch_loop = tokio::spawn(run_message_dispatch_loop(
        rx,
        handler,
        DEFAULT_MAX_IN_FLIGHT_MESSAGES,
    ));

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    {
        let state = AppState {
            secret: Arc::from(secret),
            inbound: tx.clone(),
            gate: dispatcher.deploy_gate(),
        };
        let host = config.gateway.host.clone();
        let port = config.gateway.port;
        handles.push(spawn_component_supervisor(
            "gateway",
            SUPERVISOR_INITIAL_BACKOFF_SECS,
            SUPERVISOR_MAX_BACKOFF_SECS,
            move || {
                let state = state.clone();
                let host = host.clone();
                async move { crate::gateway::run_gateway(&host, port, state).await }
            },
        ));
    }
    handles.push(spawn_supervised_listener(
        bridge,
        tx,
        SUPERVISOR_INITIAL_BACKOFF_SECS,
        SUPERVISOR_MAX_BACKOFF_SECS,
    ));

    tracing::info!(
        "release-bot started as {} ({} allowed senders, repo {})",
        config.agent.jid,
        config.allowlist().len(),
        config.repo_path().display()
    );
    println!("release-bot started");
    println!("   Gateway:  http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Bridge:   {bridge_url}");
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    crate::health::mark_component_error("daemon", "shutdown requested");
    tracing::info!("Shutdown requested");

    // Aborting the producers drops every inbound sender, which ends the
    // dispatch loop once queued messages are handled.
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    if let Err(e) = dispatch_loop.await {
        tracing::error!("Dispatch loop crashed: {e}");
    }

    shutdown_background(&dispatcher).await;
    Ok(())
}

async fn shutdown_background(dispatcher: &Dispatcher) {
    if dispatcher.is_deploy_running() {
        tracing::info!("Waiting for the running deploy to finish before exiting");
    }
    dispatcher.wait_for_background().await;
}

/// Drive the dispatcher from stdin as `identity` until EOF or ctrl-c.
pub async fn run_console(config: Config, identity: String) -> Result<()> {
    let console: Arc<dyn Channel> = Arc::new(ConsoleChannel::new(identity));
    let dispatcher = build_dispatcher(&config, Arc::clone(&console));
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

    let handler: Arc<dyn MessageHandler> = dispatcher.clone();
    let dispatch_loop = tokio::spawn(run_message_dispatch_loop(
        rx,
        handler,
        DEFAULT_MAX_IN_FLIGHT_MESSAGES,
    ));

    tokio::select! {
        result = console.listen(tx) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Console interrupted"),
    }

    dispatch_loop.await?;
    shutdown_background(&dispatcher).await;
    Ok(())
}

/// One status report, without any transport.
pub async fn run_status_once(config: &Config) -> CommandResult {
    StatusReporter::from_config(config, Arc::new(NativeCommandRunner::new()))
        .report()
        .await
}

/// One deploy attempt with notifications printed to stdout.
pub async fn run_deploy_once(config: &Config) -> CommandResult {
    let console: Arc<dyn Channel> = Arc::new(ConsoleChannel::new(OPERATOR_IDENTITY));
    let coordinator = build_coordinator(
        config,
        Arc::new(NativeCommandRunner::new()),
        Replier::new(console, config.reply.max_chars),
    );
    coordinator.attempt_deploy(OPERATOR_IDENTITY).await
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(name);
            match run_component().await {
                Ok(()) => {
                    crate::health::mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    crate::health::mark_component_error(name, e.to_string());
                    tracing::error!("Daemon component '{name}' failed: {e}");
                }
            }

            crate::health::bump_component_restart(name);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double backoff AFTER sleeping so first error uses initial_backoff
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
