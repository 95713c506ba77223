use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::{
    arguments::{config_path_override, port_override},
    broker::{Broker, BrokerHandle, TopicRegistry},
    config::{self, utils::CONFIG_FILE_PATH, Config},
    demo::{register_demo_topics, start_system_poller},
    logger::{self, LogTag},
};

/// Grace period for the webserver and dispatch loop to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Main broker execution function - handles the full process lifecycle
///
/// Loads configuration, registers topics, starts the dispatch loop and the
/// webserver, then waits for a shutdown signal and stops everything in order.
pub async fn run_broker() -> Result<()> {
    // 1. Configuration (file, then CLI overrides)
    let config_path = config_path_override().unwrap_or_else(|| CONFIG_FILE_PATH.to_string());
    config::load_config_from_path(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let mut cfg: Config = config::get_config_clone();
    if let Some(port) = port_override() {
        logger::info(LogTag::Config, &format!("Port override: {}", port));
        cfg.webserver.port = port;
    }

    logger::info(
        LogTag::Config,
        &format!(
            "Broker: ping={}s pong_timeout={}s queues out={} in={} send={} alpha={}",
            cfg.broker.ping_interval_secs,
            cfg.broker.pong_timeout_secs,
            cfg.broker.outbound_queue_capacity,
            cfg.broker.inbound_queue_capacity,
            cfg.broker.send_queue_capacity,
            cfg.broker.rtt_alpha
        ),
    );

    // 2. Topics (frozen once the broker is built)
    let mut registry = TopicRegistry::new();
    let demo = register_demo_topics(&mut registry, &cfg.demo).context("Failed to register topics")?;
    logger::info(
        LogTag::Topics,
        &format!("Topics registered: {}", registry.identifiers().join(", ")),
    );

    // 3. Dispatch loop
    let (broker, handle) = Broker::new(&cfg.broker, Arc::new(registry));
    let broker_task = broker.spawn();

    // 4. State owners
    let poller = demo
        .system
        .map(|system| start_system_poller(handle.clone(), system, cfg.demo.system_poll_secs));

    // 5. Transport
    let mut server_task = start_transport(&cfg, &handle);

    // 6. Run until a signal arrives or the transport dies
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = transport_exit(&mut server_task) => {
            logger::error(LogTag::System, "Webserver exited unexpectedly, shutting down");
        }
    }

    // 7. Stop in reverse order
    logger::info(LogTag::System, "Initiating graceful shutdown...");

    #[cfg(feature = "web")]
    crate::webserver::shutdown();
    if let Some(task) = server_task.take() {
        stop_within("webserver", task).await;
    }
    if let Some(task) = poller {
        task.abort();
    }

    handle.shutdown().await;
    stop_within("dispatch loop", broker_task).await;

    logger::info(LogTag::System, "statebroker shut down successfully");
    Ok(())
}

#[cfg(feature = "web")]
fn start_transport(cfg: &Config, handle: &BrokerHandle) -> Option<JoinHandle<()>> {
    let state = Arc::new(crate::webserver::AppState::new(
        handle.clone(),
        cfg.webserver.clone(),
        cfg.broker.transport_buffer,
    ));

    Some(tokio::spawn(async move {
        if let Err(e) = crate::webserver::start_server(state).await {
            logger::error(LogTag::Webserver, &format!("Webserver failed: {}", e));
        }
    }))
}

#[cfg(not(feature = "web"))]
fn start_transport(_cfg: &Config, _handle: &BrokerHandle) -> Option<JoinHandle<()>> {
    logger::warning(
        LogTag::System,
        "Built without the 'web' feature: no transport, topics are only reachable in-process",
    );
    None
}

/// Resolves when the transport task ends; never without one
fn transport_exit(task: &mut Option<JoinHandle<()>>) -> impl Future<Output = ()> + '_ {
    async move {
        match task.as_mut() {
            Some(handle) => {
                let _ = handle.await;
                *task = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

async fn stop_within(name: &str, task: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => logger::warning(LogTag::System, &format!("{} task failed: {}", name, e)),
        Err(_) => logger::warning(
            LogTag::System,
            &format!("{} did not stop within {}s", name, SHUTDOWN_TIMEOUT.as_secs()),
        ),
    }
}

/// Wait for shutdown signal (Ctrl+C, SIGTERM on Unix)
async fn wait_for_shutdown_signal() -> Result<()> {
    logger::info(
        LogTag::System,
        "Waiting for shutdown signal (press Ctrl+C twice to force kill)",
    );

    #[cfg(unix)]
    let signal_name = {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to bind SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to bind SIGTERM")?;

        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    };

    #[cfg(not(unix))]
    let signal_name = {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        "CTRL_C"
    };

    logger::warning(
        LogTag::System,
        &format!(
            "Shutdown signal received ({}). Press Ctrl+C again to force kill.",
            signal_name
        ),
    );

    // A second Ctrl+C during graceful shutdown exits immediately
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logger::error(LogTag::System, "Second Ctrl+C detected, forcing immediate exit.");
            // 130 is the conventional exit code for SIGINT
            std::process::exit(130);
        }
    });

    Ok(())
}
