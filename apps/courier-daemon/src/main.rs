mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use config::DaemonConfig;
use courier_core::{CourierError, RetryMessageCache};
use courier_platform::{CredentialStore, FileCredentialStore};
use courier_runtime::{
    ConnectionSupervisor, CredentialResolver, HandlerSets, NotifierConfig, Scheduler,
    SidecarTransport, StartupNotifier, SupervisorExit,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        session_dir = %config.session_dir.display(),
        transport_addr = %config.transport_addr,
        max_reconnect = config.max_reconnect,
        owners = config.owner_recipients.len(),
        "starting courier daemon"
    );

    let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(&config.session_dir));
    let initial = CredentialResolver::new(Arc::clone(&store), config.session_token.clone()).resolve();
    info!(
        source = initial.as_str(),
        pairing = initial.pairing_mode(),
        "session credential resolved"
    );

    let shutdown = CancellationToken::new();
    let handlers = HandlerSets::new(config.auto_reject_calls);
    let dispatch = Arc::new(handlers.dispatch_table());
    let routed_categories = dispatch.categories().count();

    let notifier = Arc::new(StartupNotifier::new(
        NotifierConfig {
            recipients: config.owner_recipients.clone(),
            bot_name: config.bot_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            prefix: config.prefix.clone(),
            public_mode: config.public_mode,
            ..NotifierConfig::default()
        },
        Scheduler::new(&shutdown),
        Arc::new(move || routed_categories),
    ));

    let supervisor = ConnectionSupervisor::new(
        Arc::new(SidecarTransport::new(config.transport_addr.clone())),
        store,
        initial,
        RetryMessageCache::new(config.retry_cache_capacity, config.retry_cache_ttl),
        Arc::clone(&dispatch),
        notifier,
        config.supervisor_config(),
        shutdown.clone(),
    );

    spawn_signal_listener(shutdown);
    let outcome = tokio::spawn(supervisor.run()).await;

    for stats in dispatch.stats() {
        info!(
            category = stats.category.as_str(),
            delivered = stats.delivered,
            faulted = stats.faulted,
            "event category totals"
        );
    }

    match outcome {
        Ok(Ok(SupervisorExit::Shutdown)) => {
            info!("courier daemon stopped");
            ExitCode::SUCCESS
        }
        Ok(Err(err)) => {
            error!(
                category = ?err.category,
                code = %err.code,
                error = %err,
                "connection supervisor failed"
            );
            if let Some(hint) = recovery_hint(&err) {
                warn!("{hint}");
            }
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "connection supervisor panicked");
            ExitCode::FAILURE
        }
    }
}

fn recovery_hint(err: &CourierError) -> Option<&'static str> {
    match err.code.as_str() {
        "logged_out" => {
            Some("the session was logged out remotely and its stored credential was discarded; restart to pair again")
        }
        "retries_exhausted" => Some(
            "close other active web sessions for this account and check for duplicate daemons before restarting",
        ),
        _ => None,
    }
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!(error = %err, "failed installing SIGTERM handler; only ctrl-c stops the daemon");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
