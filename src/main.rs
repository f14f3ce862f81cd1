use std::{
    process,
    sync::{Arc, OnceLock},
    time::Duration,
};

use tidewatch::{config::Config, handler::LoggingHandler, logger::LoggerManager, print_error};
use tidewatch_mqtt::{HandlerKind, Session, SessionManager, SessionState, StaticConnectionInfo};
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Logs every state transition until the session goes away.
fn spawn_state_logger(session: &Session) {
    let mut state_rx = session.state_receiver();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            match state {
                SessionState::GivingUp => error!("Session gave up reconnecting"),
                SessionState::Reconnecting { .. } => warn!("Session {}", state.details()),
                _ => debug!("Session {}", state.details()),
            }
        }
    });
}

/// Waits for the first connection, then subscribes the configured topics.
async fn subscribe_configured(session: &Session, topics: &[String], ack_timeout: Duration) {
    let mut state_rx = session.state_receiver();
    if state_rx.wait_for(SessionState::is_connected).await.is_err() {
        return;
    }

    for topic in topics {
        match session.subscribe_with_ack(topic, ack_timeout).await {
            Ok(()) => info!("Subscribed to configured topic: {}", topic),
            Err(e) => error!("Failed to subscribe to '{}': {}", topic, e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting tidewatch version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.session);

    let provider = Arc::new(
        StaticConnectionInfo::new(&cfg.endpoint.wss_url).unwrap_or_else(|e| {
            error!("Invalid endpoint: {}", e);
            process::exit(1);
        }),
    );

    let manager = SessionManager::from_config(cfg.session.clone()).unwrap_or_else(|e| {
        error!("Failed to create SessionManager: {}", e);
        process::exit(1);
    });
    let session = manager.build_and_start(provider).await.unwrap_or_else(|e| {
        error!("Failed to build session: {}", e);
        process::exit(1);
    });

    let handler = Arc::new(LoggingHandler::new());
    for kind in [
        HandlerKind::Connected,
        HandlerKind::Disconnected,
        HandlerKind::Update,
    ] {
        session.add_event_handler(kind, handler.clone()).await;
    }
    spawn_state_logger(&session);

    if let Err(e) = session.connect().await {
        error!("Failed to connect: {}", e);
        process::exit(1);
    }

    let ack_timeout = Duration::from_secs(cfg.session.reconnect.subscribe_ack_timeout);
    tokio::select! {
        _ = subscribe_configured(&session, &cfg.subscriptions.topics, ack_timeout) => {
            info!("Listening for device updates");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C before the first connection");
            session.shutdown().await?;
            return Ok(());
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown...");
    if let Err(e) = session.shutdown().await {
        warn!("Shutdown did not complete cleanly: {}", e);
    }
    info!("Shutdown complete, {} updates received", handler.updates());
    Ok(())
}
