use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use file_queue::config::{self, FileQueueConfig};
use file_queue::dispatch::ObserverError;
use file_queue::env::EnvSettings;
use file_queue::rabbitmq::LapinTransport;
use file_queue::{CancellationToken, FileMessage, FileQueueDispatcher, Observer, Subscription};

/// Logs every file message received.
struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_next(&self, message: &FileMessage) -> Result<(), ObserverError> {
        info!(
            id = %message.id,
            file = %message.name,
            bytes = message.len(),
            content_type = ?message.content_type,
            "Received file"
        );
        Ok(())
    }
}

fn load(settings: &EnvSettings) -> Result<FileQueueConfig> {
    match &settings.config_path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = EnvSettings::load().map_err(|e| anyhow!("Invalid environment: {}", e))?;

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("--init") {
        let path = args
            .get(2)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE_NAME));
        return config::create_default_config_file(&path);
    }

    let config = load(&settings)?;
    let timeout = settings
        .connect_timeout()
        .unwrap_or_else(|| config.connection.connect_timeout());
    let credentials = settings.credentials().or_else(|| {
        match (&config.connection.user, &config.connection.password) {
            (Some(user), Some(password)) => Some(file_queue::Credentials::new(user.as_str(), password.as_str())),
            _ => None,
        }
    });

    // Every observer of a dispatcher sees the files of all its bindings, so
    // topic and header listeners get a dispatcher each.
    let transport = Arc::new(LapinTransport::new(timeout));
    let observer: Arc<dyn Observer> = Arc::new(LoggingObserver);
    let token = CancellationToken::new();
    let mut subscriptions: Vec<Subscription> = Vec::new();

    if let Some(topics) = config.topics {
        let dispatcher = FileQueueDispatcher::new(transport.clone());
        dispatcher.configure(Some(topics))?;
        let subscription = match &credentials {
            Some(c) => {
                dispatcher
                    .subscribe_to_topics_with_authentication(observer.clone(), token.clone(), &c.user, &c.password)
                    .await
            }
            None => dispatcher.subscribe_to_topics(observer.clone(), token.clone()).await,
        }
        .context("Failed to subscribe to topic bindings")?;
        subscriptions.push(subscription);
    }

    if let Some(headers) = config.headers {
        let dispatcher = FileQueueDispatcher::new(transport.clone());
        dispatcher.configure_headers(Some(headers))?;
        let subscription = match &credentials {
            Some(c) => {
                dispatcher
                    .subscribe_to_headers_with_authentication(observer.clone(), token.clone(), &c.user, &c.password)
                    .await
            }
            None => dispatcher.subscribe_to_headers(observer.clone(), token.clone()).await,
        }
        .context("Failed to subscribe to header bindings")?;
        subscriptions.push(subscription);
    }

    info!("Listening for files. Press Ctrl+C to exit.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for Ctrl+C: {}", e);
    }

    info!("Shutting down receive loops...");
    token.cancel();
    for subscription in &subscriptions {
        subscription.dispose();
    }
    // Give the loops a moment to close their channels.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    Ok(())
}
