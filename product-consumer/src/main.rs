use std::collections::HashMap;
use std::env;
use std::error::Error;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    // Setup the CryptoProvider (controls core cryptography used by rustls) for the process
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Installing default CryptoProvider");

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let vars: HashMap<String, String> = env::vars().collect();
    let settings = product_consumer_core::Settings::try_from(vars)?;
    info!(
        brokers = ?settings.kafka.brokers,
        topic = %settings.kafka.topic,
        error_topic = ?settings.kafka.error_topic,
        "Starting product consumer"
    );

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = product_consumer_core::run(&settings, cln_token).await;
    // no signal will come once the loop has failed
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    result.map_err(|e| format!("Error running product consumer: {e:?}"))?;

    info!("Gracefully Exiting...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
