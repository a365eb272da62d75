use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::Address;
use eyre::WrapErr;

use bridge_relayer::api::{self, AppState};
use bridge_relayer::config::{CompletionMode, Config};
use bridge_relayer::db::{self, PgStore, TransferStore};
use bridge_relayer::signer::AttestationSigner;
use bridge_relayer::watchers::{ChainPoller, EvmEventSource, PollerConfig};
use bridge_relayer::writers::{DestinationClient, EvmDestination};
use bridge_relayer::{Relayer, RelayerSettings};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting bridge relayer");

    let config = Config::load()?;
    tracing::info!(
        source_chain_id = config.source.chain_id,
        destination_chain_id = config.destination.chain_id,
        mode = %config.signer.mode,
        instance_id = %config.relayer.instance_id,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn TransferStore> = Arc::new(PgStore::new(pool));

    // Source first so initiations land before destination settlements
    let pollers = vec![
        ChainPoller::new(
            Arc::new(EvmEventSource::new(&config.source)?),
            PollerConfig::from(&config.source),
        ),
        ChainPoller::new(
            Arc::new(EvmEventSource::new(&config.destination)?),
            PollerConfig::from(&config.destination),
        ),
    ];

    let destination = EvmDestination::new(&config.destination, &config.signer.submitter_key)?;
    tracing::info!(submitter = %destination.submitter_address(), "Destination client ready");

    let signer = match config.signer.mode {
        CompletionMode::Attested => {
            let vault: Address = config
                .destination
                .bridge_address
                .parse()
                .wrap_err("Invalid destination bridge address")?;
            let signer = AttestationSigner::from_keys(
                &config.signer.attestation_keys,
                config.signer.signature_threshold,
                vault,
            )?;
            tracing::info!(
                signers = ?signer.addresses(),
                threshold = signer.threshold(),
                "Attestation signer ready"
            );
            Some(signer)
        }
        CompletionMode::Payout => None,
    };

    let client: Arc<dyn DestinationClient> = Arc::new(destination);
    match client.min_signatures().await {
        Ok(min) if config.signer.mode == CompletionMode::Attested
            && min > config.signer.signature_threshold =>
        {
            tracing::warn!(
                contract_min = min,
                threshold = config.signer.signature_threshold,
                "Destination requires more signatures than the relayer provides"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Could not read minSignatures from destination"),
    }

    let relayer = Relayer::new(
        store.clone(),
        pollers,
        client,
        signer,
        RelayerSettings::from(&config),
    )?;

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    let api_state = AppState {
        store,
        chains: vec![config.source.name.clone(), config.destination.name.clone()],
        instance_id: config.relayer.instance_id.clone(),
        started_at: Instant::now(),
    };
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    relayer.run(wait_for_shutdown_signal()).await?;

    tracing::info!("Bridge relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
///
/// `LOG_FORMAT=json` switches to one JSON object per line.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
