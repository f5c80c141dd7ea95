//! publisher-agent binary entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use publisher_agent_lib::incoming::{bind_incoming_server, serve, ValueUpdateSenders};
use publisher_agent_lib::puller::{IncomingWebsocketPuller, PullerConfig};
use publisher_agent_lib::server::{run_server, ServerState};
use publisher_agent_lib::{
    AgentConfig, AgentError, BrokerRegistry, PublisherAgentRunner, RegistryClient,
};
use publisher_signer::{EvmSigner, SignatureType, Signer};

#[derive(Parser, Debug)]
#[command(name = "publisher-agent")]
#[command(about = "Signs price updates and streams them to registry-listed brokers")]
struct Args {
    /// Path to the agent config file
    #[arg(short = 'c', long, env = "PUBLISHER_AGENT_CONFIG_FILE_PATH")]
    config_file_path: PathBuf,

    /// Path to the keys file (keys may also come from PUBLISHER_AGENT_* variables)
    #[arg(
        short = 'k',
        long,
        env = "PUBLISHER_AGENT_KEYS_FILE_PATH",
        default_value = "keys.json"
    )]
    keys_file_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = AgentConfig::load(&args.config_file_path, &args.keys_file_path).map_err(|e| {
        error!(error = %e, "Failed to load config");
        e
    })?;
    info!(config = ?config, "Starting publisher agent");

    let registry: Arc<dyn BrokerRegistry> = Arc::new(RegistryClient::new(
        &config.registry_base_url,
        config.keys.registry_auth.clone(),
    )?);

    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<Result<(), AgentError>> = JoinSet::new();
    let mut senders = Vec::with_capacity(config.signature_types.len());
    let mut health = ServerState::new();

    for signature_type in &config.signature_types {
        let signer = build_signer(*signature_type, &config)?;
        let runner = PublisherAgentRunner::new(&config, signer, Arc::clone(&registry))?;
        senders.push(runner.value_sender());
        health = health.with_pipeline(*signature_type, runner.broker_table());
        tasks.spawn(runner.run(shutdown.clone()));
    }
    let senders: ValueUpdateSenders = Arc::from(senders);

    if config.incoming_ws_port > 0 {
        let (listener, _) = bind_incoming_server(config.incoming_ws_port).await?;
        let senders = Arc::clone(&senders);
        let token = shutdown.clone();
        tasks.spawn(
            async move {
                serve(listener, senders, token).await;
                Ok(())
            }
            .instrument(info_span!("incoming", service = "incoming")),
        );
    }

    if let Some(pull) = &config.pull_based {
        let puller = IncomingWebsocketPuller::new(
            PullerConfig {
                url: pull.url.clone(),
                auth: config.keys.pull_based_auth.clone(),
                subscription_request: pull.subscription_request.clone(),
                reconnect_delay: pull.reconnect_delay,
                read_timeout: pull.read_timeout,
            },
            Arc::clone(&senders),
        );
        let token = shutdown.clone();
        tasks.spawn(
            async move {
                puller.run(token).await;
                Ok(())
            }
            .instrument(info_span!("incoming", service = "incoming")),
        );
    }
    // pipelines see their input close once the incoming tasks exit
    drop(senders);

    if config.health_port > 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
        let token = shutdown.clone();
        info!(addr = %addr, "Health server listening");
        tasks.spawn(async move { run_server(addr, health, token).await.map_err(AgentError::from) });
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;

    info!("Publisher agent running, waiting for SIGTERM/SIGINT to stop");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down gracefully");
        }
        result = tasks.join_next() => {
            match result {
                Some(Ok(Ok(()))) => info!("Task completed, shutting down all tasks"),
                Some(Ok(Err(e))) => error!(error = %e, "Task failed, shutting down all tasks"),
                Some(Err(e)) => error!(error = %e, "Task panicked, shutting down all tasks"),
                None => info!("All tasks completed"),
            }
        }
    }
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Task failed during shutdown"),
            Err(e) => error!(error = %e, "Task panicked during shutdown"),
        }
    }

    info!("Publisher agent stopped");
    Ok(())
}

fn build_signer(signature_type: SignatureType, config: &AgentConfig) -> anyhow::Result<Arc<dyn Signer>> {
    match signature_type {
        SignatureType::Evm => {
            let private_key = config
                .keys
                .evm_private_key
                .as_deref()
                .context("missing EVM private key")?;
            let signer = EvmSigner::new(private_key)?;
            if let Some(public_key) = &config.keys.evm_public_key {
                if !public_key.eq_ignore_ascii_case(signer.publisher_key()) {
                    bail!(
                        "EVM public key {} does not match the private key's address {}",
                        public_key,
                        signer.publisher_key()
                    );
                }
            }
            info!(publisher_key = %signer.publisher_key(), "EVM signer ready");
            Ok(Arc::new(signer))
        }
        SignatureType::Stark => bail!("stark signing needs an external signer, none is built in"),
    }
}
