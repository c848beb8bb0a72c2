use std::sync::Arc;

use color_eyre::eyre::Context;
use russh::{
    MethodKind, MethodSet,
    keys::{PrivateKey, load_secret_key},
    server::Config,
};
use tokio::{fs, net::TcpListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    GatewayServer,
    access::FileAccessPolicy,
    config::{ApplicationConfig, TargetConnectorKind},
    error::ServerError,
    host_key::load_or_create,
    identity::DirectoryIdentityResolver,
    listener::serve,
    target::{SshConnector, TargetConnector},
    telemetry::install_exporter,
};

/// Run the gateway until it receives SIGINT or SIGTERM.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    if let Some(address) = config.metrics_address {
        install_exporter(address)?;
        info!(%address, "Serving metrics.");
    }

    // Check that the identities directory exists, or create it.
    if config.disable_directory_creation {
        if !config.identities_directory.is_dir() {
            return Err(ServerError::MissingDirectory(config.identities_directory.clone()))
                .with_context(|| "Error setting up identities directory");
        }
    } else {
        fs::create_dir_all(config.identities_directory.as_path())
            .await
            .with_context(|| "Error creating identities directory")?;
    }
    let key = load_or_create(
        config.private_key_file.as_path(),
        !config.disable_directory_creation,
    )
    .await?;
    if !config.access_policy_file.is_file() {
        warn!(path = ?config.access_policy_file, "Access policy file not found. Every target will be denied.");
    }

    let identity_resolver = Arc::new(
        DirectoryIdentityResolver::open(config.identities_directory.clone())
            .await
            .with_context(|| "Error opening identities directory")?,
    );
    let access_policy = Arc::new(FileAccessPolicy::new(config.access_policy_file.clone()));
    let target_connector = target_connector(&config, &key).await?;
    let server = Arc::new(
        GatewayServer::builder()
            .identity_resolver(identity_resolver)
            .access_policy(access_policy)
            .target_connector(target_connector)
            .authentication_timeout(config.authentication_timeout.into())
            .negotiation_timeout(config.negotiation_timeout.into())
            .target_connect_timeout(config.target_connect_timeout.into())
            .buffer_size(config.buffer_size)
            .build(),
    );

    let ssh_config = Config {
        inactivity_timeout: config.inactivity_timeout.map(Into::into),
        auth_rejection_time: std::time::Duration::from_secs(1),
        auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
        methods: MethodSet::from([MethodKind::PublicKey].as_slice()),
        keys: vec![key],
        ..Default::default()
    };
    let ssh_config = Arc::new(ssh_config);

    let ssh_listener = TcpListener::bind((config.listen_address.as_str(), config.ssh_port))
        .await
        .with_context(|| "Error listening to SSH port")?;
    info!(
        address = %ssh_listener.local_addr()?,
        "Listening for SSH connections."
    );
    info!("Lighthouse is now running.");
    // Add OS signal handlers for termination.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => signal_token.cancel(),
            Err(error) => warn!(%error, "Unable to listen for termination signals."),
        }
    });
    serve(ssh_listener, ssh_config, server, shutdown).await?;
    info!("Lighthouse is shutting down.");
    Ok(())
}

async fn target_connector(
    config: &ApplicationConfig,
    host_key: &PrivateKey,
) -> color_eyre::Result<Arc<dyn TargetConnector>> {
    match config.target_connector {
        #[cfg(unix)]
        TargetConnectorKind::Command => Ok(Arc::new(
            crate::target::CommandConnector::new(&config.target_command)
                .with_context(|| "Error parsing target command")?,
        )),
        #[cfg(not(unix))]
        TargetConnectorKind::Command => Err(ServerError::InvalidConfig(
            "the command connector requires a Unix pseudo-terminal".into(),
        )
        .into()),
        TargetConnectorKind::Ssh => {
            let client_key = match config.target_private_key_file.as_ref() {
                Some(path) => load_secret_key(path, None)
                    .with_context(|| "Error loading target private key")?,
                None => host_key.clone(),
            };
            Ok(Arc::new(
                SshConnector::from_file(config.targets_file.as_path(), client_key).await?,
            ))
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate())?;
    let mut signal_interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
    Ok(())
}

#[cfg(windows)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c()?;
    let mut signal_break = windows::ctrl_break()?;
    let mut signal_close = windows::ctrl_close()?;
    let mut signal_shutdown = windows::ctrl_shutdown()?;

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
    Ok(())
}
