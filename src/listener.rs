use std::{net::SocketAddr, sync::Arc, time::Duration};

use metrics::counter;
use russh::server::Config;
use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    GatewayServer,
    ssh::{SessionState, Server},
    telemetry::TELEMETRY_COUNTER_SSH_CONNECTIONS,
};

// Back-off after a failed accept, e.g. when out of file descriptors.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Accept SSH connections on `listener` until `shutdown` is cancelled.
///
/// Every connection runs on its own task. Cancelling `shutdown` also disconnects the
/// connections that are still open.
pub async fn serve(
    listener: TcpListener,
    config: Arc<Config>,
    server: Arc<GatewayServer>,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    loop {
        tokio::select! {
            conn = listener.accept() => {
                let (stream, address) = match conn {
                    Ok((stream, address)) => (stream, address),
                    Err(error) => {
                        error!(%error, "Unable to accept SSH connection.");
                        sleep(ACCEPT_ERROR_DELAY).await;
                        continue;
                    },
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, %address, "Error setting nodelay.");
                }
                counter!(TELEMETRY_COUNTER_SSH_CONNECTIONS).increment(1);
                handle_ssh_connection(HandleSshConnectionConfig {
                    stream,
                    address,
                    config: Arc::clone(&config),
                    server: &server,
                    cancellation_token: shutdown.child_token(),
                });
            }
            _ = shutdown.cancelled() => {
                break;
            }
        }
    }
    Ok(())
}

struct HandleSshConnectionConfig<'a> {
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<Config>,
    server: &'a Arc<GatewayServer>,
    cancellation_token: CancellationToken,
}

fn handle_ssh_connection(
    HandleSshConnectionConfig {
        stream,
        address,
        config,
        server,
        cancellation_token,
    }: HandleSshConnectionConfig,
) {
    // Create a new SSH handler.
    let handler = server.new_client(address, cancellation_token.clone());
    let session_task = handler.session_task();
    let status = handler.status();
    tokio::spawn(async move {
        match russh::server::run_stream(config, stream, handler).await {
            Ok(mut session) => {
                tokio::select! {
                    result = &mut session => {
                        if let Err(error) = result {
                            warn!(%error, %address, "Connection closed.");
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        info!(%address, "Disconnecting client...");
                        let _ = session.handle().disconnect(russh::Disconnect::ByApplication, "".into(), "English".into()).await;
                    },
                }
            }
            Err(error) => {
                warn!(%error, %address, "Connection setup failed.");
            }
        }
        // The bridge may still be running if the client went away first.
        cancellation_token.cancel();
        let task = session_task.lock().expect("not poisoned").take();
        if let Some(task) = task
            && let Err(error) = task.await
        {
            error!(%error, %address, "Session task failed.");
        }
        status.transition(SessionState::Closed);
        info!(%address, "SSH client disconnected.");
    });
}
