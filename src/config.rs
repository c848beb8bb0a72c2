use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, ValueEnum};
use humantime::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum TargetConnectorKind {
    /// Run a local command in a pseudo-terminal for each session.
    Command,
    /// Open a nested SSH connection to the address listed in the targets file.
    Ssh,
}

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen for SSH connections.
    #[arg(long, default_value_t = String::from("::"), value_name = "ADDRESS")]
    pub listen_address: String,

    /// Port to listen for SSH connections.
    #[arg(long, default_value_t = 2222, value_parser = validate_port, value_name = "PORT")]
    pub ssh_port: u16,

    /// File path to the server's secret key. If missing, it will be created for you.
    #[arg(
        long,
        default_value_os = "./deploy/server_keys/ssh",
        value_name = "FILE"
    )]
    pub private_key_file: PathBuf,

    /// Directory containing the public keys of every identity.
    ///
    /// Each file is one identity named after the file stem, with one OpenSSH public key per line.
    /// Files ending in `.disabled` belong to inactive identities and never authenticate.
    #[arg(
        long,
        default_value_os = "./deploy/identities/",
        value_name = "DIRECTORY"
    )]
    pub identities_directory: PathBuf,

    /// JSON file mapping identities to the targets they may reach, e.g.
    ///
    /// {"alice": ["build-node", "staging-*"]}
    ///
    /// The file is read again on every authentication attempt.
    #[arg(long, default_value_os = "./deploy/access.json", value_name = "FILE")]
    pub access_policy_file: PathBuf,

    /// If set, disables automatic creation of the directories expected by the application.
    /// This may result in application errors if the directories are missing.
    #[arg(long, default_value_t = false)]
    pub disable_directory_creation: bool,

    /// How to open the outbound session toward a target.
    #[arg(long, value_enum, default_value_t = TargetConnectorKind::Command, value_name = "CONNECTOR")]
    pub target_connector: TargetConnectorKind,

    /// Command run for each session with the command connector.
    ///
    /// `{target}` and `{identity}` are replaced in every argument.
    #[arg(long, default_value_t = String::from("ssh -tt {target}"), value_name = "TEMPLATE")]
    pub target_command: String,

    /// JSON file listing the SSH targets for the ssh connector, e.g.
    ///
    /// {"build-node": {"address": "10.0.0.5:22", "user": "deploy"}}
    #[arg(long, default_value_os = "./deploy/targets.json", value_name = "FILE")]
    pub targets_file: PathBuf,

    /// Secret key used to authenticate toward targets with the ssh connector.
    ///
    /// By default, the server's own key is used.
    #[arg(long, value_name = "FILE")]
    pub target_private_key_file: Option<PathBuf>,

    /// Time until a connection that hasn't authenticated is dropped.
    #[arg(long, default_value = "20s", value_name = "DURATION")]
    pub authentication_timeout: Duration,

    /// Time allowed after opening a session channel to request a shell, a command, or a terminal.
    #[arg(long, default_value = "10s", value_name = "DURATION")]
    pub negotiation_timeout: Duration,

    /// Time until an attempt to open the outbound session is abandoned.
    #[arg(long, default_value = "10s", value_name = "DURATION")]
    pub target_connect_timeout: Duration,

    /// How long an idle SSH connection may stay open.
    ///
    /// By default, idle connections are never closed.
    #[arg(long, value_name = "DURATION")]
    pub inactivity_timeout: Option<Duration>,

    /// Size in bytes of the buffers used in each relay direction.
    #[arg(long, default_value_t = 32_768, value_parser = validate_buffer_size, value_name = "BYTES")]
    pub buffer_size: usize,

    /// Address to serve Prometheus metrics on. Disabled by default.
    #[arg(long, value_name = "ADDRESS")]
    pub metrics_address: Option<SocketAddr>,
}

fn validate_port(port: &str) -> Result<u16, String> {
    match port.parse::<u16>() {
        Err(err) => Err(err.to_string()),
        Ok(0) => Err("port cannot be zero".into()),
        Ok(port) => Ok(port),
    }
}

fn validate_buffer_size(size: &str) -> Result<usize, String> {
    match size.parse::<usize>() {
        Err(err) => Err(err.to_string()),
        Ok(0) => Err("buffer size cannot be zero".into()),
        Ok(size) => Ok(size),
    }
}
