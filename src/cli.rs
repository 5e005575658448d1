//! Clap option structs for the server and client binaries

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::server::{ServeMode, ServerConfig};

/// Server daemon options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "ftplited - minimal FTP-style file server")]
pub struct ServerOpts {
    /// Port for the control connection
    pub port: u16,

    /// Connection handling: sequential (0), threaded (1) or pooled (2)
    #[arg(short = 't', long, value_enum, default_value_t = ServeMode::Sequential)]
    pub mode: ServeMode,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_ip: String,

    /// Directory to serve
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Most concurrent sessions in pooled mode; extra clients are refused
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Text log file
    #[arg(long, default_value = "server.log")]
    pub log_file: PathBuf,

    /// Append every transfer outcome to this JSONL file
    #[arg(long = "transfer-log")]
    pub transfer_log: Option<PathBuf>,

    /// Do not echo log lines to the console
    #[arg(short, long)]
    pub quiet: bool,
}

impl ServerOpts {
    pub fn config(&self) -> Result<ServerConfig> {
        let ip: IpAddr = self
            .bind_ip
            .parse()
            .with_context(|| format!("invalid bind address: {}", self.bind_ip))?;
        let mut config = ServerConfig::new(SocketAddr::new(ip, self.port), &self.root, self.mode);
        config.max_sessions = self.max_sessions;
        Ok(config)
    }
}

/// Interactive client options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "ftplite - interactive client for ftplited")]
pub struct ClientOpts {
    /// Server host name or address
    pub host: String,

    /// Server control port
    pub port: u16,

    /// Local directory for downloads, uploads and `lls`
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
}
