//! Client side of a control connection.
//!
//! Commands are sent one at a time and their replies read synchronously; the
//! data connection for `get`/`put` is opened by a transfer thread so the
//! caller can issue the next command while bytes are still moving. Outcomes
//! reach the caller through the `Logger` (and `wait`/`quit`).

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use uuid::Uuid;

use crate::command::Command;
use crate::data_channel::{connect, tune_socket};
use crate::error::{Error, Result};
use crate::framing::{receive_message, receive_text, send_message};
use crate::logger::Logger;
use crate::protocol::PortReply;
use crate::transfer::{open_source, receive_file, send_file, Direction, TransferOutcome};
use crate::worker::TransferSet;

pub struct Client {
    stream: TcpStream,
    server: SocketAddr,
    local_dir: PathBuf,
    logger: Arc<dyn Logger>,
    transfers: TransferSet,
}

impl Client {
    /// Open the control connection. `local_dir` is where `get` saves files
    /// and `put` reads them from.
    pub fn connect(
        host: &str,
        port: u16,
        local_dir: impl Into<PathBuf>,
        logger: Arc<dyn Logger>,
    ) -> anyhow::Result<Self> {
        let local_dir = local_dir.into();
        if !local_dir.is_dir() {
            anyhow::bail!("Local path is not a directory: {}", local_dir.display());
        }
        let stream = TcpStream::connect((host, port))
            .with_context(|| format!("connect {}:{}", host, port))?;
        tune_socket(&stream);
        let server = stream.peer_addr().context("server address")?;
        Ok(Self {
            stream,
            server,
            local_dir,
            logger,
            transfers: TransferSet::new(),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Shared view of in-flight transfers, for cancelling from a signal handler.
    pub fn transfers(&self) -> TransferSet {
        self.transfers.clone()
    }

    fn negotiate(&mut self, cmd: &Command) -> Result<PortReply> {
        self.transfers.reap();
        send_message(&mut self.stream, cmd.to_string().as_bytes())?;
        let reply = receive_message(&mut self.stream)?;
        PortReply::decode(&reply)
    }

    /// Ask the server for `name` and start receiving it into the local
    /// directory. Returns once the data channel is negotiated.
    pub fn get(&mut self, name: &str) -> Result<Uuid> {
        let port = match self.negotiate(&Command::Get(name.to_string()))? {
            PortReply::Port(port) => port,
            PortReply::NotFound => return Err(Error::RemoteNotFound(name.to_string())),
        };
        let ip = self.server.ip();
        let dir = self.local_dir.clone();
        let logger = Arc::clone(&self.logger);
        let file_name = name.to_string();
        let id = self.transfers.spawn(Direction::Received, name, None, move |id, slot| {
            let outcome = match connect(ip, port) {
                Err(e) => TransferOutcome::aborted(id, Direction::Received, &file_name, e.to_string()),
                Ok(_) if slot.is_cancelled() => {
                    TransferOutcome::aborted(id, Direction::Received, &file_name, "cancelled")
                }
                Ok(mut stream) => {
                    let remote = stream.peer_addr().ok();
                    slot.attach(&stream);
                    let (tally, saved_as) = receive_file(&mut stream, &dir, &file_name);
                    let _ = stream.shutdown(Shutdown::Both);
                    TransferOutcome::new(id, Direction::Received, &file_name, remote, tally, saved_as)
                }
            };
            logger.transfer_done(&outcome);
            outcome
        })?;
        Ok(id)
    }

    /// Upload `name` from the local directory. The file is opened before
    /// anything is sent, so a missing file never reaches the server.
    pub fn put(&mut self, name: &str) -> Result<Uuid> {
        let (mut file, len) = open_source(&self.local_dir.join(name))?;
        let port = match self.negotiate(&Command::Put(name.to_string()))? {
            PortReply::Port(port) => port,
            PortReply::NotFound => return Err(Error::RemoteNotFound(name.to_string())),
        };
        let ip = self.server.ip();
        let logger = Arc::clone(&self.logger);
        let file_name = name.to_string();
        let id = self.transfers.spawn(Direction::Sent, name, None, move |id, slot| {
            let outcome = match connect(ip, port) {
                Err(e) => TransferOutcome::aborted(id, Direction::Sent, &file_name, e.to_string()),
                Ok(_) if slot.is_cancelled() => {
                    TransferOutcome::aborted(id, Direction::Sent, &file_name, "cancelled")
                }
                Ok(mut stream) => {
                    let remote = stream.peer_addr().ok();
                    slot.attach(&stream);
                    let tally = send_file(&mut stream, &mut file, len);
                    let _ = stream.shutdown(Shutdown::Write);
                    TransferOutcome::new(id, Direction::Sent, &file_name, remote, tally, None)
                }
            };
            logger.transfer_done(&outcome);
            outcome
        })?;
        Ok(id)
    }

    /// Names of the regular files the server is serving.
    pub fn list(&mut self) -> Result<Vec<String>> {
        self.transfers.reap();
        send_message(&mut self.stream, Command::Ls.to_string().as_bytes())?;
        let listing = receive_text(&mut self.stream)?;
        Ok(listing
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Block until one transfer finishes.
    pub fn wait(&self, id: Uuid) -> Option<TransferOutcome> {
        self.transfers.join(id)
    }

    /// Let in-flight transfers finish, then end the session.
    pub fn quit(mut self) -> Result<Vec<TransferOutcome>> {
        let outcomes = self.transfers.join_all();
        let sent = send_message(&mut self.stream, Command::Quit.to_string().as_bytes());
        let _ = self.stream.shutdown(Shutdown::Both);
        sent?;
        Ok(outcomes)
    }
}
