use anyhow::Result;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

use crate::log::TransferLog;
use crate::transfer::{Direction, TransferOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Received and about to run
    Execute,
    Success,
    Failure,
    Unknown,
}

/// Status sink shared by the server, its sessions and their transfer
/// workers. Every method defaults to doing nothing.
pub trait Logger: Send + Sync {
    fn server_started(&self, _addr: SocketAddr, _mode: &str) {}
    fn server_stopped(&self) {}
    fn session_opened(&self, _peer: SocketAddr) {}
    fn session_closed(&self, _peer: SocketAddr, _reason: &str) {}
    fn command(&self, _peer: SocketAddr, _line: &str, _status: CommandStatus) {}
    fn data_channel_opened(&self, _peer: SocketAddr, _port: u16) {}
    fn data_channel_connected(&self, _peer: SocketAddr, _port: u16, _remote: SocketAddr) {}
    fn data_channel_closed(&self, _peer: SocketAddr, _port: u16) {}
    fn transfer_done(&self, _outcome: &TransferOutcome) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
}

/// Timestamped text log. Debug and info lines go to the file; info lines are
/// also echoed to stderr when console output is on.
pub struct TextLogger {
    file: Option<Mutex<File>>,
    console: bool,
    journal: Option<TransferLog>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(f)),
            console: false,
            journal: None,
        })
    }

    pub fn with_console(mut self, on: bool) -> Self {
        self.console = on;
        self
    }

    pub fn with_journal(mut self, journal: TransferLog) -> Self {
        self.journal = Some(journal);
        self
    }

    fn line(&self, level: Level, s: &str) {
        if let Some(file) = &self.file {
            let thread = std::thread::current();
            let _ = writeln!(
                file.lock(),
                "{} PID:{} {} {}",
                Local::now().format("%H:%M:%S"),
                std::process::id(),
                thread.name().unwrap_or("unnamed"),
                s
            );
        }
        if self.console && level == Level::Info {
            eprintln!("{}", s);
        }
    }
}

impl Logger for TextLogger {
    fn server_started(&self, addr: SocketAddr, mode: &str) {
        self.line(
            Level::Info,
            &format!(">>>>> SERVER LISTENING ON PORT {} <<<<<", addr.port()),
        );
        self.line(Level::Debug, &format!("Server starting in {} mode", mode));
    }
    fn server_stopped(&self) {
        self.line(Level::Info, ">>>>>>>> SERVER CLOSED <<<<<<<<");
    }
    fn session_opened(&self, peer: SocketAddr) {
        self.line(
            Level::Info,
            &format!("New client accepted HOST: {} PORT: {}", peer.ip(), peer.port()),
        );
    }
    fn session_closed(&self, peer: SocketAddr, reason: &str) {
        self.line(Level::Debug, &format!("{} {}", peer, reason));
    }
    fn command(&self, peer: SocketAddr, line: &str, status: CommandStatus) {
        let (level, tag) = match status {
            CommandStatus::Execute => (Level::Debug, "EXECUTE"),
            CommandStatus::Success => (Level::Info, "SUCCESS"),
            CommandStatus::Failure => (Level::Info, "FAILURE"),
            CommandStatus::Unknown => (Level::Info, "Unknown command"),
        };
        self.line(level, &format!("{} {}\t{}", tag, peer, line));
    }
    fn data_channel_opened(&self, peer: SocketAddr, port: u16) {
        self.line(Level::Debug, &format!("Opened data socket {} for {}", port, peer));
    }
    fn data_channel_connected(&self, peer: SocketAddr, port: u16, remote: SocketAddr) {
        self.line(
            Level::Debug,
            &format!("Connected data socket {} for {} through {}", port, peer, remote),
        );
    }
    fn data_channel_closed(&self, peer: SocketAddr, port: u16) {
        self.line(Level::Debug, &format!("Closed data socket {} for {}", port, peer));
    }
    fn transfer_done(&self, o: &TransferOutcome) {
        let peer = o
            .peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let msg = match (o.is_complete(), o.direction) {
            (true, Direction::Sent) => format!("SUCCESS sent '{}' to {}", o.file, peer),
            (true, Direction::Received) => format!(
                "SUCCESS retrieved '{}' from {} and saved as '{}'",
                o.file,
                peer,
                o.saved_as
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            (false, Direction::Sent) => format!(
                "FAILURE did not send all of '{}' to {} ({} of {} bytes: {})",
                o.file,
                peer,
                o.transferred,
                o.expected,
                o.error.as_deref().unwrap_or("short transfer")
            ),
            (false, Direction::Received) => format!(
                "FAILURE did not retrieve all of '{}' from {} ({} of {} bytes: {})",
                o.file,
                peer,
                o.transferred,
                o.expected,
                o.error.as_deref().unwrap_or("short transfer")
            ),
        };
        self.line(Level::Info, &msg);
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(o) {
                self.line(Level::Info, &format!("transfer log write failed: {}", e));
            }
        }
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(Level::Debug, &format!("ERROR ctx={} msg={}", context, msg));
    }
}
