//! Server side of one control connection.
//!
//! The session reads one framed command at a time and answers it before
//! reading the next. `get` and `put` bind their data listener and send the
//! port reply right here on the control thread, so every reply answers its
//! own command; only the accept and the byte moving run on a transfer thread.

use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use crate::command::Command;
use crate::data_channel::DataListener;
use crate::error::{Error, Result};
use crate::framing::{receive_message, send_message};
use crate::fs_enum::{base_name, list_files, servable_file};
use crate::logger::{CommandStatus, Logger};
use crate::protocol::PortReply;
use crate::transfer::{open_source, receive_file, send_file, Direction, TransferOutcome};
use crate::worker::TransferSet;

/// Why a session left the command loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    Disconnected(String),
}

enum Flow {
    Continue,
    Quit,
}

pub struct ControlSession {
    stream: TcpStream,
    peer: SocketAddr,
    root: PathBuf,
    logger: Arc<dyn Logger>,
    transfers: TransferSet,
}

impl ControlSession {
    /// `root` must be canonical; every name a client sends is resolved under it.
    pub fn new(stream: TcpStream, peer: SocketAddr, root: PathBuf, logger: Arc<dyn Logger>) -> Self {
        Self {
            stream,
            peer,
            root,
            logger,
            transfers: TransferSet::new(),
        }
    }

    /// Run transfers in `transfers`, so whoever holds a clone can cancel them.
    pub fn with_transfers(mut self, transfers: TransferSet) -> Self {
        self.transfers = transfers;
        self
    }

    /// Run the command loop until `quit` or a framing failure, then tear
    /// down this session's transfers and close the control socket.
    pub fn run(mut self) -> SessionEnd {
        let end = loop {
            self.transfers.reap();
            let payload = match receive_message(&mut self.stream) {
                Ok(p) => p,
                Err(e) => break SessionEnd::Disconnected(e.to_string()),
            };
            let line = String::from_utf8_lossy(&payload).into_owned();
            if line.trim().is_empty() {
                continue;
            }
            match self.dispatch(&line) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break SessionEnd::Quit,
                Err(e) => break SessionEnd::Disconnected(e.to_string()),
            }
        };
        self.terminate(&end);
        end
    }

    fn terminate(&mut self, end: &SessionEnd) {
        self.transfers.finish();
        let _ = self.stream.shutdown(Shutdown::Both);
        let reason = match end {
            SessionEnd::Quit => "quit".to_string(),
            SessionEnd::Disconnected(why) => why.clone(),
        };
        self.logger.session_closed(self.peer, &reason);
    }

    fn dispatch(&mut self, line: &str) -> Result<Flow> {
        self.logger.command(self.peer, line, CommandStatus::Execute);
        let cmd = match Command::parse(line) {
            Ok(cmd) if cmd.is_remote() => cmd,
            _ => {
                self.logger.command(self.peer, line, CommandStatus::Unknown);
                return Ok(Flow::Continue);
            }
        };
        match cmd {
            Command::Get(name) => self.get(line, &name)?,
            Command::Put(name) => self.put(line, &name)?,
            Command::Ls => self.ls(line)?,
            Command::Quit => {
                self.logger.command(self.peer, line, CommandStatus::Success);
                return Ok(Flow::Quit);
            }
            Command::Lls | Command::Help => {}
        }
        Ok(Flow::Continue)
    }

    fn reply(&mut self, reply: PortReply) -> Result<()> {
        send_message(&mut self.stream, reply.encode().as_bytes())?;
        Ok(())
    }

    // Data listeners use the wildcard address of the control socket's family
    fn bind_data_channel(&self) -> std::io::Result<DataListener> {
        let family = self
            .stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        DataListener::bind(family)
    }

    fn get(&mut self, line: &str, name: &str) -> Result<()> {
        // Open before negotiating: an unreadable file never gets a listener
        let source = servable_file(&self.root, name).and_then(|p| open_source(&p).ok());
        let Some((mut file, len)) = source else {
            self.reply(PortReply::NotFound)?;
            self.logger.command(self.peer, line, CommandStatus::Failure);
            self.logger.error("get", &format!("'{}' is not a file", name));
            return Ok(());
        };
        let listener = match self.bind_data_channel() {
            Ok(l) => l,
            Err(e) => {
                self.reply(PortReply::NotFound)?;
                self.logger.command(self.peer, line, CommandStatus::Failure);
                self.logger.error("get: bind data channel", &e.to_string());
                return Ok(());
            }
        };
        let port = listener.port();
        let wake = listener.wake_addr();
        self.reply(PortReply::Port(port))?;
        self.logger.data_channel_opened(self.peer, port);

        let logger = Arc::clone(&self.logger);
        let peer = self.peer;
        let file_name = name.to_string();
        self.transfers
            .spawn(Direction::Sent, name, Some(wake), move |id, slot| {
                let outcome = match listener.accept() {
                    Err(e) => TransferOutcome::aborted(id, Direction::Sent, &file_name, e.to_string()),
                    Ok((mut stream, remote)) => {
                        if slot.attach(&stream) {
                            logger.data_channel_connected(peer, port, remote);
                            let tally = send_file(&mut stream, &mut file, len);
                            let _ = stream.shutdown(Shutdown::Both);
                            TransferOutcome::new(id, Direction::Sent, &file_name, Some(remote), tally, None)
                        } else {
                            TransferOutcome::aborted(id, Direction::Sent, &file_name, "cancelled")
                        }
                    }
                };
                logger.data_channel_closed(peer, port);
                logger.transfer_done(&outcome);
                outcome
            })
            .map_err(Error::Io)?;
        Ok(())
    }

    fn put(&mut self, line: &str, name: &str) -> Result<()> {
        if base_name(name).is_none() {
            self.reply(PortReply::NotFound)?;
            self.logger.command(self.peer, line, CommandStatus::Failure);
            return Ok(());
        }
        let listener = match self.bind_data_channel() {
            Ok(l) => l,
            Err(e) => {
                self.reply(PortReply::NotFound)?;
                self.logger.command(self.peer, line, CommandStatus::Failure);
                self.logger.error("put: bind data channel", &e.to_string());
                return Ok(());
            }
        };
        let port = listener.port();
        let wake = listener.wake_addr();
        self.reply(PortReply::Port(port))?;
        self.logger.data_channel_opened(self.peer, port);

        let logger = Arc::clone(&self.logger);
        let peer = self.peer;
        let root = self.root.clone();
        let file_name = name.to_string();
        self.transfers
            .spawn(Direction::Received, name, Some(wake), move |id, slot| {
                let outcome = match listener.accept() {
                    Err(e) => TransferOutcome::aborted(id, Direction::Received, &file_name, e.to_string()),
                    Ok((mut stream, remote)) => {
                        if slot.attach(&stream) {
                            logger.data_channel_connected(peer, port, remote);
                            let (tally, saved_as) = receive_file(&mut stream, &root, &file_name);
                            let _ = stream.shutdown(Shutdown::Both);
                            TransferOutcome::new(
                                id,
                                Direction::Received,
                                &file_name,
                                Some(remote),
                                tally,
                                saved_as,
                            )
                        } else {
                            TransferOutcome::aborted(id, Direction::Received, &file_name, "cancelled")
                        }
                    }
                };
                logger.data_channel_closed(peer, port);
                logger.transfer_done(&outcome);
                outcome
            })
            .map_err(Error::Io)?;
        Ok(())
    }

    fn ls(&mut self, line: &str) -> Result<()> {
        let (listing, status) = match list_files(&self.root) {
            Ok(names) => (names.join("\n"), CommandStatus::Success),
            Err(e) => {
                self.logger.error("ls", &e.to_string());
                (String::new(), CommandStatus::Failure)
            }
        };
        if let Err(e) = send_message(&mut self.stream, listing.as_bytes()) {
            self.logger.command(self.peer, line, CommandStatus::Failure);
            return Err(e);
        }
        self.logger.command(self.peer, line, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn answers_until_quit() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::write(root.join("one.txt"), "1").unwrap();
        std::fs::write(root.join("two.txt"), "2").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let session = ControlSession::new(stream, peer, root, Arc::new(NoopLogger));
        let running = thread::spawn(move || session.run());

        // Unknown commands get no reply, so the next answer belongs to `ls`
        send_message(&mut client, b"delete one.txt").unwrap();
        send_message(&mut client, b"ls").unwrap();
        assert_eq!(receive_message(&mut client).unwrap(), b"one.txt\ntwo.txt".to_vec());
        send_message(&mut client, b"get nope.txt").unwrap();
        assert_eq!(receive_message(&mut client).unwrap(), b"-1".to_vec());
        send_message(&mut client, b"quit").unwrap();

        assert_eq!(running.join().unwrap(), SessionEnd::Quit);
    }

    #[test]
    fn peer_hangup_ends_session() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let session = ControlSession::new(
            stream,
            peer,
            tmp.path().canonicalize().unwrap(),
            Arc::new(NoopLogger),
        );
        drop(client);
        assert!(matches!(session.run(), SessionEnd::Disconnected(_)));
    }
}
