//! Transfer threads and their shutdown path.
//!
//! Every transfer runs on its own named thread so the control loop keeps
//! going. The owning session (or client) registers each thread in a
//! `TransferSet`; the set can join them, or cancel them by closing their data
//! socket (or waking a listener still blocked in `accept`).

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::transfer::{Direction, TransferOutcome};

enum SlotState {
    /// No data connection yet; the address wakes a pending accept
    Waiting(Option<SocketAddr>),
    Connected(TcpStream),
    Done,
}

/// Handle a worker shares with its `TransferSet` so the set can reach the
/// worker's data socket.
pub struct ChannelSlot {
    cancelled: AtomicBool,
    state: Mutex<SlotState>,
}

impl ChannelSlot {
    fn new(wake: Option<SocketAddr>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            state: Mutex::new(SlotState::Waiting(wake)),
        }
    }

    /// Record the data connection. Returns false if the transfer was
    /// cancelled meanwhile; the worker must then drop the connection.
    pub fn attach(&self, stream: &TcpStream) -> bool {
        let mut state = self.state.lock();
        if self.is_cancelled() {
            return false;
        }
        if let Ok(clone) = stream.try_clone() {
            *state = SlotState::Connected(clone);
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_waiting(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Waiting(_))
    }

    /// Release the socket clone once the transfer is over.
    pub fn finish(&self) {
        *self.state.lock() = SlotState::Done;
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let state = self.state.lock();
        match &*state {
            SlotState::Waiting(Some(addr)) => {
                // Unblocks the accept; the worker sees the flag and bails
                let _ = TcpStream::connect(addr);
            }
            SlotState::Connected(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            SlotState::Waiting(None) | SlotState::Done => {}
        }
    }
}

struct Entry {
    id: Uuid,
    direction: Direction,
    file: String,
    slot: Arc<ChannelSlot>,
    handle: JoinHandle<TransferOutcome>,
}

impl Entry {
    fn join(self) -> TransferOutcome {
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => TransferOutcome::aborted(
                self.id,
                self.direction,
                &self.file,
                "transfer worker panicked",
            ),
        }
    }
}

/// Transfers owned by one session or client.
#[derive(Clone, Default)]
pub struct TransferSet {
    entries: Arc<Mutex<Vec<Entry>>>,
    closed: Arc<AtomicBool>,
}

impl TransferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transfer thread. `wake` is the listener address to poke if
    /// the transfer is cancelled before its peer connects.
    pub fn spawn<F>(
        &self,
        direction: Direction,
        file: &str,
        wake: Option<SocketAddr>,
        work: F,
    ) -> io::Result<Uuid>
    where
        F: FnOnce(Uuid, Arc<ChannelSlot>) -> TransferOutcome + Send + 'static,
    {
        let id = Uuid::new_v4();
        let slot = Arc::new(ChannelSlot::new(wake));
        let worker_slot = Arc::clone(&slot);
        let handle = thread::Builder::new()
            .name(format!("transfer-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let outcome = work(id, Arc::clone(&worker_slot));
                worker_slot.finish();
                outcome
            })?;
        let mut entries = self.entries.lock();
        // Checked under the lock so `close` cannot miss this entry
        if self.closed.load(Ordering::SeqCst) {
            slot.cancel();
        }
        entries.push(Entry {
            id,
            direction,
            file: file.to_string(),
            slot,
            handle,
        });
        Ok(id)
    }

    /// Wait for one transfer.
    pub fn join(&self, id: Uuid) -> Option<TransferOutcome> {
        let entry = {
            let mut entries = self.entries.lock();
            let pos = entries.iter().position(|e| e.id == id)?;
            entries.swap_remove(pos)
        };
        Some(entry.join())
    }

    /// Wait for every registered transfer.
    pub fn join_all(&self) -> Vec<TransferOutcome> {
        let drained: Vec<Entry> = self.entries.lock().drain(..).collect();
        drained.into_iter().map(Entry::join).collect()
    }

    /// Collect transfers that have already finished without blocking.
    pub fn reap(&self) -> Vec<TransferOutcome> {
        let done: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let mut done = Vec::new();
            let mut i = 0;
            while i < entries.len() {
                if entries[i].handle.is_finished() {
                    done.push(entries.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            done
        };
        done.into_iter().map(Entry::join).collect()
    }

    /// Cancel transfers whose peer never connected.
    pub fn cancel_waiting(&self) {
        for entry in self.entries.lock().iter() {
            if entry.slot.is_waiting() {
                entry.slot.cancel();
            }
        }
    }

    /// Cancel everything, closing live data sockets.
    pub fn cancel_all(&self) {
        for entry in self.entries.lock().iter() {
            entry.slot.cancel();
        }
    }

    /// Cancel everything now and everything spawned from here on. Used by
    /// server shutdown, which must not wait on a stalled peer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all();
    }

    /// Session teardown: drop transfers still waiting for a peer, let the
    /// ones already moving bytes run to completion.
    pub fn finish(&self) -> Vec<TransferOutcome> {
        self.cancel_waiting();
        self.join_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_channel::DataListener;
    use crate::transfer::Tally;
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr, TcpListener};

    fn accept_worker(listener: DataListener) -> impl FnOnce(Uuid, Arc<ChannelSlot>) -> TransferOutcome {
        move |id, slot| {
            let (stream, peer) = match listener.accept() {
                Ok(x) => x,
                Err(e) => return TransferOutcome::aborted(id, Direction::Sent, "f", e.to_string()),
            };
            if !slot.attach(&stream) {
                return TransferOutcome::aborted(id, Direction::Sent, "f", "cancelled");
            }
            let tally = Tally {
                transferred: 1,
                expected: 1,
                error: None,
            };
            TransferOutcome::new(id, Direction::Sent, "f", Some(peer), tally, None)
        }
    }

    #[test]
    fn finish_cancels_transfer_without_peer() {
        let set = TransferSet::new();
        let listener = DataListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let wake = listener.wake_addr();
        set.spawn(Direction::Sent, "f", Some(wake), accept_worker(listener))
            .unwrap();

        let outcomes = set.finish();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].error.as_deref(), Some("cancelled"));
        assert!(set.join_all().is_empty());
    }

    #[test]
    fn join_returns_worker_outcome() {
        let set = TransferSet::new();
        let listener = DataListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let (port, wake) = (listener.port(), listener.wake_addr());
        let id = set
            .spawn(Direction::Sent, "f", Some(wake), accept_worker(listener))
            .unwrap();
        let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let outcome = set.join(id).unwrap();
        assert_eq!(outcome.id, id);
        assert!(outcome.is_complete());
        assert!(set.join(id).is_none());
    }

    #[test]
    fn cancel_all_closes_live_socket() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let set = TransferSet::new();
        let (tx, rx) = std::sync::mpsc::channel();
        set.spawn(Direction::Received, "f", None, move |id, slot| {
            let mut stream = TcpStream::connect(addr).unwrap();
            assert!(slot.attach(&stream));
            tx.send(()).unwrap();
            let mut buf = [0u8; 16];
            // Blocks until the set shuts the socket down
            let n = stream.read(&mut buf).unwrap_or(0);
            let tally = Tally {
                transferred: n as u64,
                expected: 16,
                error: None,
            };
            TransferOutcome::new(id, Direction::Received, "f", None, tally, None)
        })
        .unwrap();
        let (_held, _) = server.accept().unwrap();
        rx.recv().unwrap();

        set.cancel_all();
        let outcomes = set.join_all();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].is_complete());
    }

    #[test]
    fn closed_set_cancels_later_transfers() {
        let set = TransferSet::new();
        set.close();
        let listener = DataListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let wake = listener.wake_addr();
        let id = set
            .spawn(Direction::Sent, "late", Some(wake), accept_worker(listener))
            .unwrap();

        let outcome = set.join(id).unwrap();
        assert_eq!(outcome.error.as_deref(), Some("cancelled"));
    }
}
