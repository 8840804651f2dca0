//! TCP client for the relay server. Each connection is one session; lines
//! are forwarded to the engine inbox and the session is closed when the
//! connection drops. Reconnects back off exponentially.

use std::io::{self, BufRead, BufReader};
use std::net::TcpStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use fluid::remote::ProtocolError;
use fluid::RemoteSender;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    /// The delay to wait now; doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}

/// Stops the relay thread when dropped.
pub struct RelayHandle {
    stop: Option<Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                tracing::warn!("relay thread panicked");
            }
        }
    }
}

pub fn spawn(address: String, sender: RemoteSender) -> Result<RelayHandle> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let handle = thread::Builder::new()
        .name("dyeflow-relay".into())
        .spawn(move || relay_loop(&address, &sender, &stop_rx))
        .map_err(|err| anyhow!("failed to spawn relay thread: {err}"))?;
    Ok(RelayHandle {
        stop: Some(stop_tx),
        join_handle: Some(handle),
    })
}

enum SessionEnd {
    Dropped,
    Stopped,
}

fn relay_loop(address: &str, sender: &RemoteSender, stop: &Receiver<()>) {
    let mut backoff = Backoff::default();
    let mut session = 0u64;
    loop {
        match TcpStream::connect(address) {
            Ok(stream) => {
                session += 1;
                backoff.reset();
                tracing::info!(address, session, "connected to relay");
                let end = read_session(stream, session, sender, stop);
                if sender.close_session(session).is_err() {
                    return;
                }
                match end {
                    Ok(SessionEnd::Stopped) => return,
                    Ok(SessionEnd::Dropped) => {
                        tracing::warn!(address, session, "relay connection closed")
                    }
                    Err(err) => tracing::warn!(address, session, %err, "relay connection failed"),
                }
            }
            Err(err) => tracing::debug!(address, %err, "relay unreachable"),
        }

        let delay = backoff.next_delay();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnecting to relay");
        match stop.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn read_session(
    stream: TcpStream,
    session: u64,
    sender: &RemoteSender,
    stop: &Receiver<()>,
) -> io::Result<SessionEnd> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => return Ok(SessionEnd::Stopped),
        }
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(SessionEnd::Dropped),
            Ok(_) if line.ends_with('\n') => {
                match sender.send_line(session, &line) {
                    Err(ProtocolError::Disconnected) => return Ok(SessionEnd::Stopped),
                    // Malformed lines are already logged and dropped.
                    Ok(()) | Err(_) => {}
                }
                line.clear();
            }
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(err) => return Err(err),
        }
    }
}
