//! Socket transport: one process per rank over a static full mesh
//!
//! Connection layout is fixed at startup from the rank space alone: every
//! rank listens, higher ranks dial lower ranks, and a short hello frame
//! identifies the dialer. Dials retry with exponential backoff up to the
//! configured budget; exhausting it is fatal for the run.
//!
//! One reader thread per peer connection drains frames into the shared
//! mailbox (the worker-per-peer-connection pattern), so `recv` stays a
//! plain blocking dequeue and slow peers never block unrelated channels.
//! A reserved control tag fans an abort out to every peer when a collective
//! gives up, carrying the root-cause rank.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::errors::{LatticeError, Result};
use crate::topology::Rank;
use crate::transport::mailbox::Mailbox;
use crate::transport::wire;
use crate::transport::{Message, RetryPolicy, Tag, Transport, ABORT_TAG};

/// First frame on every dialed connection, identifying the dialer.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: Rank,
}

/// A bound listener, ready to join the mesh.
///
/// Binding is split from establishment so a launcher can bind every rank
/// (possibly to ephemeral ports), distribute the resulting addresses, and
/// only then bring the mesh up.
pub struct TcpBuilder {
    rank: Rank,
    listener: TcpListener,
}

impl TcpBuilder {
    /// The address this rank is actually listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Connect the full mesh. `peers` holds every rank's listen address,
    /// indexed by rank; this rank's own entry is ignored. Blocks until all
    /// `world_size - 1` connections are up.
    pub fn establish(self, peers: &[SocketAddr], config: &TransportConfig) -> Result<TcpTransport> {
        config.validate()?;
        let world_size = peers.len();
        if self.rank >= world_size {
            return Err(LatticeError::Config(format!(
                "rank {} out of range for {} peer addresses",
                self.rank, world_size
            )));
        }

        let rank = self.rank;
        let limit = config.message_size_limit;
        let policy = RetryPolicy::from_config(config);
        let mailbox = Arc::new(Mailbox::new(rank, config.queue_capacity));

        // Ranks above us dial in; collect their handshaked streams.
        let expected_incoming = world_size - rank - 1;
        let listener = self.listener;
        let acceptor = thread::spawn(move || -> Result<Vec<(Rank, TcpStream)>> {
            let mut accepted = Vec::with_capacity(expected_incoming);
            while accepted.len() < expected_incoming {
                let (mut stream, _) = listener.accept()?;
                stream.set_nodelay(true)?;
                let hello: Hello = wire::read_frame(&mut stream, wire::MESSAGE_SIZE_LIMIT)?;
                tracing::debug!(rank, peer = hello.rank, "accepted peer connection");
                accepted.push((hello.rank, stream));
            }
            Ok(accepted)
        });

        // Meanwhile, dial every rank below us.
        let mut streams: Vec<(Rank, TcpStream)> = Vec::with_capacity(world_size - 1);
        for peer in 0..rank {
            let mut stream = dial_with_retry(peer, peers[peer], &policy)?;
            wire::write_frame(&mut stream, &Hello { rank }, wire::MESSAGE_SIZE_LIMIT)?;
            tracing::debug!(rank, peer, "dialed peer");
            streams.push((peer, stream));
        }

        let accepted = acceptor
            .join()
            .map_err(|_| LatticeError::Config("acceptor thread panicked".into()))??;
        streams.extend(accepted);

        // One reader thread per peer; the writer half stays with the sender.
        let mut connections = HashMap::with_capacity(streams.len());
        for (peer, stream) in streams {
            if peer >= world_size || peer == rank {
                return Err(LatticeError::Config(format!(
                    "unexpected handshake from rank {}",
                    peer
                )));
            }
            let reader = stream.try_clone()?;
            let reader_mailbox = Arc::clone(&mailbox);
            thread::spawn(move || reader_loop(peer, reader, reader_mailbox, limit));
            connections.insert(peer, Mutex::new(stream));
        }

        tracing::info!(rank, world_size, "mesh established");
        Ok(TcpTransport {
            rank,
            world_size,
            mailbox,
            connections,
            limit,
        })
    }
}

/// One rank's endpoint in a TCP mesh.
pub struct TcpTransport {
    rank: Rank,
    world_size: usize,
    mailbox: Arc<Mailbox>,
    connections: HashMap<Rank, Mutex<TcpStream>>,
    limit: usize,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Bind this rank's listener. Use an ephemeral port (`:0`) and
    /// [`TcpBuilder::local_addr`] when the launcher assigns addresses.
    pub fn bind(rank: Rank, addr: SocketAddr) -> Result<TcpBuilder> {
        let listener = TcpListener::bind(addr)?;
        Ok(TcpBuilder { rank, listener })
    }

    fn write_to(&self, dest: Rank, message: &Message) -> Result<()> {
        let connection = self.connections.get(&dest).ok_or_else(|| {
            LatticeError::Config(format!(
                "no connection to rank {} (world of {})",
                dest, self.world_size
            ))
        })?;

        let mut stream = connection.lock().unwrap_or_else(|e| e.into_inner());
        match wire::write_frame(&mut *stream, message, self.limit) {
            Ok(()) => Ok(()),
            Err(LatticeError::Io(e)) => {
                self.mailbox.fail(dest, dest);
                Err(LatticeError::Transport {
                    peer: dest,
                    reason: format!("connection reset: {}", e),
                })
            }
            // A local encoding problem (e.g. oversized frame) is not the
            // peer's fault; leave the connection alone.
            Err(other) => Err(other),
        }
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, dest: Rank, payload: Vec<u8>, tag: Tag) -> Result<()> {
        if dest == self.rank {
            return self.mailbox.push(self.rank, tag, payload);
        }
        self.write_to(
            dest,
            &Message {
                source: self.rank,
                dest,
                tag,
                payload,
            },
        )
    }

    fn recv(&self, source: Rank, tag: Tag) -> Result<Vec<u8>> {
        if source >= self.world_size {
            return Err(LatticeError::Config(format!(
                "source rank {} out of range for world of {}",
                source, self.world_size
            )));
        }
        self.mailbox.pop(source, tag)
    }

    fn abort(&self, origin: Rank) {
        tracing::warn!(rank = self.rank, origin, "aborting run, notifying peers");
        let frame = Message {
            source: self.rank,
            dest: self.rank,
            tag: ABORT_TAG,
            payload: encode_abort(origin),
        };
        for (&peer, connection) in &self.connections {
            let mut abort_frame = frame.clone();
            abort_frame.dest = peer;
            let mut stream = connection.lock().unwrap_or_else(|e| e.into_inner());
            // Best effort: a peer that is already gone is the reason we are
            // aborting in the first place.
            let _ = wire::write_frame(&mut *stream, &abort_frame, self.limit);
        }
        self.mailbox.abort_run(origin);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for connection in self.connections.values() {
            let stream = connection.lock().unwrap_or_else(|e| e.into_inner());
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn reader_loop(peer: Rank, mut stream: TcpStream, mailbox: Arc<Mailbox>, limit: usize) {
    loop {
        match wire::read_frame::<_, Message>(&mut stream, limit) {
            Ok(message) if message.tag == ABORT_TAG => {
                match decode_abort(&message.payload) {
                    Ok(origin) => {
                        tracing::warn!(peer, origin, "received abort frame");
                        mailbox.abort_run(origin);
                    }
                    Err(e) => {
                        tracing::warn!(peer, error = %e, "malformed abort frame");
                        mailbox.fail(peer, peer);
                    }
                }
                return;
            }
            Ok(message) => {
                if message.source != peer {
                    tracing::warn!(
                        peer,
                        claimed = message.source,
                        "dropping frame with mismatched source rank"
                    );
                    continue;
                }
                if mailbox.push(message.source, message.tag, message.payload).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(peer, error = %e, "peer connection closed");
                mailbox.fail(peer, peer);
                return;
            }
        }
    }
}

fn dial_with_retry(peer: Rank, addr: SocketAddr, policy: &RetryPolicy) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(LatticeError::Transport {
                        peer,
                        reason: format!(
                            "peer unreachable after {} dial attempts: {}",
                            attempt, e
                        ),
                    });
                }
                let delay = policy.delay(attempt - 1);
                tracing::warn!(peer, attempt, ?delay, error = %e, "dial failed, backing off");
                thread::sleep(delay);
            }
        }
    }
}

fn encode_abort(origin: Rank) -> Vec<u8> {
    (origin as u64).to_le_bytes().to_vec()
}

fn decode_abort(payload: &[u8]) -> Result<Rank> {
    let bytes: [u8; 8] = payload.try_into().map_err(|_| {
        LatticeError::Serialization(format!("abort payload has {} bytes, expected 8", payload.len()))
    })?;
    Ok(u64::from_le_bytes(bytes) as Rank)
}
