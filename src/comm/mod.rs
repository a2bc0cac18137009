//! Rank-to-rank communication.
//!
//! The kernel is SPMD: every rank runs the same pass structure and
//! exchanges halo data with its neighbours through a [`Communicator`].
//! The trait models a group of processes that exchange byte messages;
//! the underlying transport can in principle be TCP, UDP, or a higher
//! level abstraction like MPI. Two implementations ship with the crate:
//!
//! - [`NullCommunicator`] for single-rank runs (every operation is a
//!   no-op or an identity),
//! - [`MeshCommunicator`] connecting a group of in-process ranks through
//!   channels, used by the multi-rank tests.
//!
//! Messages are [`Envelope`]s tagged by a monotonically increasing
//! channel id so that overlapping exchanges never collide. Collective
//! reductions (`τ` minimum, restart flag) run as a binomial reduce
//! followed by a binomial broadcast on their own channel.

mod partitioner;

pub use partitioner::Partitioner;

use std::collections::VecDeque;
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

/// A tagged message between ranks.
///
/// The payload is always a span of `f64` values; boolean collectives
/// encode into `0.0` / `1.0`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Exchange the message belongs to.
    pub channel: u32,
    /// Sending rank.
    pub source: u32,
    /// Payload values.
    pub values: Vec<f64>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("envelope serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        rmp_serde::from_slice(bytes).expect("malformed envelope")
    }
}

/// Interface for a group of processes that can exchange messages.
pub trait Communicator: Send + Sync {
    /// The rank of this process within the communicator.
    fn rank(&self) -> usize;

    /// The number of processes in this communicator.
    fn size(&self) -> usize;

    /// Send a message to a peer. Must return immediately; it is not
    /// allowed to block until a matching receive is posted.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Receive a message from any peer. May block until a message is
    /// ready.
    fn recv(&self) -> Vec<u8>;

    /// Requeue a received message which is not yet needed. Implementations
    /// must hand requeued messages back out of [`Communicator::recv`]
    /// before touching the transport again.
    fn requeue_recv(&self, bytes: Vec<u8>);

    /// Receive the next envelope on `channel`, optionally from a specific
    /// source. Envelopes for other exchanges are set aside and requeued
    /// once the match arrives.
    fn recv_envelope(&self, channel: u32, source: Option<usize>) -> Envelope {
        let mut stash = Vec::new();
        loop {
            let bytes = self.recv();
            let envelope = Envelope::from_bytes(&bytes);
            let matches = envelope.channel == channel
                && source.map_or(true, |s| envelope.source as usize == s);
            if matches {
                for bytes in stash {
                    self.requeue_recv(bytes);
                }
                return envelope;
            }
            stash.push(bytes);
        }
    }

    /// Binomial-tree reduction of one value to rank 0, followed by a
    /// binomial broadcast of the result. Commutative `combine` only.
    fn all_reduce(&self, channel: u32, value: f64, combine: fn(f64, f64) -> f64) -> f64 {
        let r = self.rank();
        let p = self.size();
        if p == 1 {
            return value;
        }
        let levels = ceil_log2(p);

        // Reduce towards rank 0.
        let mut value = value;
        for level in 0..levels {
            let step = 1 << level;
            if r % (2 * step) == step {
                self.send(
                    r - step,
                    Envelope {
                        channel,
                        source: r as u32,
                        values: vec![value],
                    }
                    .to_bytes(),
                );
                break;
            } else if r % (2 * step) == 0 && r + step < p {
                let incoming = self.recv_envelope(channel, Some(r + step));
                value = combine(value, incoming.values[0]);
            }
        }

        // Broadcast back down the same tree.
        let mut have = r == 0;
        for level in (0..levels).rev() {
            let step = 1 << level;
            if r % (2 * step) == step {
                let incoming = self.recv_envelope(channel, Some(r - step));
                value = incoming.values[0];
                have = true;
            } else if have && r % (2 * step) == 0 && r + step < p {
                self.send(
                    r + step,
                    Envelope {
                        channel,
                        source: r as u32,
                        values: vec![value],
                    }
                    .to_bytes(),
                );
            }
        }
        value
    }

    /// Collective minimum.
    fn all_reduce_min(&self, channel: u32, value: f64) -> f64 {
        self.all_reduce(channel, value, f64::min)
    }

    /// Collective logical or.
    fn all_reduce_or(&self, channel: u32, value: bool) -> bool {
        self.all_reduce(channel, if value { 1.0 } else { 0.0 }, f64::max) != 0.0
    }
}

/// Communicator for a single-rank run.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullCommunicator;

impl Communicator for NullCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, _rank: usize, _message: Vec<u8>) {
        unreachable!("a single-rank communicator has no peers");
    }

    fn recv(&self) -> Vec<u8> {
        unreachable!("a single-rank communicator has no peers");
    }

    fn requeue_recv(&self, _bytes: Vec<u8>) {
        unreachable!("a single-rank communicator has no peers");
    }
}

/// A fully connected group of in-process ranks.
///
/// Each rank owns one receiving channel; sends go directly into the
/// destination's channel. Intended for tests and single-node demos, in
/// the same spirit as running several MPI ranks on one host.
pub struct MeshCommunicator {
    rank: usize,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
    requeued: Mutex<VecDeque<Vec<u8>>>,
}

impl MeshCommunicator {
    /// Create a fully connected mesh of `size` ranks.
    pub fn mesh(size: usize) -> Vec<MeshCommunicator> {
        assert!(size > 0, "communicator needs at least one rank");
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = crossbeam_channel::unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| MeshCommunicator {
                rank,
                peers: senders.clone(),
                inbox,
                requeued: Mutex::new(VecDeque::new()),
            })
            .collect()
    }
}

impl Communicator for MeshCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.peers[rank]
            .send(message)
            .expect("peer rank hung up before the exchange completed");
    }

    fn recv(&self) -> Vec<u8> {
        if let Some(bytes) = self.requeued.lock().unwrap().pop_front() {
            return bytes;
        }
        self.inbox
            .recv()
            .expect("all peer ranks hung up while a receive was pending")
    }

    fn requeue_recv(&self, bytes: Vec<u8>) {
        self.requeued.lock().unwrap().push_back(bytes);
    }
}

fn ceil_log2(n: usize) -> usize {
    let mut levels = 0;
    while (1 << levels) < n {
        levels += 1;
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let e = Envelope {
            channel: 7,
            source: 2,
            values: vec![1.0, -0.5, 3.25],
        };
        let decoded = Envelope::from_bytes(&e.to_bytes());
        assert_eq!(decoded.channel, 7);
        assert_eq!(decoded.source, 2);
        assert_eq!(decoded.values, e.values);
    }

    #[test]
    fn null_communicator_identities() {
        let comm = NullCommunicator;
        assert_eq!(comm.all_reduce_min(0, 3.5), 3.5);
        assert!(!comm.all_reduce_or(0, false));
    }

    #[test]
    fn mesh_all_reduce_min() {
        for size in [1, 2, 3, 4, 5, 8] {
            let comms = MeshCommunicator::mesh(size);
            let values: Vec<f64> = (0..size).map(|r| 10.0 - r as f64).collect();
            let expected = values.iter().cloned().fold(f64::INFINITY, f64::min);

            let results: Vec<f64> = std::thread::scope(|scope| {
                let handles: Vec<_> = comms
                    .iter()
                    .zip(&values)
                    .map(|(comm, &v)| scope.spawn(move || comm.all_reduce_min(1, v)))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            for r in results {
                assert_eq!(r, expected, "size {}", size);
            }
        }
    }

    #[test]
    fn mesh_all_reduce_or() {
        let comms = MeshCommunicator::mesh(3);
        let flags = [false, true, false];
        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .iter()
                .zip(flags)
                .map(|(comm, v)| scope.spawn(move || comm.all_reduce_or(2, v)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|&r| r));
    }

    #[test]
    fn unrelated_channels_are_requeued() {
        let comms = MeshCommunicator::mesh(2);
        let early = Envelope {
            channel: 11,
            source: 1,
            values: vec![42.0],
        };
        let late = Envelope {
            channel: 12,
            source: 1,
            values: vec![7.0],
        };
        comms[1].send(0, early.to_bytes());
        comms[1].send(0, late.to_bytes());

        // Receive out of arrival order; the channel-11 message must
        // survive the detour through the requeue buffer.
        let first = comms[0].recv_envelope(12, None);
        assert_eq!(first.values, vec![7.0]);
        let second = comms[0].recv_envelope(11, None);
        assert_eq!(second.values, vec![42.0]);
    }
}
