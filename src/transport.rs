//! Transport - moves exchange batches between neighboring subdomains.
//!
//! A batch sent on direction `d` arrives at the neighbor as a batch for
//! `mirror(d)`. Lost, reordered or undeliverable batches are hard errors.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::error::{StoreError, StoreResult};
use crate::grid::Direction;

/// Delivers exchange batches to and from neighbors.
pub trait Transport<P, const D: usize> {
    /// Hand a drained queue to the neighbor in `direction`.
    fn send(&mut self, direction: Direction<D>, batch: Vec<P>) -> StoreResult<()>;

    /// Take the batch the neighbor in `direction` sent towards us.
    fn receive(&mut self, direction: Direction<D>) -> StoreResult<Vec<P>>;
}

/// In-process mailboxes: every subdomain is its own (periodic) neighbor.
///
/// Also used to connect two stores living in one process.
#[derive(Debug)]
pub struct MailboxTransport<P> {
    mailboxes: FxHashMap<u8, VecDeque<Vec<P>>>,
    delivered: u64,
}

impl<P> Default for MailboxTransport<P> {
    fn default() -> Self {
        Self {
            mailboxes: FxHashMap::default(),
            delivered: 0,
        }
    }
}

impl<P> MailboxTransport<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches waiting across all directions
    pub fn pending(&self) -> usize {
        self.mailboxes.values().map(VecDeque::len).sum()
    }

    /// Lifetime count of delivered batches
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl<P, const D: usize> Transport<P, D> for MailboxTransport<P> {
    fn send(&mut self, direction: Direction<D>, batch: Vec<P>) -> StoreResult<()> {
        self.mailboxes
            .entry(direction.mirror().id())
            .or_default()
            .push_back(batch);
        Ok(())
    }

    fn receive(&mut self, direction: Direction<D>) -> StoreResult<Vec<P>> {
        let batch = self
            .mailboxes
            .get_mut(&direction.id())
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| StoreError::transport(direction.id(), "no batch pending"))?;
        self.delivered += 1;
        Ok(batch)
    }
}

#[cfg(feature = "runtime")]
pub use ring::{Packet, RingTransport};

#[cfg(feature = "runtime")]
mod ring {
    use std::time::{Duration, Instant};

    use rtrb::{Consumer, Producer, RingBuffer};

    use super::Transport;
    use crate::error::{StoreError, StoreResult};
    use crate::grid::Direction;

    /// Wire unit on the ring: one particle, or the end of a batch.
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub enum Packet<P> {
        Particle { direction: u8, particle: P },
        End { direction: u8 },
    }

    /// One end of a pair of SPSC rings between two worker threads.
    ///
    /// Models a two-rank decomposition: both neighbors along the split
    /// axis are the same peer.
    pub struct RingTransport<P> {
        tx: Producer<Packet<P>>,
        rx: Consumer<Packet<P>>,
        timeout: Duration,
    }

    impl<P> RingTransport<P> {
        /// Create two connected ends with rings of `capacity` packets each.
        pub fn pair(capacity: usize) -> (Self, Self) {
            let (a_tx, b_rx) = RingBuffer::new(capacity);
            let (b_tx, a_rx) = RingBuffer::new(capacity);
            let timeout = Duration::from_secs(5);
            (
                Self {
                    tx: a_tx,
                    rx: a_rx,
                    timeout,
                },
                Self {
                    tx: b_tx,
                    rx: b_rx,
                    timeout,
                },
            )
        }

        /// Builder-style wait limit for a stalled peer.
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        fn push(&mut self, mut packet: Packet<P>, direction: u8) -> StoreResult<()> {
            let start = Instant::now();
            loop {
                match self.tx.push(packet) {
                    Ok(()) => return Ok(()),
                    Err(rtrb::PushError::Full(back)) => {
                        if start.elapsed() > self.timeout {
                            return Err(StoreError::transport(direction, "peer ring full"));
                        }
                        packet = back;
                        std::hint::spin_loop();
                    }
                }
            }
        }

        fn pop(&mut self, direction: u8) -> StoreResult<Packet<P>> {
            let start = Instant::now();
            loop {
                if let Ok(packet) = self.rx.pop() {
                    return Ok(packet);
                }
                if start.elapsed() > self.timeout {
                    return Err(StoreError::transport(direction, "timed out waiting for peer"));
                }
                std::hint::spin_loop();
            }
        }
    }

    impl<P, const D: usize> Transport<P, D> for RingTransport<P> {
        fn send(&mut self, direction: Direction<D>, batch: Vec<P>) -> StoreResult<()> {
            let id = direction.id();
            for particle in batch {
                self.push(Packet::Particle { direction: id, particle }, id)?;
            }
            self.push(Packet::End { direction: id }, id)
        }

        fn receive(&mut self, direction: Direction<D>) -> StoreResult<Vec<P>> {
            // The peer tagged the batch with its own send direction.
            let expected = direction.mirror().id();
            let mut batch = Vec::new();
            loop {
                match self.pop(direction.id())? {
                    Packet::Particle { direction: tag, particle } if tag == expected => {
                        batch.push(particle)
                    }
                    Packet::End { direction: tag } if tag == expected => return Ok(batch),
                    Packet::Particle { direction: tag, .. } | Packet::End { direction: tag } => {
                        return Err(StoreError::transport(
                            direction.id(),
                            format!("received batch for direction {} out of order", tag),
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_delivers_to_mirror() {
        let mut transport = MailboxTransport::new();
        let east = Direction::<2>::from_offset([1, 0]).unwrap();
        Transport::<u32, 2>::send(&mut transport, east, vec![1, 2, 3]).unwrap();
        assert_eq!(transport.pending(), 1);

        let batch = Transport::<u32, 2>::receive(&mut transport, east.mirror()).unwrap();
        assert_eq!(batch, vec![1, 2, 3]);
        assert_eq!(transport.delivered(), 1);
    }

    #[test]
    fn test_mailbox_missing_batch_is_error() {
        let mut transport: MailboxTransport<u32> = MailboxTransport::new();
        let north = Direction::<2>::from_offset([0, 1]).unwrap();
        let err = Transport::<u32, 2>::receive(&mut transport, north).unwrap_err();
        assert!(matches!(err, StoreError::Transport { .. }));
    }

    #[test]
    fn test_mailbox_fifo_per_direction() {
        let mut transport = MailboxTransport::new();
        let d = Direction::<1>::from_offset([1]).unwrap();
        Transport::<u8, 1>::send(&mut transport, d, vec![1]).unwrap();
        Transport::<u8, 1>::send(&mut transport, d, vec![2]).unwrap();
        assert_eq!(Transport::<u8, 1>::receive(&mut transport, d.mirror()).unwrap(), vec![1]);
        assert_eq!(Transport::<u8, 1>::receive(&mut transport, d.mirror()).unwrap(), vec![2]);
    }

    #[cfg(feature = "runtime")]
    #[test]
    fn test_ring_pair_across_threads() {
        let (mut left, mut right) = RingTransport::<u64>::pair(16);
        let east = Direction::<1>::from_offset([1]).unwrap();

        std::thread::scope(|s| {
            s.spawn(move || {
                Transport::<u64, 1>::send(&mut left, east, (0..100).collect()).unwrap();
            });
            let batch = Transport::<u64, 1>::receive(&mut right, east.mirror()).unwrap();
            assert_eq!(batch, (0..100).collect::<Vec<_>>());
        });
    }

    #[cfg(feature = "runtime")]
    #[test]
    fn test_ring_rejects_out_of_order_batch() {
        let (mut left, mut right) = RingTransport::<u64>::pair(8);
        let east = Direction::<1>::from_offset([1]).unwrap();
        Transport::<u64, 1>::send(&mut left, east, vec![1]).unwrap();
        // Receiving on +x expects the peer's -x batch
        let err = Transport::<u64, 1>::receive(&mut right, east).unwrap_err();
        assert!(matches!(err, StoreError::Transport { .. }));
    }
}
