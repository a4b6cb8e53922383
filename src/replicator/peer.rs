use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::trace;

use super::{FrameDecoder, Message, PeerId};
use crate::prelude::*;

/// What we know about one remote.
#[derive(Debug)]
pub(crate) struct Peer {
    pub id: PeerId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pub decoder: FrameDecoder,
    /// Set once the remote sent its `Info`.
    pub synced: bool,
    pub length: u64,
    pub fork: u64,
    /// Blocks the remote announced.
    pub have: Bitfield,
    pub extensions: Vec<String>,
    pub inflight: usize,
    /// Blocks this peer recently failed to deliver, with the ticks left
    /// before they may be asked for again.
    pub skip: HashMap<u64, u32>,
    /// Byte offsets this peer failed to seek to, like `skip`.
    pub seek_skip: HashMap<u64, u32>,
    /// The remote length last checked for conflicts.
    pub checked: u64,
    /// A fork this peer failed to prove.
    pub bad_fork: Option<u64>,
}

impl Peer {
    pub fn new(id: PeerId, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            tx,
            decoder: FrameDecoder::new(),
            synced: false,
            length: 0,
            fork: 0,
            have: Bitfield::new(),
            extensions: Vec::new(),
            inflight: 0,
            skip: HashMap::new(),
            seek_skip: HashMap::new(),
            checked: 0,
            bad_fork: None,
        }
    }

    /// Queues `message` on the channel. `false` once the channel is gone.
    pub fn send(&self, message: &Message) -> bool {
        trace!(target: "mulog::replicator", peer = self.id, ?message, "send");
        match message.encode() {
            Ok(frame) => self.tx.send(frame).is_ok(),
            Err(_) => false,
        }
    }

    pub fn closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn has(&self, index: u64) -> bool {
        index < self.length && self.have.get(index)
    }

    /// Whether block `index` may be requested from this peer.
    pub fn can_serve(&self, index: u64) -> bool {
        self.has(index) && !self.skip.contains_key(&index)
    }

    /// Whether requests may be sent to this peer while we are on `fork`.
    pub fn active(&self, fork: u64) -> bool {
        self.synced && self.fork == fork
    }

    /// Records a `Have` or `Unhave` range. Blocks the remote claims must
    /// lie within the length it announced.
    pub fn announce(&mut self, start: u64, length: u64, present: bool) -> Result<()> {
        let end = start
            .checked_add(length)
            .ok_or_else(|| Error::InvalidRequest(format!("range {start}+{length} overflows")))?;
        if present && end > self.length {
            return Err(Error::InvalidRequest(format!(
                "have up to {end} beyond announced length {}",
                self.length
            )));
        }
        self.have.set_range(start, end.min(self.length.max(start)) - start, present);
        Ok(())
    }

    /// Records a packed `Have` buffer starting at block `start`.
    pub fn announce_buffer(&mut self, start: u64, buffer: &[u8]) -> Result<()> {
        let fits = start <= self.length
            && buffer.len() as u64 <= (self.length - start).div_ceil(8);
        if !fits {
            return Err(Error::InvalidRequest(format!(
                "have buffer of {} bytes at {start} beyond announced length {}",
                buffer.len(),
                self.length
            )));
        }
        self.have.insert_buffer(start, buffer);
        Ok(())
    }

    /// Counts down skipped blocks, forgetting those whose time is up.
    pub fn tick(&mut self) {
        for skip in [&mut self.skip, &mut self.seek_skip] {
            skip.retain(|_, ticks| {
                *ticks = ticks.saturating_sub(1);
                *ticks > 0
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_is_bounded_by_length() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut peer = Peer::new(1, tx);

        peer.length = 5;
        peer.announce(2, 3, true).unwrap();
        assert!(peer.has(4));
        assert!(!peer.has(1));

        peer.length = 3;
        assert!(!peer.has(4));
    }

    #[test]
    fn test_skipped_blocks_expire() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut peer = Peer::new(1, tx);
        peer.length = 1;
        peer.announce(0, 1, true).unwrap();

        peer.skip.insert(0, 2);
        assert!(!peer.can_serve(0));
        peer.tick();
        assert!(!peer.can_serve(0));
        peer.tick();
        assert!(peer.can_serve(0));
    }

    #[test]
    fn test_haves_past_the_announced_length_are_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut peer = Peer::new(1, tx);
        peer.length = 5;

        assert!(matches!(
            peer.announce(u64::MAX - 1, 5, true),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            peer.announce(0, 1 << 40, true),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            peer.announce_buffer(0, &[0xff; 2]),
            Err(Error::InvalidRequest(_))
        ));
        assert!(!peer.has(0));

        peer.announce_buffer(0, &[0b1010_1000]).unwrap();
        assert!(peer.has(0) && !peer.has(1) && peer.has(4));
    }

    #[test]
    fn test_unhave_past_the_length_is_clamped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut peer = Peer::new(1, tx);
        peer.length = 4;
        peer.announce(0, 4, true).unwrap();

        peer.announce(2, u64::MAX - 2, false).unwrap();
        assert!(peer.has(1));
        assert!(!peer.has(2));
    }

    #[test]
    fn test_send_fails_once_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::new(1, tx);

        assert!(peer.send(&Message::Close));
        drop(rx);
        assert!(!peer.send(&Message::Close));
    }
}
