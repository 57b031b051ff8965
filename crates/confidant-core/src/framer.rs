//! Stream framer: items in, packets out, over one channel.
//!
//! Outbound items are encoded when queued and wait in one of two queues;
//! control packets always go before bulk ones. A packet the channel only
//! partly accepted stays pending and its remaining bytes are retried
//! before anything else is sent.
//!
//! Inbound bytes are parsed header-first: the 8-byte header is read (and
//! bounds-checked) before any body byte, so a hostile length can never make
//! the framer allocate past [`MAX_PACKET_SIZE`]. A header outside the allowed
//! range closes the connection; a body that fails to decode is dropped and
//! the connection continues.
//!
//! Queues are shared behind a mutex so that application threads can queue
//! items without touching the socket; only [`StreamFramer::tick`] does I/O.

use crate::bandwidth::{Allowance, RateMeter};
use crate::channel::Channel;
use crate::error::{ChannelError, WireError};
use crate::item::{Item, RoutedItem};
use crate::packet::{HEADER_SIZE, MAX_PACKET_SIZE, PacketHeader};
use crate::registry::Registry;
use confidant_crypto::PeerId;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Framer tuning
#[derive(Debug, Clone)]
pub struct FramerConfig {
    /// Consecutive ticks a packet body may fail to make progress before the
    /// connection is declared dead
    pub max_body_stalls: u32,
    /// Queued outbound bytes per peer before `send` refuses bulk items
    pub max_queued_bytes: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_body_stalls: 200,
            max_queued_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Why an item could not be queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Item failed to encode
    #[error("encode failed: {0}")]
    Encode(#[from] WireError),
    /// Too many bytes already waiting for this peer
    #[error("outbound queue full")]
    Full,
}

#[derive(Default)]
struct Queues {
    control: VecDeque<Vec<u8>>,
    bulk: VecDeque<Vec<u8>>,
    queued_bytes: usize,
}

/// Outbound packet queues for one peer.
pub struct OutboundQueue {
    inner: Mutex<Queues>,
    max_bytes: usize,
}

impl OutboundQueue {
    /// Empty queue that refuses bulk items beyond `max_bytes`.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Queues::default()),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode and queue `item`. Control items bypass the size limit.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Encode`] if the item cannot be encoded and
    /// [`QueueError::Full`] if the bulk limit is reached.
    pub fn push(&self, item: &Item) -> Result<(), QueueError> {
        let bytes = item.to_bytes()?;
        let mut q = self.lock();
        if item.is_control() {
            q.queued_bytes += bytes.len();
            q.control.push_back(bytes);
        } else {
            if q.queued_bytes + bytes.len() > self.max_bytes {
                return Err(QueueError::Full);
            }
            q.queued_bytes += bytes.len();
            q.bulk.push_back(bytes);
        }
        Ok(())
    }

    /// Queue raw packet bytes ahead of bulk items.
    #[cfg(test)]
    pub(crate) fn push_raw(&self, bytes: Vec<u8>) {
        let mut q = self.lock();
        q.queued_bytes += bytes.len();
        q.control.push_back(bytes);
    }

    /// Next packet to send, control first
    pub fn pop(&self) -> Option<Vec<u8>> {
        let mut q = self.lock();
        let next = q.control.pop_front().or_else(|| q.bulk.pop_front())?;
        q.queued_bytes -= next.len();
        Some(next)
    }

    /// Drop everything queued. Returns the number of packets discarded.
    pub fn clear(&self) -> usize {
        let mut q = self.lock();
        let n = q.control.len() + q.bulk.len();
        *q = Queues::default();
        n
    }

    /// Packets waiting
    #[must_use]
    pub fn len(&self) -> usize {
        let q = self.lock();
        q.control.len() + q.bulk.len()
    }

    /// True when nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes waiting
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.lock().queued_bytes
    }
}

enum ReadState {
    Header { buf: [u8; HEADER_SIZE], filled: usize },
    Body { packet: Vec<u8>, filled: usize, stalls: u32 },
}

impl ReadState {
    fn header() -> Self {
        ReadState::Header {
            buf: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Per-framer traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Items decoded
    pub items_in: u64,
    /// Items fully written
    pub items_out: u64,
    /// Bytes read from the channel
    pub bytes_in: u64,
    /// Bytes written to the channel
    pub bytes_out: u64,
    /// Packets of acceptable size that failed to decode
    pub dropped: u64,
}

impl std::ops::AddAssign for FramerStats {
    fn add_assign(&mut self, rhs: Self) {
        self.items_in += rhs.items_in;
        self.items_out += rhs.items_out;
        self.bytes_in += rhs.bytes_in;
        self.bytes_out += rhs.bytes_out;
        self.dropped += rhs.dropped;
    }
}

/// Moves items between a peer's queues and its channel.
pub struct StreamFramer {
    peer: PeerId,
    channel: Box<dyn Channel>,
    registry: Arc<Registry>,
    outbound: Arc<OutboundQueue>,
    pending: Option<(Vec<u8>, usize)>,
    read_state: ReadState,
    config: FramerConfig,
    out_allowance: Allowance,
    in_allowance: Allowance,
    out_meter: RateMeter,
    in_meter: RateMeter,
    stats: FramerStats,
}

impl StreamFramer {
    /// Wrap an established channel to `peer`.
    pub fn new(
        peer: PeerId,
        channel: Box<dyn Channel>,
        registry: Arc<Registry>,
        outbound: Arc<OutboundQueue>,
        config: FramerConfig,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            channel,
            registry,
            outbound,
            pending: None,
            read_state: ReadState::header(),
            config,
            out_allowance: Allowance::new(0, now),
            in_allowance: Allowance::new(0, now),
            out_meter: RateMeter::new(now),
            in_meter: RateMeter::new(now),
            stats: FramerStats::default(),
        }
    }

    /// Peer this framer talks to
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Shared outbound queue
    #[must_use]
    pub fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }

    /// Traffic counters
    #[must_use]
    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// True while the channel is usable
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.channel.is_active()
    }

    /// True when the previous tick could have moved more data
    #[must_use]
    pub fn has_pending_io(&self) -> bool {
        self.pending.is_some() || !self.outbound.is_empty() || self.channel.more_to_read()
    }

    /// Smoothed (inbound, outbound) rates in bytes per second
    #[must_use]
    pub fn rates(&self) -> (f64, f64) {
        (self.in_meter.rate(), self.out_meter.rate())
    }

    /// Current (inbound, outbound) caps; 0 = unlimited
    #[must_use]
    pub fn caps(&self) -> (u64, u64) {
        (self.in_allowance.cap(), self.out_allowance.cap())
    }

    /// Apply new rate caps; 0 = unlimited.
    pub fn set_caps(&mut self, inbound: u64, outbound: u64) {
        self.in_allowance.set_cap(inbound);
        self.out_allowance.set_cap(outbound);
    }

    /// Close the channel and abandon any partial read or write.
    pub fn close(&mut self) {
        self.channel.close();
        self.pending = None;
        self.read_state = ReadState::header();
    }

    /// Move data in both directions within the current allowances.
    ///
    /// Returns the items decoded this tick, stamped with the peer id.
    ///
    /// # Errors
    ///
    /// Any error means this connection is finished: the channel failed, the
    /// peer sent an out-of-range header, or a body stalled too long.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<RoutedItem>, ChannelError> {
        self.channel.poll(now)?;
        self.out_allowance.refill(now);
        self.in_allowance.refill(now);

        self.write_packets()?;
        let items = self.read_packets()?;

        self.out_meter.sample(now);
        self.in_meter.sample(now);
        Ok(items)
    }

    fn write_packets(&mut self) -> Result<(), ChannelError> {
        while self.channel.can_write() {
            let budget = self.out_allowance.available();
            if budget == 0 {
                break;
            }
            let (packet, offset) = match self.pending.take() {
                Some(p) => p,
                None => match self.outbound.pop() {
                    Some(packet) => (packet, 0),
                    None => break,
                },
            };

            let end = packet.len().min(offset.saturating_add(budget));
            let n = self.channel.write(&packet[offset..end])?;
            self.out_allowance.consume(n);
            self.out_meter.record(n);
            self.stats.bytes_out += n as u64;

            let offset = offset + n;
            if offset == packet.len() {
                self.stats.items_out += 1;
                trace!("Sent {} byte packet to peer {}", packet.len(), self.peer);
            } else {
                let short = offset < end;
                self.pending = Some((packet, offset));
                if short || n == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    fn read_packets(&mut self) -> Result<Vec<RoutedItem>, ChannelError> {
        let mut items = Vec::new();
        loop {
            let budget = self.in_allowance.available();
            if budget == 0 {
                break;
            }
            match &mut self.read_state {
                ReadState::Header { buf, filled } => {
                    let want = (HEADER_SIZE - *filled).min(budget);
                    let n = self.channel.read(&mut buf[*filled..*filled + want])?;
                    if n == 0 {
                        break;
                    }
                    *filled += n;
                    self.in_allowance.consume(n);
                    self.in_meter.record(n);
                    self.stats.bytes_in += n as u64;
                    if *filled < HEADER_SIZE {
                        continue;
                    }

                    let header = match PacketHeader::parse(buf) {
                        Ok(h) => h,
                        Err(e) => {
                            warn!("Peer {} sent unusable packet header: {}", self.peer, e);
                            return Err(ChannelError::Malformed(e));
                        }
                    };
                    let mut packet = vec![0u8; header.length as usize];
                    packet[..HEADER_SIZE].copy_from_slice(buf);
                    if header.body_len() == 0 {
                        self.finish_packet(&packet, &mut items);
                        self.read_state = ReadState::header();
                    } else {
                        self.read_state = ReadState::Body {
                            packet,
                            filled: HEADER_SIZE,
                            stalls: 0,
                        };
                    }
                }
                ReadState::Body { packet, filled, stalls } => {
                    let want = (packet.len() - *filled).min(budget);
                    let n = self.channel.read(&mut packet[*filled..*filled + want])?;
                    if n == 0 {
                        *stalls += 1;
                        if *stalls > self.config.max_body_stalls {
                            debug!("Packet body from peer {} stalled, closing", self.peer);
                            return Err(ChannelError::Stalled(*stalls));
                        }
                        break;
                    }
                    *stalls = 0;
                    *filled += n;
                    self.in_allowance.consume(n);
                    self.in_meter.record(n);
                    self.stats.bytes_in += n as u64;
                    if *filled == packet.len() {
                        let packet = std::mem::take(packet);
                        self.read_state = ReadState::header();
                        self.finish_packet(&packet, &mut items);
                    }
                }
            }
        }
        Ok(items)
    }

    fn finish_packet(&mut self, packet: &[u8], items: &mut Vec<RoutedItem>) {
        match self.registry.decode(packet) {
            Ok(item) => {
                self.stats.items_in += 1;
                items.push(RoutedItem {
                    peer: self.peer,
                    item,
                });
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!("Dropping undecodable packet from peer {}: {}", self.peer, e);
            }
        }
    }
}

impl Drop for StreamFramer {
    fn drop(&mut self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ControlItem;
    use std::time::Duration;

    /// Scripted channel: inbound bytes are released in chunks, outbound
    /// writes accept at most `write_limit` bytes each.
    struct MockChannel {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<Vec<u8>>>,
        write_limit: usize,
        writable: bool,
        open: bool,
    }

    impl Channel for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
            let mut q = self.inbound.lock().unwrap();
            let n = buf.len().min(q.len());
            for (d, s) in buf.iter_mut().zip(q.drain(..n)) {
                *d = s;
            }
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
            let n = buf.len().min(self.write_limit);
            self.outbound.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn is_active(&self) -> bool {
            self.open
        }

        fn can_write(&self) -> bool {
            self.writable
        }

        fn more_to_read(&self) -> bool {
            !self.inbound.lock().unwrap().is_empty()
        }

        fn close(&mut self) {
            self.open = false;
        }
    }

    struct Harness {
        framer: StreamFramer,
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<Vec<u8>>>,
        queue: Arc<OutboundQueue>,
    }

    fn harness(write_limit: usize, max_body_stalls: u32) -> Harness {
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let channel = MockChannel {
            inbound: Arc::clone(&inbound),
            outbound: Arc::clone(&outbound),
            write_limit,
            writable: true,
            open: true,
        };
        let mut registry = Registry::default();
        registry.register_service(0x0042);
        let queue = Arc::new(OutboundQueue::new(1 << 20));
        let framer = StreamFramer::new(
            PeerId::new(9),
            Box::new(channel),
            Arc::new(registry),
            Arc::clone(&queue),
            FramerConfig {
                max_body_stalls,
                ..FramerConfig::default()
            },
            Instant::now(),
        );
        Harness {
            framer,
            inbound,
            outbound,
            queue,
        }
    }

    #[test]
    fn test_control_goes_first() {
        let mut h = harness(usize::MAX, 10);
        let bulk = Item::service(0x0042, 1, vec![7; 32]);
        let control = Item::Control(ControlItem::Heartbeat);
        h.queue.push(&bulk).unwrap();
        h.queue.push(&control).unwrap();

        h.framer.tick(Instant::now()).unwrap();

        let out = h.outbound.lock().unwrap().clone();
        let hb = control.to_bytes().unwrap();
        assert_eq!(&out[..hb.len()], &hb[..]);
        assert_eq!(&out[hb.len()..], &bulk.to_bytes().unwrap()[..]);
        assert_eq!(h.framer.stats().items_out, 2);
    }

    #[test]
    fn test_partial_write_resumes_verbatim() {
        let mut h = harness(5, 10);
        let first = Item::service(0x0042, 1, vec![1; 20]);
        h.queue.push(&first).unwrap();

        let now = Instant::now();
        h.framer.tick(now).unwrap();
        // a control item queued mid-packet must not interleave
        h.queue.push(&Item::Control(ControlItem::Heartbeat)).unwrap();
        for _ in 0..10 {
            h.framer.tick(now).unwrap();
        }

        let out = h.outbound.lock().unwrap().clone();
        let expected_first = first.to_bytes().unwrap();
        assert_eq!(&out[..expected_first.len()], &expected_first[..]);
        assert_eq!(
            &out[expected_first.len()..],
            &Item::Control(ControlItem::Heartbeat).to_bytes().unwrap()[..]
        );
    }

    #[test]
    fn test_reads_split_packets() {
        let mut h = harness(usize::MAX, 10);
        let item = Item::service(0x0042, 3, b"hello world".to_vec());
        let bytes = item.to_bytes().unwrap();

        let now = Instant::now();
        let mut got = Vec::new();
        for chunk in bytes.chunks(3) {
            h.inbound.lock().unwrap().extend(chunk);
            got.extend(h.framer.tick(now).unwrap());
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].peer, PeerId::new(9));
        assert_eq!(got[0].item, item);
    }

    #[test]
    fn test_oversized_header_closes() {
        let mut h = harness(usize::MAX, 10);
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&0x0200_4200u32.to_be_bytes());
        header[4..].copy_from_slice(&((MAX_PACKET_SIZE as u32) + 1).to_be_bytes());
        h.inbound.lock().unwrap().extend(header);

        let err = h.framer.tick(Instant::now()).unwrap_err();
        assert!(matches!(err, ChannelError::Malformed(WireError::TooLarge(_))));
    }

    #[test]
    fn test_undecodable_packet_dropped_connection_kept() {
        let mut h = harness(usize::MAX, 10);
        // unregistered service
        let junk = Item::service(0x0099, 0, vec![1, 2, 3]).to_bytes().unwrap();
        let good = Item::Control(ControlItem::Heartbeat);
        h.inbound.lock().unwrap().extend(junk);
        h.inbound.lock().unwrap().extend(good.to_bytes().unwrap());

        let items = h.framer.tick(Instant::now()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item, good);
        assert_eq!(h.framer.stats().dropped, 1);
    }

    #[test]
    fn test_body_stall_limit() {
        let mut h = harness(usize::MAX, 3);
        let bytes = Item::service(0x0042, 0, vec![0; 100]).to_bytes().unwrap();
        h.inbound.lock().unwrap().extend(&bytes[..20]);

        let now = Instant::now();
        for _ in 0..3 {
            h.framer.tick(now).unwrap();
        }
        assert!(matches!(h.framer.tick(now), Err(ChannelError::Stalled(4))));
    }

    #[test]
    fn test_outbound_cap_limits_bytes() {
        let mut h = harness(usize::MAX, 10);
        let start = Instant::now();
        h.framer.set_caps(0, 4000);
        for _ in 0..10 {
            h.queue.push(&Item::service(0x0042, 0, vec![0; 992])).unwrap();
        }
        // fresh bucket holds a quarter second of allowance
        h.framer.tick(start).unwrap();
        assert_eq!(h.outbound.lock().unwrap().len(), 1000);

        h.framer.tick(start + Duration::from_millis(500)).unwrap();
        assert_eq!(h.outbound.lock().unwrap().len(), 2000);
        assert_eq!(h.framer.caps(), (0, 4000));
    }

    #[test]
    fn test_queue_limits_bulk_not_control() {
        let q = OutboundQueue::new(100);
        assert!(q.push(&Item::service(1, 0, vec![0; 80])).is_ok());
        assert_eq!(q.push(&Item::service(1, 0, vec![0; 80])), Err(QueueError::Full));
        assert!(q.push(&Item::Control(ControlItem::Heartbeat)).is_ok());
        assert_eq!(q.len(), 2);
        assert_eq!(q.clear(), 2);
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn test_close_abandons_partial_state() {
        let mut h = harness(3, 10);
        h.queue.push(&Item::service(0x0042, 0, vec![0; 50])).unwrap();
        h.framer.tick(Instant::now()).unwrap();
        assert!(h.framer.has_pending_io());
        h.framer.close();
        assert!(!h.framer.is_active());
    }
}
