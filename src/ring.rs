// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The Packet Ring (A, §4.1): a single-producer / multi-consumer bounded
//! FIFO of packets. The producer never blocks on a slow consumer — when the
//! ring is full, the oldest unread slot is reclaimed and any cursor still
//! behind it observes a lag instead of blocking or silently skipping.
//!
//! Each slot carries the sequence number it was written with. A cursor
//! reads `slots[next_seq % capacity]`; if the stored sequence is greater
//! than expected, the slot has been overwritten since the cursor last
//! advanced and the cursor resyncs with a [`RingEvent::Lagged`] report. This
//! needs no central registry of cursor positions — the producer writes
//! slots unconditionally and consumers detect staleness on read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::packet::Packet;

struct Slot {
    /// Sequence number last written into this slot. `u64::MAX` means empty.
    seq: u64,
    packet: Option<Packet>,
}

struct Inner {
    slots: RwLock<Vec<Slot>>,
    capacity: u64,
    /// Next sequence number to be assigned on publish.
    head: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Outcome of a [`PacketRing::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Ok,
    /// The ring was full; the oldest unread slot was reclaimed.
    DroppedOldest,
}

/// Outcome of a [`Cursor::next`] call.
#[derive(Debug, Clone)]
pub enum RingEvent {
    Packet(Packet),
    /// The ring producer has been closed and no more packets will arrive.
    EndOfStream,
    /// This cursor fell behind and `dropped` packets were skipped. The
    /// cursor has resynced to the oldest packet still available.
    Lagged { dropped: u64 },
    /// No packet was available before the deadline elapsed.
    Timeout,
}

/// Bounded packet ring with `capacity` slots. Cloning is cheap (`Arc`
/// internally); every clone refers to the same ring.
#[derive(Clone)]
pub struct PacketRing {
    inner: Arc<Inner>,
}

impl PacketRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot { seq: u64::MAX, packet: None });
        }
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(slots),
                capacity: capacity as u64,
                head: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Publish a packet. Never blocks. If the ring is full, the oldest
    /// unread slot is overwritten (§4.1 backpressure policy).
    pub fn publish(&self, packet: Packet) -> PublishOutcome {
        let seq = self.inner.head.fetch_add(1, Ordering::SeqCst);
        let idx = (seq % self.inner.capacity) as usize;
        let outcome = {
            let mut slots = self.inner.slots.write();
            let was_occupied = slots[idx].packet.is_some();
            slots[idx] = Slot { seq, packet: Some(packet) };
            if was_occupied && seq >= self.inner.capacity {
                PublishOutcome::DroppedOldest
            } else {
                PublishOutcome::Ok
            }
        };
        self.inner.notify.notify_waiters();
        outcome
    }

    /// Mark the ring closed: `end_of_stream` is the only notification
    /// cursors will see once they drain what is left.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Create a new consumer cursor starting at the oldest packet still
    /// retained (or at the current write head if the ring is empty).
    pub fn subscribe(&self) -> Cursor {
        let head = self.inner.head.load(Ordering::SeqCst);
        let start = head.saturating_sub(self.inner.capacity);
        Cursor { ring: self.inner.clone(), next_seq: start }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity as usize
    }
}

/// A consumer's position into the ring, plus its resync state.
pub struct Cursor {
    ring: Arc<Inner>,
    next_seq: u64,
}

impl Cursor {
    /// Await the next packet in publish order, or resync on lag. Returns
    /// [`RingEvent::Timeout`] if `deadline` elapses first.
    pub async fn next(&mut self, deadline: Instant) -> RingEvent {
        loop {
            {
                let slots = self.ring.slots.read();
                let idx = (self.next_seq % self.ring.capacity) as usize;
                let slot_seq = slots[idx].seq;

                if slot_seq == self.next_seq {
                    let packet = slots[idx].packet.clone();
                    drop(slots);
                    if let Some(packet) = packet {
                        self.next_seq += 1;
                        return RingEvent::Packet(packet);
                    }
                } else if slot_seq != u64::MAX && slot_seq > self.next_seq {
                    // Overwritten since we last advanced: resync past it.
                    let dropped = slot_seq - self.next_seq;
                    self.next_seq = slot_seq;
                    return RingEvent::Lagged { dropped };
                }
                // Not yet published; fall through to wait.
            }

            if self.ring.closed.load(Ordering::SeqCst) {
                let head = self.ring.head.load(Ordering::SeqCst);
                if self.next_seq >= head {
                    return RingEvent::EndOfStream;
                }
            }

            let wait = self.ring.notify.notified();
            tokio::select! {
                _ = wait => {}
                _ = tokio::time::sleep_until(deadline) => return RingEvent::Timeout,
            }
        }
    }

    /// Release a previously read packet. Packets carry reference-counted
    /// payloads, so this is bookkeeping only — dropping the caller's last
    /// handle already frees the bytes. Exposed to satisfy the ring's
    /// borrow/release contract for callers that hold packets across
    /// suspension points.
    pub fn release(&self, _packet: Packet) {}

    pub fn lag_estimate(&self) -> u64 {
        let head = self.ring.head.load(Ordering::SeqCst);
        head.saturating_sub(self.next_seq)
    }
}
