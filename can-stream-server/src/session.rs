//! Per-connection session state and the arena that owns it.

use crate::queue::BoundedQueue;
use can_frame_decoder::CanFrame;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

/// Serialized message shared by every session it is delivered to
pub type Outbound = Arc<str>;

/// Stable address of a session slot. The generation makes a handle to a
/// removed session stop resolving even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}.{}", self.index, self.generation)
    }
}

/// One connected observer
#[derive(Debug)]
pub struct ClientSession {
    /// Subscribed frame IDs; empty means everything
    pub subscription: HashSet<u32>,
    /// Optional ID allow-list applied before the subscription
    pub id_filter: Option<Vec<u32>>,
    /// Optional bus allow-list, applied to frames that carry a channel
    pub bus_filter: Option<Vec<u8>>,
    /// Last time the client proved it is alive
    pub last_heartbeat: Instant,
    outbound: BoundedQueue<Outbound>,
    sink: mpsc::Sender<Outbound>,
    delivered: u64,
    dropped: u64,
}

impl ClientSession {
    /// Fresh session: subscribed to nothing, no filters, idle since `now`
    pub fn new(sink: mpsc::Sender<Outbound>, queue_capacity: usize, now: Instant) -> Self {
        Self {
            subscription: HashSet::new(),
            id_filter: None,
            bus_filter: None,
            last_heartbeat: now,
            outbound: BoundedQueue::new(queue_capacity),
            sink,
            delivered: 0,
            dropped: 0,
        }
    }

    /// Whether `frame` passes this session's filters and subscription.
    ///
    /// An empty subscription is a wildcard, so a client that unsubscribes from
    /// everything starts receiving all frames again.
    pub fn wants(&self, frame: &CanFrame) -> bool {
        let id_ok = match &self.id_filter {
            Some(ids) if !ids.is_empty() => ids.contains(&frame.id),
            _ => true,
        };
        let bus_ok = match (&self.bus_filter, frame.channel) {
            (Some(buses), Some(channel)) if !buses.is_empty() => buses.contains(&channel),
            _ => true,
        };
        let subscribed = self.subscription.is_empty() || self.subscription.contains(&frame.id);
        id_ok && bus_ok && subscribed
    }

    /// False once the connection's writer has gone away
    pub fn is_writable(&self) -> bool {
        !self.sink.is_closed()
    }

    /// Queue a message and try to push everything queued to the writer.
    /// Returns true if an older message was evicted to make room.
    pub fn send(&mut self, message: Outbound) -> bool {
        let evicted = self.outbound.push_back(message).is_some();
        if evicted {
            self.dropped += 1;
        }
        self.flush();
        evicted
    }

    /// Hand queued messages to the writer until the queue is empty or the
    /// writer refuses one; a refused message goes back to the head.
    pub fn flush(&mut self) -> usize {
        let mut sent = 0;
        while let Some(message) = self.outbound.pop_front() {
            match self.sink.try_send(message) {
                Ok(()) => {
                    sent += 1;
                    self.delivered += 1;
                }
                Err(TrySendError::Full(message)) | Err(TrySendError::Closed(message)) => {
                    // Just popped, so there is room at the head
                    let _ = self.outbound.push_front(message);
                    break;
                }
            }
        }
        sent
    }

    /// Messages waiting for the transport
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.outbound.capacity()
    }

    /// Messages handed to the writer so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Messages evicted by queue overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    session: Option<ClientSession>,
}

/// Arena of session slots addressed by [`SessionHandle`]
#[derive(Debug, Default)]
pub struct SessionArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl SessionArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session, reusing a freed slot when one exists
    pub fn insert(&mut self, session: ClientSession) -> SessionHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.session = Some(session);
            return SessionHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            session: Some(session),
        });
        SessionHandle { index, generation: 0 }
    }

    /// Take the session out and retire its handle. Stale handles return `None`.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<ClientSession> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(session)
    }

    /// Resolve a handle; `None` if it is stale
    pub fn get(&self, handle: SessionHandle) -> Option<&ClientSession> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_ref())
    }

    /// Mutable variant of [`SessionArena::get`]
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut ClientSession> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_mut())
    }

    /// Live sessions in slot order
    pub fn iter(&self) -> impl Iterator<Item = (SessionHandle, &ClientSession)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.session.as_ref().map(|session| {
                (
                    SessionHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    session,
                )
            })
        })
    }

    /// Live sessions in slot order, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SessionHandle, &mut ClientSession)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.session.as_mut().map(|session| {
                (
                    SessionHandle {
                        index: index as u32,
                        generation,
                    },
                    session,
                )
            })
        })
    }

    /// Handles of every live session
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(capacity: usize, sink_capacity: usize) -> (ClientSession, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(sink_capacity);
        (ClientSession::new(tx, capacity, Instant::now()), rx)
    }

    fn msg(text: &str) -> Outbound {
        Arc::from(text)
    }

    #[test]
    fn test_wildcard_and_subscription() {
        let (mut s, _rx) = session(4, 4);
        assert!(s.wants(&CanFrame::new(0x100, vec![], 0)));
        assert!(s.wants(&CanFrame::new(0x200, vec![], 0)));

        s.subscription.insert(0x100);
        assert!(s.wants(&CanFrame::new(0x100, vec![], 0)));
        assert!(!s.wants(&CanFrame::new(0x200, vec![], 0)));

        s.subscription.clear();
        assert!(s.wants(&CanFrame::new(0x200, vec![], 0)));
    }

    #[test]
    fn test_filters_narrow_delivery() {
        let (mut s, _rx) = session(4, 4);
        s.id_filter = Some(vec![0x100, 0x101]);
        s.subscription.insert(0x101);
        assert!(!s.wants(&CanFrame::new(0x100, vec![], 0)));
        assert!(s.wants(&CanFrame::new(0x101, vec![], 0)));

        s.id_filter = Some(vec![]);
        s.subscription.clear();
        s.bus_filter = Some(vec![1]);
        assert!(s.wants(&CanFrame::new(0x300, vec![], 0)));
        assert!(s.wants(&CanFrame::new(0x300, vec![], 0).with_channel(1)));
        assert!(!s.wants(&CanFrame::new(0x300, vec![], 0).with_channel(2)));
    }

    #[test]
    fn test_send_flushes_to_writer() {
        let (mut s, mut rx) = session(4, 4);
        assert!(!s.send(msg("a")));
        assert!(!s.send(msg("b")));
        assert_eq!(s.queued(), 0);
        assert_eq!(s.delivered(), 2);
        assert_eq!(&*rx.try_recv().unwrap(), "a");
        assert_eq!(&*rx.try_recv().unwrap(), "b");
    }

    #[test]
    fn test_blocked_writer_keeps_order_and_caps_queue() {
        let (mut s, mut rx) = session(3, 1);
        s.send(msg("0")); // goes straight to the writer
        for i in 1..=3 {
            assert!(!s.send(msg(&i.to_string())));
        }
        assert_eq!(s.queued(), 3);

        // Overflow evicts "1", the oldest queued entry
        assert!(s.send(msg("4")));
        assert_eq!(s.queued(), 3);
        assert_eq!(s.dropped(), 1);

        assert_eq!(&*rx.try_recv().unwrap(), "0");
        assert_eq!(s.flush(), 1);
        assert_eq!(&*rx.try_recv().unwrap(), "2");
        s.flush();
        assert_eq!(&*rx.try_recv().unwrap(), "3");
        s.flush();
        assert_eq!(&*rx.try_recv().unwrap(), "4");
        assert_eq!(s.queued(), 0);
    }

    #[test]
    fn test_closed_writer_is_not_writable() {
        let (mut s, rx) = session(2, 2);
        drop(rx);
        assert!(!s.is_writable());
        s.send(msg("lost"));
        assert_eq!(s.queued(), 1);
        assert_eq!(s.delivered(), 0);
    }

    #[test]
    fn test_arena_handles_are_generation_checked() {
        let mut arena = SessionArena::new();
        let (a, _ra) = session(1, 1);
        let (b, _rb) = session(1, 1);

        let ha = arena.insert(a);
        assert_eq!(arena.len(), 1);
        assert!(arena.remove(ha).is_some());
        assert!(arena.remove(ha).is_none());
        assert!(arena.is_empty());

        // Slot is reused with a new generation
        let hb = arena.insert(b);
        assert_ne!(ha, hb);
        assert!(arena.get(ha).is_none());
        assert!(arena.get(hb).is_some());
        assert_eq!(arena.handles(), vec![hb]);
    }

    #[test]
    fn test_arena_iteration() {
        let mut arena = SessionArena::new();
        let mut receivers = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (s, rx) = session(1, 1);
            receivers.push(rx);
            handles.push(arena.insert(s));
        }
        arena.remove(handles[1]);

        let seen: Vec<SessionHandle> = arena.iter().map(|(h, _)| h).collect();
        assert_eq!(seen, vec![handles[0], handles[2]]);

        for (_, s) in arena.iter_mut() {
            s.subscription.insert(1);
        }
        assert!(arena.get(handles[2]).unwrap().subscription.contains(&1));
    }
}
