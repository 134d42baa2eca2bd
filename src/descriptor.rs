//! Per-descriptor subscriber state.
//!
//! Each watched descriptor owns a [`DescriptorInfo`]: the set of subscribed
//! ports with their event masks and token balances, plus the flag recording
//! whether kernel filters are currently installed. Listening sockets admit
//! many subscribers served round-robin; everything else admits exactly one.
//!
//! Token accounting drives backpressure. Handing an event to a subscriber
//! consumes one token; a subscriber with no tokens stops contributing to
//! [`DescriptorInfo::mask`], which in turn removes its kernel filters until
//! credit is returned.

use std::os::fd::RawFd;

use crate::errno::retry_on_eintr;
use crate::events::EventBits;
use crate::mailbox::{Port, PortSink};

/// One (port, mask, tokens) subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subscriber {
    port: Port,
    mask: EventBits,
    tokens: i64,
}

impl Subscriber {
    fn new(port: Port, mask: EventBits) -> Subscriber {
        Subscriber {
            port,
            mask,
            tokens: 1,
        }
    }

    fn is_ready(&self) -> bool {
        self.tokens > 0
    }
}

#[derive(Debug)]
enum Subscribers {
    /// At most one subscriber; regular sockets.
    Single(Option<Subscriber>),
    /// Ordered subscribers plus the round-robin cursor; listening sockets.
    Multiple { subs: Vec<Subscriber>, cursor: usize },
}

/// State of one kernel descriptor under observation.
#[derive(Debug)]
pub struct DescriptorInfo {
    fd: RawFd,
    tracked_by_kqueue: bool,
    subscribers: Subscribers,
}

/// Subscriber-selection mask for a translated event.
///
/// Close notifications originate from the read filter, so they go to
/// subscribers that asked for `IN`.
fn selection_mask(event_mask: EventBits) -> EventBits {
    let mut mask = event_mask & EventBits::SUBSCRIBABLE;
    if event_mask.contains(EventBits::CLOSE) {
        mask |= EventBits::IN;
    }
    mask
}

impl DescriptorInfo {
    /// A descriptor admitting exactly one subscriber.
    pub fn single(fd: RawFd) -> DescriptorInfo {
        DescriptorInfo {
            fd,
            tracked_by_kqueue: false,
            subscribers: Subscribers::Single(None),
        }
    }

    /// A listening descriptor admitting many subscribers, served round-robin.
    pub fn multiple(fd: RawFd) -> DescriptorInfo {
        DescriptorInfo {
            fd,
            tracked_by_kqueue: false,
            subscribers: Subscribers::Multiple {
                subs: Vec::new(),
                cursor: 0,
            },
        }
    }

    /// The wrapped descriptor, or `-1` after [`DescriptorInfo::close`].
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.subscribers, Subscribers::Multiple { .. })
    }

    /// True iff at least one kernel filter is installed for this descriptor.
    pub fn tracked_by_kqueue(&self) -> bool {
        self.tracked_by_kqueue
    }

    pub(crate) fn set_tracked_by_kqueue(&mut self, tracked: bool) {
        self.tracked_by_kqueue = tracked;
    }

    /// Union of the masks of all subscribers holding tokens. The kernel
    /// filter set mirrors exactly this value.
    pub fn mask(&self) -> EventBits {
        match &self.subscribers {
            Subscribers::Single(sub) => sub
                .filter(|s| s.is_ready())
                .map(|s| s.mask)
                .unwrap_or(EventBits::NONE),
            Subscribers::Multiple { subs, .. } => subs
                .iter()
                .filter(|s| s.is_ready())
                .fold(EventBits::NONE, |acc, s| acc | s.mask),
        }
    }

    pub fn has_read_event(&self) -> bool {
        self.mask().contains(EventBits::IN)
    }

    pub fn has_write_event(&self) -> bool {
        self.mask().contains(EventBits::OUT)
    }

    /// Upserts the subscription for `port`. A new subscriber starts with one
    /// token; updating an existing subscription keeps its balance.
    pub fn set_port_and_mask(&mut self, port: Port, mask: EventBits) {
        debug_assert!(EventBits::SUBSCRIBABLE.contains(mask));
        match &mut self.subscribers {
            Subscribers::Single(sub) => match sub {
                Some(existing) if existing.port == port => existing.mask = mask,
                _ => *sub = Some(Subscriber::new(port, mask)),
            },
            Subscribers::Multiple { subs, .. } => {
                if let Some(index) = subs.iter().position(|s| s.port == port) {
                    subs[index].mask = mask;
                } else {
                    subs.push(Subscriber::new(port, mask));
                }
            }
        }
    }

    /// Drops the subscription for `port`, if present.
    pub fn remove_port(&mut self, port: Port) {
        match &mut self.subscribers {
            Subscribers::Single(sub) => {
                if sub.map(|s| s.port) == Some(port) {
                    *sub = None;
                }
            }
            Subscribers::Multiple { subs, cursor } => {
                if let Some(index) = subs.iter().position(|s| s.port == port) {
                    subs.remove(index);
                    if index < *cursor {
                        *cursor -= 1;
                    }
                    if *cursor >= subs.len() {
                        *cursor = 0;
                    }
                }
            }
        }
    }

    /// Credits `count` flow-control tokens to the subscriber for `port`.
    pub fn return_tokens(&mut self, port: Port, count: i64) {
        match &mut self.subscribers {
            Subscribers::Single(sub) => {
                if let Some(existing) = sub.as_mut().filter(|s| s.port == port) {
                    existing.tokens += count;
                }
            }
            Subscribers::Multiple { subs, .. } => {
                if let Some(existing) = subs.iter_mut().find(|s| s.port == port) {
                    existing.tokens += count;
                }
            }
        }
    }

    /// Current token balance of the subscriber for `port`.
    pub fn token_count(&self, port: Port) -> Option<i64> {
        match &self.subscribers {
            Subscribers::Single(sub) => sub.filter(|s| s.port == port).map(|s| s.tokens),
            Subscribers::Multiple { subs, .. } => {
                subs.iter().find(|s| s.port == port).map(|s| s.tokens)
            }
        }
    }

    /// Picks the subscriber receiving `event_mask`, consuming one token.
    ///
    /// For listening descriptors this walks the subscriber list round-robin,
    /// skipping entries without tokens or without a matching interest. It is
    /// a programming error to call this when no subscriber is eligible; the
    /// loop checks [`DescriptorInfo::mask`] before routing.
    pub fn next_notify_port(&mut self, event_mask: EventBits) -> Port {
        let selection = selection_mask(event_mask);
        match &mut self.subscribers {
            Subscribers::Single(sub) => {
                let sub = sub
                    .as_mut()
                    .expect("no subscriber eligible for readiness event");
                debug_assert!(sub.is_ready() && sub.mask.intersects(selection));
                sub.tokens -= 1;
                sub.port
            }
            Subscribers::Multiple { subs, cursor } => {
                let len = subs.len();
                for step in 0..len {
                    let index = (*cursor + step) % len;
                    let sub = &mut subs[index];
                    if sub.is_ready() && sub.mask.intersects(selection) {
                        sub.tokens -= 1;
                        *cursor = (index + 1) % len;
                        return sub.port;
                    }
                }
                panic!("no subscriber eligible for readiness event");
            }
        }
    }

    /// Delivers `event_mask` to every subscribed port.
    pub fn notify_all_ports(&self, event_mask: EventBits, sink: &dyn PortSink) {
        let value = event_mask.bits() as i32;
        match &self.subscribers {
            Subscribers::Single(sub) => {
                if let Some(sub) = sub {
                    sink.post_int32(sub.port, value);
                }
            }
            Subscribers::Multiple { subs, .. } => {
                for sub in subs {
                    sink.post_int32(sub.port, value);
                }
            }
        }
    }

    /// Closes the kernel descriptor. Idempotent.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            let _ = retry_on_eintr(|| unsafe { libc::close(self.fd) });
            self.fd = -1;
        }
    }
}
