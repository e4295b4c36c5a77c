//! Bookkeeping for requests whose replies must keep their order:
//! global requests in both directions, and requests received on a
//! channel.

use std::collections::{HashMap, VecDeque};

use log::debug;
use tokio::sync::oneshot;

use crate::Error;

/// Replies to requests received from the peer, in arrival order.
///
/// Each request gets a slot when it arrives. Slots may be resolved in
/// any order, but only a resolved prefix of the queue is released, so
/// the peer always sees replies in the order it sent the requests.
#[derive(Debug)]
pub(crate) struct ReplyQueue<C, R> {
    next_slot: u64,
    slots: VecDeque<Slot<C, R>>,
}

#[derive(Debug)]
struct Slot<C, R> {
    id: u64,
    want_reply: bool,
    context: C,
    reply: Option<R>,
}

/// A slot released from the head of a [`ReplyQueue`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Released<C, R> {
    pub want_reply: bool,
    pub context: C,
    pub reply: R,
}

impl<C, R> Default for ReplyQueue<C, R> {
    fn default() -> Self {
        ReplyQueue {
            next_slot: 0,
            slots: VecDeque::new(),
        }
    }
}

impl<C, R> ReplyQueue<C, R> {
    pub fn push(&mut self, want_reply: bool, context: C) -> u64 {
        let id = self.next_slot;
        self.next_slot += 1;
        self.slots.push_back(Slot {
            id,
            want_reply,
            context,
            reply: None,
        });
        id
    }

    /// Records the decision for `slot`. Returns `false` if the slot is
    /// unknown or was already resolved.
    pub fn resolve(&mut self, slot: u64, reply: R) -> bool {
        match self.slots.iter_mut().find(|s| s.id == slot) {
            Some(s) if s.reply.is_none() => {
                s.reply = Some(reply);
                true
            }
            _ => {
                debug!("ignoring decision for slot {slot}");
                false
            }
        }
    }

    /// Pops every resolved slot at the head of the queue.
    pub fn release(&mut self) -> Vec<Released<C, R>> {
        let mut released = Vec::new();
        while self.slots.front().is_some_and(|s| s.reply.is_some()) {
            if let Some(Slot {
                want_reply,
                context,
                reply: Some(reply),
                ..
            }) = self.slots.pop_front()
            {
                released.push(Released {
                    want_reply,
                    context,
                    reply,
                })
            }
        }
        released
    }

    pub fn clear(&mut self) {
        self.slots.clear()
    }
}

/// A global request we sent, waiting for `REQUEST_SUCCESS` or `REQUEST_FAILURE`.
#[derive(Debug)]
pub enum GlobalRequestResponse {
    /// `keepalive@openssh.com`, either reply proves the peer is alive.
    Ping(oneshot::Sender<Result<(), Error>>),
    TcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<u32, Error>>,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

impl GlobalRequestResponse {
    /// Resolves the request with the peer's answer, updating `forwards`
    /// when a forwarding was set up or torn down.
    pub(crate) fn complete(self, reply: Result<Option<u32>, ()>, forwards: &mut RemoteForwards) {
        match self {
            GlobalRequestResponse::Ping(sender) => {
                let _ = sender.send(Ok(()));
            }
            GlobalRequestResponse::TcpIpForward {
                address,
                port,
                reply: sender,
            } => {
                let result = match reply {
                    Ok(bound_port) => {
                        let bound_port = bound_port.unwrap_or(port);
                        forwards.insert(&address, port, bound_port);
                        Ok(bound_port)
                    }
                    Err(()) => Err(Error::RequestDenied),
                };
                let _ = sender.send(result);
            }
            GlobalRequestResponse::CancelTcpIpForward {
                address,
                port,
                reply: sender,
            } => {
                let result = match reply {
                    Ok(_) => {
                        forwards.remove(&address, port);
                        Ok(())
                    }
                    Err(()) => Err(Error::RequestDenied),
                };
                let _ = sender.send(result);
            }
        }
    }

    /// The connection went away before the peer replied.
    pub(crate) fn fail(self) {
        match self {
            GlobalRequestResponse::Ping(sender) => {
                let _ = sender.send(Err(Error::NoResponse));
            }
            GlobalRequestResponse::TcpIpForward { reply, .. } => {
                let _ = reply.send(Err(Error::NoResponse));
            }
            GlobalRequestResponse::CancelTcpIpForward { reply, .. } => {
                let _ = reply.send(Err(Error::NoResponse));
            }
        }
    }
}

/// Remote forwardings this side registered with `tcpip-forward`,
/// keyed by the requested address and port, with the port the peer
/// bound. Incoming `forwarded-tcpip` channels are only considered when
/// they match one of these.
#[derive(Debug, Default)]
pub(crate) struct RemoteForwards(HashMap<(String, u32), u32>);

impl RemoteForwards {
    pub fn insert(&mut self, address: &str, port: u32, bound_port: u32) {
        self.0.insert((address.to_string(), port), bound_port);
    }

    /// Drops the forwarding requested or bound on `port`.
    pub fn remove(&mut self, address: &str, port: u32) {
        self.0
            .retain(|(a, requested), bound| a != address || (*requested != port && *bound != port));
    }

    pub fn contains(&self, address: &str, port: u32) -> bool {
        self.0
            .iter()
            .any(|((a, requested), bound)| a == address && (*requested == port || *bound == port))
    }
}
