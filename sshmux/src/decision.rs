//! Owned, single-use decision tokens.
//!
//! The engine hands one of these to the application together with each
//! authentication attempt, channel open, channel request or global
//! request it receives. Resolving consumes the token; dropping it
//! unresolved counts as a rejection. The decision travels back to the
//! connection's event loop, so it may be produced from any task, at any
//! time. Once the connection is gone, resolving is a no-op.

use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use crate::auth::{Decision, MethodSet};
use crate::message::Prompt;
use crate::{ChannelId, ChannelOpenFailure};

#[derive(Debug)]
pub(crate) enum Resolution {
    Auth {
        attempt: u64,
        decision: Decision,
    },
    ChannelOpen {
        channel: ChannelId,
        result: Result<(), ChannelOpenFailure>,
    },
    ChannelRequest {
        channel: ChannelId,
        slot: u64,
        accepted: bool,
    },
    Global {
        slot: u64,
        result: Result<Option<u32>, ()>,
    },
}

fn resolve(sender: Option<UnboundedSender<Resolution>>, resolution: Resolution) {
    if let Some(sender) = sender {
        if sender.send(resolution).is_err() {
            debug!("decision made after the connection closed");
        }
    }
}

/// Decides one authentication attempt.
#[derive(Debug)]
pub struct AuthDecision {
    attempt: u64,
    sender: Option<UnboundedSender<Resolution>>,
}

impl AuthDecision {
    pub(crate) fn new(attempt: u64, sender: UnboundedSender<Resolution>) -> Self {
        AuthDecision {
            attempt,
            sender: Some(sender),
        }
    }

    pub fn decide(mut self, decision: Decision) {
        resolve(
            self.sender.take(),
            Resolution::Auth {
                attempt: self.attempt,
                decision,
            },
        )
    }

    pub fn accept(self) {
        self.decide(Decision::Accept)
    }

    pub fn reject(self) {
        self.decide(Decision::Reject {
            proceed_with_methods: None,
        })
    }

    pub fn partial_success(self, remaining_methods: MethodSet) {
        self.decide(Decision::PartialSuccess { remaining_methods })
    }

    /// Keyboard-interactive only.
    pub fn info_request(self, name: String, instructions: String, prompts: Vec<Prompt>) {
        self.decide(Decision::InfoRequest {
            name,
            instructions,
            prompts,
        })
    }
}

impl Drop for AuthDecision {
    fn drop(&mut self) {
        resolve(
            self.sender.take(),
            Resolution::Auth {
                attempt: self.attempt,
                decision: Decision::Reject {
                    proceed_with_methods: None,
                },
            },
        )
    }
}

/// Decides whether an incoming channel is opened.
#[derive(Debug)]
pub struct ChannelOpenDecision {
    channel: ChannelId,
    sender: Option<UnboundedSender<Resolution>>,
}

impl ChannelOpenDecision {
    pub(crate) fn new(channel: ChannelId, sender: UnboundedSender<Resolution>) -> Self {
        ChannelOpenDecision {
            channel,
            sender: Some(sender),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn accept(mut self) {
        resolve(
            self.sender.take(),
            Resolution::ChannelOpen {
                channel: self.channel,
                result: Ok(()),
            },
        )
    }

    pub fn reject(mut self, reason: ChannelOpenFailure) {
        resolve(
            self.sender.take(),
            Resolution::ChannelOpen {
                channel: self.channel,
                result: Err(reason),
            },
        )
    }
}

impl Drop for ChannelOpenDecision {
    fn drop(&mut self) {
        resolve(
            self.sender.take(),
            Resolution::ChannelOpen {
                channel: self.channel,
                result: Err(ChannelOpenFailure::AdministrativelyProhibited),
            },
        )
    }
}

/// Decides a request made on a channel (`exec`, `pty-req`, `env`...).
#[derive(Debug)]
pub struct RequestDecision {
    channel: ChannelId,
    slot: u64,
    sender: Option<UnboundedSender<Resolution>>,
}

impl RequestDecision {
    pub(crate) fn new(channel: ChannelId, slot: u64, sender: UnboundedSender<Resolution>) -> Self {
        RequestDecision {
            channel,
            slot,
            sender: Some(sender),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn accept(mut self) {
        self.send(true)
    }

    pub fn reject(mut self) {
        self.send(false)
    }

    fn send(&mut self, accepted: bool) {
        resolve(
            self.sender.take(),
            Resolution::ChannelRequest {
                channel: self.channel,
                slot: self.slot,
                accepted,
            },
        )
    }
}

impl Drop for RequestDecision {
    fn drop(&mut self) {
        self.send(false)
    }
}

/// Decides a connection-wide request (`tcpip-forward`...).
#[derive(Debug)]
pub struct GlobalDecision {
    slot: u64,
    sender: Option<UnboundedSender<Resolution>>,
}

impl GlobalDecision {
    pub(crate) fn new(slot: u64, sender: UnboundedSender<Resolution>) -> Self {
        GlobalDecision {
            slot,
            sender: Some(sender),
        }
    }

    /// Accepts the request. `bound_port` is reported back for a
    /// `tcpip-forward` request to port 0.
    pub fn accept(mut self, bound_port: Option<u32>) {
        self.send(Ok(bound_port))
    }

    pub fn reject(mut self) {
        self.send(Err(()))
    }

    fn send(&mut self, result: Result<Option<u32>, ()>) {
        resolve(
            self.sender.take(),
            Resolution::Global {
                slot: self.slot,
                result,
            },
        )
    }
}

impl Drop for GlobalDecision {
    fn drop(&mut self) {
        self.send(Err(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    #[test]
    fn resolved_exactly_once() {
        let (tx, mut rx) = unbounded_channel();
        GlobalDecision::new(3, tx.clone()).accept(Some(2222));
        match rx.try_recv() {
            Ok(Resolution::Global { slot: 3, result }) => assert_eq!(result, Ok(Some(2222))),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        drop(RequestDecision::new(ChannelId(1), 0, tx.clone()));
        match rx.try_recv() {
            Ok(Resolution::ChannelRequest { accepted, .. }) => assert!(!accepted),
            other => panic!("unexpected {other:?}"),
        }

        AuthDecision::new(9, tx).accept();
        match rx.try_recv() {
            Ok(Resolution::Auth {
                attempt: 9,
                decision: Decision::Accept,
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn decision_after_close_is_ignored() {
        let (tx, rx) = unbounded_channel();
        drop(rx);
        ChannelOpenDecision::new(ChannelId(0), tx).accept();
    }
}
