// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::collections::{HashMap, VecDeque};
use std::mem::take;
use std::num::Wrapping;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::channels::{ChannelRef, SessionRequest};
use crate::decision::{RequestDecision, Resolution};
use crate::global::{GlobalRequestResponse, ReplyQueue, RemoteForwards};
use crate::message::{ChannelRequest, ChannelType, GlobalRequest, Message};
use crate::negotiation::Names;
use crate::transport::{Handshake, Transport};
use crate::{ChannelId, ChannelMsg, ChannelOpenFailure, Disconnect, Error, Limits};

/// Connection-level events, delivered in order to the mailbox returned
/// by `client::Handle::events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Text the server asked to show before authentication.
    Banner(String),
    /// Authentication succeeded. Emitted once per connection.
    Ready,
    /// The connection failed. Followed by `Close`.
    Error(String),
    /// The connection is gone. Always the last event of a connection.
    Close,
}

/// Per-connection channel parameters, copied from the configuration.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSettings {
    pub window_size: u32,
    pub maximum_packet_size: u32,
    pub limits: Limits,
    pub inactivity_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KexState {
    Idle,
    /// We sent `KEXINIT` and wait for the peer's.
    InitSent,
    /// We sent `NEWKEYS` and wait for the peer's.
    NewKeysSent,
}

/// `shell`, `exec` or `subsystem` on a session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminalState {
    None,
    Pending,
    Started,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub terminal: TerminalState,
    pub env: Vec<(String, String)>,
}

/// The kind of a channel, with what is specific to it.
#[derive(Debug)]
pub(crate) enum ChannelKind {
    Session(SessionState),
    DirectTcpIp,
    ForwardedTcpIp,
    X11,
    AgentForward,
}

impl ChannelKind {
    pub fn from_type(channel_type: &ChannelType) -> Option<ChannelKind> {
        Some(match channel_type {
            ChannelType::Session => ChannelKind::Session(SessionState {
                terminal: TerminalState::None,
                env: Vec::new(),
            }),
            ChannelType::DirectTcpip(_) => ChannelKind::DirectTcpIp,
            ChannelType::ForwardedTcpIp(_) => ChannelKind::ForwardedTcpIp,
            ChannelType::X11 { .. } => ChannelKind::X11,
            ChannelType::AgentForward => ChannelKind::AgentForward,
            ChannelType::Unknown { .. } => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Opening,
    Open,
    /// We sent `CHANNEL_CLOSE`.
    Closing,
}

#[derive(Debug)]
struct PendingData {
    data: Bytes,
    ext: Option<u32>,
    /// Window credit was already taken by the writer.
    reserved: bool,
}

/// Sent after all the data queued before it.
#[derive(Debug)]
enum Control {
    Eof,
    Close,
    Request {
        want_reply: bool,
        request: ChannelRequest,
    },
}

#[derive(Debug)]
struct PendingRequest {
    terminal: bool,
    reply: oneshot::Sender<Result<(), Error>>,
}

/// What needs to be undone or recorded once a request from the peer is decided.
#[derive(Debug)]
struct InboundRequest {
    terminal: bool,
    env: Option<String>,
}

#[derive(Debug)]
pub(crate) struct ChannelParams {
    pub recipient_channel: u32,
    pub kind: ChannelKind,
    pub state: ChannelState,
    /// Opened by the peer.
    pub inbound: bool,
    /// How much the peer may still send us.
    pub local_window: u32,
    pub remote_maximum_packet_size: u32,
    pending_data: VecDeque<PendingData>,
    pending_control: VecDeque<Control>,
    pending_requests: VecDeque<PendingRequest>,
    inbound_requests: ReplyQueue<InboundRequest, bool>,
    pub received_eof: bool,
    sent_eof: bool,
    pub sink: ChannelRef,
}

impl ChannelParams {
    fn new(kind: ChannelKind, inbound: bool, local_window: u32, sink: ChannelRef) -> Self {
        ChannelParams {
            recipient_channel: 0,
            kind,
            state: ChannelState::Opening,
            inbound,
            local_window,
            remote_maximum_packet_size: 0,
            pending_data: VecDeque::new(),
            pending_control: VecDeque::new(),
            pending_requests: VecDeque::new(),
            inbound_requests: ReplyQueue::default(),
            received_eof: false,
            sent_eof: false,
            sink,
        }
    }
}

/// State shared by the client and server event loops, once the
/// transport handshake is done.
#[derive(Debug)]
pub(crate) struct CommonSession {
    pub settings: ChannelSettings,
    pub session_id: Bytes,
    pub names: Names,
    write: VecDeque<Message>,
    kex: KexState,
    /// Messages held back while keys are being re-exchanged.
    kex_queue: VecDeque<Message>,
    rekey_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    pub channels: HashMap<ChannelId, ChannelParams>,
    last_channel_id: Wrapping<u32>,
    global_replies: ReplyQueue<GlobalRequest, Result<Option<u32>, ()>>,
    open_global_requests: VecDeque<GlobalRequestResponse>,
    pub forwards: RemoteForwards,
    pub resolutions: UnboundedSender<Resolution>,
    events: UnboundedSender<ConnectionEvent>,
    pub disconnected: bool,
    written: usize,
    read: usize,
    last_rekey: Instant,
    last_activity: Instant,
}

impl CommonSession {
    pub fn new(
        settings: ChannelSettings,
        handshake: &Handshake,
        resolutions: UnboundedSender<Resolution>,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Self {
        CommonSession {
            settings,
            session_id: handshake.session_id.clone(),
            names: handshake.names.clone(),
            write: VecDeque::new(),
            kex: KexState::Idle,
            kex_queue: VecDeque::new(),
            rekey_waiters: Vec::new(),
            channels: HashMap::new(),
            last_channel_id: Wrapping(0),
            global_replies: ReplyQueue::default(),
            open_global_requests: VecDeque::new(),
            forwards: RemoteForwards::default(),
            resolutions,
            events,
            disconnected: false,
            written: 0,
            read: 0,
            last_rekey: Instant::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        debug!("connection event: {event:?}");
        let _ = self.events.send(event);
    }

    /// Queues a message for the transport. Messages written once the
    /// connection is closed are dropped.
    pub fn send(&mut self, msg: Message) {
        if self.disconnected {
            trace!("connection closed, dropping {msg:?}");
            return;
        }
        if self.kex != KexState::Idle && !msg.allowed_during_kex() {
            self.kex_queue.push_back(msg);
        } else {
            self.write.push_back(msg);
        }
    }

    /// Messages ready for the transport, in order.
    pub fn take_writes(&mut self) -> VecDeque<Message> {
        let writes = take(&mut self.write);
        self.written += writes.iter().map(Message::payload_len).sum::<usize>();
        writes
    }

    /// Accounting for an incoming message.
    pub fn received(&mut self, msg: &Message) {
        self.read += msg.payload_len();
        self.last_activity = Instant::now();
    }

    pub fn inactivity_deadline(&self) -> Option<Instant> {
        self.settings
            .inactivity_timeout
            .map(|timeout| self.last_activity + timeout)
    }

    pub fn disconnect(&mut self, reason: Disconnect, description: &str, language_tag: &str) {
        if self.disconnected {
            return;
        }
        self.write.push_back(Message::Disconnect {
            reason,
            description: description.to_string(),
            language_tag: language_tag.to_string(),
        });
        self.disconnected = true;
    }

    // Key re-exchange.

    pub fn is_rekeying(&self) -> bool {
        self.kex != KexState::Idle
    }

    pub fn initiate_rekey(&mut self, done: Option<oneshot::Sender<Result<(), Error>>>) {
        if let Some(done) = done {
            self.rekey_waiters.push(done);
        }
        if self.kex == KexState::Idle && !self.disconnected {
            info!("starting key re-exchange");
            self.write.push_back(Message::KexInit);
            self.kex = KexState::InitSent;
        }
    }

    /// Handles `KEXINIT` and `NEWKEYS`. Returns `true` when the new keys
    /// take effect, at which point the messages held back are released.
    pub fn kex_message(&mut self, msg: &Message) -> Result<bool, Error> {
        match (msg, self.kex) {
            (Message::KexInit, KexState::Idle) => {
                debug!("peer started a key re-exchange");
                self.write.push_back(Message::KexInit);
                self.write.push_back(Message::NewKeys);
                self.kex = KexState::NewKeysSent;
                Ok(false)
            }
            (Message::KexInit, KexState::InitSent) => {
                self.write.push_back(Message::NewKeys);
                self.kex = KexState::NewKeysSent;
                Ok(false)
            }
            (Message::NewKeys, KexState::NewKeysSent) => {
                info!(
                    "key re-exchange done, releasing {} messages",
                    self.kex_queue.len()
                );
                self.kex = KexState::Idle;
                self.written = 0;
                self.read = 0;
                self.last_rekey = Instant::now();
                self.write.extend(self.kex_queue.drain(..));
                for waiter in self.rekey_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                Ok(true)
            }
            (msg, _) => Err(Error::UnexpectedMessage(msg.number())),
        }
    }

    /// The byte limits were reached.
    pub fn needs_rekey(&self) -> bool {
        !self.is_rekeying()
            && (self.written >= self.settings.limits.rekey_write_limit
                || self.read >= self.settings.limits.rekey_read_limit)
    }

    pub fn rekey_deadline(&self) -> Option<Instant> {
        if self.is_rekeying() || self.disconnected {
            None
        } else {
            Some(self.last_rekey + self.settings.limits.rekey_time_limit)
        }
    }

    // Channels.

    fn new_channel_id(&mut self) -> ChannelId {
        loop {
            self.last_channel_id += Wrapping(1);
            let id = ChannelId(self.last_channel_id.0);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Opens a channel on our side. The holder of `sink` learns the
    /// outcome through [`ChannelMsg::Open`] or [`ChannelMsg::OpenFailure`].
    pub fn open_channel(&mut self, channel_type: ChannelType, sink: ChannelRef) -> ChannelId {
        let id = self.new_channel_id();
        let Some(kind) = ChannelKind::from_type(&channel_type) else {
            sink.send(ChannelMsg::OpenFailure(
                ChannelOpenFailure::UnknownChannelType,
            ));
            return id;
        };
        debug!("opening channel {id} ({})", channel_type.name());
        self.channels.insert(
            id,
            ChannelParams::new(kind, false, self.settings.window_size, sink),
        );
        self.send(Message::ChannelOpen {
            sender_channel: id.0,
            initial_window_size: self.settings.window_size,
            maximum_packet_size: self.settings.maximum_packet_size,
            channel_type,
        });
        id
    }

    /// Registers a channel opened by the peer, until the application decides.
    pub fn register_inbound(
        &mut self,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
        kind: ChannelKind,
        sink: ChannelRef,
    ) -> ChannelId {
        let id = self.new_channel_id();
        sink.window.set(initial_window_size);
        let mut params = ChannelParams::new(kind, true, self.settings.window_size, sink);
        params.recipient_channel = sender_channel;
        params.remote_maximum_packet_size = maximum_packet_size;
        self.channels.insert(id, params);
        id
    }

    /// Refuses a channel open that was never registered.
    pub fn refuse_open(&mut self, sender_channel: u32, reason: ChannelOpenFailure) {
        debug!("refusing channel open from {sender_channel}: {reason:?}");
        self.send(Message::ChannelOpenFailure {
            recipient_channel: sender_channel,
            reason,
            description: String::new(),
            language_tag: String::new(),
        });
    }

    /// The application decided on a channel opened by the peer.
    pub fn resolve_open(&mut self, id: ChannelId, result: Result<(), ChannelOpenFailure>) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.inbound || channel.state != ChannelState::Opening {
            warn!("duplicate decision on channel {id}");
            return;
        }
        match result {
            Ok(()) => {
                channel.state = ChannelState::Open;
                let msg = Message::ChannelOpenConfirmation {
                    recipient_channel: channel.recipient_channel,
                    sender_channel: id.0,
                    initial_window_size: channel.local_window,
                    maximum_packet_size: self.settings.maximum_packet_size,
                };
                self.send(msg);
                self.flush_channel(id);
            }
            Err(reason) => {
                let recipient = channel.recipient_channel;
                self.refuse_open(recipient, reason);
                self.finish_channel(id, || Error::ChannelOpenFailure(reason));
            }
        }
    }

    pub fn open_confirmation(
        &mut self,
        id: ChannelId,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Result<(), Error> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(Error::WrongChannel);
        };
        if channel.inbound || channel.state != ChannelState::Opening {
            return Err(Error::Inconsistent);
        }
        debug!("channel {id} confirmed, remote window {initial_window_size}");
        channel.recipient_channel = sender_channel;
        channel.remote_maximum_packet_size = maximum_packet_size;
        channel.state = ChannelState::Open;
        channel.sink.window.set(initial_window_size);
        channel.sink.send(ChannelMsg::Open {
            id,
            max_packet_size: maximum_packet_size,
            window_size: initial_window_size,
        });
        self.flush_channel(id);
        Ok(())
    }

    pub fn open_failure(&mut self, id: ChannelId, reason: ChannelOpenFailure) -> Result<(), Error> {
        match self.channels.remove(&id) {
            Some(channel) if !channel.inbound && channel.state == ChannelState::Opening => {
                debug!("channel {id} refused: {reason:?}");
                channel.sink.send(ChannelMsg::OpenFailure(reason));
                Ok(())
            }
            Some(channel) => {
                self.channels.insert(id, channel);
                Err(Error::Inconsistent)
            }
            None => Err(Error::WrongChannel),
        }
    }

    /// Queues data on a channel, sending as much as the peer's window allows.
    pub fn data(&mut self, id: ChannelId, ext: Option<u32>, data: Bytes, reserved: bool) {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("data for unknown channel {id}, dropped");
            return;
        };
        let eof_queued = channel
            .pending_control
            .iter()
            .any(|c| matches!(c, Control::Eof | Control::Close));
        if channel.state == ChannelState::Closing || channel.sent_eof || eof_queued {
            debug!("data after EOF or close on channel {id}, dropped");
            return;
        }
        channel.pending_data.push_back(PendingData {
            data,
            ext,
            reserved,
        });
        self.flush_channel(id);
    }

    pub fn eof(&mut self, id: ChannelId) {
        self.control(id, Control::Eof)
    }

    /// A channel still opening is closed once confirmed.
    pub fn close(&mut self, id: ChannelId) {
        self.control(id, Control::Close)
    }

    /// Sends a request on a channel. With a `reply`, the peer's answer is
    /// delivered there, in the order the requests were sent.
    pub fn request(
        &mut self,
        id: ChannelId,
        request: ChannelRequest,
        reply: Option<oneshot::Sender<Result<(), Error>>>,
    ) {
        let Some(channel) = self.channels.get_mut(&id) else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::ChannelClosed));
            }
            return;
        };
        let terminal = request.is_terminal();
        if terminal {
            if let ChannelKind::Session(ref mut session) = channel.kind {
                if session.terminal != TerminalState::None {
                    debug!("channel {id}: {} after a terminal request", request.name());
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(Error::SessionAlreadyStarted));
                    }
                    return;
                }
                session.terminal = if reply.is_some() {
                    TerminalState::Pending
                } else {
                    TerminalState::Started
                };
            }
        }
        let want_reply = reply.is_some();
        if let Some(reply) = reply {
            channel
                .pending_requests
                .push_back(PendingRequest { terminal, reply });
        }
        self.control(
            id,
            Control::Request {
                want_reply,
                request,
            },
        )
    }

    fn control(&mut self, id: ChannelId, control: Control) {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("{control:?} on unknown channel {id}");
            return;
        };
        if channel.state == ChannelState::Closing {
            debug!("{control:?} on closing channel {id}");
            return;
        }
        channel.pending_control.push_back(control);
        self.flush_channel(id);
    }

    /// Sends the data and control messages of a channel that fit in the
    /// peer's window. Control messages never overtake data.
    fn flush_channel(&mut self, id: ChannelId) {
        let mut out = Vec::new();
        if let Some(channel) = self.channels.get_mut(&id) {
            if channel.state != ChannelState::Open {
                return;
            }
            let recipient_channel = channel.recipient_channel;
            while let Some(front) = channel.pending_data.front_mut() {
                let n = if front.reserved {
                    front.data.len()
                } else {
                    channel
                        .sink
                        .window
                        .try_reserve(channel.remote_maximum_packet_size, front.data.len())
                };
                if n == 0 && !front.data.is_empty() {
                    trace!("channel {id}: window exhausted");
                    break;
                }
                let data = front.data.split_to(n);
                out.push(match front.ext {
                    None => Message::ChannelData {
                        recipient_channel,
                        data,
                    },
                    Some(data_type) => Message::ChannelExtendedData {
                        recipient_channel,
                        data_type,
                        data,
                    },
                });
                if front.data.is_empty() {
                    channel.pending_data.pop_front();
                }
            }
            if channel.pending_data.is_empty() {
                while let Some(control) = channel.pending_control.pop_front() {
                    match control {
                        Control::Eof => {
                            channel.sent_eof = true;
                            channel.sink.window.finish_writes();
                            out.push(Message::ChannelEof { recipient_channel })
                        }
                        Control::Close => {
                            channel.state = ChannelState::Closing;
                            channel.pending_control.clear();
                            channel.sink.window.close();
                            out.push(Message::ChannelClose { recipient_channel });
                        }
                        Control::Request {
                            want_reply,
                            request,
                        } => out.push(Message::ChannelRequest {
                            recipient_channel,
                            want_reply,
                            request,
                        }),
                    }
                }
            }
        }
        for msg in out {
            self.send(msg)
        }
    }

    pub fn window_adjust(&mut self, id: ChannelId, bytes_to_add: u32) {
        if let Some(channel) = self.channels.get_mut(&id) {
            let new_size = channel.sink.window.add(bytes_to_add);
            trace!("channel {id}: window adjusted to {new_size}");
            channel.sink.send(ChannelMsg::WindowAdjusted { new_size });
            self.flush_channel(id);
        } else {
            debug!("window adjust for unknown channel {id}");
        }
    }

    /// Delivers data from the peer to the channel's holder. Returns
    /// `false` if the data was dropped.
    pub fn inbound_data(&mut self, id: ChannelId, ext: Option<u32>, data: &Bytes) -> bool {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("data on unknown channel {id}");
            return false;
        };
        if channel.received_eof {
            warn!("data after EOF on channel {id}, ignored");
            return false;
        }
        let len = data.len() as u32;
        if len > channel.local_window {
            // https://tools.ietf.org/html/rfc4254#section-5.2
            warn!(
                "channel {id}: peer sent {len} bytes over a window of {}",
                channel.local_window
            );
            channel.local_window = 0;
        } else {
            channel.local_window -= len;
        }
        channel.sink.send(match ext {
            None => ChannelMsg::Data { data: data.clone() },
            Some(ext) => ChannelMsg::ExtendedData {
                data: data.clone(),
                ext,
            },
        });
        true
    }

    /// Credits the peer back up to `target` once less than half of it remains.
    pub fn adjust_local_window(&mut self, id: ChannelId, target: u32) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.local_window < target / 2 && channel.state == ChannelState::Open {
            let bytes_to_add = target - channel.local_window;
            debug!("channel {id}: crediting {bytes_to_add} bytes");
            channel.local_window = target;
            let msg = Message::ChannelWindowAdjust {
                recipient_channel: channel.recipient_channel,
                bytes_to_add,
            };
            self.send(msg);
        }
    }

    pub fn inbound_eof(&mut self, id: ChannelId) {
        if let Some(channel) = self.channels.get_mut(&id) {
            if !channel.received_eof {
                channel.received_eof = true;
                channel.sink.send(ChannelMsg::Eof);
            }
        }
    }

    /// The peer closed the channel: completes the close handshake.
    /// Returns `false` for an unknown channel.
    pub fn inbound_close(&mut self, id: ChannelId) -> bool {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("close on unknown channel {id}");
            return false;
        };
        if channel.state != ChannelState::Closing {
            let recipient_channel = channel.recipient_channel;
            channel.pending_data.clear();
            channel.pending_control.clear();
            self.send(Message::ChannelClose { recipient_channel });
        }
        self.finish_channel(id, || Error::ChannelClosed);
        true
    }

    /// Removes a channel, failing everything still pending on it.
    fn finish_channel(&mut self, id: ChannelId, error: impl Fn() -> Error) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };
        debug!("channel {id} finished");
        for pending in channel.pending_requests.drain(..) {
            let _ = pending.reply.send(Err(error()));
        }
        channel.inbound_requests.clear();
        channel.sink.window.close();
        if channel.state == ChannelState::Opening && !channel.inbound {
            // Dropping the sink resolves the open with an error.
            return;
        }
        if !channel.received_eof {
            channel.sink.send(ChannelMsg::Eof);
        }
        channel.sink.send(ChannelMsg::Close);
    }

    /// `CHANNEL_SUCCESS` or `CHANNEL_FAILURE`.
    pub fn request_reply(&mut self, id: ChannelId, success: bool) {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("request reply on unknown channel {id}");
            return;
        };
        let Some(pending) = channel.pending_requests.pop_front() else {
            warn!("unsolicited request reply on channel {id}");
            return;
        };
        if pending.terminal {
            if let ChannelKind::Session(ref mut session) = channel.kind {
                session.terminal = if success {
                    TerminalState::Started
                } else {
                    TerminalState::None
                };
            }
        }
        let _ = pending.reply.send(if success {
            Ok(())
        } else {
            Err(Error::RequestDenied)
        });
    }

    /// A request from the peer on a channel. Requests that need a
    /// decision are returned with their token; the others are answered
    /// right away, in order with the pending ones.
    pub fn inbound_request(
        &mut self,
        id: ChannelId,
        want_reply: bool,
        request: ChannelRequest,
    ) -> Option<(SessionRequest, RequestDecision)> {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("request on unknown channel {id}");
            return None;
        };
        let mut context = InboundRequest {
            terminal: false,
            env: None,
        };
        let session = match channel.kind {
            ChannelKind::Session(ref mut session) => Some(session),
            _ => None,
        };
        let decided = match (request, session) {
            (ChannelRequest::ExitStatus { exit_status }, _) => {
                channel.sink.send(ChannelMsg::ExitStatus { exit_status });
                Err(true)
            }
            (
                ChannelRequest::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                },
                _,
            ) => {
                channel.sink.send(ChannelMsg::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                });
                Err(true)
            }
            (ChannelRequest::XonXoff { client_can_do }, _) => {
                channel.sink.send(ChannelMsg::XonXoff { client_can_do });
                Err(true)
            }
            (
                ChannelRequest::Env {
                    variable_name,
                    variable_value,
                },
                Some(session),
            ) => {
                session.env.retain(|(name, _)| *name != variable_name);
                session
                    .env
                    .push((variable_name.clone(), variable_value.clone()));
                context.env = Some(variable_name.clone());
                Ok(SessionRequest::Env {
                    name: variable_name,
                    value: variable_value,
                })
            }
            (
                ChannelRequest::PtyReq {
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    terminal_modes,
                },
                Some(_),
            ) => Ok(SessionRequest::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes,
            }),
            (
                ChannelRequest::X11Req {
                    single_connection,
                    x11_authentication_protocol,
                    x11_authentication_cookie,
                    x11_screen_number,
                },
                Some(_),
            ) => Ok(SessionRequest::X11 {
                single_connection,
                auth_protocol: x11_authentication_protocol,
                auth_cookie: x11_authentication_cookie,
                screen_number: x11_screen_number,
            }),
            (ChannelRequest::AuthAgentReq, Some(_)) => Ok(SessionRequest::AuthAgent),
            (
                ChannelRequest::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                },
                Some(_),
            ) => Ok(SessionRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            }),
            (ChannelRequest::Signal { signal }, Some(_)) => {
                Ok(SessionRequest::Signal { signal })
            }
            (request, Some(session)) if request.is_terminal() => {
                if session.terminal != TerminalState::None {
                    debug!("channel {id}: refusing a second {}", request.name());
                    Err(false)
                } else {
                    session.terminal = TerminalState::Pending;
                    context.terminal = true;
                    let env = session.env.clone();
                    match request {
                        ChannelRequest::Exec { command } => Ok(SessionRequest::Exec { command, env }),
                        ChannelRequest::Subsystem { name } => {
                            Ok(SessionRequest::Subsystem { name, env })
                        }
                        _ => Ok(SessionRequest::Shell { env }),
                    }
                }
            }
            (request, _) => {
                debug!("channel {id}: unhandled request {}", request.name());
                Err(false)
            }
        };
        let slot = channel.inbound_requests.push(want_reply, context);
        match decided {
            Ok(request) => Some((
                request,
                RequestDecision::new(id, slot, self.resolutions.clone()),
            )),
            Err(accepted) => {
                self.resolve_request(id, slot, accepted);
                None
            }
        }
    }

    /// The application decided on a request from the peer. Replies are
    /// sent in the order the requests arrived.
    pub fn resolve_request(&mut self, id: ChannelId, slot: u64, accepted: bool) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.inbound_requests.resolve(slot, accepted) {
            return;
        }
        let recipient_channel = channel.recipient_channel;
        let mut replies = Vec::new();
        for released in channel.inbound_requests.release() {
            if let ChannelKind::Session(ref mut session) = channel.kind {
                if released.context.terminal {
                    session.terminal = if released.reply {
                        TerminalState::Started
                    } else {
                        TerminalState::None
                    };
                }
                if let (Some(name), false) = (released.context.env, released.reply) {
                    session.env.retain(|(n, _)| *n != name);
                }
            }
            if released.want_reply {
                replies.push(if released.reply {
                    Message::ChannelSuccess { recipient_channel }
                } else {
                    Message::ChannelFailure { recipient_channel }
                });
            }
        }
        for msg in replies {
            self.send(msg)
        }
    }

    /// Snapshot of the variables set by `env` on a session channel.
    pub fn channel_env(&self, id: ChannelId) -> Vec<(String, String)> {
        match self.channels.get(&id).map(|c| &c.kind) {
            Some(ChannelKind::Session(session)) => session.env.clone(),
            _ => Vec::new(),
        }
    }

    // Global requests.

    /// Sends a global request; its reply resolves `response`.
    pub fn global_request(&mut self, request: GlobalRequest, response: GlobalRequestResponse) {
        if self.disconnected {
            response.fail();
            return;
        }
        self.send(Message::GlobalRequest {
            want_reply: true,
            request,
        });
        self.open_global_requests.push_back(response);
    }

    /// `REQUEST_SUCCESS` or `REQUEST_FAILURE`.
    pub fn global_reply(&mut self, reply: Result<Option<u32>, ()>) {
        match self.open_global_requests.pop_front() {
            Some(response) => response.complete(reply, &mut self.forwards),
            None => warn!("unsolicited global request reply"),
        }
    }

    /// Takes a slot for a global request from the peer.
    pub fn push_global_request(&mut self, want_reply: bool, request: GlobalRequest) -> u64 {
        self.global_replies.push(want_reply, request)
    }

    pub fn resolve_global_request(&mut self, slot: u64, result: Result<Option<u32>, ()>) {
        if !self.global_replies.resolve(slot, result) {
            return;
        }
        for released in self.global_replies.release() {
            if !released.want_reply {
                continue;
            }
            let msg = match (released.reply, released.context) {
                (Ok(bound_port), GlobalRequest::TcpIpForward { port: 0, .. }) => {
                    Message::RequestSuccess { bound_port }
                }
                (Ok(_), _) => Message::RequestSuccess { bound_port: None },
                (Err(()), _) => Message::RequestFailure,
            };
            self.send(msg)
        }
    }

    /// Applies an application decision.
    pub fn resolve(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::ChannelOpen { channel, result } => self.resolve_open(channel, result),
            Resolution::ChannelRequest {
                channel,
                slot,
                accepted,
            } => self.resolve_request(channel, slot, accepted),
            Resolution::Global { slot, result } => self.resolve_global_request(slot, result),
            Resolution::Auth { attempt, .. } => {
                debug!("ignoring authentication decision {attempt}")
            }
        }
    }

    /// Handles the connection-protocol messages common to both sides.
    /// Returns the message back if it is role-specific.
    pub fn connection_message(&mut self, msg: Message) -> Result<Option<Message>, Error> {
        match msg {
            Message::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => self.open_confirmation(
                ChannelId(recipient_channel),
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            )?,
            Message::ChannelOpenFailure {
                recipient_channel,
                reason,
                ..
            } => self.open_failure(ChannelId(recipient_channel), reason)?,
            Message::ChannelWindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => self.window_adjust(ChannelId(recipient_channel), bytes_to_add),
            Message::ChannelSuccess { recipient_channel } => {
                self.request_reply(ChannelId(recipient_channel), true)
            }
            Message::ChannelFailure { recipient_channel } => {
                self.request_reply(ChannelId(recipient_channel), false)
            }
            Message::RequestSuccess { bound_port } => self.global_reply(Ok(bound_port)),
            Message::RequestFailure => self.global_reply(Err(())),
            msg => return Ok(Some(msg)),
        }
        Ok(None)
    }

    /// Hands the queued messages to the transport. A transport that
    /// hung up ends the connection without an error.
    pub async fn flush<T: Transport>(&mut self, transport: &mut T) -> Result<(), Error> {
        for msg in self.take_writes() {
            trace!("sending {msg:?}");
            match transport.send(msg).await {
                Ok(()) => {}
                Err(Error::HUP) => {
                    debug!("transport hung up");
                    self.disconnected = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Ends the connection: resolves everything still pending, sends
    /// what is left (typically `DISCONNECT`), closes the transport and
    /// emits the final events. `error` is the reason the connection
    /// failed, if it did.
    pub async fn finish<T: Transport>(&mut self, transport: &mut T, error: Option<String>) {
        self.teardown();
        for msg in self.write.drain(..) {
            if transport.send(msg).await.is_err() {
                break;
            }
        }
        if let Err(e) = transport.close().await {
            debug!("closing the transport: {e:?}");
        }
        if let Some(e) = error {
            error!("connection ended with an error: {e}");
            self.emit(ConnectionEvent::Error(e));
        }
        self.emit(ConnectionEvent::Close);
    }

    /// Resolves everything still pending: channels get EOF and close,
    /// requests fail with [`Error::NoResponse`].
    pub fn teardown(&mut self) {
        self.disconnected = true;
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.finish_channel(id, || Error::NoResponse);
        }
        for response in self.open_global_requests.drain(..) {
            response.fail();
        }
        self.global_replies.clear();
        self.kex_queue.clear();
        for waiter in self.rekey_waiters.drain(..) {
            let _ = waiter.send(Err(Error::NoResponse));
        }
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use ssh_key::{Algorithm, PrivateKey};
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    fn common() -> (CommonSession, tokio::sync::mpsc::UnboundedReceiver<Resolution>) {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let handshake = Handshake {
            session_id: Bytes::from_static(b"session"),
            host_key: key.public_key().clone(),
            names: Names {
                kex: "none".into(),
                key: Algorithm::Ed25519,
                cipher: "none".into(),
                mac: "none".into(),
                compression: "none".into(),
            },
        };
        let (resolutions, resolutions_rx) = unbounded_channel();
        let (events, _) = unbounded_channel();
        let settings = ChannelSettings {
            window_size: 100,
            maximum_packet_size: 10,
            limits: Limits::default(),
            inactivity_timeout: None,
        };
        (
            CommonSession::new(settings, &handshake, resolutions, events),
            resolutions_rx,
        )
    }

    fn open(common: &mut CommonSession, window: u32) -> (ChannelId, tokio::sync::mpsc::UnboundedReceiver<ChannelMsg>) {
        let (sink, receiver) = unbounded_channel();
        let id = common.open_channel(ChannelType::Session, ChannelRef::new(sink));
        common
            .open_confirmation(id, 42, window, 4)
            .unwrap();
        common.take_writes();
        (id, receiver)
    }

    #[test]
    fn data_waits_for_window_and_eof_stays_behind() {
        let (mut common, _) = common();
        let (id, _rx) = open(&mut common, 6);
        common.data(id, None, Bytes::from_static(b"0123456789"), false);
        common.eof(id);
        let sent: Vec<_> = common.take_writes().into_iter().collect();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| matches!(m, Message::ChannelData { data, .. } if data.len() <= 4)));

        common.window_adjust(id, 100);
        let sent: Vec<_> = common.take_writes().into_iter().collect();
        assert!(matches!(&sent[..], [Message::ChannelData { data, .. }, Message::ChannelEof { recipient_channel: 42 }] if data.len() == 4));
    }

    #[test]
    fn rekey_holds_channel_traffic() {
        let (mut common, _) = common();
        let (id, _rx) = open(&mut common, 100);
        common.initiate_rekey(None);
        common.data(id, None, Bytes::from_static(b"abc"), false);
        let sent: Vec<_> = common.take_writes().into_iter().collect();
        assert!(matches!(&sent[..], [Message::KexInit]));

        assert!(!common.kex_message(&Message::KexInit).unwrap());
        assert!(matches!(&common.take_writes().into_iter().collect::<Vec<_>>()[..], [Message::NewKeys]));
        assert!(common.kex_message(&Message::NewKeys).unwrap());
        let sent: Vec<_> = common.take_writes().into_iter().collect();
        assert!(matches!(&sent[..], [Message::ChannelData { .. }]));
        assert!(common.kex_message(&Message::NewKeys).is_err());
    }

    #[test]
    fn second_terminal_request_refused() {
        let (mut common, _) = common();
        let (id, _rx) = open(&mut common, 100);
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        common.request(id, ChannelRequest::Shell, Some(tx1));
        common.request(id, ChannelRequest::Exec { command: b"ls".to_vec() }, Some(tx2));
        assert!(matches!(rx2.try_recv(), Ok(Err(Error::SessionAlreadyStarted))));
        common.request_reply(id, false);
        assert!(matches!(rx1.try_recv(), Ok(Err(Error::RequestDenied))));

        let (tx3, mut rx3) = oneshot::channel();
        common.request(id, ChannelRequest::Exec { command: b"ls".to_vec() }, Some(tx3));
        common.inbound_close(id);
        assert!(matches!(rx3.try_recv(), Ok(Err(Error::ChannelClosed))));
    }

    #[test]
    fn inbound_replies_keep_arrival_order() {
        let (mut common, _) = common();
        let (id, mut rx) = open(&mut common, 100);
        let (_, first) = common
            .inbound_request(id, true, ChannelRequest::Env { variable_name: "A".into(), variable_value: "1".into() })
            .unwrap();
        let (request, second) = common
            .inbound_request(id, true, ChannelRequest::Exec { command: b"env".to_vec() })
            .unwrap();
        assert_eq!(
            request,
            SessionRequest::Exec {
                command: b"env".to_vec(),
                env: vec![("A".into(), "1".into())]
            }
        );
        drop((first, second));
        assert!(common.inbound_request(id, true, ChannelRequest::ExitStatus { exit_status: 3 }).is_none());
        assert!(matches!(rx.try_recv(), Ok(ChannelMsg::Open { .. })));
        assert!(matches!(rx.try_recv(), Ok(ChannelMsg::ExitStatus { exit_status: 3 })));
        // Decisions arrive through the resolution channel, nothing sent yet.
        assert!(common.take_writes().is_empty());
    }

    #[test]
    fn teardown_resolves_everything() {
        let (mut common, _) = common();
        let (id, mut rx) = open(&mut common, 100);
        let (tx, mut reply) = oneshot::channel();
        common.request(id, ChannelRequest::Subsystem { name: "sftp".into() }, Some(tx));
        let (ping, mut pong) = oneshot::channel();
        common.global_request(GlobalRequest::KeepAlive, GlobalRequestResponse::Ping(ping));
        common.teardown();
        assert!(matches!(reply.try_recv(), Ok(Err(Error::NoResponse))));
        assert!(matches!(pong.try_recv(), Ok(Err(Error::NoResponse))));
        assert!(matches!(rx.try_recv(), Ok(ChannelMsg::Open { .. })));
        assert!(matches!(rx.try_recv(), Ok(ChannelMsg::Eof)));
        assert!(matches!(rx.try_recv(), Ok(ChannelMsg::Close)));
        assert!(common.channels.is_empty());
    }
}
