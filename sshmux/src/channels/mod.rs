use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tokio::sync::oneshot;

use crate::message::ChannelRequest;
use crate::{ChannelId, ChannelOpenFailure, Error, RequestDecision, Sig};

mod channel_ref;
pub(crate) use channel_ref::{ChannelRef, WindowSizeRef};

mod io;
pub use io::{ChannelRx, ChannelTx};

/// Largest chunk read from a source in [`Channel::data`].
const READ_CHUNK: usize = 1 << 16;

/// Possible messages that [Channel::wait] can receive.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChannelMsg {
    Open {
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
    },
    OpenFailure(ChannelOpenFailure),
    Data {
        data: Bytes,
    },
    ExtendedData {
        data: Bytes,
        ext: u32,
    },
    Eof,
    /// A request made by the peer on this channel. Dropping the
    /// decision rejects it.
    Request {
        request: SessionRequest,
        decision: RequestDecision,
    },
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    XonXoff {
        client_can_do: bool,
    },
    /// The peer gave us more room to send data.
    WindowAdjusted {
        new_size: u32,
    },
    Close,
}

/// Sub-requests of a session channel that wait for a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: Vec<(u8, u32)>,
    },
    Env {
        name: String,
        value: String,
    },
    X11 {
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen_number: u32,
    },
    AuthAgent,
    /// `env` holds the variables set on the channel so far.
    Shell {
        env: Vec<(String, String)>,
    },
    Exec {
        command: Vec<u8>,
        env: Vec<(String, String)>,
    },
    Subsystem {
        name: String,
        env: Vec<(String, String)>,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal {
        signal: Sig,
    },
}

/// What a [`Channel`] asks of its connection.
#[doc(hidden)]
#[derive(Debug)]
pub enum ChannelCommand {
    /// Data for which window credit was already taken.
    Data { data: Bytes, ext: Option<u32> },
    Eof,
    Close,
    Request {
        request: ChannelRequest,
        reply: Option<oneshot::Sender<Result<(), Error>>>,
    },
}

/// Waits for the peer's answer to a channel request.
pub(crate) async fn wait_reply(reply: oneshot::Receiver<Result<(), Error>>) -> Result<(), Error> {
    reply.await.unwrap_or(Err(Error::NoResponse))
}

/// A handle to a channel.
///
/// Allows you to read and write from a channel without borrowing the session
pub struct Channel<S: From<(ChannelId, ChannelCommand)>> {
    pub(crate) id: ChannelId,
    pub(crate) sender: Sender<S>,
    pub(crate) receiver: UnboundedReceiver<ChannelMsg>,
    pub(crate) max_packet_size: u32,
    pub(crate) window: WindowSizeRef,
}

impl<T: From<(ChannelId, ChannelCommand)>> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl<S: From<(ChannelId, ChannelCommand)> + Send + 'static> Channel<S> {
    pub(crate) fn new(
        id: ChannelId,
        sender: Sender<S>,
        receiver: UnboundedReceiver<ChannelMsg>,
        max_packet_size: u32,
        window: WindowSizeRef,
    ) -> Self {
        Channel {
            id,
            sender,
            receiver,
            max_packet_size,
            window,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Returns the min between the maximum packet size and the
    /// remaining window size in the channel.
    pub fn writable_packet_size(&self) -> usize {
        self.max_packet_size.min(self.window.size()) as usize
    }

    async fn send_cmd(&self, cmd: ChannelCommand) -> Result<(), Error> {
        self.sender
            .send((self.id, cmd).into())
            .await
            .map_err(|_| Error::SendError)
    }

    /// Sends a request without waiting for the answer. The returned
    /// receiver resolves once the peer replied, if a reply was asked for.
    pub(crate) async fn queue_request(
        &self,
        want_reply: bool,
        request: ChannelRequest,
    ) -> Result<Option<oneshot::Receiver<Result<(), Error>>>, Error> {
        let (reply, receiver) = if want_reply {
            let (sender, receiver) = oneshot::channel();
            (Some(sender), Some(receiver))
        } else {
            (None, None)
        };
        self.send_cmd(ChannelCommand::Request { request, reply })
            .await?;
        Ok(receiver)
    }

    /// Sends a request. If `want_reply` is set, waits for the answer:
    /// [`Error::RequestDenied`] if the peer refused, [`Error::ChannelClosed`]
    /// if the channel closed first.
    pub async fn request(&self, want_reply: bool, request: ChannelRequest) -> Result<(), Error> {
        match self.queue_request(want_reply, request).await? {
            Some(reply) => wait_reply(reply).await,
            None => Ok(()),
        }
    }

    /// Request a pseudo-terminal with the given characteristics.
    #[allow(clippy::too_many_arguments)] // length checked
    pub async fn request_pty(
        &self,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(u8, u32)],
    ) -> Result<(), Error> {
        self.request(
            want_reply,
            ChannelRequest::PtyReq {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes: terminal_modes.to_vec(),
            },
        )
        .await
    }

    /// Request a remote shell.
    pub async fn request_shell(&self, want_reply: bool) -> Result<(), Error> {
        self.request(want_reply, ChannelRequest::Shell).await
    }

    /// Execute a remote program (will be passed to a shell). This can
    /// be used to implement scp (by calling a remote scp and
    /// tunneling to its standard input).
    pub async fn exec<A: Into<Vec<u8>>>(&self, want_reply: bool, command: A) -> Result<(), Error> {
        self.request(
            want_reply,
            ChannelRequest::Exec {
                command: command.into(),
            },
        )
        .await
    }

    /// Signal a remote process.
    pub async fn signal(&self, signal: Sig) -> Result<(), Error> {
        self.request(false, ChannelRequest::Signal { signal }).await
    }

    /// Request the start of a subsystem with the given name.
    pub async fn request_subsystem<A: Into<String>>(
        &self,
        want_reply: bool,
        name: A,
    ) -> Result<(), Error> {
        self.request(want_reply, ChannelRequest::Subsystem { name: name.into() })
            .await
    }

    /// Request X11 forwarding through an already opened X11
    /// channel. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6.3.1)
    /// for security issues related to cookies.
    pub async fn request_x11<A: Into<String>, B: Into<String>>(
        &self,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: A,
        x11_authentication_cookie: B,
        x11_screen_number: u32,
    ) -> Result<(), Error> {
        self.request(
            want_reply,
            ChannelRequest::X11Req {
                single_connection,
                x11_authentication_protocol: x11_authentication_protocol.into(),
                x11_authentication_cookie: x11_authentication_cookie.into(),
                x11_screen_number,
            },
        )
        .await
    }

    /// Set a remote environment variable.
    pub async fn set_env<A: Into<String>, B: Into<String>>(
        &self,
        want_reply: bool,
        variable_name: A,
        variable_value: B,
    ) -> Result<(), Error> {
        self.request(
            want_reply,
            ChannelRequest::Env {
                variable_name: variable_name.into(),
                variable_value: variable_value.into(),
            },
        )
        .await
    }

    /// Inform the server that our window size has changed.
    pub async fn window_change(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.request(
            false,
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await
    }

    /// Inform the server that we will accept agent forwarding channels
    pub async fn agent_forward(&self, want_reply: bool) -> Result<(), Error> {
        self.request(want_reply, ChannelRequest::AuthAgentReq).await
    }

    /// Tell the client whether it may do flow control with ^S/^Q.
    pub async fn xon_xoff(&self, client_can_do: bool) -> Result<(), Error> {
        self.request(false, ChannelRequest::XonXoff { client_can_do })
            .await
    }

    /// Report the exit status of the remote process.
    pub async fn exit_status(&self, exit_status: u32) -> Result<(), Error> {
        self.request(false, ChannelRequest::ExitStatus { exit_status })
            .await
    }

    /// Report that the remote process was killed by a signal.
    pub async fn exit_signal(
        &self,
        signal_name: Sig,
        core_dumped: bool,
        error_message: &str,
        lang_tag: &str,
    ) -> Result<(), Error> {
        self.request(
            false,
            ChannelRequest::ExitSignal {
                signal_name,
                core_dumped,
                error_message: error_message.to_string(),
                lang_tag: lang_tag.to_string(),
            },
        )
        .await
    }

    /// Send data to a channel.
    pub async fn data<R: AsyncRead + Unpin>(&self, data: R) -> Result<(), Error> {
        self.send_data(None, data).await
    }

    /// Send data to a channel, as extended data of type `ext` (1 for stderr).
    pub async fn extended_data<R: AsyncRead + Unpin>(&self, ext: u32, data: R) -> Result<(), Error> {
        self.send_data(Some(ext), data).await
    }

    async fn send_data<R: AsyncRead + Unpin>(
        &self,
        ext: Option<u32>,
        mut data: R,
    ) -> Result<(), Error> {
        let chunk_size = (self.max_packet_size as usize).clamp(1, READ_CHUNK);
        let mut buffer = BytesMut::with_capacity(chunk_size);
        loop {
            buffer.reserve(chunk_size);
            let n = data.read_buf(&mut buffer).await?;
            if n == 0 {
                break;
            }
            let mut chunk = buffer.split().freeze();
            while !chunk.is_empty() {
                // wait for the window to be restored.
                let sendable = self.window.reserve(self.max_packet_size, chunk.len()).await?;
                debug!("channel {}: sending {} bytes", self.id, sendable);
                self.send_cmd(ChannelCommand::Data {
                    data: chunk.split_to(sendable),
                    ext,
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Sends EOF after the data already written. Later writes fail with
    /// [`Error::ChannelClosed`].
    pub async fn eof(&self) -> Result<(), Error> {
        self.window.finish_writes();
        self.send_cmd(ChannelCommand::Eof).await
    }

    /// Request that the channel be closed.
    pub async fn close(&self) -> Result<(), Error> {
        self.window.finish_writes();
        self.send_cmd(ChannelCommand::Close).await
    }

    /// Wait for data to come.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        self.receiver.recv().await
    }

    /// Make a reader for the [`Channel`] to receive [`ChannelMsg::Data`]
    /// through the `AsyncRead` trait.
    pub fn make_reader(&mut self) -> ChannelRx<'_> {
        ChannelRx::new(&mut self.receiver, None)
    }

    /// Make a reader for the [`Channel`] to receive [`ChannelMsg::ExtendedData`]
    /// of type `ext` through the `AsyncRead` trait.
    pub fn make_reader_ext(&mut self, ext: u32) -> ChannelRx<'_> {
        ChannelRx::new(&mut self.receiver, Some(ext))
    }

    /// Make a writer for the [`Channel`] to send [`ChannelMsg::Data`]
    /// through the `AsyncWrite` trait. Shutting it down sends EOF.
    pub fn make_writer(&self) -> ChannelTx<S> {
        self.make_writer_with_ext(None)
    }

    /// Make a writer for the [`Channel`] to send [`ChannelMsg::ExtendedData`]
    /// through the `AsyncWrite` trait.
    pub fn make_writer_ext(&self, ext: u32) -> ChannelTx<S> {
        self.make_writer_with_ext(Some(ext))
    }

    fn make_writer_with_ext(&self, ext: Option<u32>) -> ChannelTx<S> {
        ChannelTx::new(
            self.sender.clone(),
            self.id,
            self.window.clone(),
            self.max_packet_size,
            ext,
        )
    }
}
