use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::Sender;

use super::io_error;
use crate::channels::{ChannelCommand, WindowSizeRef};
use crate::{ChannelId, Error};

type BoxedSendFuture = Pin<Box<dyn Future<Output = Result<usize, Error>> + Send>>;

/// Writes to a channel, as data or as one kind of extended data.
///
/// A write waits until the peer's window allows at least one byte, and
/// writes at most one packet.
pub struct ChannelTx<S> {
    sender: Sender<S>,
    id: ChannelId,
    window: WindowSizeRef,
    max_packet_size: u32,
    ext: Option<u32>,
    pending: Option<BoxedSendFuture>,
    eof_sent: bool,
}

impl<S> std::fmt::Debug for ChannelTx<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTx")
            .field("id", &self.id)
            .field("ext", &self.ext)
            .finish()
    }
}

impl<S> ChannelTx<S>
where
    S: From<(ChannelId, ChannelCommand)> + Send + 'static,
{
    pub(crate) fn new(
        sender: Sender<S>,
        id: ChannelId,
        window: WindowSizeRef,
        max_packet_size: u32,
        ext: Option<u32>,
    ) -> Self {
        Self {
            sender,
            id,
            window,
            max_packet_size,
            ext,
            pending: None,
            eof_sent: false,
        }
    }

    fn write_future(&self, buf: &[u8]) -> BoxedSendFuture {
        let len = buf.len().min(self.max_packet_size as usize);
        let data = Bytes::copy_from_slice(buf.get(..len).unwrap_or(buf));
        let (sender, id, window, max_packet_size, ext) = (
            self.sender.clone(),
            self.id,
            self.window.clone(),
            self.max_packet_size,
            self.ext,
        );
        Box::pin(async move {
            let n = window.reserve(max_packet_size, data.len()).await?;
            sender
                .send((id, ChannelCommand::Data { data: data.slice(..n), ext }).into())
                .await
                .map_err(|_| Error::SendError)?;
            Ok(n)
        })
    }

    fn eof_future(&self) -> BoxedSendFuture {
        self.window.finish_writes();
        let (sender, id) = (self.sender.clone(), self.id);
        Box::pin(async move {
            sender
                .send((id, ChannelCommand::Eof).into())
                .await
                .map_err(|_| Error::SendError)?;
            Ok(0)
        })
    }
}

impl<S> AsyncWrite for ChannelTx<S>
where
    S: From<(ChannelId, ChannelCommand)> + Send + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.eof_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "EOF already sent",
            )));
        }
        let fut = match this.pending.as_mut() {
            Some(fut) => fut,
            None => this.pending.insert(this.write_future(buf)),
        };
        let r = ready!(fut.as_mut().poll(cx));
        this.pending = None;
        Poll::Ready(r.map_err(io_error))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.pending.as_mut() {
                let r = ready!(fut.as_mut().poll(cx));
                this.pending = None;
                if let Err(e) = r {
                    return Poll::Ready(Err(io_error(e)));
                }
            } else if this.eof_sent {
                return Poll::Ready(Ok(()));
            } else {
                this.eof_sent = true;
                this.pending = Some(this.eof_future());
            }
        }
    }
}
