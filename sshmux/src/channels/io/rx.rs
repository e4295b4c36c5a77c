use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::ChannelMsg;

/// Reads the data (or one kind of extended data) of a channel.
///
/// Other channel events are skipped. End of file is reported when the
/// peer sends EOF or closes the channel.
#[derive(Debug)]
pub struct ChannelRx<'a> {
    receiver: &'a mut UnboundedReceiver<ChannelMsg>,
    buffer: Option<Bytes>,
    ext: Option<u32>,
    eof: bool,
}

impl<'a> ChannelRx<'a> {
    pub(crate) fn new(receiver: &'a mut UnboundedReceiver<ChannelMsg>, ext: Option<u32>) -> Self {
        Self {
            receiver,
            buffer: None,
            ext,
            eof: false,
        }
    }
}

impl AsyncRead for ChannelRx<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(data) = this.buffer.as_mut() {
                let readable = buf.remaining().min(data.len());
                buf.put_slice(&data.split_to(readable));
                if data.is_empty() {
                    this.buffer = None;
                }
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.receiver.poll_recv(cx)) {
                Some(ChannelMsg::Data { data }) if this.ext.is_none() && !data.is_empty() => {
                    this.buffer = Some(data)
                }
                Some(ChannelMsg::ExtendedData { data, ext })
                    if this.ext == Some(ext) && !data.is_empty() =>
                {
                    this.buffer = Some(data)
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => this.eof = true,
                Some(_) => {}
            }
        }
    }
}
