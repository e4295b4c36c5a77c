mod rx;
pub use rx::ChannelRx;

mod tx;
pub use tx::ChannelTx;

use std::io;

pub(super) fn io_error(e: crate::Error) -> io::Error {
    match e {
        crate::Error::IO(e) => e,
        e => io::Error::new(io::ErrorKind::BrokenPipe, e),
    }
}
