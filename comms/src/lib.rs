//! Length-prefixed message framing over any async byte stream.
//!
//! A frame is a big endian `u64` length followed by that many bytes of payload,
//! the payload being whatever a `Serialize` implementor writes.

mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;

use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

pub use deserialize::Deserialize;
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frames larger than this are refused on both ends.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn frame_too_large(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
    )
}

/// Wraps a reader and a writer into the two ends of a framed channel.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// The receiving and sending halves.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}

/// Splits a connected socket into a framed channel, with Nagle's algorithm off
/// since every request waits on its reply.
pub fn tcp_channel(
    stream: TcpStream,
) -> io::Result<(OnoReceiver<OwnedReadHalf>, OnoSender<OwnedWriteHalf>)> {
    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    Ok(channel(rx, tx))
}
