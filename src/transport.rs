//! Message framing over an async byte stream.
//!
//! A frame is read in three stages: the sixteen fixed header bytes, the
//! padded header-field array, then the body. Lengths are bounds-checked
//! against the declared limits before any allocation.

use std::num::NonZeroU32;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::message::{FixedHeader, Message, FIXED_HEADER_LEN};
use crate::wire::align_num;

/// Reads one complete message frame.
pub async fn read_message<R>(stream: &mut R) -> Result<Message, Error>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    stream.read_exact(&mut fixed).await?;
    let fixed = FixedHeader::parse(&fixed)?;
    let fields_padded = align_num(fixed.fields_len as usize, 8);
    let mut fields = vec![0u8; fields_padded];
    stream.read_exact(&mut fields).await?;
    let mut body = vec![0u8; fixed.body_len as usize];
    stream.read_exact(&mut body).await?;
    let msg = Message::from_parts(fixed, &fields, body)?;
    Ok(msg)
}

/// Marshals and writes one message frame with the given serial.
pub async fn write_message<W>(
    stream: &mut W,
    msg: &Message,
    serial: NonZeroU32,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let buf = msg.marshal(serial)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Writes an already-marshalled frame.
pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}
