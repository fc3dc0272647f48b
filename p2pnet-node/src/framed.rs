//! Length-prefixed messages over a stream (RPC protocol).

use std::io;

use p2pnet_core::wire::{encode_frame, frame_len, LEN_SIZE};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) async fn write_msg<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&frame).await?;
    w.flush().await
}

/// Next payload, or `None` on a clean EOF at a frame boundary.
pub(crate) async fn read_frame<R>(r: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_SIZE];
    let mut filled = 0;
    while filled < LEN_SIZE {
        let n = r.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    let len = frame_len(header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2pnet_core::wire::decode_payload;

    #[tokio::test]
    async fn frames_survive_a_byte_pipe() {
        let (mut a, mut b) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            write_msg(&mut a, &"first".to_string()).await.unwrap();
            write_msg(&mut a, &vec![7u8; 100]).await.unwrap();
        });
        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decode_payload::<String>(&first).unwrap(), "first");
        let second = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decode_payload::<Vec<u8>>(&second).unwrap(), vec![7u8; 100]);
        writer.await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(8);
        a.write_all(&[1, 0]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
