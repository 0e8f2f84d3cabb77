//! Length-prefixed framing shared by both socket backends.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted on the wire (10 MiB).
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

fn too_large(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
    )
}

/// Prefix `payload` with its length.
pub fn encode(payload: &[u8]) -> io::Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(too_large(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; HEADER_LEN];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(too_large(len));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode(payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Incremental decoder for byte streams read in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut len_bytes = [0u8; HEADER_LEN];
        len_bytes.copy_from_slice(&self.buffer[..HEADER_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(too_large(len));
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let frame = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..HEADER_LEN + len);
        Ok(Some(frame))
    }

    /// Bytes of an incomplete frame still buffered.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_and_coalesced_input() {
        let mut wire = encode(b"hello").unwrap();
        wire.extend(encode(b"").unwrap());
        wire.extend(encode(b"world!").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&wire[3..7]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&wire[7..]);

        assert_eq!(decoder.next_frame().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), Some(Vec::new()));
        assert_eq!(decoder.next_frame().unwrap(), Some(b"world!".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn oversized_length_is_invalid_data() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&u32::MAX.to_be_bytes());
        let err = decoder.next_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn async_read_reports_clean_eof_and_truncation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"turn 1").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(b"turn 1".to_vec()));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);

        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&8u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
