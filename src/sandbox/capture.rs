//! Bounded capture of child output streams.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Output retained from one stream.
#[derive(Debug, Clone, Default)]
pub struct CapturedStream {
    /// Lossy UTF-8 of the retained prefix.
    pub text: String,
    /// True if bytes past the limit were discarded.
    pub truncated: bool,
}

/// Reads `reader` to EOF, keeping at most `limit` bytes.
///
/// Bytes past the limit are drained and dropped so the writer never blocks
/// on a full pipe.
pub async fn read_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<CapturedStream>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::with_capacity(limit.min(64 * 1024));
    let mut buf = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if room > 0 {
            kept.extend_from_slice(&buf[..n.min(room)]);
        }
        if n > room {
            truncated = true;
        }
    }

    Ok(CapturedStream {
        text: String::from_utf8_lossy(&kept).into_owned(),
        truncated,
    })
}
