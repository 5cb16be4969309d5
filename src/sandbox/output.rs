//! Size-capped stream capture.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes captured from one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    /// More than `cap` bytes were produced; the excess was discarded.
    pub truncated: bool,
    /// Total bytes the process wrote, including discarded ones.
    pub total_bytes: u64,
}

impl CapturedStream {
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// A capture buffer filled by a reader task and readable by its owner at any
/// point, including after the reader was abandoned.
#[derive(Debug, Clone, Default)]
pub struct SharedCapture(Arc<Mutex<CapturedStream>>);

impl SharedCapture {
    /// What has been captured so far.
    pub fn snapshot(&self) -> CapturedStream {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, chunk: &[u8], cap: usize) {
        let mut captured = self.0.lock().unwrap_or_else(|e| e.into_inner());
        captured.total_bytes += chunk.len() as u64;
        let room = cap.saturating_sub(captured.bytes.len());
        if room < chunk.len() {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Drains `reader` to EOF, keeping at most `cap` bytes.
///
/// The stream is always read to the end so the writer never blocks on a
/// full pipe.
pub async fn read_capped<R>(reader: R, cap: usize) -> std::io::Result<CapturedStream>
where
    R: AsyncRead + Unpin,
{
    let sink = SharedCapture::default();
    read_capped_into(reader, cap, sink.clone()).await?;
    Ok(sink.snapshot())
}

/// Like [`read_capped`], but leaves the bytes in `sink` as they arrive.
pub async fn read_capped_into<R>(
    mut reader: R,
    cap: usize,
    sink: SharedCapture,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        sink.push(&chunk[..n], cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_under_cap_is_complete() {
        let data = b"hello world".to_vec();
        let captured = read_capped(&data[..], 64).await.expect("read");
        assert_eq!(captured.bytes, data);
        assert!(!captured.truncated);
        assert_eq!(captured.total_bytes, 11);
    }

    #[tokio::test]
    async fn test_over_cap_is_truncated() {
        let data = vec![b'x'; 20_000];
        let captured = read_capped(&data[..], 100).await.expect("read");
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, 20_000);
    }

    #[tokio::test]
    async fn test_shared_capture_keeps_bytes_read_so_far() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let sink = SharedCapture::default();
        let task = tokio::spawn(read_capped_into(reader, 100, sink.clone()));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"partial")
            .await
            .expect("write");
        for _ in 0..100 {
            if sink.snapshot().bytes == b"partial" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        task.abort();

        let captured = sink.snapshot();
        assert_eq!(captured.bytes, b"partial");
        assert_eq!(captured.total_bytes, 7);
    }

    #[tokio::test]
    async fn test_exactly_cap_is_not_truncated() {
        let data = vec![b'y'; 100];
        let captured = read_capped(&data[..], 100).await.expect("read");
        assert!(!captured.truncated);
    }
}
