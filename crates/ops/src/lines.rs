//! Split a byte stream into lines.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why [`pump_lines`] stopped.
#[derive(Debug)]
pub enum PumpEnd {
    Eof,
    Cancelled,
    Failed(std::io::Error),
}

/// Feed every complete line of `stream` to `on_line`, in order, until the stream ends,
/// errors, or `cancel` fires. A trailing partial line is flushed on end and on error.
pub async fn pump_lines<S, F>(stream: S, cancel: &CancellationToken, mut on_line: F) -> PumpEnd
where
    S: Stream<Item = std::io::Result<bytes::Bytes>>,
    F: FnMut(&str),
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line = buf.split_to(pos);
                        let _ = buf.split_to(1); // drop '\n'
                        on_line(String::from_utf8_lossy(&line).trim_end_matches('\r'));
                    }
                }
                Some(Err(e)) => break PumpEnd::Failed(e),
                None => break PumpEnd::Eof,
            },
        }
    };
    if !buf.is_empty() && !matches!(end, PumpEnd::Cancelled) {
        on_line(String::from_utf8_lossy(&buf).trim_end_matches('\r'));
    }
    debug!(end = ?end, "line pump ended");
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;

    #[tokio::test]
    async fn splits_lines_across_chunks_and_flushes_tail() {
        let chunks = vec![
            Ok::<Bytes, std::io::Error>(Bytes::from_static(b"hello\nwor")),
            Ok(Bytes::from_static(b"ld\r\n")),
            Ok(Bytes::from_static(b"tail")),
        ];
        let mut out = Vec::new();
        let end = pump_lines(stream::iter(chunks), &CancellationToken::new(), |l| out.push(l.to_string())).await;
        assert!(matches!(end, PumpEnd::Eof));
        assert_eq!(out, vec!["hello", "world", "tail"]);
    }

    #[tokio::test]
    async fn error_is_reported_after_flushing() {
        let chunks = vec![
            Ok(Bytes::from_static(b"a\nb")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"never\n")),
        ];
        let mut out = Vec::new();
        let end = pump_lines(stream::iter(chunks), &CancellationToken::new(), |l| out.push(l.to_string())).await;
        assert!(matches!(end, PumpEnd::Failed(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset));
        assert_eq!(out, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn cancel_stops_pump_quickly() {
        let cancel = CancellationToken::new();
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                yield Ok::<Bytes, std::io::Error>(Bytes::from_static(b"line\n"));
            }
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            trigger.cancel();
        });
        let mut count = 0;
        let end = tokio::time::timeout(Duration::from_secs(1), pump_lines(s, &cancel, |_| count += 1))
            .await
            .expect("pump did not stop");
        assert!(matches!(end, PumpEnd::Cancelled));
        assert!(count >= 1);
    }
}
