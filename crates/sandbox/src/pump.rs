use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A single line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub line: String,
}

/// Consume a stream of bytes, split into lines and forward them through a
/// bounded channel. Lossless: waits for channel capacity. Flushes the last
/// partial line on end; stops early on cancel.
pub async fn pump_bytes_to_lines<S, E>(stream: S, tx: mpsc::Sender<LogChunk>, cancel: CancellationToken, ctx: &str)
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => { debug!(ctx = %ctx, "log pump cancelled"); return; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1);
                            let text = String::from_utf8_lossy(&line).trim_end_matches('\r').to_string();
                            if tx.send(LogChunk { line: text }).await.is_err() { return; }
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = %ctx, error = %e, "log stream error"); break; }
                    None => break,
                }
            }
        }
    }
    if !buf.is_empty() {
        let _ = tx.send(LogChunk { line: String::from_utf8_lossy(&buf).to_string() }).await;
    }
    debug!(ctx = %ctx, "log pump ended");
}

/// Receive every line until the sender side closes.
pub async fn drain_lines(mut rx: mpsc::Receiver<LogChunk>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(c) = rx.recv().await { out.push(c.line); }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn splits_lines_across_chunks_and_flushes_tail() {
        let (tx, rx) = mpsc::channel::<LogChunk>(16);
        let chunks = vec![
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"hello\nwor")),
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"ld\r\n")),
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"tail")),
        ];
        pump_bytes_to_lines(stream::iter(chunks), tx, CancellationToken::new(), "test").await;
        assert_eq!(drain_lines(rx).await, vec!["hello", "world", "tail"]);
    }

    #[tokio::test]
    async fn small_channel_is_lossless_with_concurrent_reader() {
        let (tx, rx) = mpsc::channel::<LogChunk>(1);
        let lines: Vec<_> = (0..20).map(|i| Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from(format!("l{i}\n")))).collect();
        let pump = tokio::spawn(pump_bytes_to_lines(stream::iter(lines), tx, CancellationToken::new(), "lossless"));
        let got = drain_lines(rx).await;
        pump.await.unwrap();
        assert_eq!(got.len(), 20);
        assert_eq!(got[19], "l19");
    }

    #[tokio::test]
    async fn cancel_stops_pump_quickly() {
        let (tx, _rx) = mpsc::channel::<LogChunk>(16);
        let cancel = CancellationToken::new();
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                yield Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"line\n"));
            }
        };
        let handle = tokio::spawn(pump_bytes_to_lines(s, tx, cancel.clone(), "cancel-test"));
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        cancel.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.expect("pump did not stop");
    }
}
