//! Output sanitizing and batching for display surfaces.
//!
//! Classification consumes the live stream; sanitizing is applied at the
//! transport boundary and for diagnostic read-backs only.

use std::borrow::Cow;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

/// CSI sequences: `ESC [ params intermediates final`.
static CSI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

/// OSC sequences (window title etc.), terminated by BEL or ST.
static OSC_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?").unwrap());

/// Charset designations like `ESC ( B`.
static CHARSET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b[()][0-9A-Za-z]").unwrap());

/// Remaining two-byte escapes (`ESC c`, `ESC =`, ...).
static ESC_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b[@-_=><]").unwrap());

/// Strip terminal control sequences and non-printing control characters,
/// keeping newlines and tabs. Input is decoded lossily.
pub fn sanitize(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    sanitize_str(&text)
}

/// Same as [`sanitize`] but starting from text.
pub fn sanitize_str(text: &str) -> String {
    let text = apply(&CSI_PATTERN, text);
    let text = apply(&OSC_PATTERN, &text);
    let text = apply(&CHARSET_PATTERN, &text);
    let text = apply(&ESC_PATTERN, &text);
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Sanitize and clamp to the most recent `max_chars` characters. Older
/// output is discarded; only recent context matters downstream.
pub fn sanitize_tail(data: &[u8], max_chars: usize) -> String {
    let text = sanitize(data);
    if text.chars().count() <= max_chars {
        return text;
    }
    let skip = text.chars().count() - max_chars;
    text.chars().skip(skip).collect()
}

fn apply(pattern: &Regex, text: &str) -> String {
    match pattern.replace_all(text, "") {
        Cow::Borrowed(s) => s.to_string(),
        Cow::Owned(s) => s,
    }
}

/// Coalesces rapid small output chunks into throttled batches.
///
/// A batch is flushed after a quiet interval with no new chunks, or as soon
/// as it reaches `max_batch` bytes. Consumers read flushed batches from the
/// receiver returned by [`OutputBatcher::new`].
pub struct OutputBatcher {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl OutputBatcher {
    pub fn new(quiet: Duration, max_batch: usize) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            loop {
                if pending.is_empty() {
                    match in_rx.recv().await {
                        Some(chunk) => pending.extend_from_slice(&chunk),
                        None => break,
                    }
                } else {
                    match tokio::time::timeout(quiet, in_rx.recv()).await {
                        Ok(Some(chunk)) => pending.extend_from_slice(&chunk),
                        Ok(None) => {
                            let _ = out_tx.send(std::mem::take(&mut pending));
                            break;
                        }
                        Err(_) => {
                            let _ = out_tx.send(std::mem::take(&mut pending));
                        }
                    }
                }
                if pending.len() >= max_batch {
                    let _ = out_tx.send(std::mem::take(&mut pending));
                }
            }
        });

        (Self { tx: in_tx }, out_rx)
    }

    pub fn push(&self, chunk: &[u8]) {
        let _ = self.tx.send(chunk.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_csi_and_osc() {
        let raw = b"\x1b[1;32mhello\x1b[0m \x1b]0;title\x07world\n";
        assert_eq!(sanitize(raw), "hello world\n");
    }

    #[test]
    fn test_keeps_newline_and_tab_drops_cr() {
        let raw = b"line1\r\n\tindented\r";
        assert_eq!(sanitize(raw), "line1\n\tindented");
    }

    #[test]
    fn test_charset_and_simple_escapes() {
        let raw = b"\x1b(Bplain\x1b=text";
        assert_eq!(sanitize(raw), "plaintext");
    }

    #[test]
    fn test_tail_clamp() {
        let raw = b"abcdefghij";
        assert_eq!(sanitize_tail(raw, 4), "ghij");
        assert_eq!(sanitize_tail(raw, 100), "abcdefghij");
    }

    #[tokio::test]
    async fn test_batcher_coalesces_rapid_chunks() {
        let (batcher, mut rx) = OutputBatcher::new(Duration::from_millis(30), 1024);
        batcher.push(b"one ");
        batcher.push(b"two ");
        batcher.push(b"three");

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, b"one two three");
    }

    #[tokio::test]
    async fn test_batcher_flushes_on_max_size() {
        let (batcher, mut rx) = OutputBatcher::new(Duration::from_secs(10), 8);
        batcher.push(b"0123456789");

        // Flushes immediately despite the long quiet interval.
        let batch = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("batch should flush on size")
            .unwrap();
        assert_eq!(batch, b"0123456789");
    }
}
