//! C4: the UART reader/demultiplexer (§4.4). The **only** consumer of UART
//! input in the process (§5 "single-reader"). Every other component learns
//! of inbound activity through the token registry (C3) or the inbound
//! message channel this module feeds.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::Message;
use crate::state::LinkState;
use crate::tokens::SharedTokens;

/// The fixed set of unsolicited line tokens the demux resolves directly.
/// `>` is handled separately since it may arrive without a trailing CRLF.
pub const LINE_TOKENS: &[&str] = &["OK", "ERROR", "FAIL", "SEND OK", "ALREADY CONNECTED"];

/// An inbound application message, tagged with the link it arrived on
/// (always 0 for single-link modems).
pub type Inbound = (u8, Message);

pub struct Demux {
    buf: Vec<u8>,
    max_line_bytes: usize,
    keep_tail: usize,
}

impl Demux {
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            keep_tail: max_line_bytes.saturating_mul(2).max(512),
        }
    }

    /// Append freshly-read bytes and process the buffer to completion: wake
    /// token waiters, forward decoded `+IPD` payloads and fallback JSON
    /// lines, and bound buffer growth.
    pub async fn feed(
        &mut self,
        bytes: &[u8],
        link: &LinkState,
        tokens: &SharedTokens,
        inbound: &mpsc::Sender<Inbound>,
    ) {
        if bytes.is_empty() {
            return;
        }
        link.mark_rx();
        self.buf.extend_from_slice(bytes);

        self.scan_prompt(tokens).await;
        let pending_frame_start = self.extract_frames(inbound).await;
        self.scan_lines(tokens, inbound, pending_frame_start.unwrap_or(self.buf.len()))
            .await;
        self.bound_buffer(pending_frame_start);
    }

    /// The `>` prompt may arrive with no trailing CRLF and must be detected
    /// eagerly; only the single matched byte is removed.
    async fn scan_prompt(&mut self, tokens: &SharedTokens) {
        if let Some(pos) = self.buf.iter().position(|&b| b == b'>') {
            tokens.lock().await.resolve(">");
            self.buf.remove(pos);
        }
    }

    /// Consume every `+IPD` frame that is fully present in the buffer.
    /// Returns the start offset of a still-incomplete `+IPD,` header, if one
    /// remains, so the line scanner does not misread its raw payload bytes.
    async fn extract_frames(&mut self, inbound: &mpsc::Sender<Inbound>) -> Option<usize> {
        loop {
            let marker = find_subslice(&self.buf, b"+IPD,")?;
            let header_start = marker + 5;
            let Some(colon_rel) = self.buf[header_start..].iter().position(|&b| b == b':') else {
                return Some(marker);
            };
            let colon = header_start + colon_rel;

            let Ok(header) = std::str::from_utf8(&self.buf[header_start..colon]) else {
                warn!("ipd header not valid utf-8, resyncing");
                self.buf.drain(..=colon);
                continue;
            };
            let Some((link_id, declared_len)) = parse_ipd_header(header) else {
                warn!(header, "unparsable ipd header, resyncing");
                self.buf.drain(..=colon);
                continue;
            };

            let payload_start = colon + 1;
            let payload_end = payload_start + declared_len;
            let available_end = payload_end.min(self.buf.len());

            if find_subslice(&self.buf[payload_start..available_end], b"\r\n+IPD,").is_some() {
                warn!("ipd frame corruption: overlapping frame marker, discarding");
                match find_subslice(&self.buf[header_start..], b"+IPD,") {
                    Some(next) => self.buf.drain(..header_start + next),
                    None => self.buf.clear(),
                };
                continue;
            }

            if self.buf.len() < payload_end {
                return Some(marker); // wait for the rest of the payload
            }

            let mut payload = self.buf[payload_start..payload_end].to_vec();
            self.buf.drain(..payload_end);
            if payload.ends_with(b"\r\n") {
                payload.truncate(payload.len() - 2);
            }

            match serde_json::from_slice::<Message>(&payload) {
                Ok(message) => {
                    let _ = inbound.send((link_id, message)).await;
                }
                Err(e) => debug!(error = %e, "ipd payload is not a valid message, dropping"),
            }
        }
    }

    /// Scan `\r\n`-terminated lines within `buf[..scan_limit]` for known
    /// tokens, falling back to top-level JSON decode for anything else.
    async fn scan_lines(
        &mut self,
        tokens: &SharedTokens,
        inbound: &mpsc::Sender<Inbound>,
        scan_limit: usize,
    ) {
        let mut consumed = 0usize;
        loop {
            let Some(nl) = find_subslice(&self.buf[consumed..scan_limit], b"\r\n") else { break };
            let line_end = consumed + nl;
            let raw_end = (consumed + self.max_line_bytes).min(line_end);
            let line = String::from_utf8_lossy(&self.buf[consumed..raw_end]).into_owned();
            consumed = line_end + 2;

            if line.is_empty() {
                continue;
            }

            if let Some(&known) = LINE_TOKENS.iter().find(|&&t| line.starts_with(t)) {
                tokens.lock().await.resolve(known);
                continue;
            }

            if let Some(json_str) = extract_top_level_json(&line) {
                match serde_json::from_str::<Message>(json_str) {
                    Ok(message) => {
                        let _ = inbound.send((0, message)).await;
                    }
                    Err(e) => debug!(error = %e, "non-token line not a valid message, dropping"),
                }
            }
        }
        self.buf.drain(..consumed);
    }

    /// Bound buffer growth for a runaway peer that never emits a recognized
    /// token or a completable frame header (§9 "byte-budget reader"). A
    /// genuinely in-progress `+IPD` frame is never truncated, since that
    /// would corrupt its payload.
    fn bound_buffer(&mut self, pending_frame_start: Option<usize>) {
        if pending_frame_start.is_some() {
            return;
        }
        if self.buf.len() > self.keep_tail {
            let drop = self.buf.len() - self.keep_tail;
            self.buf.drain(..drop);
        }
    }
}

fn parse_ipd_header(header: &str) -> Option<(u8, usize)> {
    match header.split_once(',') {
        Some((id, len)) => Some((id.parse().ok()?, len.parse().ok()?)),
        None => Some((0, header.parse().ok()?)),
    }
}

/// Find the first occurrence of `needle` in `haystack`, or `None`.
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract the first top-level (brace-depth-matched) JSON object from
/// `line`. Depth is counted over raw `{`/`}` characters only — no
/// string-escaping awareness, per §4.4.
fn extract_top_level_json(line: &str) -> Option<&str> {
    let start = line.find('{')?;
    let mut depth = 0i32;
    for (i, c) in line[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&line[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;
    use crate::tokens::TokenRegistry;

    fn setup() -> (Demux, LinkState, SharedTokens, mpsc::Sender<Inbound>, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(8);
        (Demux::new(512), LinkState::new(), Arc::new(Mutex::new(TokenRegistry::new())), tx, rx)
    }

    #[tokio::test]
    async fn s4_prompt_without_crlf_wakes_immediately() {
        let (mut demux, link, tokens, tx, _rx) = setup();
        let mut waiter = tokens.lock().await.register(&[">"]);
        demux.feed(b"\r\nAT+CIPSEND=4\r\n\r\n>", &link, &tokens, &tx).await;
        assert_eq!(waiter.try_recv(), Ok(">"));

        let mut send_ok_waiter = tokens.lock().await.register(&["SEND OK"]);
        demux.feed(b"\r\nSEND OK\r\n", &link, &tokens, &tx).await;
        assert_eq!(send_ok_waiter.try_recv(), Ok("SEND OK"));
    }

    #[tokio::test]
    async fn s2_fragmented_ipd_reassembles_into_one_frame() {
        let (mut demux, link, tokens, tx, mut rx) = setup();
        let payload = br#"{"Category":"Test","Id":1,"Base64Message":"QQ==","Base64MessageHash":"x","RspReceivedOK":true}"#;
        demux
            .feed(format!("+IPD,0,{}", payload.len()).as_bytes(), &link, &tokens, &tx)
            .await;
        assert!(rx.try_recv().is_err()); // header only, no colon yet: waiting

        demux.feed(b":", &link, &tokens, &tx).await;
        assert!(rx.try_recv().is_err()); // colon present but no payload bytes yet

        demux.feed(&payload[..payload.len() - 5], &link, &tokens, &tx).await;
        assert!(rx.try_recv().is_err()); // partial payload: still waiting

        demux.feed(&payload[payload.len() - 5..], &link, &tokens, &tx).await;
        let (link_id, message) = rx.try_recv().expect("one frame should be enqueued");
        assert_eq!(link_id, 0);
        assert_eq!(message.id(), 1);
    }

    #[tokio::test]
    async fn s3_corrupt_frame_is_discarded_and_next_frame_recovers() {
        let (mut demux, link, tokens, tx, mut rx) = setup();
        let clean = br#"{"Category":"Test","Id":3,"Base64Message":"QQ==","Base64MessageHash":"x","RspReceivedOK":false}"#;
        let mut wire = b"+IPD,0,50:short\r\n+IPD,0,".to_vec();
        wire.extend_from_slice(clean.len().to_string().as_bytes());
        wire.push(b':');
        wire.extend_from_slice(clean);
        demux.feed(&wire, &link, &tokens, &tx).await;
        let (link_id, message) = rx.try_recv().expect("the second frame should be enqueued");
        assert_eq!(link_id, 0);
        assert_eq!(message.id(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn line_tokens_resolve_their_waiters() {
        let (mut demux, link, tokens, tx, _rx) = setup();
        let mut ok_waiter = tokens.lock().await.register(&["OK", "ALREADY CONNECTED"]);
        demux.feed(b"\r\nOK\r\n", &link, &tokens, &tx).await;
        assert_eq!(ok_waiter.try_recv(), Ok("OK"));
    }

    #[tokio::test]
    async fn fallback_json_line_without_ipd_framing_is_enqueued() {
        let (mut demux, link, tokens, tx, mut rx) = setup();
        let line = br#"{"Category":"Test","Id":9,"Base64Message":"QQ==","Base64MessageHash":"x","RspReceivedOK":false}"#;
        let mut bytes = line.to_vec();
        bytes.extend_from_slice(b"\r\n");
        demux.feed(&bytes, &link, &tokens, &tx).await;
        let (link_id, message) = rx.try_recv().expect("fallback json line should be enqueued");
        assert_eq!(link_id, 0);
        assert_eq!(message.id(), 9);
    }

    #[tokio::test]
    async fn runaway_garbage_is_bounded_not_unbounded() {
        let (mut demux, link, tokens, tx, _rx) = setup();
        let garbage = vec![b'x'; 10_000];
        demux.feed(&garbage, &link, &tokens, &tx).await;
        assert!(demux.buf.len() <= demux.keep_tail);
    }
}
