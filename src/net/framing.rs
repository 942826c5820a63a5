// Wire framing
// Payloads travel between textual start/end tags; the extractor pulls the
// next complete frame off a rolling receive buffer.

use crate::error::{Error, Result};

/// The fixed set of frame tags used by the replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Replication data (a binary plot dump)
    Rep,
    /// Node identifier exchange
    Sid,
    /// Challenge / response legs of the handshake
    Auth,
    /// Bare acknowledgement; sent and awaited without a closer
    Ack,
}

impl Tag {
    pub fn opener(self) -> &'static [u8] {
        match self {
            Tag::Rep => b"<REP>",
            Tag::Sid => b"<SID>",
            Tag::Auth => b"<AUTH>",
            Tag::Ack => b"<ACK>",
        }
    }

    pub fn closer(self) -> &'static [u8] {
        match self {
            Tag::Rep => b"</REP>",
            Tag::Sid => b"</SID>",
            Tag::Auth => b"</AUTH>",
            Tag::Ack => b"</ACK>",
        }
    }
}

/// Outcome of one extraction attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Extract {
    /// Opener not fully received yet, or closer still missing
    NotReady,
    /// The expected opener was consumed; no payload follows it
    OpenerOnly,
    /// A complete frame; the consumed prefix has been drained
    Frame(Vec<u8>),
}

/// Wrap a payload in its tag pair.
pub fn wrap(payload: &[u8], tag: Tag) -> Vec<u8> {
    let open = tag.opener();
    let close = tag.closer();
    let mut out = Vec::with_capacity(open.len() + payload.len() + close.len());
    out.extend_from_slice(open);
    out.extend_from_slice(payload);
    out.extend_from_slice(close);
    out
}

/// Try to extract the next frame for `tag` from the head of `buf`.
///
/// The opener must begin at the head of the buffer; preceding bytes, or a
/// closer with no opener in sight, are protocol errors. With
/// `expect_closer == false` (sentinel frames like `<ACK>`) only the opener
/// is consumed. On `Frame`, everything up through the closer is drained
/// from `buf`; the payload between the tags is opaque bytes.
pub fn extract(buf: &mut Vec<u8>, tag: Tag, expect_closer: bool) -> Result<Extract> {
    let open = tag.opener();
    let close = tag.closer();

    let opener_pos = match find(buf, open) {
        Some(pos) => pos,
        None => {
            if expect_closer && find(buf, close).is_some() {
                return Err(Error::Protocol(format!(
                    "closer {} with no opener",
                    String::from_utf8_lossy(close)
                )));
            }
            return Ok(Extract::NotReady);
        }
    };
    if opener_pos != 0 {
        return Err(Error::Protocol(format!(
            "{} bytes precede opener {}",
            opener_pos,
            String::from_utf8_lossy(open)
        )));
    }

    if !expect_closer {
        buf.drain(..open.len());
        return Ok(Extract::OpenerOnly);
    }

    match find(&buf[open.len()..], close) {
        None => Ok(Extract::NotReady),
        Some(rel) => {
            let payload = buf[open.len()..open.len() + rel].to_vec();
            buf.drain(..open.len() + rel + close.len());
            Ok(Extract::Frame(payload))
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
