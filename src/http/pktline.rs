//! Git smart-HTTP packet-line framing.
//!
//! This module frames ref advertisements for `info/refs` responses and
//! parses the command section of `git-receive-pack` request bodies so the
//! transport gate can learn which branch/commit a push landed.
//!
//! # Packet-line format
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)

use tracing::{trace, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Vec<u8>),
    /// Flush packet (`0000`) -- marks end of a message / section.
    Flush,
    /// Delimiter packet (`0001`).
    Delimiter,
    /// Response-end packet (`0002`).
    ResponseEnd,
}

/// One `old-oid new-oid refname` command from a receive-pack request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old_oid: String,
    pub new_oid: String,
    pub refname: String,
}

impl RefUpdate {
    /// A deletion carries the all-zero object id as its new value.
    pub fn is_delete(&self) -> bool {
        !self.new_oid.is_empty() && self.new_oid.bytes().all(|b| b == b'0')
    }

    /// The branch name, when the update targets `refs/heads/`.
    pub fn branch(&self) -> Option<&str> {
        self.refname.strip_prefix("refs/heads/")
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a byte slice as a packet-line (4-hex-digit length prefix + data).
///
/// The length includes the 4 prefix bytes themselves.  Callers are
/// responsible for including any trailing newline in `data` if the protocol
/// requires it.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    assert!(
        total_len <= 0xFFFF,
        "packet-line data too large ({total_len} bytes)"
    );
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Frame a ref advertisement the way `info/refs` responses expect it: the
/// `# service=...` header packet, a flush, then the raw advertisement.
pub fn service_advertisement(service: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = encode_pkt_line(format!("# service={service}\n").as_bytes());
    out.extend_from_slice(b"0000");
    out.extend_from_slice(payload);
    out
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode packet lines from `data`, stopping at the first flush packet.
///
/// Malformed input stops the parse and returns whatever was decoded up to
/// that point.  The receive-pack command section is everything before the
/// flush; the binary packfile that follows is deliberately not touched.
pub fn decode_until_flush(data: &[u8]) -> Vec<PktLine> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos + 4 <= data.len() {
        let len_hex = match std::str::from_utf8(&data[pos..pos + 4]) {
            Ok(s) => s,
            Err(_) => {
                warn!(offset = pos, "non-UTF-8 packet-line length prefix");
                break;
            }
        };

        let pkt_len = match u16::from_str_radix(len_hex, 16) {
            Ok(n) => n as usize,
            Err(_) => {
                warn!(offset = pos, len_hex, "invalid packet-line length");
                break;
            }
        };

        match pkt_len {
            0 => {
                trace!(offset = pos, "flush packet");
                packets.push(PktLine::Flush);
                break;
            }
            1 => {
                packets.push(PktLine::Delimiter);
                pos += 4;
            }
            2 => {
                packets.push(PktLine::ResponseEnd);
                pos += 4;
            }
            3 => {
                // Length 3 is invalid (would mean 3 total bytes but the
                // prefix itself is 4).
                warn!(offset = pos, "invalid packet-line length 0003");
                break;
            }
            n => {
                if pos + n > data.len() {
                    warn!(
                        offset = pos,
                        declared = n,
                        available = data.len() - pos,
                        "truncated packet-line"
                    );
                    break;
                }
                let payload = data[pos + 4..pos + n].to_vec();
                trace!(offset = pos, payload_len = payload.len(), "data packet");
                packets.push(PktLine::Data(payload));
                pos += n;
            }
        }
    }

    packets
}

/// Parse the ref-update commands out of a receive-pack request body.
///
/// Each command line is `<old-oid> <new-oid> <refname>`, with the first line
/// additionally carrying a NUL-separated capability list.
pub fn parse_ref_updates(body: &[u8]) -> Vec<RefUpdate> {
    let mut updates = Vec::new();

    for pkt in decode_until_flush(body) {
        let PktLine::Data(data) = pkt else { continue };

        // Strip the capability list after the NUL on the first line.
        let line = match data.iter().position(|&b| b == 0) {
            Some(nul) => &data[..nul],
            None => &data[..],
        };
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\n');

        let mut parts = line.split(' ');
        let (Some(old_oid), Some(new_oid), Some(refname)) =
            (parts.next(), parts.next(), parts.next())
        else {
            warn!(%line, "unparseable receive-pack command line");
            continue;
        };

        let oid_ok = |oid: &str| {
            (oid.len() == 40 || oid.len() == 64) && oid.bytes().all(|b| b.is_ascii_hexdigit())
        };
        if !oid_ok(old_oid) || !oid_ok(new_oid) || refname.is_empty() {
            warn!(%line, "malformed receive-pack command line");
            continue;
        }

        updates.push(RefUpdate {
            old_oid: old_oid.to_string(),
            new_oid: new_oid.to_string(),
            refname: refname.to_string(),
        });
    }

    updates
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
