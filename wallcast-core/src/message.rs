//! Control-plane messages.
//!
//! Reconfiguration and connection descriptors arrive as text. They are
//! parsed exactly once at the boundary into the typed values below; the
//! streaming threads never look at the text again.
//!
//! ```text
//! direct layout   "<n> (<rcvId> <x> <y> <w> <h>)*"     image rectangles
//! bridge layout   "<n> (<rcvId> <first> <last>)*"      inclusive block ids
//! frame rate      "rate <fps>"
//! descriptor      "<basePort> <rcvNum> (<ip> [<localPort>] <nodeId>)*"
//! ```

use crate::error::{Result, WallError};
use crate::transport::Protocol;
use crate::types::Rect;

// ── StreamMessage ────────────────────────────────────────────────

/// Which region encoding a layout message uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// Image-space rectangles, for streamers fed by an application.
    Direct,
    /// Block-id ranges, for relays forwarding pre-cut blocks.
    Bridge,
}

/// One receiver's share of the image as a rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionAssignment {
    pub receiver_id: u32,
    pub rect: Rect,
}

/// One receiver's share of the image as a block-id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeAssignment {
    pub receiver_id: u32,
    pub first_block: u32,
    pub last_block: u32,
}

/// New receiver-to-region mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLayout {
    Direct(Vec<RegionAssignment>),
    Bridge(Vec<RangeAssignment>),
}

impl StreamLayout {
    pub fn len(&self) -> usize {
        match self {
            StreamLayout::Direct(list) => list.len(),
            StreamLayout::Bridge(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Queued for a streamer's network thread.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Reconfigure(StreamLayout),
    FrameRate(f64),
}

impl StreamMessage {
    /// Parse a control line for a streamer of the given kind.
    pub fn parse(kind: LayoutKind, text: &str) -> Result<Self> {
        let mut tokens = Tokens::new(text);
        if text.trim_start().starts_with("rate") {
            tokens.next_str("keyword")?;
            let fps: f64 = tokens.next_num("frame rate")?;
            if !(fps.is_finite() && fps > 0.0) {
                return Err(WallError::InvalidMessage(format!("frame rate {fps}")));
            }
            tokens.finish()?;
            return Ok(StreamMessage::FrameRate(fps));
        }

        let count: usize = tokens.next_num("stream count")?;
        let layout = match kind {
            LayoutKind::Direct => {
                let mut list = Vec::with_capacity(count);
                for _ in 0..count {
                    list.push(RegionAssignment {
                        receiver_id: tokens.next_num("receiver id")?,
                        rect: Rect::new(
                            tokens.next_num("x")?,
                            tokens.next_num("y")?,
                            tokens.next_num("width")?,
                            tokens.next_num("height")?,
                        ),
                    });
                }
                StreamLayout::Direct(list)
            }
            LayoutKind::Bridge => {
                let mut list = Vec::with_capacity(count);
                for _ in 0..count {
                    list.push(RangeAssignment {
                        receiver_id: tokens.next_num("receiver id")?,
                        first_block: tokens.next_num("first block")?,
                        last_block: tokens.next_num("last block")?,
                    });
                }
                StreamLayout::Bridge(list)
            }
        };
        tokens.finish()?;
        Ok(StreamMessage::Reconfigure(layout))
    }
}

// ── ConnectionDescriptor ─────────────────────────────────────────

/// One receiver a streamer connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverEndpoint {
    pub ip: String,
    /// Overrides the descriptor's base port.
    pub local_port: Option<u16>,
    /// Receiver id used in layout messages.
    pub node_id: u32,
}

impl ReceiverEndpoint {
    /// Port to dial for `protocol`.
    pub fn port(&self, base_port: u16, protocol: Protocol) -> u16 {
        self.local_port
            .unwrap_or(base_port)
            .saturating_add(protocol.port_offset())
    }
}

/// Where a streamer's receivers live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub base_port: u16,
    pub receivers: Vec<ReceiverEndpoint>,
}

impl ConnectionDescriptor {
    /// Parse a descriptor; `with_local_port` means each entry carries its
    /// own port. A receiver count of `-1` stands for a single receiver.
    pub fn parse(text: &str, with_local_port: bool) -> Result<Self> {
        let mut tokens = Tokens::new(text);
        let base_port: u16 = tokens.next_num("base port")?;
        let count: i64 = tokens.next_num("receiver count")?;
        let count = match count {
            -1 => 1,
            n if n >= 0 => n as usize,
            n => return Err(WallError::InvalidMessage(format!("receiver count {n}"))),
        };
        let mut receivers = Vec::with_capacity(count);
        for _ in 0..count {
            let ip = tokens.next_str("receiver address")?.to_string();
            let local_port = if with_local_port {
                Some(tokens.next_num("local port")?)
            } else {
                None
            };
            receivers.push(ReceiverEndpoint {
                ip,
                local_port,
                node_id: tokens.next_num("node id")?,
            });
        }
        tokens.finish()?;
        Ok(Self {
            base_port,
            receivers,
        })
    }
}

// ── Tokenizer ────────────────────────────────────────────────────

struct Tokens<'a> {
    iter: std::str::SplitAsciiWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            iter: text.split_ascii_whitespace(),
        }
    }

    fn next_str(&mut self, what: &str) -> Result<&'a str> {
        self.iter
            .next()
            .ok_or_else(|| WallError::InvalidMessage(format!("missing {what}")))
    }

    fn next_num<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next_str(what)?;
        token
            .parse()
            .map_err(|_| WallError::InvalidMessage(format!("bad {what}: {token:?}")))
    }

    fn finish(mut self) -> Result<()> {
        match self.iter.next() {
            None => Ok(()),
            Some(extra) => Err(WallError::InvalidMessage(format!(
                "unexpected trailing token {extra:?}"
            ))),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_layout() {
        let msg = StreamMessage::parse(LayoutKind::Direct, "2  0 0 0 960 1080  1 960 0 960 1080").unwrap();
        let StreamMessage::Reconfigure(StreamLayout::Direct(list)) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].receiver_id, 1);
        assert_eq!(list[1].rect, Rect::new(960, 0, 960, 1080));
    }

    #[test]
    fn bridge_layout() {
        let msg = StreamMessage::parse(LayoutKind::Bridge, "1 4 0 254").unwrap();
        assert_eq!(
            msg,
            StreamMessage::Reconfigure(StreamLayout::Bridge(vec![RangeAssignment {
                receiver_id: 4,
                first_block: 0,
                last_block: 254,
            }]))
        );
    }

    #[test]
    fn frame_rate_message() {
        assert_eq!(
            StreamMessage::parse(LayoutKind::Direct, "rate 24.5").unwrap(),
            StreamMessage::FrameRate(24.5)
        );
        assert!(StreamMessage::parse(LayoutKind::Direct, "rate 0").is_err());
    }

    #[test]
    fn malformed_layouts_rejected() {
        assert!(StreamMessage::parse(LayoutKind::Direct, "2 0 0 0 960 1080").is_err());
        assert!(StreamMessage::parse(LayoutKind::Bridge, "1 4 0 254 9").is_err());
        assert!(StreamMessage::parse(LayoutKind::Direct, "").is_err());
    }

    #[test]
    fn descriptor_with_and_without_local_ports() {
        let d = ConnectionDescriptor::parse("20000 2 10.0.0.1 0 10.0.0.2 1", false).unwrap();
        assert_eq!(d.base_port, 20000);
        assert_eq!(d.receivers[1].ip, "10.0.0.2");
        assert_eq!(d.receivers[1].port(d.base_port, Protocol::Tcp), 20000);
        assert_eq!(d.receivers[1].port(d.base_port, Protocol::Udp), 20001);

        let d = ConnectionDescriptor::parse("20000 1 10.0.0.1 21000 5", true).unwrap();
        assert_eq!(d.receivers[0].node_id, 5);
        assert_eq!(d.receivers[0].port(d.base_port, Protocol::Tcp), 21000);
    }

    #[test]
    fn single_receiver_shorthand() {
        let d = ConnectionDescriptor::parse("20000 -1 127.0.0.1 0", false).unwrap();
        assert_eq!(d.receivers.len(), 1);
        assert!(ConnectionDescriptor::parse("20000 -2", false).is_err());
    }
}
