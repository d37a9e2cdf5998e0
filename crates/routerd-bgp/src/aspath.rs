//! AS path attribute value

use std::fmt;

use crate::error::{BgpError, BgpResult};
use crate::types::{notify, AsNum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentType {
    Set = 1,
    Sequence = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsSegment {
    pub seg_type: SegmentType,
    pub asns: Vec<AsNum>,
}

/// Ordered AS path: a list of segments, head (most recent hop) first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AsPath {
    segments: Vec<AsSegment>,
}

impl AsPath {
    pub fn new() -> AsPath {
        AsPath::default()
    }

    pub fn from_sequence(asns: impl IntoIterator<Item = AsNum>) -> AsPath {
        AsPath {
            segments: vec![AsSegment {
                seg_type: SegmentType::Sequence,
                asns: asns.into_iter().collect(),
            }],
        }
    }

    pub fn segments(&self) -> &[AsSegment] {
        &self.segments
    }

    /// Prepend our AS when announcing to an external peer.
    pub fn prepend_as(&mut self, asn: AsNum) {
        match self.segments.first_mut() {
            Some(seg) if seg.seg_type == SegmentType::Sequence => seg.asns.insert(0, asn),
            _ => self.segments.insert(
                0,
                AsSegment {
                    seg_type: SegmentType::Sequence,
                    asns: vec![asn],
                },
            ),
        }
    }

    /// Path length for route selection: sets count one.
    pub fn path_length(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s.seg_type {
                SegmentType::Sequence => s.asns.len(),
                SegmentType::Set => 1,
            })
            .sum()
    }

    /// Loop detection: does the path already contain `asn`?
    pub fn contains(&self, asn: AsNum) -> bool {
        self.segments
            .iter()
            .any(|s| s.asns.iter().any(|a| a.as_extended() == asn.as_extended()))
    }

    /// Encode with 2- or 4-octet AS numbers depending on the session's
    /// negotiated capability.
    pub fn encode(&self, four_byte: bool, out: &mut Vec<u8>) {
        for seg in &self.segments {
            out.push(seg.seg_type as u8);
            out.push(seg.asns.len() as u8);
            for asn in &seg.asns {
                if four_byte {
                    out.extend_from_slice(&asn.as_extended().to_be_bytes());
                } else {
                    out.extend_from_slice(&asn.short_or_trans().to_be_bytes());
                }
            }
        }
    }

    pub fn decode(buf: &[u8], four_byte: bool) -> BgpResult<AsPath> {
        let bad = || {
            BgpError::corrupt(
                "malformed AS path",
                notify::UPDATE_MESSAGE_ERROR,
                notify::MALFORMED_ASPATH,
            )
        };
        let asn_len = if four_byte { 4 } else { 2 };
        let mut segments = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            if buf.len() - pos < 2 {
                return Err(bad());
            }
            let seg_type = match buf[pos] {
                1 => SegmentType::Set,
                2 => SegmentType::Sequence,
                _ => return Err(bad()),
            };
            let count = buf[pos + 1] as usize;
            pos += 2;
            if buf.len() - pos < count * asn_len {
                return Err(bad());
            }
            let mut asns = Vec::with_capacity(count);
            for _ in 0..count {
                let asn = if four_byte {
                    AsNum::new_extended(u32::from_be_bytes(
                        buf[pos..pos + 4].try_into().expect("4-byte slice"),
                    ))
                } else {
                    AsNum::new(u16::from_be_bytes(
                        buf[pos..pos + 2].try_into().expect("2-byte slice"),
                    ))
                };
                asns.push(asn);
                pos += asn_len;
            }
            segments.push(AsSegment { seg_type, asns });
        }
        Ok(AsPath { segments })
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.segments {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match seg.seg_type {
                SegmentType::Sequence => {
                    let parts: Vec<String> = seg.asns.iter().map(|a| a.to_string()).collect();
                    write!(f, "{}", parts.join(" "))?;
                }
                SegmentType::Set => {
                    let parts: Vec<String> = seg.asns.iter().map(|a| a.to_string()).collect();
                    write!(f, "{{{}}}", parts.join(","))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_two_byte() {
        let path = AsPath::from_sequence([AsNum::new(65001), AsNum::new(65002)]);
        let mut buf = Vec::new();
        path.encode(false, &mut buf);
        assert_eq!(buf, [2, 2, 0xfd, 0xe9, 0xfd, 0xea]);

        let back = AsPath::decode(&buf, false).unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn test_encode_four_byte() {
        let path = AsPath::from_sequence([AsNum::new_extended(65537)]);
        let mut buf = Vec::new();
        path.encode(true, &mut buf);
        assert_eq!(buf, [2, 1, 0, 1, 0, 1]);

        // In a 2-byte session the extended AS squeezes to AS_TRANS.
        let mut buf2 = Vec::new();
        path.encode(false, &mut buf2);
        assert_eq!(buf2, [2, 1, 0x5b, 0xa0]);
    }

    #[test]
    fn test_prepend_and_loop_detection() {
        let mut path = AsPath::from_sequence([AsNum::new(65002)]);
        path.prepend_as(AsNum::new(65001));
        assert_eq!(path.to_string(), "65001 65002");
        assert_eq!(path.path_length(), 2);
        assert!(path.contains(AsNum::new(65001)));
        assert!(!path.contains(AsNum::new(65003)));
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(AsPath::decode(&[2, 3, 0, 1], false).is_err());
        assert!(AsPath::decode(&[7, 1, 0, 1], false).is_err());
    }
}
