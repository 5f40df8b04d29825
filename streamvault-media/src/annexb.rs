//! Annex-B framing helpers.
//!
//! Recorders receive access units as lists of raw NAL units and hand the
//! muxers Annex-B framed buffers; the fMP4 muxer re-frames them to
//! length-prefixed samples internally.

use bytes::{BufMut, Bytes, BytesMut};

/// Join NAL units with 4-byte start codes.
#[must_use]
pub fn join(nalus: &[Bytes]) -> Bytes {
    let total: usize = nalus.iter().map(|n| n.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(total);
    for nalu in nalus {
        buf.put_slice(&[0, 0, 0, 1]);
        buf.put_slice(nalu);
    }
    buf.freeze()
}

/// Split an Annex-B framed buffer back into raw NAL units.
///
/// Accepts both 3-byte and 4-byte start codes. Bytes before the first start
/// code are discarded.
#[must_use]
pub fn split(data: &[u8]) -> Vec<Bytes> {
    let mut nalus = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                if code_start > s {
                    nalus.push(Bytes::copy_from_slice(&data[s..code_start]));
                }
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            nalus.push(Bytes::copy_from_slice(&data[s..]));
        }
    }
    nalus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_then_split() {
        let nalus = vec![
            Bytes::from_static(&[0x65, 0x88, 0x01]),
            Bytes::from_static(&[0x41, 0x9a]),
        ];
        let framed = join(&nalus);
        assert_eq!(&framed[..4], &[0, 0, 0, 1]);
        assert_eq!(split(&framed), nalus);
    }

    #[test]
    fn test_split_three_byte_start_codes() {
        let data = [0u8, 0, 1, 0x67, 0xAA, 0, 0, 1, 0x68, 0xBB];
        let nalus = split(&data);
        assert_eq!(nalus.len(), 2);
        assert_eq!(&nalus[0][..], &[0x67, 0xAA]);
        assert_eq!(&nalus[1][..], &[0x68, 0xBB]);
    }

    #[test]
    fn test_split_empty() {
        assert!(split(&[]).is_empty());
        assert!(split(&[0x65, 0x88]).is_empty());
    }
}
