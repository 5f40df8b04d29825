//! Typed media units flowing through a stream.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Format of a single media track, with the codec parameters readers need to
/// bootstrap a decoder or muxer. A tagged enum rather than trait objects so
/// reader callbacks never probe types at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackFormat {
    H264 { sps: Bytes, pps: Bytes },
    H265 { vps: Bytes, sps: Bytes, pps: Bytes },
    Mjpeg,
    Opus,
    Aac { config: Bytes },
    Generic,
}

impl TrackFormat {
    /// Short codec tag for logs and API output.
    #[must_use]
    pub const fn codec(&self) -> &'static str {
        match self {
            Self::H264 { .. } => "H264",
            Self::H265 { .. } => "H265",
            Self::Mjpeg => "MJPEG",
            Self::Opus => "Opus",
            Self::Aac { .. } => "AAC",
            Self::Generic => "generic",
        }
    }

    #[must_use]
    pub const fn is_video(&self) -> bool {
        matches!(self, Self::H264 { .. } | Self::H265 { .. } | Self::Mjpeg)
    }
}

/// One track of a media description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Index within the description; doubles as the reader callback key.
    pub id: usize,
    pub format: TrackFormat,
}

/// Immutable description of a publisher session: the ordered list of tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDescription {
    pub tracks: Vec<Track>,
}

impl MediaDescription {
    #[must_use]
    pub fn new(formats: Vec<TrackFormat>) -> Self {
        Self {
            tracks: formats
                .into_iter()
                .enumerate()
                .map(|(id, format)| Track { id, format })
                .collect(),
        }
    }

    #[must_use]
    pub fn first_video_track(&self) -> Option<&Track> {
        self.tracks.iter().find(|t| t.format.is_video())
    }
}

/// Payload of one media unit, tagged per track family.
#[derive(Debug, Clone)]
pub enum Payload {
    /// H.264 access unit as a list of raw NAL units.
    H264(Vec<Bytes>),
    /// H.265 access unit as a list of raw NAL units.
    H265(Vec<Bytes>),
    /// One JPEG image.
    Mjpeg(Bytes),
    /// Opus packets.
    Opus(Vec<Bytes>),
    /// AAC access units.
    Aac(Vec<Bytes>),
    Generic(Bytes),
}

impl Payload {
    /// Total payload size in bytes, used for the per-stream byte counter.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::H264(nalus) | Self::H265(nalus) | Self::Opus(nalus) | Self::Aac(nalus) => {
                nalus.iter().map(|n| n.len() as u64).sum()
            }
            Self::Mjpeg(data) | Self::Generic(data) => data.len() as u64,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// A single timed media unit.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Presentation timestamp on the 90 kHz clock.
    pub pts: i64,
    /// Wall-clock time of the unit.
    pub ntp: DateTime<Utc>,
    pub payload: Payload,
}

impl Unit {
    #[must_use]
    pub fn new(pts: i64, payload: Payload) -> Self {
        Self {
            pts,
            ntp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_assigns_track_ids_in_order() {
        let desc = MediaDescription::new(vec![
            TrackFormat::H264 {
                sps: Bytes::from_static(&[0x67]),
                pps: Bytes::from_static(&[0x68]),
            },
            TrackFormat::Opus,
        ]);
        assert_eq!(desc.tracks[0].id, 0);
        assert_eq!(desc.tracks[1].id, 1);
        assert_eq!(desc.first_video_track().unwrap().id, 0);
    }

    #[test]
    fn test_payload_size() {
        let payload = Payload::H264(vec![
            Bytes::from_static(&[0x65, 0x01]),
            Bytes::from_static(&[0x41]),
        ]);
        assert_eq!(payload.size(), 3);
        assert!(!payload.is_empty());
        assert!(Payload::Generic(Bytes::new()).is_empty());
    }
}
