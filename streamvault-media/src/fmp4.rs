//! Fragmented MP4 muxer.
//!
//! Writes `ftyp` + `moov` once, then one `moof`/`mdat` pair per fragment.
//! Fragments are cut at keyframes so every fragment is independently
//! decodable; `finalize` flushes whatever is pending, which doubles as the
//! file trailer (fragmented files carry no `mdat` index to patch).
//!
//! Input samples are Annex-B framed access units; they are re-framed to
//! 4-byte length-prefixed NAL units as required by ISO/IEC 14496-12.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Write;

use crate::annexb;
use crate::errors::{MediaError, Result};

/// Movie timescale. Samples are timestamped in milliseconds.
const TIMESCALE: u32 = 1000;

/// Fallback duration for the last sample of a fragment (40 ms ≈ 25 fps).
const DEFAULT_SAMPLE_DURATION: u32 = 40;

/// Upper bound on buffered samples before a fragment is forced out, so a
/// stream without keyframes cannot grow a fragment unboundedly.
const MAX_FRAGMENT_SAMPLES: usize = 512;

const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

/// Codec of a video track, with the parameter sets needed for the sample
/// entry.
#[derive(Debug, Clone)]
pub enum VideoCodec {
    H264 { sps: Bytes, pps: Bytes },
    H265 { vps: Bytes, sps: Bytes, pps: Bytes },
}

struct Sample {
    data: Bytes, // length-prefixed NAL units
    pts: i64,
    dts: i64,
    keyframe: bool,
}

struct Track {
    id: u32,
    codec: VideoCodec,
    samples: Vec<Sample>,
}

pub struct Muxer<W: Write> {
    out: W,
    tracks: Vec<Track>,
    header_written: bool,
    finalized: bool,
    fragment_seq: u32,
}

impl<W: Write> Muxer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            tracks: Vec::new(),
            header_written: false,
            finalized: false,
            fragment_seq: 1,
        }
    }

    /// Register a video track. Must happen before the first sample.
    pub fn add_video_track(&mut self, codec: VideoCodec) -> Result<u32> {
        if self.header_written {
            return Err(MediaError::HeaderAlreadyWritten);
        }
        let id = self.tracks.len() as u32 + 1;
        self.tracks.push(Track {
            id,
            codec,
            samples: Vec::new(),
        });
        Ok(id)
    }

    /// Append one access unit. Timestamps are in milliseconds.
    pub fn write_sample(
        &mut self,
        track_id: u32,
        annexb_payload: &[u8],
        pts: i64,
        dts: i64,
        keyframe: bool,
    ) -> Result<()> {
        if self.finalized {
            return Err(MediaError::Finalized);
        }
        let nalus = annexb::split(annexb_payload);
        if nalus.is_empty() {
            return Err(MediaError::EmptyAccessUnit);
        }

        if !self.header_written {
            self.write_header()?;
            self.header_written = true;
        }

        let pending: usize = self.tracks.iter().map(|t| t.samples.len()).sum();
        if (keyframe && pending > 0) || pending >= MAX_FRAGMENT_SAMPLES {
            self.flush_fragment()?;
        }

        let mut data = BytesMut::with_capacity(
            nalus.iter().map(|n| n.len() + 4).sum::<usize>(),
        );
        for nalu in &nalus {
            data.put_u32(nalu.len() as u32);
            data.put_slice(nalu);
        }

        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.id == track_id)
            .ok_or(MediaError::UnknownTrack(track_id))?;
        track.samples.push(Sample {
            data: data.freeze(),
            pts,
            dts,
            keyframe,
        });
        Ok(())
    }

    /// Flush pending samples and the output writer. The file is complete
    /// after this returns.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if !self.header_written && !self.tracks.is_empty() {
            // No samples ever arrived; still emit a valid (empty) file.
            self.write_header()?;
            self.header_written = true;
        }
        self.flush_fragment()?;
        self.out.flush()?;
        self.finalized = true;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buf = BoxBuf::new();

        let ftyp = buf.begin(b"ftyp");
        buf.buf.put_slice(b"isom");
        buf.buf.put_u32(0x200);
        buf.buf.put_slice(b"isom");
        buf.buf.put_slice(b"iso2");
        buf.buf.put_slice(b"iso6");
        buf.buf.put_slice(b"mp41");
        buf.end(ftyp);

        let moov = buf.begin(b"moov");
        self.write_mvhd(&mut buf);
        for i in 0..self.tracks.len() {
            self.write_trak(&mut buf, i);
        }
        let mvex = buf.begin(b"mvex");
        for track in &self.tracks {
            let trex = buf.full_begin(b"trex", 0, 0);
            buf.buf.put_u32(track.id);
            buf.buf.put_u32(1); // default sample description index
            buf.buf.put_u32(0); // default sample duration
            buf.buf.put_u32(0); // default sample size
            buf.buf.put_u32(0); // default sample flags
            buf.end(trex);
        }
        buf.end(mvex);
        buf.end(moov);

        self.out.write_all(&buf.buf)?;
        Ok(())
    }

    fn write_mvhd(&self, buf: &mut BoxBuf) {
        let mvhd = buf.full_begin(b"mvhd", 0, 0);
        buf.buf.put_u32(0); // creation time
        buf.buf.put_u32(0); // modification time
        buf.buf.put_u32(TIMESCALE);
        buf.buf.put_u32(0); // duration unknown (fragmented)
        buf.buf.put_u32(0x0001_0000); // rate 1.0
        buf.buf.put_u16(0x0100); // volume 1.0
        buf.buf.put_u16(0);
        buf.buf.put_u64(0);
        put_unity_matrix(&mut buf.buf);
        for _ in 0..6 {
            buf.buf.put_u32(0); // pre-defined
        }
        buf.buf.put_u32(self.tracks.len() as u32 + 1); // next track id
        buf.end(mvhd);
    }

    fn write_trak(&self, buf: &mut BoxBuf, index: usize) {
        let track = &self.tracks[index];

        let trak = buf.begin(b"trak");

        let tkhd = buf.full_begin(b"tkhd", 0, 0x7); // enabled | in movie | in preview
        buf.buf.put_u32(0); // creation
        buf.buf.put_u32(0); // modification
        buf.buf.put_u32(track.id);
        buf.buf.put_u32(0); // reserved
        buf.buf.put_u32(0); // duration
        buf.buf.put_u64(0); // reserved
        buf.buf.put_u16(0); // layer
        buf.buf.put_u16(0); // alternate group
        buf.buf.put_u16(0); // volume (video)
        buf.buf.put_u16(0); // reserved
        put_unity_matrix(&mut buf.buf);
        buf.buf.put_u32(0); // width (not parsed from parameter sets)
        buf.buf.put_u32(0); // height
        buf.end(tkhd);

        let mdia = buf.begin(b"mdia");

        let mdhd = buf.full_begin(b"mdhd", 0, 0);
        buf.buf.put_u32(0);
        buf.buf.put_u32(0);
        buf.buf.put_u32(TIMESCALE);
        buf.buf.put_u32(0);
        buf.buf.put_u16(0x55C4); // language: und
        buf.buf.put_u16(0);
        buf.end(mdhd);

        let hdlr = buf.full_begin(b"hdlr", 0, 0);
        buf.buf.put_u32(0);
        buf.buf.put_slice(b"vide");
        buf.buf.put_u64(0);
        buf.buf.put_u32(0);
        buf.buf.put_slice(b"VideoHandler\0");
        buf.end(hdlr);

        let minf = buf.begin(b"minf");

        let vmhd = buf.full_begin(b"vmhd", 0, 1);
        buf.buf.put_u64(0); // graphics mode + opcolor
        buf.end(vmhd);

        let dinf = buf.begin(b"dinf");
        let dref = buf.full_begin(b"dref", 0, 0);
        buf.buf.put_u32(1); // entry count
        let url = buf.full_begin(b"url ", 0, 1); // data in same file
        buf.end(url);
        buf.end(dref);
        buf.end(dinf);

        let stbl = buf.begin(b"stbl");
        self.write_stsd(buf, &track.codec);
        for typ in [b"stts", b"stsc", b"stco"] {
            let empty = buf.full_begin(typ, 0, 0);
            buf.buf.put_u32(0);
            buf.end(empty);
        }
        let stsz = buf.full_begin(b"stsz", 0, 0);
        buf.buf.put_u32(0); // sample size
        buf.buf.put_u32(0); // sample count
        buf.end(stsz);
        buf.end(stbl);

        buf.end(minf);
        buf.end(mdia);
        buf.end(trak);
    }

    fn write_stsd(&self, buf: &mut BoxBuf, codec: &VideoCodec) {
        let stsd = buf.full_begin(b"stsd", 0, 0);
        buf.buf.put_u32(1); // entry count

        let entry_type: &[u8; 4] = match codec {
            VideoCodec::H264 { .. } => b"avc1",
            VideoCodec::H265 { .. } => b"hvc1",
        };
        let entry = buf.begin(entry_type);
        buf.buf.put_slice(&[0; 6]); // reserved
        buf.buf.put_u16(1); // data reference index
        buf.buf.put_u32(0); // pre-defined + reserved
        buf.buf.put_u32(0);
        buf.buf.put_u64(0);
        buf.buf.put_u32(0);
        buf.buf.put_u16(0); // width: derived by the decoder
        buf.buf.put_u16(0); // height
        buf.buf.put_u32(0x0048_0000); // 72 dpi horizontal
        buf.buf.put_u32(0x0048_0000); // 72 dpi vertical
        buf.buf.put_u32(0);
        buf.buf.put_u16(1); // frame count
        buf.buf.put_slice(&[0; 32]); // compressor name
        buf.buf.put_u16(0x0018); // depth
        buf.buf.put_u16(0xFFFF); // pre-defined

        match codec {
            VideoCodec::H264 { sps, pps } => {
                let avcc = buf.begin(b"avcC");
                buf.buf.put_u8(1); // configuration version
                let (profile, compat, level) = if sps.len() >= 4 {
                    (sps[1], sps[2], sps[3])
                } else {
                    (0x64, 0, 0x1F)
                };
                buf.buf.put_u8(profile);
                buf.buf.put_u8(compat);
                buf.buf.put_u8(level);
                buf.buf.put_u8(0xFF); // 4-byte NAL lengths
                buf.buf.put_u8(0xE1); // 1 SPS
                buf.buf.put_u16(sps.len() as u16);
                buf.buf.put_slice(sps);
                buf.buf.put_u8(1); // 1 PPS
                buf.buf.put_u16(pps.len() as u16);
                buf.buf.put_slice(pps);
                buf.end(avcc);
            }
            VideoCodec::H265 { vps, sps, pps } => {
                let hvcc = buf.begin(b"hvcC");
                buf.buf.put_u8(1); // configuration version
                buf.buf.put_u8(0x01); // profile space 0, tier 0, profile idc 1 (Main)
                buf.buf.put_u32(0x6000_0000); // profile compatibility
                buf.buf.put_slice(&[0x90, 0, 0, 0, 0, 0]); // constraint flags
                buf.buf.put_u8(0x5D); // level idc (3.1)
                buf.buf.put_u16(0xF000); // min spatial segmentation
                buf.buf.put_u8(0xFC); // parallelism type
                buf.buf.put_u8(0xFD); // chroma format 4:2:0
                buf.buf.put_u8(0xF8); // bit depth luma - 8
                buf.buf.put_u8(0xF8); // bit depth chroma - 8
                buf.buf.put_u16(0); // avg frame rate
                buf.buf.put_u8(0x03); // constant frame rate 0, num temporal layers 0, 4-byte lengths
                buf.buf.put_u8(3); // number of arrays
                for (nal_type, nalu) in [(32u8, vps), (33u8, sps), (34u8, pps)] {
                    buf.buf.put_u8(nal_type);
                    buf.buf.put_u16(1); // one NAL of this type
                    buf.buf.put_u16(nalu.len() as u16);
                    buf.buf.put_slice(nalu);
                }
                buf.end(hvcc);
            }
        }

        buf.end(entry);
        buf.end(stsd);
    }

    fn flush_fragment(&mut self) -> Result<()> {
        if self.tracks.iter().all(|t| t.samples.is_empty()) {
            return Ok(());
        }

        let mut buf = BoxBuf::new();
        let moof = buf.begin(b"moof");

        let mfhd = buf.full_begin(b"mfhd", 0, 0);
        buf.buf.put_u32(self.fragment_seq);
        buf.end(mfhd);

        // Remember where each trun's data_offset lives so it can be patched
        // once the moof size is known.
        let mut offset_patches: Vec<(usize, usize)> = Vec::new(); // (patch pos, mdat-relative offset)
        let mut mdat = BytesMut::new();

        for track in &self.tracks {
            if track.samples.is_empty() {
                continue;
            }

            let traf = buf.begin(b"traf");

            let tfhd = buf.full_begin(b"tfhd", 0, 0x02_0000); // default-base-is-moof
            buf.buf.put_u32(track.id);
            buf.end(tfhd);

            let tfdt = buf.full_begin(b"tfdt", 1, 0);
            buf.buf.put_u64(track.samples[0].dts.max(0) as u64);
            buf.end(tfdt);

            // duration + size + flags + composition offset per sample
            let trun = buf.full_begin(b"trun", 1, 0x000F01);
            buf.buf.put_u32(track.samples.len() as u32);
            offset_patches.push((buf.buf.len(), mdat.len()));
            buf.buf.put_u32(0); // data offset, patched below
            for (i, sample) in track.samples.iter().enumerate() {
                let duration = track
                    .samples
                    .get(i + 1)
                    .map(|next| (next.dts - sample.dts).max(1) as u32)
                    .unwrap_or(DEFAULT_SAMPLE_DURATION);
                buf.buf.put_u32(duration);
                buf.buf.put_u32(sample.data.len() as u32);
                buf.buf.put_u32(if sample.keyframe {
                    SAMPLE_FLAGS_SYNC
                } else {
                    SAMPLE_FLAGS_NON_SYNC
                });
                buf.buf.put_i32((sample.pts - sample.dts) as i32);
                mdat.put_slice(&sample.data);
            }
            buf.end(trun);
            buf.end(traf);
        }

        buf.end(moof);

        let moof_size = buf.buf.len();
        for (pos, mdat_offset) in offset_patches {
            let absolute = moof_size + 8 + mdat_offset;
            BigEndian::write_u32(&mut buf.buf[pos..pos + 4], absolute as u32);
        }

        self.out.write_all(&buf.buf)?;

        let mut mdat_header = [0u8; 8];
        BigEndian::write_u32(&mut mdat_header[..4], mdat.len() as u32 + 8);
        mdat_header[4..].copy_from_slice(b"mdat");
        self.out.write_all(&mdat_header)?;
        self.out.write_all(&mdat)?;

        self.fragment_seq += 1;
        for track in &mut self.tracks {
            track.samples.clear();
        }
        Ok(())
    }
}

/// Byte buffer with ISO-BMFF box bookkeeping: `begin` reserves a size field,
/// `end` patches it.
struct BoxBuf {
    buf: BytesMut,
}

impl BoxBuf {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    fn begin(&mut self, typ: &[u8; 4]) -> usize {
        let offset = self.buf.len();
        self.buf.put_u32(0);
        self.buf.put_slice(typ);
        offset
    }

    fn full_begin(&mut self, typ: &[u8; 4], version: u8, flags: u32) -> usize {
        let offset = self.begin(typ);
        self.buf.put_u8(version);
        self.buf.put_slice(&flags.to_be_bytes()[1..]);
        offset
    }

    fn end(&mut self, offset: usize) {
        let size = (self.buf.len() - offset) as u32;
        BigEndian::write_u32(&mut self.buf[offset..offset + 4], size);
    }
}

fn put_unity_matrix(buf: &mut BytesMut) {
    for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        buf.put_u32(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annexb;

    fn keyframe_payload() -> Bytes {
        annexb::join(&[
            Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]), // SPS
            Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]), // PPS
            Bytes::from_static(&[0x65, 0x88, 0x84, 0x00]), // IDR
        ])
    }

    fn h264_codec() -> VideoCodec {
        VideoCodec::H264 {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]),
        }
    }

    fn box_types(data: &[u8]) -> Vec<[u8; 4]> {
        let mut types = Vec::new();
        let mut pos = 0;
        while pos + 8 <= data.len() {
            let size = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
            let mut typ = [0u8; 4];
            typ.copy_from_slice(&data[pos + 4..pos + 8]);
            types.push(typ);
            assert!(size >= 8, "corrupt box size at {pos}");
            pos += size;
        }
        assert_eq!(pos, data.len(), "trailing bytes after last box");
        types
    }

    #[test]
    fn test_top_level_box_sequence() {
        let mut out = Vec::new();
        let mut muxer = Muxer::new(&mut out);
        let track = muxer.add_video_track(h264_codec()).unwrap();

        muxer.write_sample(track, &keyframe_payload(), 0, 0, true).unwrap();
        muxer
            .write_sample(track, &annexb::join(&[Bytes::from_static(&[0x41, 0x9A])]), 40, 40, false)
            .unwrap();
        muxer.finalize().unwrap();

        let types = box_types(&out);
        assert_eq!(
            types,
            vec![*b"ftyp", *b"moov", *b"moof", *b"mdat"]
        );
    }

    #[test]
    fn test_fragment_cut_on_keyframe() {
        let mut out = Vec::new();
        let mut muxer = Muxer::new(&mut out);
        let track = muxer.add_video_track(h264_codec()).unwrap();

        muxer.write_sample(track, &keyframe_payload(), 0, 0, true).unwrap();
        muxer
            .write_sample(track, &annexb::join(&[Bytes::from_static(&[0x41, 0x9A])]), 40, 40, false)
            .unwrap();
        // Second keyframe forces the first fragment out.
        muxer.write_sample(track, &keyframe_payload(), 80, 80, true).unwrap();
        muxer.finalize().unwrap();

        let types = box_types(&out);
        let moof_count = types.iter().filter(|t| *t == b"moof").count();
        assert_eq!(moof_count, 2);
    }

    #[test]
    fn test_track_registration_after_header_rejected() {
        let mut out = Vec::new();
        let mut muxer = Muxer::new(&mut out);
        let track = muxer.add_video_track(h264_codec()).unwrap();
        muxer.write_sample(track, &keyframe_payload(), 0, 0, true).unwrap();

        assert!(matches!(
            muxer.add_video_track(h264_codec()),
            Err(MediaError::HeaderAlreadyWritten)
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let mut out = Vec::new();
        let mut muxer = Muxer::new(&mut out);
        let track = muxer.add_video_track(h264_codec()).unwrap();
        assert!(matches!(
            muxer.write_sample(track, &[], 0, 0, true),
            Err(MediaError::EmptyAccessUnit)
        ));
    }

    #[test]
    fn test_finalize_idempotent() {
        let mut out = Vec::new();
        let mut muxer = Muxer::new(&mut out);
        let track = muxer.add_video_track(h264_codec()).unwrap();
        muxer.write_sample(track, &keyframe_payload(), 0, 0, true).unwrap();
        muxer.finalize().unwrap();
        let len = out_len(&muxer);
        muxer.finalize().unwrap();
        assert_eq!(out_len(&muxer), len);
    }

    fn out_len(muxer: &Muxer<&mut Vec<u8>>) -> usize {
        muxer.out.len()
    }
}
