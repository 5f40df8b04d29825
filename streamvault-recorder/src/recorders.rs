//! Format-specific recorder adapters.
//!
//! Each adapter owns the output file, the muxer and a stream-reader
//! subscription. Muxer failures and reader-level errors (lag, stream
//! closure) are funneled into the owning task's error channel, where they
//! feed the retry loop.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use streamvault_core::{Error, Result};
use streamvault_media::{annexb, fmp4, h264, h265, mpegts, DtsExtractor};
use streamvault_stream::{Payload, Stream, StreamReader, TrackFormat, Unit};

use crate::task::RecordFormat;

/// Video codec family a recorder binds to.
#[derive(Clone, Copy, PartialEq, Eq)]
enum VideoFamily {
    H264,
    H265,
}

/// A running recorder of either format.
pub(crate) enum ActiveRecorder {
    Mp4(Mp4Recorder),
    Ts(TsRecorder),
}

impl ActiveRecorder {
    pub(crate) fn start(
        format: RecordFormat,
        stream: Arc<Stream>,
        full_path: &Path,
        timeout: std::time::Duration,
        err_tx: mpsc::Sender<Error>,
    ) -> Result<Self> {
        match format {
            RecordFormat::Mp4 => Ok(Self::Mp4(Mp4Recorder::start(stream, full_path, err_tx)?)),
            RecordFormat::Ts => Ok(Self::Ts(TsRecorder::start(
                stream, full_path, timeout, err_tx,
            )?)),
        }
    }

    /// Detach from the stream and seal the file.
    pub(crate) fn close(self) {
        match self {
            Self::Mp4(r) => r.close(),
            Self::Ts(r) => r.close(),
        }
    }
}

fn video_track(stream: &Stream) -> Result<(usize, VideoFamily, TrackFormat)> {
    for track in &stream.describe().tracks {
        match &track.format {
            TrackFormat::H264 { .. } => {
                return Ok((track.id, VideoFamily::H264, track.format.clone()))
            }
            TrackFormat::H265 { .. } => {
                return Ok((track.id, VideoFamily::H265, track.format.clone()))
            }
            _ => {}
        }
    }
    Err(Error::Muxer("stream has no recordable video track".into()))
}

fn open_output(full_path: &Path) -> Result<BufWriter<File>> {
    // Truncating keeps retried attempts from appending onto a half-written
    // file.
    let file = File::create(full_path)?;
    Ok(BufWriter::new(file))
}

/// Forward reader-level errors into the task's channel.
fn forward_errors(mut err_rx: mpsc::Receiver<Error>, err_tx: mpsc::Sender<Error>) {
    tokio::spawn(async move {
        if let Some(err) = err_rx.recv().await {
            let _ = err_tx.try_send(err);
        }
    });
}

fn unit_nalus(family: VideoFamily, unit: &Unit) -> Option<&[Bytes]> {
    match (&unit.payload, family) {
        (Payload::H264(nalus), VideoFamily::H264) | (Payload::H265(nalus), VideoFamily::H265) => {
            Some(nalus)
        }
        _ => None,
    }
}

fn is_random_access(family: VideoFamily, nalus: &[Bytes]) -> bool {
    match family {
        VideoFamily::H264 => h264::is_random_access(nalus),
        VideoFamily::H265 => h265::is_random_access(nalus),
    }
}

/// Fragmented-MP4 recorder.
///
/// Units before the first random-access unit are dropped; the DTS extractor
/// is initialized at that unit. Timestamps are converted from the 90 kHz
/// clock to milliseconds.
pub(crate) struct Mp4Recorder {
    stream: Arc<Stream>,
    reader_id: Uuid,
    state: Arc<Mutex<Mp4State>>,
}

struct Mp4State {
    muxer: fmp4::Muxer<BufWriter<File>>,
    track: u32,
    dts_extractor: Option<DtsExtractor>,
}

impl Mp4Recorder {
    pub(crate) fn start(
        stream: Arc<Stream>,
        full_path: &Path,
        err_tx: mpsc::Sender<Error>,
    ) -> Result<Self> {
        let (track_id, family, format) = video_track(&stream)?;

        let mut muxer = fmp4::Muxer::new(open_output(full_path)?);
        let codec = match format {
            TrackFormat::H264 { sps, pps } => fmp4::VideoCodec::H264 { sps, pps },
            TrackFormat::H265 { vps, sps, pps } => fmp4::VideoCodec::H265 { vps, sps, pps },
            _ => unreachable!("video_track returns H264/H265 only"),
        };
        let track = muxer
            .add_video_track(codec)
            .map_err(|e| Error::Muxer(e.to_string()))?;

        let state = Arc::new(Mutex::new(Mp4State {
            muxer,
            track,
            dts_extractor: None,
        }));

        let (reader, err_rx) = StreamReader::new();
        let callback_state = Arc::clone(&state);
        reader.on_track(
            track_id,
            Box::new(move |unit| {
                let Some(nalus) = unit_nalus(family, unit) else {
                    return Ok(());
                };
                if nalus.is_empty() {
                    return Ok(());
                }

                let mut state = callback_state.lock();
                if state.dts_extractor.is_none() {
                    if !is_random_access(family, nalus) {
                        return Ok(());
                    }
                    state.dts_extractor = Some(DtsExtractor::new());
                }

                let keyframe = is_random_access(family, nalus);
                let dts = state
                    .dts_extractor
                    .as_mut()
                    .expect("extractor initialized above")
                    .extract(unit.pts);
                let payload = annexb::join(nalus);

                let track = state.track;
                state
                    .muxer
                    .write_sample(track, &payload, unit.pts / 90, dts / 90, keyframe)
                    .map_err(|e| Error::Muxer(e.to_string()))
            }),
        );

        stream.add_reader(&reader)?;
        forward_errors(err_rx, err_tx);

        debug!(path = %full_path.display(), "MP4 recorder started");
        Ok(Self {
            stream,
            reader_id: reader.id(),
            state,
        })
    }

    pub(crate) fn close(self) {
        self.stream.remove_reader(self.reader_id);
        let mut state = self.state.lock();
        if let Err(e) = state.muxer.finalize() {
            warn!(error = %e, "failed to seal MP4 file");
        }
    }
}

/// MPEG-TS recorder built on the transport-stream muxer, configured with
/// part and segment durations equal to the task timeout and a 100 MiB part
/// bound.
pub(crate) struct TsRecorder {
    stream: Arc<Stream>,
    reader_id: Uuid,
    state: Arc<Mutex<TsState>>,
}

struct TsState {
    muxer: mpegts::Muxer<BufWriter<File>>,
    dts_extractor: Option<DtsExtractor>,
}

impl TsRecorder {
    pub(crate) fn start(
        stream: Arc<Stream>,
        full_path: &Path,
        timeout: std::time::Duration,
        err_tx: mpsc::Sender<Error>,
    ) -> Result<Self> {
        let (track_id, family, _format) = video_track(&stream)?;

        let stream_type = match family {
            VideoFamily::H264 => mpegts::VideoStreamType::H264,
            VideoFamily::H265 => mpegts::VideoStreamType::H265,
        };
        let config = mpegts::MuxerConfig {
            part_duration: timeout,
            segment_duration: timeout,
            max_part_size: 100 * 1024 * 1024,
        };
        let muxer = mpegts::Muxer::new(open_output(full_path)?, stream_type, config);

        let state = Arc::new(Mutex::new(TsState {
            muxer,
            dts_extractor: None,
        }));

        let (reader, err_rx) = StreamReader::new();
        let callback_state = Arc::clone(&state);
        reader.on_track(
            track_id,
            Box::new(move |unit| {
                let Some(nalus) = unit_nalus(family, unit) else {
                    return Ok(());
                };
                if nalus.is_empty() {
                    return Ok(());
                }

                let mut state = callback_state.lock();
                if state.dts_extractor.is_none() {
                    if !is_random_access(family, nalus) {
                        return Ok(());
                    }
                    state.dts_extractor = Some(DtsExtractor::new());
                }

                let keyframe = is_random_access(family, nalus);
                let dts = state
                    .dts_extractor
                    .as_mut()
                    .expect("extractor initialized above")
                    .extract(unit.pts);
                let payload = annexb::join(nalus);

                state
                    .muxer
                    .write_video(&payload, unit.pts, dts, keyframe)
                    .map_err(|e| Error::Muxer(e.to_string()))
            }),
        );

        stream.add_reader(&reader)?;
        forward_errors(err_rx, err_tx);

        debug!(path = %full_path.display(), "TS recorder started");
        Ok(Self {
            stream,
            reader_id: reader.id(),
            state,
        })
    }

    pub(crate) fn close(self) {
        self.stream.remove_reader(self.reader_id);
        let mut state = self.state.lock();
        if let Err(e) = state.muxer.finalize() {
            warn!(error = %e, "failed to seal TS file");
        }
    }
}
