//! In-memory fan-out of media units within one publisher session.
//!
//! Delivery model: each reader owns a bounded queue drained by its own task,
//! so one slow reader never blocks the publisher or the other readers.
//! `publish_unit` enqueues with `try_send`; a full queue means the reader
//! lagged and it is dropped with [`Error::ReaderLagged`] on its error
//! channel. Real-time media forbids arbitrary queueing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use streamvault_core::{Error, Result};

use crate::unit::{MediaDescription, Unit};

/// Per-reader queue depth. Sized for roughly two seconds of video access
/// units at high frame rates.
const READER_QUEUE_CAPACITY: usize = 256;

/// Callback invoked for every unit of one track.
pub type UnitCallback = Box<dyn FnMut(&Unit) -> Result<()> + Send>;

type Envelope = (usize, Arc<Unit>);

/// A registered consumer of a stream.
///
/// Create one with [`StreamReader::new`], install per-track callbacks with
/// [`on_track`](Self::on_track), then hand it to [`Stream::add_reader`].
/// Errors (lag, stream closure, callback failures) arrive on the receiver
/// returned by `new`.
pub struct StreamReader {
    id: Uuid,
    callbacks: Mutex<HashMap<usize, UnitCallback>>,
    err_tx: mpsc::Sender<Error>,
}

impl StreamReader {
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Error>) {
        let (err_tx, err_rx) = mpsc::channel(10);
        (
            Arc::new(Self {
                id: Uuid::new_v4(),
                callbacks: Mutex::new(HashMap::new()),
                err_tx,
            }),
            err_rx,
        )
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Install the callback for one track. Replaces any previous callback
    /// for the same track.
    pub fn on_track(&self, track_id: usize, callback: UnitCallback) {
        self.callbacks.lock().insert(track_id, callback);
    }
}

struct ReaderSlot {
    id: Uuid,
    tx: mpsc::Sender<Envelope>,
    err_tx: mpsc::Sender<Error>,
}

struct Inner {
    readers: Vec<ReaderSlot>,
    closed: bool,
}

/// The live fan-out of one publisher session.
pub struct Stream {
    desc: MediaDescription,
    /// Hint for protocol-side readers: RTP packets must be regenerated.
    pub generate_rtp_packets: bool,
    /// Hint for protocol-side readers: missing NTP timestamps are filled in.
    pub fill_ntp: bool,
    bytes_received: AtomicU64,
    inner: Mutex<Inner>,
}

impl Stream {
    #[must_use]
    pub fn new(desc: MediaDescription, generate_rtp_packets: bool, fill_ntp: bool) -> Arc<Self> {
        Arc::new(Self {
            desc,
            generate_rtp_packets,
            fill_ntp,
            bytes_received: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                readers: Vec::new(),
                closed: false,
            }),
        })
    }

    /// The immutable media description of this session.
    #[must_use]
    pub fn describe(&self) -> &MediaDescription {
        &self.desc
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers.len()
    }

    /// Register a reader. Fails with [`Error::StreamClosed`] once the
    /// publisher session is over.
    pub fn add_reader(&self, reader: &Arc<StreamReader>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Envelope>(READER_QUEUE_CAPACITY);

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::StreamClosed);
            }
            inner.readers.push(ReaderSlot {
                id: reader.id,
                tx,
                err_tx: reader.err_tx.clone(),
            });
        }

        let reader = Arc::clone(reader);
        tokio::spawn(async move {
            while let Some((track_id, unit)) = rx.recv().await {
                let result = {
                    let mut callbacks = reader.callbacks.lock();
                    match callbacks.get_mut(&track_id) {
                        Some(callback) => callback(&unit),
                        None => Ok(()),
                    }
                };
                if let Err(e) = result {
                    debug!(reader = %reader.id, error = %e, "reader callback failed");
                    let _ = reader.err_tx.try_send(e);
                    break;
                }
            }
        });

        Ok(())
    }

    /// Remove a reader. Safe to call for readers that were never added or
    /// were already dropped.
    pub fn remove_reader(&self, reader_id: Uuid) {
        self.inner.lock().readers.retain(|r| r.id != reader_id);
    }

    /// Publish one unit on a track. Called only by the publishing side.
    ///
    /// Readers are serviced in registration order. A reader whose queue is
    /// full is dropped and told so; a reader whose drain task has exited is
    /// pruned silently.
    pub fn publish_unit(&self, track_id: usize, unit: Unit) {
        self.bytes_received
            .fetch_add(unit.payload.size(), Ordering::Relaxed);

        let unit = Arc::new(unit);
        let snapshot: Vec<(Uuid, mpsc::Sender<Envelope>, mpsc::Sender<Error>)> = {
            let inner = self.inner.lock();
            inner
                .readers
                .iter()
                .map(|r| (r.id, r.tx.clone(), r.err_tx.clone()))
                .collect()
        };

        let mut dropped = Vec::new();
        for (id, tx, err_tx) in &snapshot {
            match tx.try_send((track_id, Arc::clone(&unit))) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(reader = %id, "reader lagged, dropping it");
                    let _ = err_tx.try_send(Error::ReaderLagged);
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*id);
                }
            }
        }

        if !dropped.is_empty() {
            let mut inner = self.inner.lock();
            inner.readers.retain(|r| !dropped.contains(&r.id));
        }
    }

    /// End the session. All readers receive [`Error::StreamClosed`] and are
    /// removed; subsequent `add_reader` calls fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for reader in inner.readers.drain(..) {
            let _ = reader.err_tx.try_send(Error::StreamClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Payload, TrackFormat};
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn h264_desc() -> MediaDescription {
        MediaDescription::new(vec![TrackFormat::H264 {
            sps: Bytes::from_static(&[0x67]),
            pps: Bytes::from_static(&[0x68]),
        }])
    }

    fn unit(pts: i64) -> Unit {
        Unit::new(pts, Payload::H264(vec![Bytes::from_static(&[0x41, 0x9A])]))
    }

    async fn drain_delay() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order_and_completeness() {
        let stream = Stream::new(h264_desc(), false, false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (reader, _err_rx) = StreamReader::new();
        let seen_cb = Arc::clone(&seen);
        reader.on_track(
            0,
            Box::new(move |u| {
                seen_cb.lock().push(u.pts);
                Ok(())
            }),
        );
        stream.add_reader(&reader).unwrap();

        for pts in [0, 3000, 6000, 9000] {
            stream.publish_unit(0, unit(pts));
        }
        drain_delay().await;

        assert_eq!(*seen.lock(), vec![0, 3000, 6000, 9000]);
    }

    #[tokio::test]
    async fn test_late_reader_sees_only_later_units() {
        let stream = Stream::new(h264_desc(), false, false);
        stream.publish_unit(0, unit(0));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (reader, _err_rx) = StreamReader::new();
        let seen_cb = Arc::clone(&seen);
        reader.on_track(
            0,
            Box::new(move |u| {
                seen_cb.lock().push(u.pts);
                Ok(())
            }),
        );
        stream.add_reader(&reader).unwrap();
        stream.publish_unit(0, unit(3000));
        drain_delay().await;

        assert_eq!(*seen.lock(), vec![3000]);
    }

    #[tokio::test]
    async fn test_bytes_received_is_monotonic() {
        let stream = Stream::new(h264_desc(), false, false);
        assert_eq!(stream.bytes_received(), 0);
        stream.publish_unit(0, unit(0));
        assert_eq!(stream.bytes_received(), 2);
        stream.publish_unit(0, unit(3000));
        assert_eq!(stream.bytes_received(), 4);
    }

    #[tokio::test]
    async fn test_callback_error_surfaces_on_error_channel() {
        let stream = Stream::new(h264_desc(), false, false);
        let (reader, mut err_rx) = StreamReader::new();
        reader.on_track(
            0,
            Box::new(|_| Err(Error::Muxer("disk full".into()))),
        );
        stream.add_reader(&reader).unwrap();
        stream.publish_unit(0, unit(0));

        let err = tokio::time::timeout(Duration::from_secs(1), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Error::Muxer(_)));
    }

    #[tokio::test]
    async fn test_lagged_reader_is_dropped_with_error() {
        let stream = Stream::new(h264_desc(), false, false);

        let (reader, mut err_rx) = StreamReader::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_cb = Arc::clone(&delivered);
        reader.on_track(
            0,
            Box::new(move |_| {
                delivered_cb.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        stream.add_reader(&reader).unwrap();

        // The publisher bursts without yielding, so the drain task never gets
        // scheduled and the queue overflows.
        for pts in 0..(READER_QUEUE_CAPACITY as i64 + 10) {
            stream.publish_unit(0, unit(pts));
        }

        let err = tokio::time::timeout(Duration::from_secs(1), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Error::ReaderLagged));
        assert_eq!(stream.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_reader_is_idempotent() {
        let stream = Stream::new(h264_desc(), false, false);
        let (reader, _err_rx) = StreamReader::new();
        stream.add_reader(&reader).unwrap();

        stream.remove_reader(reader.id());
        stream.remove_reader(reader.id());
        stream.remove_reader(Uuid::new_v4());
        assert_eq!(stream.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_add_reader_after_close_fails() {
        let stream = Stream::new(h264_desc(), false, false);
        let (reader, mut err_rx) = StreamReader::new();
        stream.add_reader(&reader).unwrap();

        stream.close();
        assert!(matches!(err_rx.try_recv(), Ok(Error::StreamClosed)));

        let (late, _) = StreamReader::new();
        assert!(matches!(stream.add_reader(&late), Err(Error::StreamClosed)));
    }
}
