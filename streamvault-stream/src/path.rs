//! A named media endpoint with at most one publisher.
//!
//! State machine:
//!
//! ```text
//! idle --add_publisher--> publishing --set_ready--> publishing(ready)
//!  ^                          |                           |
//!  |                          | publisher_gone            | set_not_ready / publisher_gone
//!  +--------------------------+---------------------------+
//! ```
//!
//! `terminating` is entered on path removal and is terminal.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use streamvault_core::{Error, PathConf, Result};

use crate::events::{PathEvent, PathEventHub};
use crate::stream::Stream;
use crate::unit::MediaDescription;

enum State {
    Idle,
    Publishing {
        publisher_id: Uuid,
        stream: Option<Arc<Stream>>,
    },
    Terminating,
}

pub struct Path {
    name: String,
    conf: RwLock<Arc<PathConf>>,
    events: Arc<PathEventHub>,
    state: Mutex<State>,
    /// Bumped by `restart_video_snapshot`; the snapshot service watches it.
    snapshot_generation: AtomicU64,
}

impl Path {
    #[must_use]
    pub fn new(name: String, conf: Arc<PathConf>, events: Arc<PathEventHub>) -> Arc<Self> {
        Arc::new(Self {
            name,
            conf: RwLock::new(conf),
            events,
            state: Mutex::new(State::Idle),
            snapshot_generation: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn safe_conf(&self) -> Arc<PathConf> {
        Arc::clone(&self.conf.read())
    }

    pub fn set_conf(&self, conf: Arc<PathConf>) {
        *self.conf.write() = conf;
    }

    /// Whether a publisher has set the stream ready.
    #[must_use]
    pub fn ready(&self) -> bool {
        matches!(
            &*self.state.lock(),
            State::Publishing { stream: Some(_), .. }
        )
    }

    /// The current session stream, if ready.
    #[must_use]
    pub fn stream(&self) -> Option<Arc<Stream>> {
        match &*self.state.lock() {
            State::Publishing { stream, .. } => stream.clone(),
            _ => None,
        }
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.stream().map_or(0, |s| s.bytes_received())
    }

    /// Bind a publisher. At most one can be bound at any instant; a second
    /// attempt fails without replacing the first.
    pub fn add_publisher(self: &Arc<Self>) -> Result<PublisherHandle> {
        let mut state = self.state.lock();
        match &*state {
            State::Idle => {
                let publisher_id = Uuid::new_v4();
                *state = State::Publishing {
                    publisher_id,
                    stream: None,
                };
                info!(path = %self.name, "publisher bound");
                Ok(PublisherHandle {
                    path: Arc::clone(self),
                    id: publisher_id,
                })
            }
            State::Publishing { .. } => Err(Error::PublisherAlreadyBound(self.name.clone())),
            State::Terminating => Err(Error::PathTerminating(self.name.clone())),
        }
    }

    /// Route a reader to the current stream.
    pub fn add_reader(self: &Arc<Self>) -> Result<(Arc<Self>, Arc<Stream>)> {
        match self.stream() {
            Some(stream) => Ok((Arc::clone(self), stream)),
            None => Err(Error::PathNotReady(self.name.clone())),
        }
    }

    /// Remove a reader from the current stream, if any. Never fails.
    pub fn remove_reader(&self, reader_id: Uuid) {
        if let Some(stream) = self.stream() {
            stream.remove_reader(reader_id);
        }
    }

    /// Ask the snapshot service to restart the per-path video snapshot loop.
    pub fn restart_video_snapshot(&self) -> Result<()> {
        if self.safe_conf().snapshot_interval == 0 {
            return Err(Error::PathNotConfigured(self.name.clone()));
        }
        self.snapshot_generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[must_use]
    pub fn snapshot_generation(&self) -> u64 {
        self.snapshot_generation.load(Ordering::SeqCst)
    }

    /// Enter the terminal state, tearing down any session.
    pub fn terminate(&self) {
        let was_ready = {
            let mut state = self.state.lock();
            let was_ready = matches!(&*state, State::Publishing { stream: Some(_), .. });
            if let State::Publishing {
                stream: Some(stream),
                ..
            } = &*state
            {
                stream.close();
            }
            *state = State::Terminating;
            was_ready
        };
        if was_ready {
            self.events.dispatch(PathEvent::NotReady(self.name.clone()));
        }
        debug!(path = %self.name, "path terminated");
    }
}

/// Capability handed to the publishing side of a path.
pub struct PublisherHandle {
    path: Arc<Path>,
    id: Uuid,
}

impl PublisherHandle {
    #[must_use]
    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    /// Create the session stream and mark the path ready.
    ///
    /// Calling this twice without an intervening `set_not_ready` is illegal.
    pub fn set_ready(
        &self,
        desc: MediaDescription,
        generate_rtp_packets: bool,
        fill_ntp: bool,
    ) -> Result<Arc<Stream>> {
        let stream = {
            let mut state = self.path.state.lock();
            match &mut *state {
                State::Publishing {
                    publisher_id,
                    stream,
                } if *publisher_id == self.id => {
                    if stream.is_some() {
                        return Err(Error::PathTerminating(self.path.name.clone()));
                    }
                    let s = Stream::new(desc, generate_rtp_packets, fill_ntp);
                    *stream = Some(Arc::clone(&s));
                    s
                }
                _ => return Err(Error::PathTerminating(self.path.name.clone())),
            }
        };
        info!(path = %self.path.name, "stream ready");
        self.path
            .events
            .dispatch(PathEvent::Ready(self.path.name.clone()));
        Ok(stream)
    }

    /// Tear down the session stream, keeping the publisher bound. Never
    /// fails; calling it while not ready is a no-op.
    pub fn set_not_ready(&self) {
        let was_ready = {
            let mut state = self.path.state.lock();
            match &mut *state {
                State::Publishing {
                    publisher_id,
                    stream,
                } if *publisher_id == self.id => match stream.take() {
                    Some(s) => {
                        s.close();
                        true
                    }
                    None => false,
                },
                _ => false,
            }
        };
        if was_ready {
            info!(path = %self.path.name, "stream not ready");
            self.path
                .events
                .dispatch(PathEvent::NotReady(self.path.name.clone()));
        }
    }

    /// The publisher disconnected; the path returns to idle.
    pub fn close(&self) {
        self.set_not_ready();
        let mut state = self.path.state.lock();
        let ours = matches!(
            &*state,
            State::Publishing { publisher_id, .. } if *publisher_id == self.id
        );
        if ours {
            *state = State::Idle;
            info!(path = %self.path.name, "publisher gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::TrackFormat;
    use bytes::Bytes;

    fn make_path() -> Arc<Path> {
        Path::new(
            "cam1".to_string(),
            Arc::new(PathConf {
                name: "cam1".to_string(),
                ..PathConf::default()
            }),
            Arc::new(PathEventHub::new()),
        )
    }

    fn desc() -> MediaDescription {
        MediaDescription::new(vec![TrackFormat::H264 {
            sps: Bytes::from_static(&[0x67]),
            pps: Bytes::from_static(&[0x68]),
        }])
    }

    #[tokio::test]
    async fn test_single_publisher_invariant() {
        let path = make_path();
        let first = path.add_publisher().unwrap();
        assert!(matches!(
            path.add_publisher(),
            Err(Error::PublisherAlreadyBound(_))
        ));

        // After the first goes away, a new one may bind.
        first.close();
        assert!(path.add_publisher().is_ok());
    }

    #[tokio::test]
    async fn test_ready_lifecycle() {
        let path = make_path();
        assert!(!path.ready());

        let publisher = path.add_publisher().unwrap();
        assert!(!path.ready());
        assert!(matches!(path.add_reader(), Err(Error::PathNotReady(_))));

        publisher.set_ready(desc(), false, false).unwrap();
        assert!(path.ready());
        let (_, stream) = path.add_reader().unwrap();
        assert_eq!(stream.describe().tracks.len(), 1);

        publisher.set_not_ready();
        assert!(!path.ready());
        assert!(path.stream().is_none());
    }

    #[tokio::test]
    async fn test_set_ready_twice_is_illegal() {
        let path = make_path();
        let publisher = path.add_publisher().unwrap();
        publisher.set_ready(desc(), false, false).unwrap();
        assert!(matches!(
            publisher.set_ready(desc(), false, false),
            Err(Error::PathTerminating(_))
        ));
    }

    #[tokio::test]
    async fn test_not_ready_closes_the_stream() {
        let path = make_path();
        let publisher = path.add_publisher().unwrap();
        let stream = publisher.set_ready(desc(), false, false).unwrap();

        publisher.set_not_ready();
        let (reader, _err) = crate::stream::StreamReader::new();
        assert!(matches!(
            stream.add_reader(&reader),
            Err(Error::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_terminated_path_rejects_publishers() {
        let path = make_path();
        path.terminate();
        assert!(matches!(
            path.add_publisher(),
            Err(Error::PathTerminating(_))
        ));
    }

    #[tokio::test]
    async fn test_not_ready_event_dispatched_once() {
        let events = Arc::new(PathEventHub::new());
        let mut rx = events.subscribe();
        let path = Path::new(
            "cam1".to_string(),
            Arc::new(PathConf::default()),
            Arc::clone(&events),
        );

        let publisher = path.add_publisher().unwrap();
        publisher.set_ready(desc(), false, false).unwrap();
        assert_eq!(rx.recv().await, Some(PathEvent::Ready("cam1".into())));

        // close() implies set_not_ready; only one NotReady must be seen.
        publisher.close();
        assert_eq!(rx.recv().await, Some(PathEvent::NotReady("cam1".into())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_restart_video_snapshot_requires_configuration() {
        let path = make_path();
        assert!(matches!(
            path.restart_video_snapshot(),
            Err(Error::PathNotConfigured(_))
        ));

        path.set_conf(Arc::new(PathConf {
            snapshot_interval: 10,
            ..PathConf::default()
        }));
        path.restart_video_snapshot().unwrap();
        assert_eq!(path.snapshot_generation(), 1);
    }
}
