//! Path registry and in-memory media fan-out.
//!
//! A [`Path`](path::Path) is a named endpoint with at most one publisher; its
//! current publisher session is a [`Stream`](stream::Stream) that fans typed
//! media units out to any number of readers. The [`PathManager`] is the
//! authoritative registry and the source of ready / not-ready lifecycle
//! events.

pub mod auth;
pub mod events;
pub mod manager;
pub mod path;
pub mod stream;
pub mod unit;

pub use auth::{AccessRequest, AllowAll, Authenticator, Protocol};
pub use events::{PathEvent, PathEventHub};
pub use manager::{PathInfo, PathManager};
pub use path::{Path, PublisherHandle};
pub use stream::{Stream, StreamReader};
pub use unit::{MediaDescription, Payload, Track, TrackFormat, Unit};
