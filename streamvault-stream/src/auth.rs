//! Authentication seam between protocol servers and the path registry.
//!
//! The actual credential backends live outside this crate; the registry only
//! needs a yes/no answer per access request.

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;

use streamvault_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Rtsp,
    Rtmp,
    WebRtc,
    Api,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtsp => write!(f, "rtsp"),
            Self::Rtmp => write!(f, "rtmp"),
            Self::WebRtc => write!(f, "webrtc"),
            Self::Api => write!(f, "api"),
        }
    }
}

/// An access request from a protocol server or the control API.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub path_name: String,
    pub protocol: Protocol,
    pub client_ip: Option<IpAddr>,
    pub user: String,
    pub pass: String,
    /// Whether the caller wants to publish (true) or read (false).
    pub publish: bool,
}

impl AccessRequest {
    #[must_use]
    pub fn publisher(path_name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            path_name: path_name.into(),
            protocol,
            client_ip: None,
            user: String::new(),
            pass: String::new(),
            publish: true,
        }
    }

    #[must_use]
    pub fn reader(path_name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            publish: false,
            ..Self::publisher(path_name, protocol)
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AccessRequest) -> Result<()>;
}

/// Permissive authenticator used when no auth backend is configured.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _request: &AccessRequest) -> Result<()> {
        Ok(())
    }
}

/// Authenticator that rejects everything; handy in tests.
pub struct DenyAll;

#[async_trait]
impl Authenticator for DenyAll {
    async fn authenticate(&self, _request: &AccessRequest) -> Result<()> {
        Err(Error::AuthDenied)
    }
}
