//! Identifier and value types shared across the SFU controller.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Create a new random identifier (UUIDv4).
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a peer admitted to the SFU.
    PeerId
);

string_id!(
    /// Unique identifier for a media track.
    TrackId
);

string_id!(
    /// Groups the tracks one peer publishes.
    StreamId
);

/// Secret correlator issued before a join.
///
/// Debug output is redacted so keys never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdmissionKey(String);

impl AdmissionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Raw key text. Only the key manager and the codec should need this.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AdmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdmissionKey([REDACTED])")
    }
}

impl From<String> for AdmissionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AdmissionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    Audio,
    Video,
}

impl Medium {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Medium::Audio => "audio",
            Medium::Video => "video",
        }
    }
}

/// Codec name reported by the owning endpoint (`OPUS`, `H264`, `VP8`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoding(String);

impl Encoding {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Encoding {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Capabilities a peer declares when joining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Peer publishes an audio track.
    pub relay_audio: bool,
    /// Peer publishes a video track.
    pub relay_video: bool,
    /// Peer receives every other peer's tracks.
    pub receive_media: bool,
}

impl Capabilities {
    /// Media kinds this peer will publish, audio first.
    #[must_use]
    pub fn published_media(&self) -> Vec<Medium> {
        let mut media = Vec::with_capacity(2);
        if self.relay_audio {
            media.push(Medium::Audio);
        }
        if self.relay_video {
            media.push(Medium::Video);
        }
        media
    }
}

/// Voice activity reported by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceActivity {
    Speech,
    Silence,
}
