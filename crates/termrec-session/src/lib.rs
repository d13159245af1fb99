//! termrec-session: recording lifecycle, metadata, key management and
//! timed replay on top of `termrec-core`.
//!
//! The [`Recorder`] is synchronous and meant to be called from whatever
//! pumps terminal bytes. The [`ReplayManager`] runs each replay as a tokio
//! task. [`Service`] ties both to a JSON command/event surface.

pub mod config;
pub mod keyring;
pub mod recorder;
pub mod registry;
pub mod replay;
pub mod service;
pub mod store;

pub use config::{Config, ReplaySettings};
pub use keyring::{IdentityInfo, KeySource, Keyring};
pub use recorder::{Recorder, RecorderNotice, StartOptions, StartOutcome, StartWarning};
pub use registry::Registry;
pub use replay::{
    inspect_recording, EndReason, RecordingSummary, ReplayCommand, ReplayEvent, ReplayManager,
    ReplayState, ReplayUpdate,
};
pub use service::{Service, UiCommand, UiEvent};
pub use store::{
    JsonStore, MetadataStore, RecipientKey, Recording, RecordingFormat, RecordingKey, UserKey,
};
