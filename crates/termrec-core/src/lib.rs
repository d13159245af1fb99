//! termrec-core: storage-level building blocks for terminal session recording.
//!
//! Provides the termrec event log codec, the chunked AES-256-GCM stream
//! transport, passphrase and RSA key wrapping, public-key fingerprints, and
//! the shared error type. Everything here is synchronous `std::io`.

pub mod b64;
pub mod codec;
pub mod error;
pub mod identity;
pub mod keys;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{Decoder, Encoder, Event, EventKind, Header, HEADER_LEN, MAGIC};
pub use error::{TermrecError, TermrecResult};
pub use identity::{fingerprint, public_key_fingerprint, resolve_prefix, short_fingerprint};
pub use keys::{KdfParams, Passphrase, SecretKey, WrappedKey};
pub use transport::{ChunkReader, ChunkWriter, MAX_CHUNK_PLAINTEXT};
