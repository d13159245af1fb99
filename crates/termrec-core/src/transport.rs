//! Chunked AES-256-GCM transport for event-log streams.
//!
//! Wire format, repeated until EOF:
//!
//! ```text
//! [4-byte BE ciphertext length][12-byte nonce][ciphertext || 16-byte tag]
//! ```
//!
//! Each chunk holds at most 64 KiB of plaintext. Nonces are a 4-byte random
//! prefix drawn once per stream followed by a big-endian 8-byte chunk counter.

use std::io::{self, Read, Write};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{TermrecError, TermrecResult};

/// Maximum plaintext bytes sealed into a single chunk.
pub const MAX_CHUNK_PLAINTEXT: usize = 64 * 1024;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

const NONCE_PREFIX_LEN: usize = 4;
const LEN_PREFIX: usize = 4;

fn stream_key(key: &[u8; 32]) -> TermrecResult<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| TermrecError::Crypto("invalid AES-256 key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn poisoned() -> io::Error {
    TermrecError::Crypto("chunk stream failed earlier".into()).into_io()
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// `Write` adapter that seals everything written to it.
///
/// Call [`ChunkWriter::finish`] to seal the final partial chunk; dropping the
/// writer without it loses whatever has not been flushed. A failed write to
/// the inner sink poisons the writer, since its nonce is already spent.
pub struct ChunkWriter<W: Write> {
    inner: W,
    key: LessSafeKey,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u64,
    pending: Vec<u8>,
    failed: bool,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(inner: W, key: &[u8; 32]) -> TermrecResult<Self> {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        SystemRandom::new()
            .fill(&mut prefix)
            .map_err(|_| TermrecError::Crypto("RNG failure".into()))?;
        Ok(Self {
            inner,
            key: stream_key(key)?,
            prefix,
            counter: 0,
            pending: Vec::with_capacity(MAX_CHUNK_PLAINTEXT),
            failed: false,
        })
    }

    /// Number of chunks sealed so far.
    pub fn chunks_written(&self) -> u64 {
        self.counter
    }

    fn seal_pending(&mut self) -> io::Result<()> {
        if self.failed {
            return Err(poisoned());
        }
        if self.pending.is_empty() {
            return Ok(());
        }

        let nonce = chunk_nonce(&self.prefix, self.counter);
        // Nonce-counter exhaustion is not rekeyed; refuse rather than reuse a nonce.
        let next = self.counter.checked_add(1).ok_or_else(|| {
            TermrecError::Crypto("chunk nonce counter exhausted".into()).into_io()
        })?;
        // The nonce is spent once sealing starts, whether or not the frame lands.
        self.counter = next;

        let mut sealed = std::mem::take(&mut self.pending);
        if self
            .key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut sealed,
            )
            .is_err()
        {
            self.failed = true;
            return Err(TermrecError::Crypto("chunk seal failed".into()).into_io());
        }

        let mut frame = Vec::with_capacity(LEN_PREFIX + NONCE_LEN + sealed.len());
        frame.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);
        if let Err(e) = self.inner.write_all(&frame) {
            // Part of the frame may be on disk; nothing after it can be framed.
            self.failed = true;
            return Err(e);
        }

        self.pending = sealed;
        self.pending.clear();
        Ok(())
    }

    /// Seal any pending plaintext, flush, and return the inner sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.seal_pending()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failed {
            return Err(poisoned());
        }
        let room = MAX_CHUNK_PLAINTEXT - self.pending.len();
        let n = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() == MAX_CHUNK_PLAINTEXT {
            self.seal_pending()?;
        }
        Ok(n)
    }

    /// Seals pending plaintext as a (possibly short) chunk before flushing.
    fn flush(&mut self) -> io::Result<()> {
        self.seal_pending()?;
        self.inner.flush()
    }
}

/// `Read` adapter that authenticates and decrypts one chunk at a time.
///
/// The first authentication failure poisons the reader: every later read
/// fails too, since nothing after a forged chunk can be trusted.
pub struct ChunkReader<R: Read> {
    inner: R,
    key: LessSafeKey,
    prefix: Option<[u8; NONCE_PREFIX_LEN]>,
    counter: u64,
    plain: Vec<u8>,
    pos: usize,
    failed: bool,
    eof: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, key: &[u8; 32]) -> TermrecResult<Self> {
        Ok(Self {
            inner,
            key: stream_key(key)?,
            prefix: None,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            failed: false,
            eof: false,
        })
    }

    /// Read the next chunk into `plain`. Returns `false` at a clean EOF.
    fn next_chunk(&mut self) -> TermrecResult<bool> {
        let mut len_buf = [0u8; LEN_PREFIX];
        if !read_full_or_eof(&mut self.inner, &mut len_buf)? {
            return Ok(false);
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if !(TAG_LEN..=MAX_CHUNK_PLAINTEXT + TAG_LEN).contains(&len) {
            return Err(TermrecError::CorruptStream(format!(
                "chunk {} has invalid length {len}",
                self.counter
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        self.inner
            .read_exact(&mut nonce)
            .map_err(TermrecError::from_io)?;
        let mut sealed = vec![0u8; len];
        self.inner
            .read_exact(&mut sealed)
            .map_err(TermrecError::from_io)?;

        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&nonce[..NONCE_PREFIX_LEN]);
        let expected_prefix = *self.prefix.get_or_insert(prefix);
        if nonce != chunk_nonce(&expected_prefix, self.counter) {
            return Err(TermrecError::Crypto(format!(
                "chunk {} is out of sequence",
                self.counter
            )));
        }

        let plain_len = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
            .map_err(|_| {
                TermrecError::Crypto(format!("chunk {} failed authentication", self.counter))
            })?
            .len();
        sealed.truncate(plain_len);

        self.plain = sealed;
        self.pos = 0;
        self.counter += 1;
        Ok(true)
    }
}

impl<R: Read> Read for ChunkReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            let err = TermrecError::Crypto("stream failed authentication".into());
            return Err(err.into_io());
        }
        while self.pos == self.plain.len() {
            if self.eof {
                return Ok(0);
            }
            match self.next_chunk() {
                Ok(true) => {}
                Ok(false) => {
                    self.eof = true;
                    return Ok(0);
                }
                Err(e) => {
                    self.failed = true;
                    self.plain.clear();
                    self.pos = 0;
                    return Err(e.into_io());
                }
            }
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Fill `buf` completely, or return `false` if the reader is already at EOF.
/// EOF partway through is a short read.
fn read_full_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> TermrecResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(TermrecError::CorruptStream(
                    "truncated chunk length".into(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TermrecError::from_io(e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const KEY: [u8; 32] = [7u8; 32];

    fn seal(data: &[u8]) -> Vec<u8> {
        let mut writer = ChunkWriter::new(Vec::new(), &KEY).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn open(sealed: &[u8], key: &[u8; 32]) -> io::Result<Vec<u8>> {
        let mut reader = ChunkReader::new(Cursor::new(sealed), key).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn round_trip_spanning_chunks() {
        let data = sample(3 * MAX_CHUNK_PLAINTEXT + 1234);
        let sealed = seal(&data);
        assert_eq!(sealed.len(), data.len() + 4 * (LEN_PREFIX + NONCE_LEN + TAG_LEN));
        assert_eq!(open(&sealed, &KEY).unwrap(), data);
    }

    #[test]
    fn empty_stream_has_no_chunks() {
        let sealed = seal(&[]);
        assert!(sealed.is_empty());
        assert!(open(&sealed, &KEY).unwrap().is_empty());
    }

    #[test]
    fn flush_emits_short_chunk() {
        let mut writer = ChunkWriter::new(Vec::new(), &KEY).unwrap();
        writer.write_all(b"first").unwrap();
        writer.flush().unwrap();
        writer.write_all(b"second").unwrap();
        assert_eq!(writer.chunks_written(), 1);
        let sealed = writer.finish().unwrap();
        assert_eq!(open(&sealed, &KEY).unwrap(), b"firstsecond");
    }

    #[test]
    fn flipped_byte_in_any_chunk_fails() {
        let data = sample(2 * MAX_CHUNK_PLAINTEXT + 10);
        let sealed = seal(&data);
        let frame = LEN_PREFIX + NONCE_LEN + MAX_CHUNK_PLAINTEXT + TAG_LEN;
        for chunk in 0..3 {
            let mut tampered = sealed.clone();
            tampered[chunk * frame + LEN_PREFIX + NONCE_LEN + 3] ^= 0x01;

            let mut reader = ChunkReader::new(Cursor::new(&tampered), &KEY).unwrap();
            let mut out = Vec::new();
            let err = reader.read_to_end(&mut out).unwrap_err();
            assert!(matches!(TermrecError::from_io(err), TermrecError::Crypto(_)));
            // Only chunks before the tampered one were released.
            assert_eq!(out.len(), chunk * MAX_CHUNK_PLAINTEXT);
            // The reader stays poisoned.
            assert!(reader.read(&mut [0u8; 8]).is_err());
        }
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(b"secret terminal output");
        let err = open(&sealed, &[8u8; 32]).unwrap_err();
        assert!(matches!(TermrecError::from_io(err), TermrecError::Crypto(_)));
    }

    #[test]
    fn reordered_chunks_fail() {
        let data = sample(2 * MAX_CHUNK_PLAINTEXT);
        let sealed = seal(&data);
        let frame = sealed.len() / 2;
        let mut swapped = sealed[frame..].to_vec();
        swapped.extend_from_slice(&sealed[..frame]);
        let err = open(&swapped, &KEY).unwrap_err();
        assert!(matches!(TermrecError::from_io(err), TermrecError::Crypto(_)));
    }

    #[test]
    fn truncated_chunk_is_corrupt() {
        let sealed = seal(b"some bytes");
        let err = open(&sealed[..sealed.len() - 1], &KEY).unwrap_err();
        assert!(matches!(
            TermrecError::from_io(err),
            TermrecError::CorruptStream(_)
        ));
    }

    /// Accepts `room` bytes, then fails every write.
    struct ShortSink {
        data: Vec<u8>,
        room: usize,
    }

    impl Write for ShortSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.room);
            self.data.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_frame_poisons_writer() {
        let sink = ShortSink {
            data: Vec::new(),
            room: 24,
        };
        let mut writer = ChunkWriter::new(sink, &KEY).unwrap();
        writer.write_all(b"first chunk").unwrap();
        assert!(writer.flush().is_err());
        assert_eq!(writer.chunks_written(), 1);

        // No second frame may reuse the nonce already on disk.
        writer.inner.room = usize::MAX;
        assert!(writer.write_all(b"second chunk").is_err());
        assert!(writer.flush().is_err());
        assert_eq!(writer.inner.data.len(), 24);
        assert_eq!(writer.chunks_written(), 1);
    }

    #[test]
    fn nonces_share_prefix_and_count_up() {
        let sealed = seal(&sample(MAX_CHUNK_PLAINTEXT + 1));
        let frame = LEN_PREFIX + NONCE_LEN + MAX_CHUNK_PLAINTEXT + TAG_LEN;
        let first = &sealed[LEN_PREFIX..LEN_PREFIX + NONCE_LEN];
        let second = &sealed[frame + LEN_PREFIX..frame + LEN_PREFIX + NONCE_LEN];
        assert_eq!(first[..4], second[..4]);
        assert_eq!(first[4..], 0u64.to_be_bytes());
        assert_eq!(second[4..], 1u64.to_be_bytes());
    }
}
