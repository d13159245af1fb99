//! Binary event-log codec for recorded terminal sessions ("termrec").
//!
//! Wire format:
//!
//! ```text
//! ["TERMREC" 0x01]                                  8-byte magic + version
//! [i64 LE start ns][u16 LE cols][u16 LE rows][u32 LE flags]
//! ( [uvarint delta ns][u8 tag][uvarint len][payload] )*   until EOF
//! ```
//!
//! Tags are `O` (output), `I` (input) and `R` (resize, payload = u16 cols,
//! u16 rows, little-endian). Each delta is measured from the previous event,
//! or from the header for the first one.

use std::io::{self, Read, Write};
use std::time::Instant;

use crate::error::{TermrecError, TermrecResult};

/// File magic: seven ASCII bytes plus the format version.
pub const MAGIC: &[u8; 8] = b"TERMREC\x01";

/// Size of magic + fixed header.
pub const HEADER_LEN: usize = 8 + 8 + 2 + 2 + 4;

/// Header flag: input events were captured.
pub const FLAG_CAPTURE_INPUT: u32 = 1;

/// Largest payload the decoder will allocate for a single event.
pub const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

/// Longest valid unsigned varint encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Fixed header that follows the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Recording start, unix nanoseconds.
    pub start_ns: i64,
    pub cols: u16,
    pub rows: u16,
    pub flags: u32,
}

impl Header {
    pub fn new(start_ns: i64, cols: u16, rows: u16, capture_input: bool) -> Self {
        Self {
            start_ns,
            cols,
            rows,
            flags: if capture_input { FLAG_CAPTURE_INPUT } else { 0 },
        }
    }

    pub fn capture_input(&self) -> bool {
        self.flags & FLAG_CAPTURE_INPUT != 0
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(MAGIC);
        out[8..16].copy_from_slice(&self.start_ns.to_le_bytes());
        out[16..18].copy_from_slice(&self.cols.to_le_bytes());
        out[18..20].copy_from_slice(&self.rows.to_le_bytes());
        out[20..24].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    fn decode(raw: &[u8; HEADER_LEN]) -> TermrecResult<Self> {
        if &raw[..8] != MAGIC {
            return Err(TermrecError::CorruptStream("bad magic".into()));
        }
        Ok(Self {
            start_ns: i64::from_le_bytes(le_array(&raw[8..16])),
            cols: u16::from_le_bytes(le_array(&raw[16..18])),
            rows: u16::from_le_bytes(le_array(&raw[18..20])),
            flags: u32::from_le_bytes(le_array(&raw[20..24])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Event type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Output,
    Input,
    Resize,
}

impl EventKind {
    pub fn tag(self) -> u8 {
        match self {
            EventKind::Output => b'O',
            EventKind::Input => b'I',
            EventKind::Resize => b'R',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'O' => Some(EventKind::Output),
            b'I' => Some(EventKind::Input),
            b'R' => Some(EventKind::Resize),
            _ => None,
        }
    }
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Nanoseconds since the previous event (or the header).
    pub delta_ns: u64,
    pub kind: EventKind,
    pub payload: Vec<u8>,
}

impl Event {
    /// Terminal size carried by a resize event.
    pub fn resize_dims(&self) -> Option<(u16, u16)> {
        if self.kind != EventKind::Resize || self.payload.len() != 4 {
            return None;
        }
        Some(decode_resize(&self.payload))
    }
}

/// Encode a resize payload.
pub fn encode_resize(cols: u16, rows: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&cols.to_le_bytes());
    out[2..].copy_from_slice(&rows.to_le_bytes());
    out
}

fn decode_resize(payload: &[u8]) -> (u16, u16) {
    (
        u16::from_le_bytes([payload[0], payload[1]]),
        u16::from_le_bytes([payload[2], payload[3]]),
    )
}

/// Encode an unsigned LEB128 varint into `out`, returning its length.
fn put_uvarint(out: &mut [u8; MAX_VARINT_LEN], mut value: u64) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        out[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    out[i] = value as u8;
    i + 1
}

/// Read an unsigned LEB128 varint.
///
/// Returns `Ok(None)` on a clean EOF before the first byte.
fn read_uvarint<R: Read>(reader: &mut R) -> TermrecResult<Option<u64>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        let n = read_retrying(reader, &mut byte)?;
        if n == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(TermrecError::CorruptStream("truncated varint".into()));
        }
        let b = byte[0];
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return Err(TermrecError::CorruptStream("varint overflows u64".into()));
            }
            return Ok(Some(value | (u64::from(b) << shift)));
        }
        value |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(TermrecError::CorruptStream("varint longer than 10 bytes".into()))
}

fn read_retrying<R: Read>(reader: &mut R, buf: &mut [u8]) -> TermrecResult<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TermrecError::from_io(e)),
        }
    }
}

/// Streaming event-log writer.
pub struct Encoder<W: Write> {
    inner: W,
    last: Instant,
    events: u64,
}

impl<W: Write> Encoder<W> {
    /// Write the magic and header, starting the delta clock.
    pub fn new(mut inner: W, header: &Header) -> TermrecResult<Self> {
        inner
            .write_all(&header.encode())
            .map_err(TermrecError::from_io)?;
        Ok(Self {
            inner,
            last: Instant::now(),
            events: 0,
        })
    }

    pub fn write_output(&mut self, data: &[u8]) -> TermrecResult<()> {
        let delta = self.tick();
        self.write_event(delta, EventKind::Output, data)
    }

    pub fn write_input(&mut self, data: &[u8]) -> TermrecResult<()> {
        let delta = self.tick();
        self.write_event(delta, EventKind::Input, data)
    }

    pub fn write_resize(&mut self, cols: u16, rows: u16) -> TermrecResult<()> {
        let delta = self.tick();
        self.write_event(delta, EventKind::Resize, &encode_resize(cols, rows))
    }

    /// Write one event with an explicit delta.
    pub fn write_event(
        &mut self,
        delta_ns: u64,
        kind: EventKind,
        payload: &[u8],
    ) -> TermrecResult<()> {
        if kind == EventKind::Resize && payload.len() != 4 {
            return Err(TermrecError::InvalidInput(format!(
                "resize payload must be 4 bytes, got {}",
                payload.len()
            )));
        }

        let mut varint = [0u8; MAX_VARINT_LEN];
        let mut head = Vec::with_capacity(2 * MAX_VARINT_LEN + 1);
        let n = put_uvarint(&mut varint, delta_ns);
        head.extend_from_slice(&varint[..n]);
        head.push(kind.tag());
        let n = put_uvarint(&mut varint, payload.len() as u64);
        head.extend_from_slice(&varint[..n]);

        self.inner.write_all(&head).map_err(TermrecError::from_io)?;
        self.inner.write_all(payload).map_err(TermrecError::from_io)?;
        self.events += 1;
        Ok(())
    }

    /// Nanoseconds since the previous call, advancing the clock.
    fn tick(&mut self) -> u64 {
        let now = Instant::now();
        let delta = now.duration_since(self.last);
        self.last = now;
        u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Number of events written so far.
    pub fn events_written(&self) -> u64 {
        self.events
    }

    pub fn flush(&mut self) -> TermrecResult<()> {
        self.inner.flush().map_err(TermrecError::from_io)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Streaming event-log reader.
pub struct Decoder<R: Read> {
    inner: R,
    header_read: bool,
}

impl<R: Read> Decoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header_read: false,
        }
    }

    /// Read and validate the magic and fixed header.
    pub fn read_header(&mut self) -> TermrecResult<Header> {
        let mut raw = [0u8; HEADER_LEN];
        self.inner
            .read_exact(&mut raw)
            .map_err(TermrecError::from_io)?;
        let header = Header::decode(&raw)?;
        self.header_read = true;
        Ok(header)
    }

    /// Read the next event, reusing `buf`'s allocation for its payload.
    ///
    /// Returns `Ok(None)` at a clean end of stream.
    pub fn read_event(&mut self, mut buf: Vec<u8>) -> TermrecResult<Option<Event>> {
        if !self.header_read {
            self.read_header()?;
        }

        let Some(delta_ns) = read_uvarint(&mut self.inner)? else {
            return Ok(None);
        };

        let mut tag = [0u8; 1];
        self.inner
            .read_exact(&mut tag)
            .map_err(TermrecError::from_io)?;
        let kind = EventKind::from_tag(tag[0]).ok_or_else(|| {
            TermrecError::CorruptStream(format!("unknown event tag 0x{:02x}", tag[0]))
        })?;

        let len = read_uvarint(&mut self.inner)?
            .ok_or_else(|| TermrecError::CorruptStream("missing payload length".into()))?;
        if len > MAX_PAYLOAD_LEN {
            return Err(TermrecError::CorruptStream(format!(
                "payload length {len} exceeds limit"
            )));
        }
        if kind == EventKind::Resize && len != 4 {
            return Err(TermrecError::CorruptStream(format!(
                "resize payload must be 4 bytes, got {len}"
            )));
        }

        buf.clear();
        buf.resize(len as usize, 0);
        self.inner
            .read_exact(&mut buf)
            .map_err(TermrecError::from_io)?;

        Ok(Some(Event {
            delta_ns,
            kind,
            payload: buf,
        }))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_all(header: &Header, events: &[Event]) -> Vec<u8> {
        let mut enc = Encoder::new(Vec::new(), header).unwrap();
        for e in events {
            enc.write_event(e.delta_ns, e.kind, &e.payload).unwrap();
        }
        enc.into_inner()
    }

    fn decode_all(bytes: &[u8]) -> (Header, Vec<Event>) {
        let mut dec = Decoder::new(Cursor::new(bytes));
        let header = dec.read_header().unwrap();
        let mut events = Vec::new();
        while let Some(e) = dec.read_event(Vec::new()).unwrap() {
            events.push(e);
        }
        (header, events)
    }

    #[test]
    fn header_layout() {
        let header = Header::new(1_700_000_000_000_000_000, 80, 24, true);
        let bytes = encode_all(&header, &[]);
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..8], b"TERMREC\x01");
        assert_eq!(&bytes[16..18], &80u16.to_le_bytes());
        assert_eq!(&bytes[18..20], &24u16.to_le_bytes());
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());
    }

    #[test]
    fn round_trip_mixed_events() {
        let header = Header::new(42, 120, 40, false);
        let events = vec![
            Event {
                delta_ns: 0,
                kind: EventKind::Output,
                payload: b"$ ".to_vec(),
            },
            Event {
                delta_ns: 150_000_000,
                kind: EventKind::Input,
                payload: b"l".to_vec(),
            },
            Event {
                delta_ns: 1,
                kind: EventKind::Output,
                payload: Vec::new(),
            },
            Event {
                delta_ns: u64::MAX,
                kind: EventKind::Resize,
                payload: encode_resize(100, 30).to_vec(),
            },
            Event {
                delta_ns: 300,
                kind: EventKind::Output,
                payload: vec![0xAB; 64 * 1024],
            },
        ];
        let (decoded_header, decoded) = decode_all(&encode_all(&header, &events));
        assert_eq!(decoded_header, header);
        assert_eq!(decoded, events);
        assert_eq!(decoded[3].resize_dims(), Some((100, 30)));
    }

    #[test]
    fn wall_clock_deltas_are_monotonic() {
        let mut enc = Encoder::new(Vec::new(), &Header::new(0, 80, 24, false)).unwrap();
        enc.write_output(b"a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        enc.write_output(b"b").unwrap();
        assert_eq!(enc.events_written(), 2);

        let (_, events) = decode_all(&enc.into_inner());
        assert!(events[1].delta_ns >= 5_000_000);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut bytes = encode_all(&Header::new(0, 80, 24, false), &[]);
        bytes[0] = b'X';
        let err = Decoder::new(Cursor::new(bytes)).read_header().unwrap_err();
        assert!(matches!(err, TermrecError::CorruptStream(_)));
    }

    #[test]
    fn oversized_varint_is_corrupt() {
        let mut bytes = encode_all(&Header::new(0, 80, 24, false), &[]);
        bytes.extend_from_slice(&[0xFF; 11]);
        let mut dec = Decoder::new(Cursor::new(bytes));
        dec.read_header().unwrap();
        assert!(matches!(
            dec.read_event(Vec::new()),
            Err(TermrecError::CorruptStream(_))
        ));
    }

    #[test]
    fn tenth_byte_overflow_is_corrupt() {
        let mut bytes = encode_all(&Header::new(0, 80, 24, false), &[]);
        bytes.extend_from_slice(&[0xFF; 9]);
        bytes.push(0x02);
        let mut dec = Decoder::new(Cursor::new(bytes));
        assert!(matches!(
            dec.read_event(Vec::new()),
            Err(TermrecError::CorruptStream(_))
        ));
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let events = [Event {
            delta_ns: 5,
            kind: EventKind::Output,
            payload: b"hello".to_vec(),
        }];
        let mut bytes = encode_all(&Header::new(0, 80, 24, false), &events);
        bytes.truncate(bytes.len() - 2);
        let mut dec = Decoder::new(Cursor::new(bytes));
        dec.read_header().unwrap();
        assert!(matches!(
            dec.read_event(Vec::new()),
            Err(TermrecError::CorruptStream(_))
        ));
    }

    #[test]
    fn truncated_header_is_corrupt() {
        let bytes = encode_all(&Header::new(0, 80, 24, false), &[]);
        let err = Decoder::new(Cursor::new(&bytes[..10])).read_header().unwrap_err();
        assert!(matches!(err, TermrecError::CorruptStream(_)));
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let mut bytes = encode_all(&Header::new(0, 80, 24, false), &[]);
        bytes.extend_from_slice(&[0x00, b'Z', 0x00]);
        let mut dec = Decoder::new(Cursor::new(bytes));
        assert!(matches!(
            dec.read_event(Vec::new()),
            Err(TermrecError::CorruptStream(_))
        ));
    }

    #[test]
    fn resize_payload_must_be_four_bytes() {
        let mut enc = Encoder::new(Vec::new(), &Header::new(0, 80, 24, false)).unwrap();
        assert!(enc.write_event(0, EventKind::Resize, b"abc").is_err());
    }

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 127, 128, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            let mut buf = [0u8; MAX_VARINT_LEN];
            let n = put_uvarint(&mut buf, value);
            let decoded = read_uvarint(&mut Cursor::new(&buf[..n])).unwrap();
            assert_eq!(decoded, Some(value));
        }
    }
}
