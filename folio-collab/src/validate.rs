//! Structural checks for untrusted yrs v1 payloads.
//!
//! yrs decodes strings without re-validating UTF-8 and pre-allocates from
//! length prefixes, so a corrupted or hostile delta can abort the process
//! before any error is returned. Every byte sequence received from a peer
//! is walked here first, in the same order yrs reads it:
//!
//! ```text
//! update      = var(clients) { var(blocks) var(client) var(clock) block* }  delete_set
//! block       = 0 var(len)                      (gc)
//!             | 10 var(len)                     (skip)
//!             | info [id] [id] [parent] [sub] content
//! delete_set  = var(clients) { var(client) var(ranges) { var(clock) var(len) } }
//! ```
//!
//! Anything this walk accepts is safe to hand to `Update::decode_v1` /
//! `StateVector::decode_v1`; anything it does not recognise is rejected.

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;

const TYPE_XML_ELEMENT: u8 = 3;
/// Type refs yrs decodes without a payload (array, map, text, fragment,
/// hook, xml text, subdoc, undefined).
const PLAIN_TYPE_REFS: &[u8] = &[0, 1, 2, 4, 5, 6, 9, 15];

/// Nesting limit for `Any` values (maps and arrays).
const MAX_ANY_DEPTH: usize = 32;

/// Why a payload was rejected, with the byte offset where the walk stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invalid {
    pub offset: usize,
    pub reason: &'static str,
}

impl std::fmt::Display for Invalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at byte {}", self.reason, self.offset)
    }
}

type Check<T> = Result<T, Invalid>;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn fail<T>(&self, reason: &'static str) -> Check<T> {
        Err(Invalid {
            offset: self.pos,
            reason,
        })
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Check<u8> {
        match self.buf.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => self.fail("unexpected end of payload"),
        }
    }

    fn skip(&mut self, len: usize) -> Check<&'a [u8]> {
        if len > self.remaining() {
            return self.fail("length prefix past end of payload");
        }
        let buf: &'a [u8] = self.buf;
        let slice = &buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Unsigned LEB128, at most ten bytes.
    fn var_u64(&mut self) -> Check<u64> {
        let mut value = 0u64;
        for shift in (0..70).step_by(7) {
            let b = self.u8()?;
            let bits = u64::from(b & 0x7f);
            if shift == 63 && bits > 1 {
                return self.fail("varint overflows 64 bits");
            }
            value |= bits << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        self.fail("varint longer than ten bytes")
    }

    fn var_u32(&mut self) -> Check<u32> {
        let value = self.var_u64()?;
        match u32::try_from(value) {
            Ok(v) => Ok(v),
            Err(_) => self.fail("varint overflows 32 bits"),
        }
    }

    /// A count of items that each take at least `min_item_len` bytes.
    fn count(&mut self, min_item_len: usize) -> Check<usize> {
        let n = self.var_u64()?;
        if n > (self.remaining() / min_item_len.max(1)) as u64 {
            return self.fail("count larger than the payload can hold");
        }
        Ok(n as usize)
    }

    /// Signed lib0 varint: the continuation rule is the same as unsigned.
    fn var_signed(&mut self) -> Check<()> {
        for _ in 0..10 {
            if self.u8()? & 0x80 == 0 {
                return Ok(());
            }
        }
        self.fail("varint longer than ten bytes")
    }

    fn buf(&mut self) -> Check<&'a [u8]> {
        let len = self.var_u32()? as usize;
        self.skip(len)
    }

    /// A length-prefixed string; returns its byte length.
    fn string(&mut self) -> Check<usize> {
        let start = self.pos;
        let bytes = self.buf()?;
        if std::str::from_utf8(bytes).is_err() {
            return Err(Invalid {
                offset: start,
                reason: "string is not valid UTF-8",
            });
        }
        Ok(bytes.len())
    }

    fn id(&mut self) -> Check<()> {
        self.var_u32()?;
        self.var_u32()?;
        Ok(())
    }

    fn any(&mut self, depth: usize) -> Check<()> {
        if depth > MAX_ANY_DEPTH {
            return self.fail("value nested too deeply");
        }
        match self.u8()? {
            127 | 126 | 121 | 120 => {}
            125 => self.var_signed()?,
            124 => {
                self.skip(4)?;
            }
            123 | 122 => {
                self.skip(8)?;
            }
            119 => {
                self.string()?;
            }
            118 => {
                for _ in 0..self.count(2)? {
                    self.string()?;
                    self.any(depth + 1)?;
                }
            }
            117 => {
                for _ in 0..self.count(1)? {
                    self.any(depth + 1)?;
                }
            }
            116 => {
                self.buf()?;
            }
            _ => return self.fail("unknown value tag"),
        }
        Ok(())
    }

    /// Item content; returns an upper bound of the clock span it occupies.
    fn content(&mut self, info: u8) -> Check<u64> {
        match info & 0b1111 {
            CONTENT_DELETED => Ok(u64::from(self.var_u32()?)),
            CONTENT_JSON => {
                let n = self.var_u32()?;
                if n > i32::MAX as u32 {
                    return self.fail("count larger than the payload can hold");
                }
                // yrs reads one more entry than the prefix states.
                for _ in 0..=n {
                    self.string()?;
                }
                Ok(u64::from(n) + 1)
            }
            CONTENT_BINARY => {
                self.buf()?;
                Ok(1)
            }
            CONTENT_STRING => Ok(self.string()? as u64),
            CONTENT_EMBED => {
                self.string()?;
                Ok(1)
            }
            CONTENT_FORMAT => {
                self.string()?;
                self.string()?;
                Ok(1)
            }
            CONTENT_TYPE => {
                let type_ref = self.u8()?;
                if type_ref == TYPE_XML_ELEMENT {
                    self.string()?;
                } else if !PLAIN_TYPE_REFS.contains(&type_ref) {
                    return self.fail("unsupported shared type");
                }
                Ok(1)
            }
            CONTENT_ANY => {
                let n = self.count(1)?;
                for _ in 0..n {
                    self.any(0)?;
                }
                Ok(n as u64)
            }
            _ => self.fail("unsupported block content"),
        }
    }

    /// One block; returns an upper bound of its clock length.
    fn block(&mut self) -> Check<u64> {
        let info = self.u8()?;
        match info {
            BLOCK_GC | BLOCK_SKIP => Ok(u64::from(self.var_u32()?)),
            info => {
                let copies_parent = info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) != 0;
                if info & HAS_ORIGIN != 0 {
                    self.id()?;
                }
                if info & HAS_RIGHT_ORIGIN != 0 {
                    self.id()?;
                }
                if !copies_parent {
                    if self.var_u32()? == 1 {
                        self.string()?;
                    } else {
                        self.id()?;
                    }
                    if info & HAS_PARENT_SUB != 0 {
                        self.string()?;
                    }
                }
                self.content(info)
            }
        }
    }

    fn delete_set(&mut self) -> Check<()> {
        for _ in 0..self.count(2)? {
            self.var_u32()?;
            for _ in 0..self.count(2)? {
                let clock = self.var_u32()?;
                let len = self.var_u32()?;
                if clock.checked_add(len).is_none() {
                    return self.fail("deleted range overflows the clock");
                }
            }
        }
        Ok(())
    }
}

/// Check a v1-encoded update before it reaches the yrs decoder.
pub(crate) fn update_v1(bytes: &[u8]) -> Result<(), Invalid> {
    let mut r = Reader::new(bytes);
    for _ in 0..r.count(3)? {
        let blocks = r.count(1)?;
        r.var_u32()?;
        let mut clock = u64::from(r.var_u32()?);
        for _ in 0..blocks {
            clock += r.block()?;
            if clock > u64::from(u32::MAX) {
                return r.fail("block clock overflows");
            }
        }
    }
    r.delete_set()
}

/// Check a v1-encoded state vector before it reaches the yrs decoder.
pub(crate) fn state_vector_v1(bytes: &[u8]) -> Result<(), Invalid> {
    let mut r = Reader::new(bytes);
    for _ in 0..r.count(2)? {
        r.var_u64()?;
        r.var_u32()?;
    }
    Ok(())
}
