//! Just enough hessian2 to walk a dubbo request body: read its strings and
//! attachment map, and step over argument values without materialising them.

use crate::error::ProtocolError;

const NULL: u8 = b'N';
const CHUNK: u8 = b'R';
const FINAL_CHUNK: u8 = b'S';
const UNTYPED_MAP: u8 = b'H';
const TYPED_MAP: u8 = b'M';
const END: u8 = b'Z';

/// Nesting limit for skipped values.
const MAX_DEPTH: usize = 64;

/// Sequential reader over hessian2-encoded values.
#[derive(Debug)]
pub struct HessianReader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Field counts of the class definitions seen so far, by reference.
    classes: Vec<usize>,
}

fn invalid(message: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidHessian(message.into())
}

impl<'a> HessianReader<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            classes: Vec::new(),
        }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Whether every byte has been consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek(&self) -> Result<u8, ProtocolError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| invalid("unexpected end of data"))
    }

    fn skip(&mut self, len: usize) -> Result<(), ProtocolError> {
        if self.buf.len() - self.pos < len {
            return Err(invalid("unexpected end of data"));
        }
        self.pos += len;
        Ok(())
    }

    fn byte(&mut self) -> Result<u8, ProtocolError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| ProtocolError::InvalidHessian("unexpected end of data".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<usize, ProtocolError> {
        let hi = usize::from(self.byte()?);
        let lo = usize::from(self.byte()?);
        Ok((hi << 8) | lo)
    }

    /// Reads `chars` UTF-8 characters (hessian lengths count characters, not bytes).
    fn chars(&mut self, chars: usize, out: &mut String) -> Result<(), ProtocolError> {
        let start = self.pos;
        for _ in 0..chars {
            let lead = self.byte()?;
            let width = match lead {
                0x00..=0x7f => 1,
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                0xf0..=0xf7 => 4,
                _ => return Err(ProtocolError::InvalidHessian("invalid utf-8 lead byte".into())),
            };
            for _ in 1..width {
                self.byte()?;
            }
        }
        let text = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|e| ProtocolError::InvalidHessian(e.to_string()))?;
        out.push_str(text);
        Ok(())
    }

    /// Reads a string value. A hessian `null` reads as `None`.
    pub fn read_string(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut out = String::new();
        loop {
            let tag = self.byte()?;
            match tag {
                NULL => return Ok(None),
                0x00..=0x1f => {
                    self.chars(usize::from(tag), &mut out)?;
                    return Ok(Some(out));
                }
                0x30..=0x33 => {
                    let len = (usize::from(tag - 0x30) << 8) | usize::from(self.byte()?);
                    self.chars(len, &mut out)?;
                    return Ok(Some(out));
                }
                FINAL_CHUNK => {
                    let len = self.u16()?;
                    self.chars(len, &mut out)?;
                    return Ok(Some(out));
                }
                CHUNK => {
                    let len = self.u16()?;
                    self.chars(len, &mut out)?;
                }
                other => {
                    return Err(ProtocolError::InvalidHessian(format!(
                        "expected string, found tag {other:#04x}"
                    )))
                }
            }
        }
    }

    /// Reads a 32-bit integer in any of its encodings.
    pub fn read_int(&mut self) -> Result<i32, ProtocolError> {
        let tag = self.byte()?;
        match tag {
            0x80..=0xbf => Ok(i32::from(tag) - 0x90),
            0xc0..=0xcf => Ok(((i32::from(tag) - 0xc8) << 8) | i32::from(self.byte()?)),
            0xd0..=0xd7 => {
                let hi = i32::from(self.byte()?);
                let lo = i32::from(self.byte()?);
                Ok(((i32::from(tag) - 0xd4) << 16) | (hi << 8) | lo)
            }
            b'I' => {
                let mut raw = [0u8; 4];
                for b in &mut raw {
                    *b = self.byte()?;
                }
                Ok(i32::from_be_bytes(raw))
            }
            other => Err(invalid(format!("expected int, found tag {other:#04x}"))),
        }
    }

    fn read_len(&mut self) -> Result<usize, ProtocolError> {
        let len = self.read_int()?;
        usize::try_from(len).map_err(|_| invalid(format!("negative length {len}")))
    }

    /// Reads a map whose keys are strings. Entries whose key or value is
    /// not a string are stepped over.
    pub fn read_string_map(&mut self) -> Result<Vec<(String, String)>, ProtocolError> {
        match self.byte()? {
            UNTYPED_MAP => {}
            TYPED_MAP => self.skip_type()?,
            other => return Err(invalid(format!("expected map, found tag {other:#04x}"))),
        }

        let mut entries = Vec::new();
        while self.peek()? != END {
            let key_start = self.pos;
            let key = match self.read_string() {
                Ok(key) => key,
                Err(_) => {
                    self.pos = key_start;
                    self.skip_value()?;
                    None
                }
            };
            let value_start = self.pos;
            let value = match self.read_string() {
                Ok(value) => value,
                Err(_) => {
                    self.pos = value_start;
                    self.skip_value()?;
                    None
                }
            };
            if let (Some(key), Some(value)) = (key, value) {
                entries.push((key, value));
            }
        }
        self.pos += 1;
        Ok(entries)
    }

    /// Steps over one complete value of any type.
    pub fn skip_value(&mut self) -> Result<(), ProtocolError> {
        self.skip_nested(0)
    }

    fn skip_nested(&mut self, depth: usize) -> Result<(), ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(invalid("value nested too deeply"));
        }
        let tag = self.byte()?;
        match tag {
            0x00..=0x1f | 0x30..=0x33 | CHUNK | FINAL_CHUNK => {
                self.pos -= 1;
                self.read_string()?;
            }
            NULL | b'T' | b'F' => {}
            0x80..=0xd7 | b'I' => {
                self.pos -= 1;
                self.read_int()?;
            }
            // longs
            0xd8..=0xef | 0x5b | 0x5c => {}
            0xf0..=0xff | 0x5d => self.skip(1)?,
            0x38..=0x3f | 0x5e => self.skip(2)?,
            0x59 | 0x5f | 0x4b => self.skip(4)?,
            b'L' | b'D' | 0x4a => self.skip(8)?,
            // binary
            0x20..=0x2f => self.skip(usize::from(tag - 0x20))?,
            0x34..=0x37 => {
                let len = (usize::from(tag - 0x34) << 8) | usize::from(self.byte()?);
                self.skip(len)?;
            }
            b'A' | b'B' => {
                let mut chunk = tag;
                loop {
                    let len = self.u16()?;
                    self.skip(len)?;
                    if chunk == b'B' {
                        break;
                    }
                    chunk = self.byte()?;
                    if chunk != b'A' && chunk != b'B' {
                        return Err(invalid(format!("bad binary chunk {chunk:#04x}")));
                    }
                }
            }
            // lists
            0x55 => {
                self.skip_type()?;
                self.skip_until_end(depth)?;
            }
            b'V' => {
                self.skip_type()?;
                let len = self.read_len()?;
                self.skip_many(len, depth)?;
            }
            0x57 => self.skip_until_end(depth)?,
            0x58 => {
                let len = self.read_len()?;
                self.skip_many(len, depth)?;
            }
            0x70..=0x77 => {
                self.skip_type()?;
                self.skip_many(usize::from(tag - 0x70), depth)?;
            }
            0x78..=0x7f => self.skip_many(usize::from(tag - 0x78), depth)?,
            UNTYPED_MAP => self.skip_until_end(depth)?,
            TYPED_MAP => {
                self.skip_type()?;
                self.skip_until_end(depth)?;
            }
            // a class definition precedes the instance that uses it
            b'C' => {
                self.read_string()?;
                let fields = self.read_len()?;
                for _ in 0..fields {
                    self.read_string()?;
                }
                self.classes.push(fields);
                self.skip_nested(depth + 1)?;
            }
            b'O' => {
                let class = self.read_len()?;
                self.skip_object(class, depth)?;
            }
            0x60..=0x6f => self.skip_object(usize::from(tag - 0x60), depth)?,
            b'Q' => {
                self.read_int()?;
            }
            other => return Err(invalid(format!("unknown tag {other:#04x}"))),
        }
        Ok(())
    }

    fn skip_type(&mut self) -> Result<(), ProtocolError> {
        match self.peek()? {
            0x00..=0x1f | 0x30..=0x33 | CHUNK | FINAL_CHUNK => self.read_string().map(drop),
            _ => self.read_int().map(drop),
        }
    }

    fn skip_many(&mut self, count: usize, depth: usize) -> Result<(), ProtocolError> {
        for _ in 0..count {
            self.skip_nested(depth + 1)?;
        }
        Ok(())
    }

    fn skip_until_end(&mut self, depth: usize) -> Result<(), ProtocolError> {
        while self.peek()? != END {
            self.skip_nested(depth + 1)?;
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_object(&mut self, class: usize, depth: usize) -> Result<(), ProtocolError> {
        let fields = *self
            .classes
            .get(class)
            .ok_or_else(|| invalid(format!("undefined class reference {class}")))?;
        self.skip_many(fields, depth)
    }
}

/// Writes `s` as a single hessian2 string value.
pub fn write_string(out: &mut Vec<u8>, s: &str) {
    let chars = s.chars().count();
    match chars {
        0..=0x1f => out.push(chars as u8),
        0x20..=0x3ff => {
            out.push(0x30 + (chars >> 8) as u8);
            out.push((chars & 0xff) as u8);
        }
        _ => {
            out.push(FINAL_CHUNK);
            out.extend_from_slice(&(chars as u16).to_be_bytes());
        }
    }
    out.extend_from_slice(s.as_bytes());
}

/// Writes `entries` as an untyped map of strings.
pub fn write_string_map(out: &mut Vec<u8>, entries: &[(String, String)]) {
    out.push(UNTYPED_MAP);
    for (key, value) in entries {
        write_string(out, key);
        write_string(out, value);
    }
    out.push(END);
}
