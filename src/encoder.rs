//! Self-describing argument stream.
//!
//! A log call serializes its arguments directly into the reserved chunk,
//! little-endian, with no per-call heap allocation. Each argument starts
//! with a one-byte type tag so the stream is self-delimiting; the
//! consumer advances without consulting the format string.
//!
//! Layouts (all arguments start 4-byte aligned):
//!
//! - scalars: `tag, pad×3, value (LE)`, padded to 4;
//! - null: `tag, pad×3`;
//! - variable length: `tag, pad×3, len: u32, hash: u32, bytes`, padded
//!   to 4. `hash` is the crc32 of the payload bytes, computed in the same
//!   pass that copies them; consumers may use it to deduplicate repeated
//!   strings or detect corruption.
//!
//! Text arguments are copied verbatim: invalid UTF-16 units travel through
//! and are replaced with U+FFFD only when a consumer renders the value
//! ([`ArgValue::lossy_text`]). `MixedStr` carries UTF-16 with the ASCII
//! prefix collapsed (see [`utf`](crate::utf)); `CustomUtf8`/`CustomUtf16`
//! carry pre-rendered output that the layout engine splices in as-is.

use crate::entry::round_up4;
use crate::utf;

/// Argument type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Null = 0,
    Bool = 1,
    I8 = 2,
    U8 = 3,
    I16 = 4,
    U16 = 5,
    I32 = 6,
    U32 = 7,
    I64 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
    Utf8Str = 12,
    Utf16Str = 13,
    Utf32Str = 14,
    Pointer = 15,
    EnumInt = 16,
    MixedStr = 17,
    CustomUtf8 = 18,
    CustomUtf16 = 19,
}

impl TypeTag {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Null),
            1 => Some(Self::Bool),
            2 => Some(Self::I8),
            3 => Some(Self::U8),
            4 => Some(Self::I16),
            5 => Some(Self::U16),
            6 => Some(Self::I32),
            7 => Some(Self::U32),
            8 => Some(Self::I64),
            9 => Some(Self::U64),
            10 => Some(Self::F32),
            11 => Some(Self::F64),
            12 => Some(Self::Utf8Str),
            13 => Some(Self::Utf16Str),
            14 => Some(Self::Utf32Str),
            15 => Some(Self::Pointer),
            16 => Some(Self::EnumInt),
            17 => Some(Self::MixedStr),
            18 => Some(Self::CustomUtf8),
            19 => Some(Self::CustomUtf16),
            _ => None,
        }
    }
}

/// A borrowed argument on the encode side.
///
/// A nullable pointer encodes as [`Arg::Null`] rather than a zero
/// [`Arg::Pointer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    Null,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Utf8(&'a str),
    Utf16(&'a [u16]),
    Utf32(&'a [u32]),
    Pointer(u64),
    EnumInt(i64),
    /// UTF-16 stored with the compact mixed encoding.
    Mixed(&'a [u16]),
    CustomUtf8(&'a [u8]),
    CustomUtf16(&'a [u16]),
}

/// An owned argument on the decode side.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Utf8(String),
    Utf16(Vec<u16>),
    Utf32(Vec<u32>),
    Pointer(u64),
    EnumInt(i64),
    Mixed(Vec<u16>),
    CustomUtf8(Vec<u8>),
    CustomUtf16(Vec<u16>),
}

impl ArgValue {
    /// Renders a text-bearing value, substituting U+FFFD for invalid
    /// units. `None` for non-text values.
    pub fn lossy_text(&self) -> Option<String> {
        match self {
            Self::Utf8(s) => Some(s.clone()),
            Self::Utf16(u) | Self::Mixed(u) | Self::CustomUtf16(u) => {
                Some(utf::utf16_to_utf8_lossy(u))
            }
            Self::Utf32(u) => Some(
                u.iter()
                    .map(|&c| char::from_u32(c).unwrap_or('\u{FFFD}'))
                    .collect(),
            ),
            Self::CustomUtf8(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }
}

/// Copies `src` into `dst` and returns the crc32 of `src`, hashing each
/// chunk as it is copied.
pub fn copy_with_hash(dst: &mut [u8], src: &[u8]) -> u32 {
    debug_assert_eq!(dst.len(), src.len());
    let mut hasher = crc32fast::Hasher::new();
    for (d, s) in dst.chunks_mut(1024).zip(src.chunks(1024)) {
        d.copy_from_slice(s);
        hasher.update(s);
    }
    hasher.finalize()
}

/// Crc32 of `src`; by construction equals what [`copy_with_hash`] returns.
pub fn hash_only(src: &[u8]) -> u32 {
    crc32fast::hash(src)
}

fn scalar_width(tag: TypeTag) -> usize {
    match tag {
        TypeTag::Null => 0,
        TypeTag::Bool | TypeTag::I8 | TypeTag::U8 => 1,
        TypeTag::I16 | TypeTag::U16 => 2,
        TypeTag::I32 | TypeTag::U32 | TypeTag::F32 => 4,
        TypeTag::I64 | TypeTag::U64 | TypeTag::F64 | TypeTag::Pointer | TypeTag::EnumInt => 8,
        _ => unreachable!("variable-length tag"),
    }
}

fn is_variable(tag: TypeTag) -> bool {
    matches!(
        tag,
        TypeTag::Utf8Str
            | TypeTag::Utf16Str
            | TypeTag::Utf32Str
            | TypeTag::MixedStr
            | TypeTag::CustomUtf8
            | TypeTag::CustomUtf16
    )
}

impl Arg<'_> {
    pub fn tag(&self) -> TypeTag {
        match self {
            Arg::Null => TypeTag::Null,
            Arg::Bool(_) => TypeTag::Bool,
            Arg::I8(_) => TypeTag::I8,
            Arg::U8(_) => TypeTag::U8,
            Arg::I16(_) => TypeTag::I16,
            Arg::U16(_) => TypeTag::U16,
            Arg::I32(_) => TypeTag::I32,
            Arg::U32(_) => TypeTag::U32,
            Arg::I64(_) => TypeTag::I64,
            Arg::U64(_) => TypeTag::U64,
            Arg::F32(_) => TypeTag::F32,
            Arg::F64(_) => TypeTag::F64,
            Arg::Utf8(_) => TypeTag::Utf8Str,
            Arg::Utf16(_) => TypeTag::Utf16Str,
            Arg::Utf32(_) => TypeTag::Utf32Str,
            Arg::Pointer(_) => TypeTag::Pointer,
            Arg::EnumInt(_) => TypeTag::EnumInt,
            Arg::Mixed(_) => TypeTag::MixedStr,
            Arg::CustomUtf8(_) => TypeTag::CustomUtf8,
            Arg::CustomUtf16(_) => TypeTag::CustomUtf16,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Arg::Utf8(s) => s.len(),
            Arg::Utf16(u) | Arg::CustomUtf16(u) => 2 * u.len(),
            Arg::Utf32(u) => 4 * u.len(),
            Arg::Mixed(u) => utf::mixed_len(u),
            Arg::CustomUtf8(b) => b.len(),
            _ => 0,
        }
    }

    /// Encoded size of this argument, including padding.
    pub fn encoded_size(&self) -> usize {
        let tag = self.tag();
        if is_variable(tag) {
            // tag + pad + len + hash + payload, padded to 4
            4 + 4 + 4 + round_up4(self.payload_len())
        } else {
            4 + round_up4(scalar_width(tag))
        }
    }
}

/// Encoded size of a whole argument list.
pub fn args_size(args: &[Arg<'_>]) -> usize {
    args.iter().map(Arg::encoded_size).sum()
}

/// Writes arguments into a caller-provided buffer.
///
/// The buffer must be sized with [`args_size`]; encoding happens inside
/// the producer's reserved chunk, so there is nothing to grow.
pub struct ArgWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ArgWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn pad_to4(&mut self) {
        while self.pos % 4 != 0 {
            self.buf[self.pos] = 0;
            self.pos += 1;
        }
    }

    fn put_header(&mut self, tag: TypeTag) {
        self.buf[self.pos] = tag as u8;
        self.buf[self.pos + 1..self.pos + 4].fill(0);
        self.pos += 4;
    }

    /// Writes a variable-length payload with its fused hash.
    fn put_var(&mut self, tag: TypeTag, payload: &[u8]) {
        self.put_header(tag);
        self.put(&(payload.len() as u32).to_le_bytes());
        let hash_pos = self.pos;
        self.pos += 4;
        let dst = &mut self.buf[self.pos..self.pos + payload.len()];
        let hash = copy_with_hash(dst, payload);
        self.pos += payload.len();
        self.buf[hash_pos..hash_pos + 4].copy_from_slice(&hash.to_le_bytes());
        self.pad_to4();
    }

    /// Writes a variable-length payload of u16 units, hashing the written
    /// little-endian bytes.
    fn put_var_u16(&mut self, tag: TypeTag, units: &[u16]) {
        self.put_header(tag);
        self.put(&((2 * units.len()) as u32).to_le_bytes());
        let hash_pos = self.pos;
        self.pos += 4;
        let start = self.pos;
        for &u in units {
            self.put(&u.to_le_bytes());
        }
        let hash = hash_only(&self.buf[start..self.pos]);
        self.buf[hash_pos..hash_pos + 4].copy_from_slice(&hash.to_le_bytes());
        self.pad_to4();
    }

    pub fn write(&mut self, arg: &Arg<'_>) {
        match *arg {
            Arg::Null => self.put_header(TypeTag::Null),
            Arg::Bool(v) => {
                self.put_header(TypeTag::Bool);
                self.put(&[u8::from(v)]);
                self.pad_to4();
            }
            Arg::I8(v) => {
                self.put_header(TypeTag::I8);
                self.put(&v.to_le_bytes());
                self.pad_to4();
            }
            Arg::U8(v) => {
                self.put_header(TypeTag::U8);
                self.put(&v.to_le_bytes());
                self.pad_to4();
            }
            Arg::I16(v) => {
                self.put_header(TypeTag::I16);
                self.put(&v.to_le_bytes());
                self.pad_to4();
            }
            Arg::U16(v) => {
                self.put_header(TypeTag::U16);
                self.put(&v.to_le_bytes());
                self.pad_to4();
            }
            Arg::I32(v) => {
                self.put_header(TypeTag::I32);
                self.put(&v.to_le_bytes());
            }
            Arg::U32(v) => {
                self.put_header(TypeTag::U32);
                self.put(&v.to_le_bytes());
            }
            Arg::F32(v) => {
                self.put_header(TypeTag::F32);
                self.put(&v.to_le_bytes());
            }
            Arg::I64(v) => {
                self.put_header(TypeTag::I64);
                self.put(&v.to_le_bytes());
            }
            Arg::U64(v) => {
                self.put_header(TypeTag::U64);
                self.put(&v.to_le_bytes());
            }
            Arg::F64(v) => {
                self.put_header(TypeTag::F64);
                self.put(&v.to_le_bytes());
            }
            Arg::Pointer(v) => {
                self.put_header(TypeTag::Pointer);
                self.put(&v.to_le_bytes());
            }
            Arg::EnumInt(v) => {
                self.put_header(TypeTag::EnumInt);
                self.put(&v.to_le_bytes());
            }
            Arg::Utf8(s) => self.put_var(TypeTag::Utf8Str, s.as_bytes()),
            Arg::Utf16(u) => self.put_var_u16(TypeTag::Utf16Str, u),
            Arg::CustomUtf16(u) => self.put_var_u16(TypeTag::CustomUtf16, u),
            Arg::Utf32(u) => {
                self.put_header(TypeTag::Utf32Str);
                self.put(&((4 * u.len()) as u32).to_le_bytes());
                let hash_pos = self.pos;
                self.pos += 4;
                let start = self.pos;
                for &c in u {
                    self.put(&c.to_le_bytes());
                }
                let hash = hash_only(&self.buf[start..self.pos]);
                self.buf[hash_pos..hash_pos + 4].copy_from_slice(&hash.to_le_bytes());
            }
            Arg::Mixed(u) => {
                let encoded = utf::encode_mixed(u);
                self.put_var(TypeTag::MixedStr, &encoded);
            }
            Arg::CustomUtf8(b) => self.put_var(TypeTag::CustomUtf8, b),
        }
    }
}

/// Encodes a whole argument list into `buf`, returning the bytes written.
pub fn encode_args(buf: &mut [u8], args: &[Arg<'_>]) -> usize {
    let mut w = ArgWriter::new(buf);
    for arg in args {
        w.write(arg);
    }
    w.written()
}

/// Decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnknownTag(u8),
    Truncated,
    MalformedMixed,
}

/// Iterator over an encoded argument stream.
pub struct ArgReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn next_value(&mut self) -> Result<ArgValue, DecodeError> {
        let header = self.take(4)?;
        let tag = TypeTag::from_raw(header[0]).ok_or(DecodeError::UnknownTag(header[0]))?;

        if is_variable(tag) {
            let len = self.read_u32()? as usize;
            let _hash = self.read_u32()?;
            let payload = self.take(len)?;
            let _ = self.take(round_up4(len) - len)?;
            return match tag {
                TypeTag::Utf8Str => Ok(ArgValue::Utf8(
                    String::from_utf8_lossy(payload).into_owned(),
                )),
                TypeTag::Utf16Str | TypeTag::CustomUtf16 => {
                    if len % 2 != 0 {
                        return Err(DecodeError::Truncated);
                    }
                    let units = payload
                        .chunks_exact(2)
                        .map(|p| u16::from_le_bytes([p[0], p[1]]))
                        .collect();
                    if tag == TypeTag::Utf16Str {
                        Ok(ArgValue::Utf16(units))
                    } else {
                        Ok(ArgValue::CustomUtf16(units))
                    }
                }
                TypeTag::Utf32Str => {
                    if len % 4 != 0 {
                        return Err(DecodeError::Truncated);
                    }
                    Ok(ArgValue::Utf32(
                        payload
                            .chunks_exact(4)
                            .map(|p| u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
                            .collect(),
                    ))
                }
                TypeTag::MixedStr => utf::decode_mixed(payload)
                    .map(ArgValue::Mixed)
                    .ok_or(DecodeError::MalformedMixed),
                TypeTag::CustomUtf8 => Ok(ArgValue::CustomUtf8(payload.to_vec())),
                _ => unreachable!(),
            };
        }

        let width = scalar_width(tag);
        let value = self.take(round_up4(width))?;
        Ok(match tag {
            TypeTag::Null => ArgValue::Null,
            TypeTag::Bool => ArgValue::Bool(value[0] != 0),
            TypeTag::I8 => ArgValue::I8(value[0] as i8),
            TypeTag::U8 => ArgValue::U8(value[0]),
            TypeTag::I16 => ArgValue::I16(i16::from_le_bytes([value[0], value[1]])),
            TypeTag::U16 => ArgValue::U16(u16::from_le_bytes([value[0], value[1]])),
            TypeTag::I32 => ArgValue::I32(i32::from_le_bytes(value[..4].try_into().unwrap())),
            TypeTag::U32 => ArgValue::U32(u32::from_le_bytes(value[..4].try_into().unwrap())),
            TypeTag::F32 => ArgValue::F32(f32::from_le_bytes(value[..4].try_into().unwrap())),
            TypeTag::I64 => ArgValue::I64(i64::from_le_bytes(value[..8].try_into().unwrap())),
            TypeTag::U64 => ArgValue::U64(u64::from_le_bytes(value[..8].try_into().unwrap())),
            TypeTag::F64 => ArgValue::F64(f64::from_le_bytes(value[..8].try_into().unwrap())),
            TypeTag::Pointer => {
                ArgValue::Pointer(u64::from_le_bytes(value[..8].try_into().unwrap()))
            }
            TypeTag::EnumInt => {
                ArgValue::EnumInt(i64::from_le_bytes(value[..8].try_into().unwrap()))
            }
            _ => unreachable!(),
        })
    }
}

impl Iterator for ArgReader<'_> {
    type Item = Result<ArgValue, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        Some(self.next_value())
    }
}

/// Decodes a whole stream.
pub fn decode_args(buf: &[u8]) -> Result<Vec<ArgValue>, DecodeError> {
    ArgReader::new(buf).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(args: &[Arg<'_>]) -> Vec<ArgValue> {
        let mut buf = vec![0u8; args_size(args)];
        let written = encode_args(&mut buf, args);
        assert_eq!(written, buf.len(), "size calculation disagrees with writer");
        decode_args(&buf).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip() {
        let got = roundtrip(&[
            Arg::Null,
            Arg::Bool(true),
            Arg::I8(-5),
            Arg::U8(200),
            Arg::I16(-12345),
            Arg::U16(54321),
            Arg::I32(-22123),
            Arg::U32(4_000_000_000),
            Arg::I64(i64::MIN),
            Arg::U64(u64::MAX),
            Arg::F32(1.5),
            Arg::F64(3.14),
            Arg::Pointer(0xDEAD_BEEF),
            Arg::EnumInt(-9),
        ]);
        assert_eq!(got[0], ArgValue::Null);
        assert_eq!(got[1], ArgValue::Bool(true));
        assert_eq!(got[2], ArgValue::I8(-5));
        assert_eq!(got[6], ArgValue::I32(-22123));
        assert_eq!(got[9], ArgValue::U64(u64::MAX));
        assert_eq!(got[11], ArgValue::F64(3.14));
        assert_eq!(got[13], ArgValue::EnumInt(-9));
    }

    #[test]
    fn test_text_roundtrip() {
        let utf16 = utf::utf8_to_utf16("utf16文本");
        let got = roundtrip(&[
            Arg::Utf8("abc"),
            Arg::Utf8(""),
            Arg::Utf16(&utf16),
            Arg::Utf32(&[0x61, 0x1F980]),
            Arg::Mixed(&utf16),
            Arg::CustomUtf8(b"pre-rendered"),
            Arg::CustomUtf16(&utf16),
        ]);
        assert_eq!(got[0], ArgValue::Utf8(String::from("abc")));
        assert_eq!(got[1], ArgValue::Utf8(String::new()));
        assert_eq!(got[2], ArgValue::Utf16(utf16.clone()));
        assert_eq!(got[3], ArgValue::Utf32(vec![0x61, 0x1F980]));
        assert_eq!(got[4], ArgValue::Mixed(utf16.clone()));
        assert_eq!(got[4].lossy_text().unwrap(), "utf16文本");
        assert_eq!(got[5], ArgValue::CustomUtf8(b"pre-rendered".to_vec()));
        assert_eq!(got[6], ArgValue::CustomUtf16(utf16));
    }

    #[test]
    fn test_stream_is_self_delimiting() {
        // Interleave text and scalars; the reader must advance without any
        // format string.
        let args = [Arg::Utf8("x"), Arg::I32(7), Arg::Utf8("yy"), Arg::Null];
        let mut buf = vec![0u8; args_size(&args)];
        encode_args(&mut buf, &args);
        let mut reader = ArgReader::new(&buf);
        assert!(matches!(reader.next(), Some(Ok(ArgValue::Utf8(_)))));
        assert!(matches!(reader.next(), Some(Ok(ArgValue::I32(7)))));
        assert!(matches!(reader.next(), Some(Ok(ArgValue::Utf8(_)))));
        assert!(matches!(reader.next(), Some(Ok(ArgValue::Null))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_stored_hash_matches_payload() {
        let args = [Arg::Utf8("hash me")];
        let mut buf = vec![0u8; args_size(&args)];
        encode_args(&mut buf, &args);
        let len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let hash = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        assert_eq!(len, 7);
        assert_eq!(hash, hash_only(&buf[12..12 + len]));
        assert_eq!(hash, hash_only(b"hash me"));
    }

    #[test]
    fn test_copy_with_hash_fused() {
        let src: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0u8; src.len()];
        let h = copy_with_hash(&mut dst, &src);
        assert_eq!(dst, src);
        assert_eq!(h, hash_only(&src));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_args(&[255, 0, 0, 0]), Err(DecodeError::UnknownTag(255)));
        // Variable-length header promising more bytes than exist.
        let mut buf = vec![0u8; 12];
        buf[0] = TypeTag::Utf8Str as u8;
        buf[4..8].copy_from_slice(&100u32.to_le_bytes());
        assert_eq!(decode_args(&buf), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_invalid_utf16_passes_through() {
        let units = [0x41, 0xD800, 0x42]; // lone surrogate mid-stream
        let got = roundtrip(&[Arg::Utf16(&units)]);
        assert_eq!(got[0], ArgValue::Utf16(units.to_vec()));
        assert_eq!(got[0].lossy_text().unwrap(), "A\u{FFFD}B");
    }
}
