use std::mem::size_of;

const MAX_VAR_SIZE_BYTES: usize = 10;
const VAR_SIZE_GROUP_BITS: u32 = 7;
const VAR_SIZE_GROUP_MASK: u8 = 0x7F;
const VAR_SIZE_CONTINUE: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Fixed(usize),
    Growable,
}

/// Byte buffer with independent read and write cursors.
///
/// Cursor invariant: `read_head <= readable <= write_head`, and
/// `write_head <= capacity` for fixed buffers.
#[derive(Debug, Clone)]
pub struct ByteCodec {
    data: Vec<u8>,
    write_head: usize,
    read_head: usize,
    readable: usize,
    growth: Growth,
    endianness: Endianness,
}

impl Default for ByteCodec {
    fn default() -> Self {
        Self::growable()
    }
}

macro_rules! primitive_io {
    ($($write:ident, $read:ident => $ty:ty;)*) => {
        $(
            pub fn $write(&mut self, value: $ty) -> bool {
                let bytes = match self.endianness {
                    Endianness::Little => value.to_le_bytes(),
                    Endianness::Big => value.to_be_bytes(),
                };
                self.write_bytes(&bytes)
            }

            pub fn $read(&mut self) -> Option<$ty> {
                let bytes = self.read_array::<{ size_of::<$ty>() }>()?;
                Some(match self.endianness {
                    Endianness::Little => <$ty>::from_le_bytes(bytes),
                    Endianness::Big => <$ty>::from_be_bytes(bytes),
                })
            }
        )*
    };
}

impl ByteCodec {
    pub fn growable() -> Self {
        Self {
            data: Vec::new(),
            write_head: 0,
            read_head: 0,
            readable: 0,
            growth: Growth::Growable,
            endianness: Endianness::default(),
        }
    }

    pub fn fixed(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            write_head: 0,
            read_head: 0,
            readable: 0,
            growth: Growth::Fixed(capacity),
            endianness: Endianness::default(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            write_head: bytes.len(),
            read_head: 0,
            readable: bytes.len(),
            growth: Growth::Growable,
            endianness: Endianness::default(),
        }
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.growth, Growth::Fixed(_))
    }

    pub fn capacity(&self) -> Option<usize> {
        match self.growth {
            Growth::Fixed(capacity) => Some(capacity),
            Growth::Growable => None,
        }
    }

    pub fn len(&self) -> usize {
        self.write_head
    }

    pub fn is_empty(&self) -> bool {
        self.write_head == 0
    }

    pub fn write_head(&self) -> usize {
        self.write_head
    }

    pub fn read_head(&self) -> usize {
        self.read_head
    }

    pub fn readable_len(&self) -> usize {
        self.readable
    }

    pub fn remaining_readable(&self) -> usize {
        self.readable - self.read_head
    }

    pub fn remaining_capacity(&self) -> usize {
        match self.growth {
            Growth::Fixed(capacity) => capacity - self.write_head,
            Growth::Growable => usize::MAX - self.write_head,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.write_head]
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_head..self.readable]
    }

    /// Shrinks the declared readable length. Fails if `len` is past the write head.
    pub fn set_readable_len(&mut self, len: usize) -> bool {
        if len > self.write_head {
            return false;
        }
        self.readable = len;
        self.read_head = self.read_head.min(len);
        true
    }

    pub fn reset_write(&mut self) {
        self.write_head = 0;
        self.readable = 0;
        self.read_head = 0;
    }

    pub fn reset_read(&mut self) {
        self.read_head = 0;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        let end = self.write_head + bytes.len();
        match self.growth {
            Growth::Fixed(capacity) => {
                if end > capacity {
                    return false;
                }
                self.data[self.write_head..end].copy_from_slice(bytes);
            }
            Growth::Growable => {
                self.data.truncate(self.write_head);
                self.data.extend_from_slice(bytes);
            }
        }
        self.write_head = end;
        self.readable = end;
        true
    }

    /// Overwrites already-written bytes. Only fixed buffers support this.
    pub fn write_bytes_at(&mut self, offset: usize, bytes: &[u8]) -> bool {
        if !self.is_fixed() {
            log::error!("in-place write refused on a growable buffer");
            return false;
        }
        let end = offset + bytes.len();
        if end > self.write_head {
            return false;
        }
        self.data[offset..end].copy_from_slice(bytes);
        true
    }

    /// Copies up to `out.len()` unread bytes and returns how many were available.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.remaining_readable());
        out[..count].copy_from_slice(&self.data[self.read_head..self.read_head + count]);
        self.read_head += count;
        count
    }

    pub fn skip(&mut self, count: usize) -> usize {
        let count = count.min(self.remaining_readable());
        self.read_head += count;
        count
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.remaining_readable() < N {
            return None;
        }
        let mut bytes = [0u8; N];
        self.read_bytes(&mut bytes);
        Some(bytes)
    }

    primitive_io! {
        write_u8, read_u8 => u8;
        write_i8, read_i8 => i8;
        write_u16, read_u16 => u16;
        write_i16, read_i16 => i16;
        write_u32, read_u32 => u32;
        write_i32, read_i32 => i32;
        write_u64, read_u64 => u64;
        write_i64, read_i64 => i64;
        write_f32, read_f32 => f32;
        write_f64, read_f64 => f64;
    }

    pub fn write_bool(&mut self, value: bool) -> bool {
        self.write_u8(u8::from(value))
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_u8().map(|byte| byte != 0)
    }

    pub fn write_var_size(&mut self, value: usize) -> bool {
        let mut encoded = [0u8; MAX_VAR_SIZE_BYTES];
        let len = encode_var_size(value, &mut encoded);
        self.write_bytes(&encoded[..len])
    }

    pub fn read_var_size(&mut self) -> Option<usize> {
        let start = self.read_head;
        let mut value: u128 = 0;
        for group in 0..MAX_VAR_SIZE_BYTES {
            let Some(byte) = self.read_u8() else {
                self.read_head = start;
                return None;
            };
            value |= u128::from(byte & VAR_SIZE_GROUP_MASK) << (group as u32 * VAR_SIZE_GROUP_BITS);
            if byte & VAR_SIZE_CONTINUE == 0 {
                return match usize::try_from(value) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        self.read_head = start;
                        None
                    }
                };
            }
        }
        self.read_head = start;
        None
    }

    pub fn write_string(&mut self, value: &str) -> bool {
        let bytes = value.as_bytes();
        if var_size_len(bytes.len()) + bytes.len() > self.remaining_capacity() {
            return false;
        }
        self.write_var_size(bytes.len()) && self.write_bytes(bytes)
    }

    pub fn read_string(&mut self) -> Option<String> {
        let start = self.read_head;
        let len = self.read_var_size()?;
        if len > self.remaining_readable() {
            self.read_head = start;
            return None;
        }
        let mut bytes = vec![0u8; len];
        self.read_bytes(&mut bytes);
        match String::from_utf8(bytes) {
            Ok(value) => Some(value),
            Err(_) => {
                self.read_head = start;
                None
            }
        }
    }
}

fn encode_var_size(mut value: usize, out: &mut [u8; MAX_VAR_SIZE_BYTES]) -> usize {
    let mut len = 0;
    loop {
        let group = value as u8 & VAR_SIZE_GROUP_MASK;
        value >>= VAR_SIZE_GROUP_BITS;
        if value == 0 {
            out[len] = group;
            return len + 1;
        }
        out[len] = group | VAR_SIZE_CONTINUE;
        len += 1;
    }
}

/// Number of bytes `write_var_size` emits for `value`.
pub fn var_size_len(value: usize) -> usize {
    let bits = usize::BITS - value.leading_zeros();
    (bits.max(1)).div_ceil(VAR_SIZE_GROUP_BITS) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_size_boundaries() {
        let cases: [(usize, &[u8]); 6] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (300, &[0xAC, 0x02]),
            (16384, &[0x80, 0x80, 0x01]),
        ];

        for (value, expected) in cases {
            let mut codec = ByteCodec::growable();
            assert!(codec.write_var_size(value));
            assert_eq!(codec.as_slice(), expected, "encoding of {}", value);
            assert_eq!(var_size_len(value), expected.len());
            assert_eq!(codec.read_var_size(), Some(value));
        }
    }

    #[test]
    fn test_var_size_bijection_over_u32_range() {
        let mut value: u64 = 0;
        while value < 1u64 << 32 {
            let mut codec = ByteCodec::growable();
            codec.write_var_size(value as usize);

            let groups = (64 - value.leading_zeros()).max(1).div_ceil(7) as usize;
            assert_eq!(codec.len(), groups);
            assert_eq!(codec.read_var_size(), Some(value as usize));

            value = value * 3 + 1;
        }

        let mut codec = ByteCodec::growable();
        codec.write_var_size(u32::MAX as usize);
        assert_eq!(codec.len(), 5);
        assert_eq!(codec.read_var_size(), Some(u32::MAX as usize));
    }

    #[test]
    fn test_truncated_var_size_restores_cursor() {
        let mut codec = ByteCodec::from_bytes(&[0x80, 0x80]);
        assert_eq!(codec.read_var_size(), None);
        assert_eq!(codec.read_head(), 0);
    }

    #[test]
    fn test_fixed_buffer_rejects_overflow() {
        let mut codec = ByteCodec::fixed(4);
        assert!(codec.write_u16(7));
        assert!(codec.write_u16(8));
        assert!(!codec.write_u8(9));
        assert_eq!(codec.len(), 4);
    }

    #[test]
    fn test_growable_buffer_never_fails() {
        let mut codec = ByteCodec::growable();
        for i in 0..5000u32 {
            assert!(codec.write_u32(i));
        }
        assert_eq!(codec.len(), 20000);
    }

    #[test]
    fn test_read_bytes_reports_available() {
        let mut codec = ByteCodec::from_bytes(&[1, 2, 3]);
        let mut out = [0u8; 8];
        assert_eq!(codec.read_bytes(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(codec.read_bytes(&mut out), 0);
    }

    #[test]
    fn test_endianness() {
        let mut little = ByteCodec::growable();
        little.write_u16(0x0102);
        assert_eq!(little.as_slice(), &[0x02, 0x01]);

        let mut big = ByteCodec::growable().with_endianness(Endianness::Big);
        big.write_u16(0x0102);
        assert_eq!(big.as_slice(), &[0x01, 0x02]);
        assert_eq!(big.read_u16(), Some(0x0102));
    }

    #[test]
    fn test_string_round_trip() {
        let mut codec = ByteCodec::growable();
        assert!(codec.write_string("hello, wire"));
        assert!(codec.write_string(""));
        assert_eq!(codec.as_slice()[0], 11);
        assert_eq!(codec.read_string().as_deref(), Some("hello, wire"));
        assert_eq!(codec.read_string().as_deref(), Some(""));
        assert_eq!(codec.read_string(), None);
    }

    #[test]
    fn test_string_too_long_for_fixed_buffer() {
        let mut codec = ByteCodec::fixed(4);
        assert!(!codec.write_string("abcd"));
        assert!(codec.is_empty());
    }

    #[test]
    fn test_write_bytes_at() {
        let mut fixed = ByteCodec::fixed(8);
        fixed.write_u32(0);
        assert!(fixed.write_bytes_at(1, &[9, 9]));
        assert_eq!(fixed.as_slice(), &[0, 9, 9, 0]);
        assert!(!fixed.write_bytes_at(3, &[1, 1]));

        let mut growable = ByteCodec::growable();
        growable.write_u32(0);
        assert!(!growable.write_bytes_at(0, &[1]));
    }

    #[test]
    fn test_reset_cursors() {
        let mut codec = ByteCodec::fixed(16);
        codec.write_u32(42);
        assert_eq!(codec.read_u32(), Some(42));
        codec.reset_read();
        assert_eq!(codec.read_u32(), Some(42));
        codec.reset_write();
        assert!(codec.is_empty());
        assert_eq!(codec.remaining_capacity(), 16);
        assert_eq!(codec.read_u8(), None);
    }

    #[test]
    fn test_readable_len_limits_reads() {
        let mut codec = ByteCodec::from_bytes(&[1, 2, 3, 4]);
        assert!(codec.set_readable_len(2));
        assert!(!codec.set_readable_len(5));
        assert_eq!(codec.unread(), &[1, 2]);
        assert_eq!(codec.read_u32(), None);
        assert_eq!(codec.read_u16(), Some(0x0201));
    }
}
