//! Framed packet codec.
//!
//! Every frame is one outer record whose value is a sequence of inner
//! records, all sharing the layout `{ type: u32, value_length: u32,
//! value: [u8; value_length] }` with little-endian integers. The outer
//! record's type is the message id; the inner records are the typed
//! fields, decoded by position.

use crate::error::PacketError;
use crate::types::{Guid, MAX_PACKET_SIZE};

pub const FIELD_NULL: u32 = 0;
pub const FIELD_DWORD: u32 = 1;
pub const FIELD_DATA: u32 = 2;
pub const FIELD_WSTRING: u32 = 3;
pub const FIELD_GUID: u32 = 4;

/// Record header size: type + value_length.
pub const HEADER_SIZE: usize = 8;

/// Total size of the frame starting at `buf[0]`, or `None` when not
/// enough bytes have arrived to know yet. Used by the stream reader to
/// delimit frames; the size includes the outer header.
pub fn frame_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    Some(HEADER_SIZE + len)
}

/// Builds one outgoing frame. Fields are appended in wire order and the
/// outer length is patched in by [`PacketBuilder::finish`].
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(msg_id: u32) -> PacketBuilder {
        // Frames are small; one reservation avoids regrowth for all but
        // large application payloads.
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(&msg_id.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        PacketBuilder { buf }
    }

    fn field(&mut self, ty: u32, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&ty.to_le_bytes());
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn null(&mut self) -> &mut Self {
        self.field(FIELD_NULL, &[])
    }

    pub fn dword(&mut self, value: u32) -> &mut Self {
        self.field(FIELD_DWORD, &value.to_le_bytes())
    }

    pub fn data(&mut self, value: &[u8]) -> &mut Self {
        self.field(FIELD_DATA, value)
    }

    /// UTF-16LE code units, length in bytes, no terminator.
    pub fn wstring(&mut self, value: &str) -> &mut Self {
        let mut bytes = Vec::with_capacity(value.len() * 2);
        for unit in value.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        self.field(FIELD_WSTRING, &bytes)
    }

    pub fn guid(&mut self, value: &Guid) -> &mut Self {
        self.field(FIELD_GUID, value.as_bytes())
    }

    pub fn opt_guid(&mut self, value: Option<&Guid>) -> &mut Self {
        match value {
            Some(g) => self.guid(g),
            None => self.null(),
        }
    }

    pub fn opt_data(&mut self, value: Option<&[u8]>) -> &mut Self {
        match value {
            Some(d) => self.data(d),
            None => self.null(),
        }
    }

    pub fn opt_wstring(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(s) => self.wstring(s),
            None => self.null(),
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        let value_len = (self.buf.len() - HEADER_SIZE) as u32;
        self.buf[4..8].copy_from_slice(&value_len.to_le_bytes());
        self.buf
    }
}

/// Zero-copy view over one received frame.
#[derive(Debug)]
pub struct PacketReader<'a> {
    msg_id: u32,
    fields: Vec<(u32, &'a [u8])>,
}

impl<'a> PacketReader<'a> {
    /// Parse the frame starting at `buf[0]`. The buffer must contain the
    /// whole frame (`Incomplete` otherwise); trailing bytes beyond the
    /// outer length are ignored.
    pub fn parse(buf: &'a [u8]) -> Result<PacketReader<'a>, PacketError> {
        let total = frame_size(buf).ok_or(PacketError::Incomplete)?;
        if total > MAX_PACKET_SIZE {
            return Err(PacketError::Malformed);
        }
        if buf.len() < total {
            return Err(PacketError::Incomplete);
        }

        let msg_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut fields = Vec::new();
        let mut at = HEADER_SIZE;

        while at < total {
            if total - at < HEADER_SIZE {
                return Err(PacketError::Malformed);
            }
            let ty = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            let len =
                u32::from_le_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]) as usize;
            at += HEADER_SIZE;
            if total - at < len {
                return Err(PacketError::Malformed);
            }
            fields.push((ty, &buf[at..at + len]));
            at += len;
        }

        Ok(PacketReader { msg_id, fields })
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    fn get(&self, index: usize) -> Result<(u32, &'a [u8]), PacketError> {
        self.fields
            .get(index)
            .copied()
            .ok_or(PacketError::MissingField(index))
    }

    pub fn is_null(&self, index: usize) -> Result<bool, PacketError> {
        Ok(self.get(index)?.0 == FIELD_NULL)
    }

    pub fn dword(&self, index: usize) -> Result<u32, PacketError> {
        let (ty, value) = self.get(index)?;
        if ty != FIELD_DWORD {
            return Err(PacketError::TypeMismatch(index));
        }
        let bytes: [u8; 4] = value.try_into().map_err(|_| PacketError::Malformed)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn data(&self, index: usize) -> Result<&'a [u8], PacketError> {
        let (ty, value) = self.get(index)?;
        if ty != FIELD_DATA {
            return Err(PacketError::TypeMismatch(index));
        }
        Ok(value)
    }

    pub fn wstring(&self, index: usize) -> Result<String, PacketError> {
        let (ty, value) = self.get(index)?;
        if ty != FIELD_WSTRING {
            return Err(PacketError::TypeMismatch(index));
        }
        if value.len() % 2 != 0 {
            return Err(PacketError::Malformed);
        }
        let units: Vec<u16> = value
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| PacketError::Malformed)
    }

    pub fn guid(&self, index: usize) -> Result<Guid, PacketError> {
        let (ty, value) = self.get(index)?;
        if ty != FIELD_GUID {
            return Err(PacketError::TypeMismatch(index));
        }
        let bytes: [u8; 16] = value.try_into().map_err(|_| PacketError::Malformed)?;
        Ok(Guid::from_bytes(bytes))
    }

    pub fn opt_guid(&self, index: usize) -> Result<Option<Guid>, PacketError> {
        if self.is_null(index)? {
            Ok(None)
        } else {
            Ok(Some(self.guid(index)?))
        }
    }

    pub fn opt_data(&self, index: usize) -> Result<Option<&'a [u8]>, PacketError> {
        if self.is_null(index)? {
            Ok(None)
        } else {
            Ok(Some(self.data(index)?))
        }
    }

    pub fn opt_wstring(&self, index: usize) -> Result<Option<String>, PacketError> {
        if self.is_null(index)? {
            Ok(None)
        } else {
            Ok(Some(self.wstring(index)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_field_types() {
        let guid = Guid::random();
        let mut b = PacketBuilder::new(42);
        b.null()
            .dword(0xDEADBEEF)
            .data(b"payload")
            .wstring("S\u{00e9}ance")
            .guid(&guid);
        let frame = b.finish();

        assert_eq!(frame_size(&frame), Some(frame.len()));

        let r = PacketReader::parse(&frame).unwrap();
        assert_eq!(r.msg_id(), 42);
        assert_eq!(r.num_fields(), 5);
        assert!(r.is_null(0).unwrap());
        assert_eq!(r.dword(1).unwrap(), 0xDEADBEEF);
        assert_eq!(r.data(2).unwrap(), b"payload");
        assert_eq!(r.wstring(3).unwrap(), "S\u{00e9}ance");
        assert_eq!(r.guid(4).unwrap(), guid);
    }

    #[test]
    fn empty_frame() {
        let frame = PacketBuilder::new(7).finish();
        let r = PacketReader::parse(&frame).unwrap();
        assert_eq!(r.msg_id(), 7);
        assert_eq!(r.num_fields(), 0);
    }

    #[test]
    fn incomplete_outer() {
        let mut b = PacketBuilder::new(1);
        b.dword(1);
        let frame = b.finish();
        assert_eq!(
            PacketReader::parse(&frame[..frame.len() - 1]).unwrap_err(),
            PacketError::Incomplete
        );
        assert_eq!(
            PacketReader::parse(&frame[..4]).unwrap_err(),
            PacketError::Incomplete
        );
    }

    #[test]
    fn truncated_inner_is_malformed() {
        let mut frame = PacketBuilder::new(1).finish();
        // Outer claims 12 bytes of fields but carries a bare header
        // with an impossible inner length.
        frame[4..8].copy_from_slice(&12u32.to_le_bytes());
        frame.extend_from_slice(&FIELD_DWORD.to_le_bytes());
        frame.extend_from_slice(&100u32.to_le_bytes());
        frame.extend_from_slice(&[0; 4]);
        assert_eq!(
            PacketReader::parse(&frame).unwrap_err(),
            PacketError::Malformed
        );
    }

    #[test]
    fn odd_wstring_is_malformed() {
        let mut b = PacketBuilder::new(1);
        b.field(FIELD_WSTRING, &[0x41, 0x00, 0x42]);
        let frame = b.finish();
        let r = PacketReader::parse(&frame).unwrap();
        assert_eq!(r.wstring(0).unwrap_err(), PacketError::Malformed);
    }

    #[test]
    fn indexed_access_errors() {
        let mut b = PacketBuilder::new(1);
        b.dword(5);
        let frame = b.finish();
        let r = PacketReader::parse(&frame).unwrap();
        assert_eq!(r.dword(1).unwrap_err(), PacketError::MissingField(1));
        assert_eq!(r.guid(0).unwrap_err(), PacketError::TypeMismatch(0));
        assert_eq!(r.data(0).unwrap_err(), PacketError::TypeMismatch(0));
    }

    #[test]
    fn optional_fields() {
        let mut b = PacketBuilder::new(9);
        b.opt_guid(None).opt_data(Some(b"x")).opt_wstring(None);
        let frame = b.finish();
        let r = PacketReader::parse(&frame).unwrap();
        assert_eq!(r.opt_guid(0).unwrap(), None);
        assert_eq!(r.opt_data(1).unwrap(), Some(&b"x"[..]));
        assert_eq!(r.opt_wstring(2).unwrap(), None);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut frame = PacketBuilder::new(1).finish();
        frame[4..8].copy_from_slice(&(MAX_PACKET_SIZE as u32).to_le_bytes());
        assert_eq!(
            PacketReader::parse(&frame).unwrap_err(),
            PacketError::Malformed
        );
    }
}
