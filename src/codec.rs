//! 패킷 본문과 엔트리 payload가 공유하는 바이트 인코딩 도우미
//!
//! - 정수: little-endian
//! - 길이/개수: LCB (Length-Coded Binary)
//! - 문자열/바이트열: LCB 길이 + 본문

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

/// LCB (Length-Coded Binary) 읽기
pub fn read_lcb(cursor: &mut Cursor<&[u8]>) -> io::Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => cursor.read_u64::<LittleEndian>(),
        0xfb | 0xff => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid length-coded prefix 0x{:02x}", byte),
        )),
    }
}

/// LCB 쓰기
pub fn write_lcb<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    if value <= 0xfa {
        writer.write_u8(value as u8)
    } else if value <= 0xffff {
        writer.write_u8(0xfc)?;
        writer.write_u16::<LittleEndian>(value as u16)
    } else if value <= 0xff_ffff {
        writer.write_u8(0xfd)?;
        writer.write_u24::<LittleEndian>(value as u32)
    } else {
        writer.write_u8(0xfe)?;
        writer.write_u64::<LittleEndian>(value)
    }
}

/// 남은 바이트 수
pub fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

/// 길이가 붙은 바이트열 읽기
pub fn read_blob(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = read_lcb(cursor)? as usize;
    // 선언된 길이가 남은 입력보다 크면 할당 전에 거부
    if len > remaining(cursor) {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("declared length {} exceeds remaining {} bytes", len, remaining(cursor)),
        ));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// 길이가 붙은 UTF-8 문자열 읽기
pub fn read_string(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let bytes = read_blob(cursor)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// 길이가 붙은 문자열 읽기. 잘못된 UTF-8은 U+FFFD로 대체
pub fn read_string_lossy(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let bytes = read_blob(cursor)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// 길이가 붙은 바이트열 쓰기
pub fn write_blob<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_lcb(writer, bytes.len() as u64)?;
    writer.write_all(bytes)
}

/// 길이가 붙은 문자열 쓰기
pub fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_blob(writer, value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcb_widths() {
        for (value, width) in [(0u64, 1usize), (250, 1), (251, 3), (70_000, 4), (1 << 40, 9)] {
            let mut buf = Vec::new();
            write_lcb(&mut buf, value).unwrap();
            assert_eq!(buf.len(), width, "width of {}", value);
            let mut cursor = Cursor::new(buf.as_slice());
            assert_eq!(read_lcb(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn test_invalid_lcb_prefix() {
        let data = [0xffu8];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(read_lcb(&mut cursor).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_blob_length_exceeds_input() {
        // 길이 100을 선언했지만 2 바이트만 존재
        let data = [100u8, 0x61, 0x62];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(read_blob(&mut cursor).unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let data = [2u8, 0xc3, 0x28];
        let mut cursor = Cursor::new(&data[..]);
        assert!(read_string(&mut cursor).is_err());
    }

    #[test]
    fn test_lossy_string_replaces_invalid_utf8() {
        let data = [3u8, 0x61, 0xff, 0x62];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(read_string_lossy(&mut cursor).unwrap(), "a\u{FFFD}b");
        assert_eq!(remaining(&cursor), 0);
    }
}
