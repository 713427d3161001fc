//! Chunked binary checkpoint format.
//!
//! Layout: 8-byte magic, `u32` version, then any number of chunks. Each
//! chunk is a 4-byte tag, a `u32` length and an LZ4-compressed payload
//! preceded by its uncompressed length. Readers skip tags they do not know.

use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"TRACTUS1";
/// Image format version written and accepted by this crate.
pub const VERSION_CURRENT: u32 = 1;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

/// Sink that only counts bytes, for sizing a checkpoint without buffering it.
pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f64_le<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Length-prefixed run of `f64` values.
pub fn write_f64_seq<W: Write, I>(w: &mut W, len: usize, values: I) -> io::Result<()>
where
    I: IntoIterator<Item = f64>,
{
    let len = u64::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "sequence too long"))?;
    write_u64_le(w, len)?;
    for v in values {
        write_f64_le(w, v)?;
    }
    Ok(())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    Ok(read_exact::<1, _>(r)?[0])
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f64_le<R: Read>(r: &mut R) -> io::Result<f64> {
    Ok(f64::from_le_bytes(read_exact::<8, _>(r)?))
}

/// Read a sequence written by [`write_f64_seq`], refusing more than
/// `max_len` values.
pub fn read_f64_seq<R: Read>(r: &mut R, max_len: usize) -> io::Result<Vec<f64>> {
    let len = read_u64_le(r)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|n| *n <= max_len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "sequence length out of range"))?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(read_f64_le(r)?);
    }
    Ok(out)
}

/// Write a chunk whose payload is LZ4-compressed and preceded by the
/// uncompressed length (u32).
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read and decompress the body of a chunk whose header was just read.
pub fn read_chunk_payload_lz4<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    if compressed.len() + 4 != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated chunk payload",
        ));
    }
    decompress_lz4(&compressed, uncompressed_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_payload_survives_compression() {
        let mut payload = Vec::new();
        write_f64_seq(&mut payload, 3, [1.5, -2.0, f64::NAN]).unwrap();

        let mut buf = Vec::new();
        write_chunk_lz4(&mut buf, *b"TEST", &payload).unwrap();

        let mut r = io::Cursor::new(buf);
        let (tag, len) = read_chunk_header(&mut r).unwrap();
        assert_eq!(&tag, b"TEST");
        let body = read_chunk_payload_lz4(&mut r, len).unwrap();
        let values = read_f64_seq(&mut io::Cursor::new(body), 3).unwrap();
        assert_eq!(values[..2], [1.5, -2.0]);
        assert!(values[2].is_nan());
    }

    #[test]
    fn oversized_sequences_are_refused() {
        let mut payload = Vec::new();
        write_f64_seq(&mut payload, 4, [0.0; 4]).unwrap();
        let err = read_f64_seq(&mut io::Cursor::new(payload), 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        let mut buf = Vec::new();
        write_chunk_lz4(&mut buf, *b"TEST", &[7u8; 64]).unwrap();
        buf.truncate(buf.len() - 2);
        let mut r = io::Cursor::new(buf);
        let (_, len) = read_chunk_header(&mut r).unwrap();
        assert!(read_chunk_payload_lz4(&mut r, len).is_err());
    }

    #[test]
    fn counting_writer_counts() {
        let mut w = CountingWriter::new();
        write_u64_le(&mut w, 1).unwrap();
        write_u8(&mut w, 1).unwrap();
        assert_eq!(w.written(), 9);
    }
}
