use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use rust_lzo::{LZOContext, LZOError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logservice::log_debug;
use crate::upkreader::PACKAGE_TAG;

const SENDER: &str = "Decompress";

/// Nominal uncompressed block size; every compressed stream declares it.
pub const MAX_BLOCK_SIZE: u32 = 0x0002_0000;

/// Failure while rebuilding a compressed stream. The two variants feed the
/// package error taxonomy: a layout sanity failure and a failed decode are
/// reported differently.
#[derive(Debug, Error)]
pub enum DecompressError {
    /// The declared stream layout failed a sanity check (bad magic, bad
    /// block size, short regeneration, truncation).
    #[error("{0}")]
    BadStream(String),
    /// The block decoder itself gave up on its input.
    #[error("{0}")]
    DecoderFailed(String),
}

impl From<std::io::Error> for DecompressError {
    fn from(err: std::io::Error) -> DecompressError {
        DecompressError::BadStream(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum CompressionMethod {
    None = 0,
    Zlib = 1,
    Lzo = 2,
    Lzx = 4,
}

impl TryFrom<u32> for CompressionMethod {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Zlib),
            2 => Ok(CompressionMethod::Lzo),
            4 => Ok(CompressionMethod::Lzx),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompressedChunkBlock {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

/// Leading header of a fully compressed package file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressedChunkHeader {
    pub signature: u32,
    pub block_size: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub num_blocks: u32,
    pub blocks: Vec<CompressedChunkBlock>,
}

/// Chunk placement entry declared by the package summary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompressedChunk {
    pub uncompressed_offset: u32,
    pub uncompressed_size: u32,
    pub compressed_offset: u32,
    pub compressed_size: u32,
}

pub fn read_compressed_chunks<R: Read>(
    reader: &mut R,
    count: usize,
) -> std::io::Result<Vec<CompressedChunk>> {
    let mut chunks = Vec::with_capacity(count);
    for _ in 0..count {
        chunks.push(CompressedChunk {
            uncompressed_offset: reader.read_u32::<LittleEndian>()?,
            uncompressed_size: reader.read_u32::<LittleEndian>()?,
            compressed_offset: reader.read_u32::<LittleEndian>()?,
            compressed_size: reader.read_u32::<LittleEndian>()?,
        });
    }
    Ok(chunks)
}

fn decompress_block(
    method: CompressionMethod,
    src: &[u8],
    expected: usize,
) -> Result<Vec<u8>, DecompressError> {
    match method {
        CompressionMethod::Lzo => {
            let mut out = vec![0u8; expected];
            let written = {
                let (decompressed, err) = LZOContext::decompress_to_slice(src, &mut out);
                if err != LZOError::OK {
                    return Err(DecompressError::DecoderFailed(
                        "LZO block decompression failed".into(),
                    ));
                }
                decompressed.len()
            };
            if written != expected {
                return Err(DecompressError::BadStream(format!(
                    "LZO block regenerated {written} bytes, expected {expected}"
                )));
            }
            Ok(out)
        }
        CompressionMethod::Zlib => {
            let mut decoder = ZlibDecoder::new(src);
            let mut buf = vec![0u8; expected];
            match decoder.read_exact(&mut buf) {
                Ok(()) => Ok(buf),
                // EOF means the block inflated to less than it declared;
                // anything else is the decoder rejecting its input.
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    Err(DecompressError::BadStream(
                        "zlib block regenerated fewer bytes than declared".into(),
                    ))
                }
                Err(err) => Err(DecompressError::DecoderFailed(format!(
                    "zlib block decompression failed: {err}"
                ))),
            }
        }
        other => Err(DecompressError::DecoderFailed(format!(
            "cannot decompress {other:?} compressed data"
        ))),
    }
}

/// Decodes one chunk stream at the reader's current position: signature,
/// nominal block size, a (compressed, uncompressed) pair for the whole chunk,
/// per-block pairs, then the block payloads back to back.
pub fn read_chunk_stream<R: Read>(
    reader: &mut R,
    method: CompressionMethod,
) -> Result<Vec<u8>, DecompressError> {
    let tag = reader.read_u32::<LittleEndian>()?;
    if tag != PACKAGE_TAG {
        return Err(DecompressError::BadStream(format!(
            "missing 0x{PACKAGE_TAG:08X} signature in chunk stream"
        )));
    }
    let block_size = reader.read_u32::<LittleEndian>()?;
    if block_size != MAX_BLOCK_SIZE {
        return Err(DecompressError::BadStream("incorrect max block size".into()));
    }
    let _chunk_compressed = reader.read_u32::<LittleEndian>()?;
    let chunk_uncompressed = reader.read_u32::<LittleEndian>()?;
    let num_blocks = chunk_uncompressed.div_ceil(block_size);
    if num_blocks < 1 {
        return Err(DecompressError::BadStream("chunk declares no data".into()));
    }
    log_debug(&format!("num_blocks = {num_blocks}"), SENDER);
    let mut blocks = Vec::with_capacity(num_blocks as usize);
    for _ in 0..num_blocks {
        let block = CompressedChunkBlock {
            compressed_size: reader.read_u32::<LittleEndian>()?,
            uncompressed_size: reader.read_u32::<LittleEndian>()?,
        };
        log_debug(
            &format!(
                "Compressed size = {}\tUncompressed size = {}",
                block.compressed_size, block.uncompressed_size
            ),
            SENDER,
        );
        blocks.push(block);
    }
    let mut out = Vec::with_capacity(chunk_uncompressed as usize);
    for block in &blocks {
        let mut src = vec![0u8; block.compressed_size as usize];
        reader.read_exact(&mut src)?;
        let data = decompress_block(method, &src, block.uncompressed_size as usize)?;
        out.extend_from_slice(&data);
    }
    if out.len() != chunk_uncompressed as usize {
        return Err(DecompressError::BadStream(
            "chunk did not regenerate its declared size".into(),
        ));
    }
    Ok(out)
}

/// Rebuilds the logical stream of a fully compressed package file. The whole
/// file is one chunk stream starting at offset zero; fully compressed files
/// are always LZO.
pub fn decompress_fully_compressed(stream: &[u8]) -> Result<Vec<u8>, DecompressError> {
    let mut cursor = Cursor::new(stream);
    log_debug("Decompressing fully compressed package...", SENDER);
    read_chunk_stream(&mut cursor, CompressionMethod::Lzo)
}

/// Rebuilds the logical stream of a package with summary-declared chunks.
/// `summary_prefix` is the re-serialized summary with its compression fields
/// cleared; the decompressed chunks are appended to it in declaration order.
pub fn decompress_chunked(
    stream: &[u8],
    chunks: &[CompressedChunk],
    method: CompressionMethod,
    summary_prefix: Vec<u8>,
) -> Result<Vec<u8>, DecompressError> {
    let mut out = summary_prefix;
    for (i, chunk) in chunks.iter().enumerate() {
        log_debug(&format!("Decompressing chunk #{i}"), SENDER);
        let mut cursor = Cursor::new(stream);
        cursor.seek(SeekFrom::Start(chunk.compressed_offset as u64))?;
        let data = read_chunk_stream(&mut cursor, method)?;
        out.extend_from_slice(&data);
    }
    log_debug("Package decompressed successfully.", SENDER);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn build_chunk_stream(data: &[u8], compress: impl Fn(&[u8]) -> Vec<u8>) -> Vec<u8> {
        let blocks: Vec<&[u8]> = data.chunks(MAX_BLOCK_SIZE as usize).collect();
        let compressed: Vec<Vec<u8>> = blocks.iter().map(|b| compress(b)).collect();
        let total_compressed: usize = compressed.iter().map(|c| c.len()).sum();
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(PACKAGE_TAG).unwrap();
        out.write_u32::<LittleEndian>(MAX_BLOCK_SIZE).unwrap();
        out.write_u32::<LittleEndian>(total_compressed as u32).unwrap();
        out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        for (block, comp) in blocks.iter().zip(&compressed) {
            out.write_u32::<LittleEndian>(comp.len() as u32).unwrap();
            out.write_u32::<LittleEndian>(block.len() as u32).unwrap();
        }
        for comp in &compressed {
            out.extend_from_slice(comp);
        }
        out
    }

    // A pure-literal LZO1X stream: (length + 17), the literals, then the
    // end-of-stream marker 11 00 00.
    fn lzo_literal_stream(data: &[u8]) -> Vec<u8> {
        assert!(data.len() >= 4 && data.len() <= 238);
        let mut out = vec![data.len() as u8 + 17];
        out.extend_from_slice(data);
        out.extend_from_slice(&[0x11, 0x00, 0x00]);
        out
    }

    #[test]
    fn zlib_chunk_stream_of_three_blocks() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let stream = build_chunk_stream(&data, zlib_compress);
        let mut cursor = Cursor::new(stream.as_slice());
        let restored = read_chunk_stream(&mut cursor, CompressionMethod::Zlib).unwrap();
        assert_eq!(restored.len(), 300_000);
        assert_eq!(restored, data);
    }

    #[test]
    fn lzo_chunk_stream_round_trip() {
        let data = *b"NoneNone";
        let stream = build_chunk_stream(&data, |b| lzo_literal_stream(b));
        let mut cursor = Cursor::new(stream.as_slice());
        let restored = read_chunk_stream(&mut cursor, CompressionMethod::Lzo).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn chunk_stream_rejects_bad_signature() {
        let data = vec![0u8; 32];
        let mut stream = build_chunk_stream(&data, zlib_compress);
        stream[0] ^= 0xFF;
        let mut cursor = Cursor::new(stream.as_slice());
        let err = read_chunk_stream(&mut cursor, CompressionMethod::Zlib).unwrap_err();
        assert!(matches!(err, DecompressError::BadStream(_)));
    }

    #[test]
    fn chunk_stream_rejects_bad_block_size() {
        let data = vec![7u8; 32];
        let mut stream = build_chunk_stream(&data, zlib_compress);
        stream[4..8].copy_from_slice(&0x1000u32.to_le_bytes());
        let mut cursor = Cursor::new(stream.as_slice());
        let err = read_chunk_stream(&mut cursor, CompressionMethod::Zlib).unwrap_err();
        assert!(matches!(err, DecompressError::BadStream(_)));
    }

    #[test]
    fn block_must_regenerate_declared_size() {
        let data = vec![3u8; 64];
        let mut stream = build_chunk_stream(&data, zlib_compress);
        // Claim the block inflates to more than it actually does.
        stream[12..16].copy_from_slice(&128u32.to_le_bytes());
        stream[20..24].copy_from_slice(&128u32.to_le_bytes());
        let mut cursor = Cursor::new(stream.as_slice());
        let err = read_chunk_stream(&mut cursor, CompressionMethod::Zlib).unwrap_err();
        assert!(matches!(err, DecompressError::BadStream(_)));
    }

    #[test]
    fn corrupt_lzo_block_is_a_decoder_failure() {
        let data = vec![5u8; 8];
        // Payload that is not a valid LZO1X stream at all.
        let stream = build_chunk_stream(&data, |_| vec![0x00, 0x00]);
        let mut cursor = Cursor::new(stream.as_slice());
        let err = read_chunk_stream(&mut cursor, CompressionMethod::Lzo).unwrap_err();
        assert!(matches!(err, DecompressError::DecoderFailed(_)));
    }

    #[test]
    fn corrupt_zlib_block_is_a_decoder_failure() {
        let data = vec![5u8; 8];
        let stream = build_chunk_stream(&data, |_| vec![0xFF, 0xFF, 0xFF, 0xFF]);
        let mut cursor = Cursor::new(stream.as_slice());
        let err = read_chunk_stream(&mut cursor, CompressionMethod::Zlib).unwrap_err();
        assert!(matches!(err, DecompressError::DecoderFailed(_)));
    }

    #[test]
    fn chunked_decode_prepends_summary_prefix() {
        let data = vec![0xABu8; 100];
        let chunk_stream = build_chunk_stream(&data, zlib_compress);
        let mut file = vec![0u8; 16];
        let offset = file.len() as u32;
        file.extend_from_slice(&chunk_stream);
        let chunks = [CompressedChunk {
            uncompressed_offset: 0,
            uncompressed_size: 100,
            compressed_offset: offset,
            compressed_size: chunk_stream.len() as u32,
        }];
        let prefix = vec![1u8, 2, 3, 4];
        let out = decompress_chunked(&file, &chunks, CompressionMethod::Zlib, prefix).unwrap();
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(&out[4..], data.as_slice());
    }

    #[test]
    fn lzx_method_is_rejected() {
        let err = decompress_block(CompressionMethod::Lzx, &[0u8; 4], 4).unwrap_err();
        assert!(matches!(err, DecompressError::DecoderFailed(_)));
        assert_eq!(CompressionMethod::try_from(4u32), Ok(CompressionMethod::Lzx));
        assert_eq!(CompressionMethod::try_from(3u32), Err(3));
    }
}
