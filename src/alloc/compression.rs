//! Compression codec for allocator blocks and in-place buffers

use crate::error::{Error, Result};
use std::io::Write;

/// Compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Zstd,
}

/// Compress data using specified algorithm and zstd level
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm, level: i32) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => {
            let mut encoder = zstd::Encoder::new(Vec::with_capacity(data.len() / 4), level)
                .map_err(|e| Error::Compression(format!("Failed to create zstd encoder: {}", e)))?;
            encoder
                .write_all(data)
                .map_err(|e| Error::Compression(format!("Failed to compress: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| Error::Compression(format!("Failed to finish compression: {}", e)))
        }
    }
}

/// Decompress data using specified algorithm
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => zstd::decode_all(data)
            .map_err(|e| Error::Decompression(format!("Failed to decompress: {}", e))),
    }
}

/// Compressed size over original size; 1.0 for empty input
pub fn compression_ratio(original_size: usize, compressed_size: usize) -> f64 {
    if original_size > 0 {
        compressed_size as f64 / original_size as f64
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_none() -> Result<()> {
        let data = b"Hello, World!";
        let compressed = compress(data, CompressionAlgorithm::None, 3)?;
        assert_eq!(compressed, data);

        let decompressed = decompress(&compressed, CompressionAlgorithm::None)?;
        assert_eq!(decompressed, data);
        Ok(())
    }

    #[test]
    fn test_compression_zstd() -> Result<()> {
        let data = b"subtitle track 01 frame 0042 ".repeat(100);
        let compressed = compress(&data, CompressionAlgorithm::Zstd, 3)?;

        // Repetitive data must shrink
        assert!(compressed.len() < data.len());

        let decompressed = decompress(&compressed, CompressionAlgorithm::Zstd)?;
        assert_eq!(decompressed, data);
        Ok(())
    }

    #[test]
    fn test_corrupt_input_is_decompression_error() {
        let result = decompress(b"definitely not a zstd frame", CompressionAlgorithm::Zstd);
        match result {
            Err(e) => assert!(e.is_fatal()),
            Ok(_) => panic!("garbage input decoded"),
        }
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(1000, 250), 0.25);
        assert_eq!(compression_ratio(0, 10), 1.0);
    }
}
