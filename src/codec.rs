//! Compression codec selected from the destination key's extension

use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::TransferError;

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;
pub const DEFAULT_XZ_PRESET: u32 = 6;

/// Compression settings applied on the write direction
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    pub zstd_level: i32,
    pub xz_preset: u32,
}

impl Default for CodecOptions {
    fn default() -> Self {
        CodecOptions {
            zstd_level: DEFAULT_ZSTD_LEVEL,
            xz_preset: DEFAULT_XZ_PRESET,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// LZMA2 in an xz container, tag `.xz`
    Xz,
    /// Zstandard frames, tag `.zstd`
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 2] = [Compression::Xz, Compression::Zstd];

    /// Resolve the codec from the lower-cased extension of `key`.
    /// Fails before any I/O for anything but the known tags.
    pub fn from_key(key: &str) -> Result<Self, TransferError> {
        let ext = Path::new(key)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext.as_deref() {
            Some("xz") => Ok(Compression::Xz),
            Some("zstd") => Ok(Compression::Zstd),
            _ => Err(TransferError::UnsupportedCodec {
                key: key.to_string(),
            }),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Compression::Xz => ".xz",
            Compression::Zstd => ".zstd",
        }
    }

    /// Compress all of `input` into `output`, finish the codec stream and
    /// hand `output` back so the caller can close it.
    pub fn encode<W: Write>(
        &self,
        input: &mut dyn Read,
        output: W,
        options: &CodecOptions,
    ) -> io::Result<(u64, W)> {
        match self {
            Compression::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(output, options.xz_preset);
                let n = io::copy(input, &mut encoder)?;
                Ok((n, encoder.finish()?))
            }
            Compression::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(output, options.zstd_level)?;
                let n = io::copy(input, &mut encoder)?;
                Ok((n, encoder.finish()?))
            }
        }
    }

    /// Decompress `input` into `output`; returns decompressed bytes.
    pub fn decode(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<u64> {
        match self {
            Compression::Xz => {
                // Keeps parsing after the first stream, so trailing garbage fails.
                let mut decoder = xz2::read::XzDecoder::new_multi_decoder(input);
                io::copy(&mut decoder, output)
            }
            Compression::Zstd => {
                let mut decoder = zstd::stream::read::Decoder::new(input)?;
                io::copy(&mut decoder, output)
            }
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_key() {
        assert_eq!(Compression::from_key("backup.zstd").unwrap(), Compression::Zstd);
        assert_eq!(Compression::from_key("dir/Backup.ZSTD").unwrap(), Compression::Zstd);
        assert_eq!(Compression::from_key("site.tar.xz").unwrap(), Compression::Xz);

        for key in ["archive.tar.gz", "plain", "trailing.", "backup.zst"] {
            match Compression::from_key(key) {
                Err(TransferError::UnsupportedCodec { key: k }) => assert_eq!(k, key),
                other => panic!("expected unsupported codec for {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_compress_then_decompress() {
        let data: Vec<u8> = (0..200_000u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();

        for codec in Compression::ALL {
            for sample in [&data[..], &[0u8; 0][..], &b"hi"[..]] {
                let (read, compressed) = codec
                    .encode(&mut &sample[..], Vec::new(), &CodecOptions::default())
                    .unwrap();
                assert_eq!(read, sample.len() as u64);

                let mut out = Vec::new();
                codec.decode(&mut &compressed[..], &mut out).unwrap();
                assert_eq!(out, sample, "codec {codec}");
            }
        }
    }

    #[test]
    fn test_corrupt_stream_fails() {
        let garbage = b"definitely not a compressed stream".to_vec();
        for codec in Compression::ALL {
            let mut out = Vec::new();
            assert!(codec.decode(&mut &garbage[..], &mut out).is_err(), "codec {codec}");
        }
    }
}
