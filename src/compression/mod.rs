#[cfg(feature = "zlib-compression")]
use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use std::io::Write;

use crate::error::{Error, ErrorKind, Result};

/// The compressor ids defined by the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum CompressorId {
    Noop = 0,
    Snappy = 1,
    Zlib = 2,
    Zstd = 3,
}

impl CompressorId {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressorId::Noop),
            1 => Ok(CompressorId::Snappy),
            2 => Ok(CompressorId::Zlib),
            3 => Ok(CompressorId::Zstd),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid compressor id: {}", other),
            }
            .into()),
        }
    }
}

/// Enum representing supported compressor algorithms.
/// Used for compressing and decompressing messages sent to and read from the server.
/// For compressors that take a `level`, use `None` to indicate the default level.
/// Higher `level` indicates more compression (and slower).
/// Requires the `zstd-compression` feature flag to use `Zstd`, the `zlib-compression` feature
/// flag to use `Zlib`, and the `snappy-compression` feature flag to use `Snappy`.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// Zstd compressor.
    /// See [`Zstd`](http://facebook.github.io/zstd/zstd_manual.html) for more information
    #[cfg(feature = "zstd-compression")]
    Zstd {
        /// Zstd compression level
        level: Option<i32>,
    },
    /// Zlib compressor.
    /// See [`Zlib`](https://zlib.net/) for more information.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        /// Zlib compression level
        level: Option<i32>,
    },
    /// Snappy compressor.
    /// See [`Snappy`](http://google.github.io/snappy/) for more information.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
impl Compressor {
    #[cfg(feature = "zlib-compression")]
    pub(crate) fn write_zlib_level(&mut self, level: i32) -> Result<()> {
        if let Compressor::Zlib {
            level: ref mut zlib_level,
        } = *self
        {
            *zlib_level = if level == -1 { None } else { Some(level) }
        }
        Ok(())
    }

    #[cfg(feature = "zstd-compression")]
    pub(crate) fn write_zstd_level(&mut self, level: i32) -> Result<()> {
        if let Compressor::Zstd {
            level: ref mut zstd_level,
        } = *self
        {
            *zstd_level = if level == -1 { None } else { Some(level) }
        }
        Ok(())
    }

    pub(crate) fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Compressor::Zlib { level: None }),
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Compressor::Zstd { level: None }),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Compressor::Snappy),
            other => Err(Error::from(ErrorKind::InvalidArgument {
                message: format!("Invalid compressor: {} was supplied but is invalid", other),
            })),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => "zstd",
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => "zlib",
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => "snappy",
        }
    }

    pub(crate) fn id(&self) -> CompressorId {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => CompressorId::Zstd,
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => CompressorId::Zlib,
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => CompressorId::Snappy,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        #[allow(unreachable_patterns)]
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level: Some(level) }
                if !zstd::compression_level_range().contains(&level) =>
            {
                Err(Error::from(ErrorKind::InvalidArgument {
                    message: format!("invalid zstd level: {}", level),
                }))
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level: Some(level) } if !(-1..10).contains(&level) => {
                Err(Error::from(ErrorKind::InvalidArgument {
                    message: format!("invalid zlib level: {}", level),
                }))
            }
            _ => Ok(()),
        }
    }

    /// Compress `source` with this compressor's algorithm and level.
    pub(crate) fn compress(&self, source: &[u8]) -> Result<Vec<u8>> {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level } => {
                zstd::stream::encode_all(source, level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL))
                    .map_err(|e| {
                        Error::from(ErrorKind::Internal {
                            message: format!("an error occurred compressing with zstd: {}", e),
                        })
                    })
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level } => {
                let level = match level {
                    Some(level) => Compression::new(level.max(0) as u32),
                    None => Compression::default(),
                };
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(source).map_err(Error::network)?;
                encoder.finish().map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("an error occurred compressing with zlib: {}", e),
                    })
                })
            }
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => {
                // The server doesn't use the snappy frame format, so raw encoding is required
                // here. Likewise for decoding.
                let mut compressor = snap::raw::Encoder::new();
                compressor.compress_vec(source).map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("an error occurred compressing with snappy: {}", e),
                    })
                })
            }
        }
    }
}

/// Decompresses a payload given the compressor id from the wire.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Decoder {
    #[cfg(feature = "zstd-compression")]
    Zstd,
    #[cfg(feature = "zlib-compression")]
    Zlib,
    #[cfg(feature = "snappy-compression")]
    Snappy,
    Noop,
}

impl Decoder {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match CompressorId::from_u8(id)? {
            CompressorId::Noop => Ok(Decoder::Noop),
            #[cfg(feature = "snappy-compression")]
            CompressorId::Snappy => Ok(Decoder::Snappy),
            #[cfg(feature = "zlib-compression")]
            CompressorId::Zlib => Ok(Decoder::Zlib),
            #[cfg(feature = "zstd-compression")]
            CompressorId::Zstd => Ok(Decoder::Zstd),
            #[allow(unreachable_patterns)]
            other => Err(ErrorKind::InvalidResponse {
                message: format!(
                    "the server sent a reply compressed with {:?}, but the matching compression \
                     feature is not enabled",
                    other
                ),
            }
            .into()),
        }
    }

    pub(crate) fn decode(self, source: &[u8]) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "zstd-compression")]
            Decoder::Zstd => {
                let mut ret = Vec::new();
                zstd::stream::copy_decode(source, &mut ret).map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("Could not decode using zstd decoder: {}", e),
                    })
                })?;
                Ok(ret)
            }
            #[cfg(feature = "zlib-compression")]
            Decoder::Zlib => {
                let mut decoder = ZlibDecoder::new(Vec::new());
                decoder.write_all(source).map_err(Error::network)?;
                decoder.finish().map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("Could not decode using zlib decoder: {}", e),
                    })
                })
            }
            #[cfg(feature = "snappy-compression")]
            Decoder::Snappy => {
                let mut decompressor = snap::raw::Decoder::new();
                decompressor.decompress_vec(source).map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("Could not decode using snappy decoder: {}", e),
                    })
                })
            }
            Decoder::Noop => Ok(source.to_vec()),
        }
    }
}

#[cfg(all(test, feature = "zlib-compression"))]
mod test {
    use super::*;

    #[test]
    fn zlib_round_trip() {
        let compressor = Compressor::Zlib { level: Some(4) };
        let payload = b"a moderately compressible payload payload payload".to_vec();
        let compressed = compressor.compress(&payload).unwrap();
        let decoded = Decoder::Zlib.decode(&compressed).unwrap();
        assert_eq!(decoded, payload);
    }
}
