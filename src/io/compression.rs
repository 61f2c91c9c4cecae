//! Pluggable compression codecs for snapshot files.
//!
//! Snapshot dumps arrive as `.gz` (sometimes `.zst`, `.bz2` or `.xz`) files.
//! Codecs are looked up in a global registry, first by file extension and then
//! by magic bytes, so a misnamed file still decompresses.
//!
//! Built-in codecs, each behind a feature flag:
//! - **Gzip** (`.gz`, `.gzip`), always available through `flate2`
//! - **Zstd** (`.zst`, `.zstd`), feature `compression-zstd`
//! - **Bzip2** (`.bz2`, `.bzip2`), feature `compression-bzip2`
//! - **Xz** (`.xz`), feature `compression-xz`
//!
//! ```no_run
//! use snapflow::io::compression::decompress_file;
//! # fn main() -> anyhow::Result<()> {
//! let bytes = decompress_file("works/part_000.jsonl.gz", "extract/works/part_000.jsonl")?;
//! # Ok(())
//! # }
//! ```
//!
//! Custom codecs implement [`CompressionCodec`] and are added with
//! [`register_codec`].

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

static CODEC_REGISTRY: RwLock<Option<Vec<Arc<dyn CompressionCodec>>>> = RwLock::new(None);

fn builtin_codecs() -> Vec<Arc<dyn CompressionCodec>> {
    vec![
        Arc::new(GzipCodec),
        #[cfg(feature = "compression-zstd")]
        Arc::new(ZstdCodec),
        #[cfg(feature = "compression-bzip2")]
        Arc::new(Bzip2Codec),
        #[cfg(feature = "compression-xz")]
        Arc::new(XzCodec),
    ]
}

fn registry() -> Vec<Arc<dyn CompressionCodec>> {
    // The registry holds plain data, so a poisoned lock is still usable.
    let mut lock = CODEC_REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(builtin_codecs).clone()
}

/// Register a custom compression codec globally.
///
/// ```
/// use snapflow::io::compression::{register_codec, CompressionCodec};
/// use std::io::{Read, Write};
/// # use std::sync::Arc;
///
/// struct Identity;
/// impl CompressionCodec for Identity {
///     fn name(&self) -> &str { "identity" }
///     fn extensions(&self) -> &[&str] { &[".ident"] }
///     fn magic_bytes(&self) -> Option<&[u8]> { None }
///     fn wrap_reader_dyn(&self, r: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> { Ok(r) }
///     fn wrap_writer_dyn(&self, w: Box<dyn Write>) -> std::io::Result<Box<dyn Write>> { Ok(w) }
/// }
///
/// register_codec(Arc::new(Identity));
/// ```
pub fn register_codec(codec: Arc<dyn CompressionCodec>) {
    let mut lock = CODEC_REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(builtin_codecs).push(codec);
}

/// A compression algorithm.
///
/// Stored in a global registry and shared between worker threads.
pub trait CompressionCodec: Send + Sync {
    /// Codec name, e.g. `"gzip"`.
    fn name(&self) -> &str;

    /// Lowercase extensions with the leading dot, e.g. `&[".gz"]`.
    fn extensions(&self) -> &[&str];

    /// Signature at the start of a compressed stream, if the format has one.
    fn magic_bytes(&self) -> Option<&[u8]>;

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> io::Result<Box<dyn Read>>;

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> io::Result<Box<dyn Write>>;
}

/// Find the codec whose extension matches `path`, case-insensitively.
pub fn codec_for_path(path: impl AsRef<Path>) -> Option<Arc<dyn CompressionCodec>> {
    let name = path.as_ref().to_string_lossy().to_lowercase();
    registry()
        .into_iter()
        .find(|c| c.extensions().iter().any(|ext| name.ends_with(ext)))
}

fn codec_for_magic<R: BufRead>(reader: &mut R) -> Option<Arc<dyn CompressionCodec>> {
    let buf = reader.fill_buf().ok()?;
    if buf.is_empty() {
        return None;
    }
    registry()
        .into_iter()
        .find(|c| c.magic_bytes().is_some_and(|m| buf.starts_with(m)))
}

/// `path` with its compression extension removed, if it has one.
///
/// `works/part_000.jsonl.gz` becomes `works/part_000.jsonl`; a path without a
/// known codec extension is returned unchanged.
#[must_use]
pub fn strip_codec_extension(path: &Path) -> PathBuf {
    let Some(codec) = codec_for_path(path) else {
        return path.to_path_buf();
    };
    let s = path.to_string_lossy();
    let lower = s.to_lowercase();
    codec
        .extensions()
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map_or_else(|| path.to_path_buf(), |ext| PathBuf::from(&s[..s.len() - ext.len()]))
}

/// Wrap `reader` with the decompressor matching `path_hint`.
///
/// The extension is checked first, then the stream's magic bytes. Streams
/// matching neither are returned as-is.
///
/// # Errors
/// Fails if the codec cannot initialize on the stream.
pub fn auto_detect_reader<R: Read + 'static>(reader: R, path_hint: impl AsRef<Path>) -> Result<Box<dyn Read>> {
    if let Some(codec) = codec_for_path(&path_hint) {
        return codec
            .wrap_reader_dyn(Box::new(reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }

    let mut buffered = BufReader::new(reader);
    if let Some(codec) = codec_for_magic(&mut buffered) {
        return codec
            .wrap_reader_dyn(Box::new(buffered))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }
    Ok(Box::new(buffered))
}

/// Wrap `writer` with the compressor matching `path_hint`'s extension.
///
/// # Errors
/// Fails if the codec cannot initialize.
pub fn auto_detect_writer<W: Write + 'static>(writer: W, path_hint: impl AsRef<Path>) -> Result<Box<dyn Write>> {
    if let Some(codec) = codec_for_path(&path_hint) {
        return codec
            .wrap_writer_dyn(Box::new(writer))
            .with_context(|| format!("wrap writer with {} codec", codec.name()));
    }
    Ok(Box::new(BufWriter::new(writer)))
}

/// Decompress `src` into `dst`, creating parent directories. Returns the
/// number of bytes written.
///
/// # Errors
/// Fails on any read, decode or write error. A partially written `dst` is
/// removed.
pub fn decompress_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<u64> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let input = File::open(src).with_context(|| format!("open {}", src.display()))?;
    let mut reader = auto_detect_reader(input, src)?;
    let out = File::create(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut writer = BufWriter::new(out);

    let copied = io::copy(&mut reader, &mut writer).and_then(|n| writer.flush().map(|()| n));
    match copied {
        Ok(n) => Ok(n),
        Err(e) => {
            let _ = fs::remove_file(dst);
            Err(e).with_context(|| format!("decompress {} -> {}", src.display(), dst.display()))
        }
    }
}

struct GzipCodec;

impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".gzip"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x1f, 0x8b])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> io::Result<Box<dyn Read>> {
        // Multi-member archives are common in concatenated dumps.
        Ok(Box::new(flate2::read::MultiGzDecoder::new(reader)))
    }

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> io::Result<Box<dyn Write>> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        Ok(Box::new(GzEncoder::new(writer, Compression::default())))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extensions(&self) -> &[&str] {
        &[".zst", ".zstd"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x28, 0xb5, 0x2f, 0xfd])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> io::Result<Box<dyn Read>> {
        zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as Box<dyn Read>)
    }

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> io::Result<Box<dyn Write>> {
        zstd::stream::write::Encoder::new(writer, 3).map(|e| Box::new(e.auto_finish()) as Box<dyn Write>)
    }
}

#[cfg(feature = "compression-bzip2")]
struct Bzip2Codec;

#[cfg(feature = "compression-bzip2")]
impl CompressionCodec for Bzip2Codec {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn extensions(&self) -> &[&str] {
        &[".bz2", ".bzip2"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x42, 0x5a, 0x68])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(bzip2::read::BzDecoder::new(reader)))
    }

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(bzip2::write::BzEncoder::new(writer, bzip2::Compression::default())))
    }
}

#[cfg(feature = "compression-xz")]
struct XzCodec;

#[cfg(feature = "compression-xz")]
impl CompressionCodec for XzCodec {
    fn name(&self) -> &str {
        "xz"
    }

    fn extensions(&self) -> &[&str] {
        &[".xz"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(xz2::read::XzDecoder::new(reader)))
    }

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(xz2::write::XzEncoder::new(writer, 6)))
    }
}
