//! Open an image and stream its payload out

use crate::{
    digest::HashReader,
    error::{Error, Result},
    image::{header::ImageHeader, FORMAT_VERSION, HEADER_MAX_BYTES, MAGIC, PREFIX_LEN},
};
use flate2::bufread::ZlibDecoder;
use std::{
    fs,
    io::{self, BufReader, Read},
    path::{Component, Path},
};

/// Lazy byte source yielding the decompressed tar stream of an image.
///
/// Bytes are pulled from the file and inflated on demand; the digest of
/// everything that passed through is available once the stream is drained.
#[derive(Debug)]
pub struct Payload {
    inner: HashReader<ZlibDecoder<BufReader<fs::File>>>,
}

impl Payload {
    /// Hex SHA-256 and byte count of the decompressed data read so far.
    pub fn into_digest(self) -> (String, u64) {
        self.inner.finish()
    }
}

impl Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Read and validate the fixed prefix and header, and hand back a lazy
/// reader over the payload.
///
/// Only the prefix and the declared header bytes are consumed here; the
/// payload stays on disk until the caller pulls it. The decoder runs over
/// the same buffered handle the header was read from, so bytes that were
/// buffered during header parsing are inflated first.
pub fn open(path: &Path) -> Result<(ImageHeader, Payload)> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut prefix = [0u8; PREFIX_LEN];
    read_exact_or_truncated(&mut reader, &mut prefix, "file prefix")?;

    let magic: [u8; 4] = prefix[0..4].try_into().unwrap();
    if &magic != MAGIC {
        return Err(Error::BadMagic { found: magic });
    }
    let version = u32::from_be_bytes(prefix[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let header_len = u32::from_be_bytes(prefix[8..12].try_into().unwrap());
    if header_len < 2 {
        return Err(Error::HeaderTooSmall(header_len));
    }
    if header_len > HEADER_MAX_BYTES {
        return Err(Error::HeaderTooLarge(header_len));
    }

    let mut header_bytes = vec![0u8; header_len as usize];
    read_exact_or_truncated(&mut reader, &mut header_bytes, "header")?;
    let header: ImageHeader = serde_json::from_slice(&header_bytes)?;
    header.validate()?;

    let inner = HashReader::new(ZlibDecoder::new(reader));
    Ok((header, Payload { inner }))
}

fn read_exact_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated(what)
        } else {
            Error::UnknownIo(e)
        }
    })
}

/// Unpack the payload into `dest`, enforcing that nothing is created
/// outside it. Entry modes recorded in the archive are preserved.
///
/// Returns the hex SHA-256 and byte count of the full decompressed stream,
/// for comparison against the header `hash`.
pub fn extract(payload: Payload, dest: &Path) -> Result<(String, u64)> {
    let mut ar = tar::Archive::new(payload);
    ar.set_preserve_permissions(true);
    ar.set_unpack_xattrs(false);

    for entry in ar.entries().map_err(Error::Unpack)? {
        let mut entry = entry.map_err(Error::Unpack)?;
        let path = entry.path().map_err(Error::Unpack)?.into_owned();
        check_entry_path(&path)?;
        check_link_target(&path, &entry)?;
        if !entry.unpack_in(dest).map_err(Error::Unpack)? {
            return Err(Error::UnsafePath(path));
        }
    }

    // The extractor stops at the end-of-archive marker; drain the trailing
    // padding so the digest covers the entire stream the writer hashed.
    let mut payload = ar.into_inner();
    io::copy(&mut payload, &mut io::sink()).map_err(Error::Decompression)?;
    Ok(payload.into_digest())
}

fn check_entry_path(path: &Path) -> Result<()> {
    if path.is_absolute() {
        return Err(Error::UnsafePath(path.to_owned()));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir | Component::RootDir) {
            return Err(Error::UnsafePath(path.to_owned()));
        }
    }
    Ok(())
}

/// Reject symlink and hardlink entries whose target resolves outside the
/// extraction root. `depth` tracks how many directories deep the resolved
/// target sits; dropping below the root is an escape.
fn check_link_target(entry_path: &Path, entry: &tar::Entry<Payload>) -> Result<()> {
    let kind = entry.header().entry_type();
    if !kind.is_symlink() && !kind.is_hard_link() {
        return Ok(());
    }
    let target = match entry.link_name().map_err(Error::Unpack)? {
        Some(target) => target.into_owned(),
        None => return Ok(()),
    };
    if target.is_absolute() {
        return Err(Error::UnsafePath(target));
    }

    let mut depth: i64 = entry_path
        .parent()
        .map(|p| {
            p.components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count() as i64
        })
        .unwrap_or(0);
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::UnsafePath(target));
                }
            }
            Component::CurDir => {}
            _ => return Err(Error::UnsafePath(target)),
        }
    }
    Ok(())
}
