//! Compose a directory as a compressed single-file image

use crate::{
    digest::HashWriter,
    error::{Error, Result},
    image::{header::ImageHeader, header::SCHEMA_VERSION, FORMAT_VERSION, HEADER_MAX_BYTES, MAGIC},
};
use chrono::Utc;
use flate2::{write::ZlibEncoder, Compression};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use uuid::Uuid;

/// Removes a half-written scratch file on drop unless it was kept.
struct ScratchFile {
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    fn beside(dest: &Path, tag: &str) -> Self {
        let mut name = dest
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.{}", tag, Uuid::new_v4().simple()));
        Self {
            path: dest.with_file_name(name),
            armed: true,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Write `payload_source`'s contents to `dest` as an image.
///
/// The tar stream is hashed and zlib-compressed while it is produced, so
/// the payload is never held in memory. The finished image appears under
/// `dest` atomically: both the compressed payload and the assembled image
/// are staged in scratch files beside it and the last step is a rename.
///
/// Returns the header that was written, with `hash`, `created` and
/// `sizeKB` filled in from the observed stream.
pub fn write(dest: &Path, payload_source: &Path, template: ImageHeader) -> Result<ImageHeader> {
    if !payload_source.is_dir() {
        return Err(Error::NotADirectory(payload_source.to_owned()));
    }

    let payload_scratch = ScratchFile::beside(dest, "payload");
    let (hash, tar_len) = compress_payload(payload_source, payload_scratch.path())?;

    let mut header = template;
    header.schema_version = SCHEMA_VERSION;
    header.created = Some(Utc::now());
    header.hash = Some(hash);
    header.size_kb = Some(tar_len.div_ceil(1024));

    let header_json = serde_json::to_vec(&header)?;
    if header_json.len() > HEADER_MAX_BYTES as usize {
        return Err(Error::HeaderTooLarge(header_json.len() as u32));
    }

    let image_scratch = ScratchFile::beside(dest, "image");
    assemble(image_scratch.path(), &header_json, payload_scratch.path())?;
    fs::rename(image_scratch.path(), dest)?;
    image_scratch.keep();

    Ok(header)
}

/// Tar `source`'s entries (at the archive root, not nested under the
/// directory name) through a digest tee into a best-compression zlib
/// stream written to `payload_path`.
fn compress_payload(source: &Path, payload_path: &Path) -> Result<(String, u64)> {
    let file = fs::File::create(payload_path)?;
    let encoder = ZlibEncoder::new(io::BufWriter::new(file), Compression::best());
    let mut ar = tar::Builder::new(HashWriter::new(encoder));
    ar.follow_symlinks(false);

    let mut entries = 0usize;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        let path = entry.path();
        // file_type does not traverse symlinks, so a link to a directory
        // is archived as a link
        if entry.file_type()?.is_dir() {
            ar.append_dir_all(Path::new(&name), &path)?;
        } else {
            ar.append_path_with_name(&path, Path::new(&name))?;
        }
        entries += 1;
    }
    if entries == 0 {
        return Err(Error::EmptyPayload);
    }

    let tee = ar.into_inner()?;
    let (encoder, hash, tar_len) = tee.finish();
    let writer = encoder.finish().map_err(Error::Compression)?;
    let file = writer.into_inner().map_err(io::Error::from)?;
    file.sync_all()?;
    Ok((hash, tar_len))
}

fn assemble(image_path: &Path, header_json: &[u8], payload_path: &Path) -> Result<()> {
    let mut out = io::BufWriter::new(fs::File::create(image_path)?);
    out.write_all(MAGIC)?;
    out.write_all(&FORMAT_VERSION.to_be_bytes())?;
    out.write_all(&(header_json.len() as u32).to_be_bytes())?;
    out.write_all(header_json)?;
    let mut payload = fs::File::open(payload_path)?;
    io::copy(&mut payload, &mut out)?;
    let file = out.into_inner().map_err(io::Error::from)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::header::RuntimeSpec;

    fn template() -> ImageHeader {
        ImageHeader {
            image_name: "t".to_string(),
            version: "0.1".to_string(),
            schema_version: SCHEMA_VERSION,
            created: None,
            hash: None,
            size_kb: None,
            runtime: RuntimeSpec::default(),
        }
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        let dest = dir.path().join("out.nsi");
        assert!(matches!(
            write(&dest, &src, template()),
            Err(Error::EmptyPayload)
        ));
        assert!(!dest.exists());
        // no scratch files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn missing_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.nsi");
        assert!(matches!(
            write(&dest, &dir.path().join("nope"), template()),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn written_file_starts_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("hello.txt"), "hi\n").unwrap();
        let dest = dir.path().join("out.nsi");

        let header = write(&dest, &src, template()).unwrap();
        assert!(header.hash.is_some());
        assert!(header.created.is_some());
        assert_eq!(header.size_kb, Some(2)); // one file header block + finish

        let bytes = fs::read(&dest).unwrap();
        assert_eq!(&bytes[0..4], MAGIC);
        assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 1);
        let header_len = u32::from_be_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let parsed: ImageHeader = serde_json::from_slice(&bytes[12..12 + header_len]).unwrap();
        assert_eq!(parsed.image_name, "t");
    }
}
