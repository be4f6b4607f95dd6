//! Stage an image into a fresh root filesystem

use crate::{
    error::{Error, Result},
    image::{self, ImageHeader},
};
use std::{
    fs,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};
use uuid::Uuid;

/// Root filesystem extracted from an image.
///
/// The directory is exclusively owned by one run and removed on drop, so
/// it disappears on every exit path, launcher failure included.
pub struct Rootfs {
    path: PathBuf,
    keep: bool,
}

impl Rootfs {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detach ownership; the caller becomes responsible for removal.
    pub fn into_path(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for Rootfs {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not remove rootfs {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Open `image`, extract its payload into a fresh 0700 directory under
/// `parent`, and verify the payload digest against the header hash.
///
/// A digest mismatch is a warning by default, so images with legacy or
/// recomputed hashes stay runnable; `strict` promotes it to a hard error.
/// On any failure the partly populated directory is removed before the
/// error is returned.
pub fn load(image: &Path, parent: &Path, strict: bool) -> Result<(ImageHeader, Rootfs)> {
    let (header, payload) = image::open(image)?;

    let dir = parent.join(format!("nsbox-rootfs-{}", Uuid::new_v4().simple()));
    fs::DirBuilder::new().mode(0o700).create(&dir)?;
    let rootfs = Rootfs::new(dir);

    let (digest, len) = image::extract(payload, rootfs.path())?;
    log::debug!(
        "extracted {} byte payload into {}",
        len,
        rootfs.path().display()
    );

    match &header.hash {
        Some(expected) if *expected != digest => {
            if strict {
                return Err(Error::HashMismatch {
                    expected: expected.clone(),
                    actual: digest,
                });
            }
            log::warn!(
                "payload digest {} does not match header hash {}; continuing",
                digest,
                expected
            );
        }
        None => log::warn!("image {} carries no payload hash", image.display()),
        _ => {}
    }

    Ok((header, rootfs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::header::{RuntimeSpec, SCHEMA_VERSION};
    use std::os::unix::fs::PermissionsExt;

    fn write_image(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("hello.txt"), "hi\n").unwrap();
        let template = ImageHeader {
            image_name: "h".to_string(),
            version: "0.1".to_string(),
            schema_version: SCHEMA_VERSION,
            created: None,
            hash: None,
            size_kb: None,
            runtime: RuntimeSpec::default(),
        };
        let path = dir.join("h-0.1.nsi");
        image::write(&path, &src, template).unwrap();
        path
    }

    #[test]
    fn load_stages_and_drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = write_image(dir.path());

        let staged;
        {
            let (header, rootfs) = load(&image_path, dir.path(), false).unwrap();
            assert_eq!(header.image_name, "h");
            staged = rootfs.path().to_owned();
            assert_eq!(fs::read(staged.join("hello.txt")).unwrap(), b"hi\n");
            let mode = fs::metadata(&staged).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
        assert!(!staged.exists());
    }

    #[test]
    fn tampered_hash_warns_but_loads() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = write_image(dir.path());
        flip_hash(&image_path);

        let (_, rootfs) = load(&image_path, dir.path(), false).unwrap();
        assert!(rootfs.path().join("hello.txt").exists());
    }

    #[test]
    fn tampered_hash_fails_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = write_image(dir.path());
        flip_hash(&image_path);

        assert!(matches!(
            load(&image_path, dir.path(), true),
            Err(Error::HashMismatch { .. })
        ));
        // the partial rootfs was removed
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("nsbox-rootfs-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    /// Rewrite one hex digit of the header `hash` in place; the header
    /// length does not change, so the image stays structurally valid.
    fn flip_hash(path: &Path) {
        let (header, _) = image::open(path).unwrap();
        let hash = header.hash.unwrap();
        let flipped_digit = if hash.as_bytes()[0] == b'0' { "1" } else { "0" };
        let flipped = format!("{}{}", flipped_digit, &hash[1..]);

        let mut bytes = fs::read(path).unwrap();
        let needle = hash.as_bytes();
        let pos = bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        bytes[pos..pos + needle.len()].copy_from_slice(flipped.as_bytes());
        fs::write(path, bytes).unwrap();
    }
}
