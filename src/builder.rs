//! Build an image from a source tree and its build configuration

use crate::{
    config::BuildConfig,
    error::{Error, Result},
    image,
};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use uuid::Uuid;
use walkdir::WalkDir;

/// Scratch directory beside the configuration file; removed on drop so
/// every exit path of the build cleans up after itself.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(parent: &Path, name: &str) -> Result<Self> {
        let path = parent.join(format!(".{}-build-{}", name, Uuid::new_v4().simple()));
        fs::create_dir(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            log::warn!("could not remove scratch {}: {}", self.path.display(), e);
        }
    }
}

/// Run a full build: parse the configuration, stage the selected sources
/// in a scratch directory, run the build commands there, and pack the
/// result into `{name}-{version}.nsi` beside the configuration file.
///
/// Returns the path of the written image.
pub fn build(config_path: &Path) -> Result<PathBuf> {
    let config = BuildConfig::from_path(config_path)?;
    let source_dir = match config_path.parent() {
        Some(parent) if parent != Path::new("") => parent.to_owned(),
        _ => PathBuf::from("."),
    };

    let scratch = ScratchDir::create(&source_dir, &config.name)?;
    copy_sources(&config, &source_dir, scratch.path())?;
    run_build_steps(&config, scratch.path())?;

    let dest = source_dir.join(config.image_file_name());
    log::info!("writing image {}", dest.display());
    image::write(&dest, scratch.path(), config.header_template())?;
    Ok(dest)
}

/// Copy the configured `include` entries (or, when none are listed, the
/// whole source tree) into the scratch, skipping `exclude` prefixes and
/// the scratch itself. A listed entry that does not exist is a warning,
/// not a failure.
fn copy_sources(config: &BuildConfig, source_dir: &Path, scratch: &Path) -> Result<()> {
    let whole_tree = vec![String::new()];
    let include = if config.include.is_empty() {
        &whole_tree
    } else {
        &config.include
    };

    for pattern in include {
        let root = source_dir.join(pattern);
        if !root.exists() {
            log::warn!("include entry `{}` does not exist, skipping", pattern);
            continue;
        }
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(source_dir)
                .expect("walk stays under the source directory");
            if rel == Path::new("") || rel.starts_with(scratch_name(scratch)) {
                continue;
            }
            if is_excluded(rel, &config.exclude) {
                continue;
            }

            let target = scratch.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if file_type.is_symlink() {
                    let link = fs::read_link(entry.path())?;
                    std::os::unix::fs::symlink(link, &target)?;
                } else {
                    fs::copy(entry.path(), &target)?;
                }
            }
        }
    }
    Ok(())
}

fn scratch_name(scratch: &Path) -> &Path {
    scratch
        .file_name()
        .map(Path::new)
        .unwrap_or_else(|| Path::new(""))
}

/// Plain prefix match on the relative path; no globbing.
fn is_excluded(rel: &Path, excludes: &[String]) -> bool {
    let rel = rel.to_string_lossy();
    excludes.iter().any(|prefix| rel.starts_with(prefix.as_str()))
}

/// Run each build command with `sh -c` in the scratch, inheriting the
/// caller's environment and streaming its stdio. The first non-zero exit
/// aborts the build.
fn run_build_steps(config: &BuildConfig, scratch: &Path) -> Result<()> {
    for command in &config.build {
        log::info!("build step: {}", command);
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(scratch)
            .status()?;
        if !status.success() {
            return Err(Error::BuildCommand {
                command: command.clone(),
                status,
            });
        }
    }
    Ok(())
}
