//! Experimental application containers without a container runtime.
//!
//! `nsbox` packs a source directory into a single self-contained image
//! file (a JSON header plus a zlib-compressed tar payload) and later runs
//! that image as an isolated process on a Linux host: user, PID, mount,
//! UTS, IPC and cgroup namespaces, a pivoted root filesystem, and cgroup
//! v2 resource limits. No registry, no layers, no daemon.
//!
//! The usual round trip:
//!
//! ```no_run
//! # fn main() -> nsbox::error::Result<()> {
//! let image = nsbox::builder::build("app/nsbox.yml".as_ref())?;
//! let (header, rootfs) = nsbox::loader::load(&image, std::env::temp_dir().as_ref(), false)?;
//! let status = nsbox::runtime::run(rootfs.path(), &header, &Default::default())?;
//! # std::process::exit(status);
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod image;
pub mod loader;
pub mod runtime;

mod digest;

pub use config::BuildConfig;
pub use image::{ImageHeader, RuntimeSpec};
pub use loader::Rootfs;
