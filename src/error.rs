use std::{path::PathBuf, process::ExitStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid user input
    //
    #[error("Invalid build configuration: {0}")]
    Config(String),
    #[error(transparent)]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Not a file, or not exist: {0}")]
    NotAFile(PathBuf),
    #[error("Not a directory, or not exist: {0}")]
    NotADirectory(PathBuf),
    #[error("Build command `{command}` failed with {status}")]
    BuildCommand { command: String, status: ExitStatus },

    //
    // Invalid container image
    //
    #[error("Bad magic {found:02x?}: not an nsbox image")]
    BadMagic { found: [u8; 4] },
    #[error("Unsupported image format version {0}")]
    UnsupportedVersion(u32),
    #[error("Declared header length {0} is too small to hold a JSON object")]
    HeaderTooSmall(u32),
    #[error("Declared header length {0} exceeds the 10 MiB cap")]
    HeaderTooLarge(u32),
    #[error("Image ends before the {0} is complete")]
    Truncated(&'static str),
    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
    #[error("Header field `{0}` is missing or empty")]
    MissingField(&'static str),
    #[error("Image payload contains no entries")]
    EmptyPayload,
    #[error("Payload digest {actual} does not match header hash {expected}")]
    HashMismatch { expected: String, actual: String },

    //
    // Payload codec
    //
    #[error("Compressing payload failed: {0}")]
    Compression(#[source] std::io::Error),
    #[error("Decompressing payload failed: {0}")]
    Decompression(#[source] std::io::Error),
    #[error("Archive entry `{0}` escapes the extraction root")]
    UnsafePath(PathBuf),
    #[error("Unpacking archive failed: {0}")]
    Unpack(#[source] std::io::Error),

    //
    // Sandbox
    //
    #[error("Entering {what} namespace failed: {source}")]
    Namespace {
        what: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("Writing identity map {path} failed: {source}")]
    IdentityMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Setting hostname failed: {0}")]
    Hostname(#[source] nix::Error),
    #[error("Mounting {target} failed: {source}")]
    Mount {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("pivot_root into {new_root} failed: {source}")]
    Pivot {
        new_root: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("Changing directory to {path} failed: {source}")]
    Chdir {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("Waiting for the container process failed: {0}")]
    Wait(#[source] nix::Error),
    #[error("Executing `{program}` failed: {source}")]
    Exec {
        program: String,
        #[source]
        source: nix::Error,
    },
    #[error("Command string contains a NUL byte")]
    NulInCommand(#[from] std::ffi::NulError),

    //
    // System error
    //
    #[error(transparent)]
    UnknownIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Self::UnknownIo(e.into())
    }
}
