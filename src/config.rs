//! Build configuration file

use crate::{
    error::{Error, Result},
    image::{
        header::{ImageHeader, RuntimeSpec, DEFAULT_WORK_DIR, SCHEMA_VERSION},
        FILE_EXTENSION,
    },
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Declarative build input, loaded from a YAML file next to the source
/// tree it describes.
///
/// ```yaml
/// name: hello
/// version: "0.1"
/// include:
///   - hello.txt
/// exclude:
///   - target/
/// build:
///   - echo built > stamp
/// runtime:
///   workDir: /app
///   cmd: ["/bin/sh", "-c", "cat hello.txt"]
///   env:
///     GREETING: hi
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Image name; with `version`, derives the output filename.
    pub name: String,
    pub version: String,
    /// Shell commands run in the scratch directory before packing.
    #[serde(default)]
    pub build: Vec<String>,
    /// Prefix patterns selecting source entries to pack. Empty means the
    /// whole source tree.
    #[serde(default)]
    pub include: Vec<String>,
    /// Prefix patterns for entries to skip.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Copied verbatim into the image header.
    #[serde(default)]
    pub runtime: RuntimeSpec,
}

impl BuildConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotAFile(path.to_owned()));
        }
        let text = fs::read_to_string(path)?;
        let config: BuildConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("`name` must not be empty".to_string()));
        }
        if self.version.is_empty() {
            return Err(Error::Config("`version` must not be empty".to_string()));
        }
        if self.runtime.cmd.is_empty() {
            return Err(Error::Config(
                "`runtime.cmd` must list the program to run".to_string(),
            ));
        }
        Ok(())
    }

    /// `{name}-{version}.nsi`
    pub fn image_file_name(&self) -> String {
        format!("{}-{}.{}", self.name, self.version, FILE_EXTENSION)
    }

    /// Header with everything the builder knows up front; the codec fills
    /// in `hash`, `created` and `sizeKB` while writing.
    pub fn header_template(&self) -> ImageHeader {
        let mut runtime = self.runtime.clone();
        if runtime.work_dir.is_none() {
            runtime.work_dir = Some(DEFAULT_WORK_DIR.to_string());
        }
        ImageHeader {
            image_name: self.name.clone(),
            version: self.version.clone(),
            schema_version: SCHEMA_VERSION,
            created: None,
            hash: None,
            size_kb: None,
            runtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
name: h
version: "0.1"
include:
  - hello.txt
exclude:
  - node_modules
build:
  - echo ready > stamp
runtime:
  workDir: /app
  cmd: ["/bin/sh", "-c", "cat /app/hello.txt"]
  env:
    MODE: test
"#;

    #[test]
    fn parse_example() {
        let config: BuildConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.name, "h");
        assert_eq!(config.include, vec!["hello.txt"]);
        assert_eq!(config.build.len(), 1);
        assert_eq!(config.runtime.env["MODE"], "test");
        assert_eq!(config.image_file_name(), "h-0.1.nsi");
    }

    #[test]
    fn missing_cmd_is_rejected() {
        let config: BuildConfig =
            serde_yaml::from_str("name: h\nversion: \"0.1\"\n").unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn missing_name_fails_to_parse() {
        let parsed: std::result::Result<BuildConfig, _> =
            serde_yaml::from_str("version: \"0.1\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn template_defaults_work_dir() {
        let config: BuildConfig = serde_yaml::from_str(
            "name: h\nversion: \"0.1\"\nruntime:\n  cmd: [\"/bin/true\"]\n",
        )
        .unwrap();
        let header = config.header_template();
        assert_eq!(header.runtime.work_dir.as_deref(), Some("/app"));
        assert_eq!(header.image_name, "h");
        assert!(header.hash.is_none());
    }
}
