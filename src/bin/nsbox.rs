use clap::Parser;
use nsbox::error::Result;
use nsbox::runtime::{self, RunOptions};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
enum Opt {
    /// Build an image from a build configuration file
    Build {
        /// Path of the YAML build configuration; the image is written
        /// beside it
        config: PathBuf,
    },

    /// Run an image inside a fresh sandbox
    Run {
        /// Path of the image file
        image: PathBuf,

        /// Memory limit written to memory.max (decimal byte count or "max")
        #[arg(long)]
        memory: Option<String>,

        /// KEY=VALUE override for the image environment; repeatable
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,

        /// Container id; synthesised when absent
        #[arg(long)]
        id: Option<String>,

        /// Treat a payload hash mismatch as an error instead of a warning
        #[arg(long)]
        strict: bool,
    },

    /// Print the parsed header of an image
    Inspect {
        /// Path of the image file
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    match Opt::parse() {
        Opt::Build { config } => {
            let image = nsbox::builder::build(&config)?;
            println!("{}", image.display());
        }

        Opt::Run {
            image,
            memory,
            env,
            id,
            strict,
        } => {
            let overrides = runtime::parse_env_overrides(&env);
            let (header, rootfs) = nsbox::loader::load(&image, &std::env::temp_dir(), strict)?;
            let opts = RunOptions {
                container_id: id,
                memory_limit: memory,
                env: overrides,
            };
            let code = runtime::run(rootfs.path(), &header, &opts)?;
            drop(rootfs);
            std::process::exit(code);
        }

        Opt::Inspect { image } => {
            let (header, _) = nsbox::image::open(&image)?;
            println!("{}", serde_json::to_string_pretty(&header)?);
        }
    }
    Ok(())
}
