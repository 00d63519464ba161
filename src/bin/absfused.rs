use std::path::{Path, PathBuf};

use absfuse::{LocalFs, MountOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config: Option<PathBuf> = None;
    let mut read_only = false;
    let mut allow_other = false;
    let mut direct_io = false;
    let mut positional: Vec<String> = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config = args.next().map(PathBuf::from);
            }
            "--read-only" => read_only = true,
            "--allow-other" => allow_other = true,
            "--direct-io" => direct_io = true,
            "--help" | "-h" => {
                print_help();
                return;
            }
            other if other.starts_with('-') => {
                eprintln!("absfused: unknown argument: {other}");
                print_help();
                std::process::exit(2);
            }
            other => positional.push(other.to_string()),
        }
    }

    let [source, mountpoint] = match <[String; 2]>::try_from(positional) {
        Ok(paths) => paths,
        Err(_) => {
            print_help();
            std::process::exit(2);
        }
    };

    let mut options = match config {
        Some(path) => match load_config(&path) {
            Ok(options) => options,
            Err(e) => {
                eprintln!("absfused: cannot read config {}: {e}", path.display());
                std::process::exit(2);
            }
        },
        None => MountOptions::default(),
    };
    options.mountpoint = PathBuf::from(mountpoint);
    options.read_only |= read_only;
    options.allow_other |= allow_other;
    options.direct_io |= direct_io;

    if let Ok(true) = absfuse::is_mounted(&options.mountpoint) {
        eprintln!(
            "absfused: {} is already a mountpoint",
            options.mountpoint.display()
        );
        std::process::exit(1);
    }

    info!(
        source = %source,
        mountpoint = %options.mountpoint.display(),
        pid = std::process::id(),
        "absfused starting"
    );
    if let Err(e) = absfuse::mount_and_wait(LocalFs::new(source), options) {
        eprintln!("absfused: fatal error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<MountOptions, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn print_help() {
    eprintln!(
        "Usage: absfused [--config FILE] [--read-only] [--allow-other] [--direct-io] SOURCE MOUNTPOINT"
    );
}
