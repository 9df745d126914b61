//! Prism triangle viewer.
//!
//! Builds one BLAS over a single triangle, one TLAS with an identity instance
//! of it, and publishes both with a static camera through the scene set.
//! Each frame copies the output image to the swapchain.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames-in-flight <N>`: Number of frame slots (default: 2)
//! - `--no-vsync`: Present without waiting for vertical blank
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use anyhow::Context;
use prism_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    run_app::<Viewer>(parse_args(&args)?)
}

fn parse_args(args: &[String]) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::new("Prism - Triangle").with_size(WIDTH, HEIGHT);

    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames-in-flight" => {
                let value = args.next().context("--frames-in-flight needs a value")?;
                let frames: usize = value
                    .parse()
                    .with_context(|| format!("invalid frame count: {value}"))?;
                anyhow::ensure!(frames > 0, "--frames-in-flight must be at least 1");
                config = config.with_frames_in_flight(frames);
            }
            "--no-vsync" => config = config.with_vsync(false),
            other => anyhow::bail!("unknown argument: {other} (see --help)"),
        }
    }
    Ok(config)
}

fn print_help() {
    eprintln!(
        "Prism triangle viewer

USAGE:
    prism-viewer [OPTIONS]

OPTIONS:
    --frames-in-flight <N>   Number of frame slots (default: 2)
    --no-vsync               Present without waiting for vertical blank
    -h, --help               Print this help message

ENVIRONMENT:
    RUST_LOG                 Log filter (default: info)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn defaults() {
        let config = parse_args(&[]).unwrap();
        assert_eq!((config.width, config.height), (WIDTH, HEIGHT));
        assert_eq!(config.frames_in_flight, 2);
        assert!(config.vsync);
    }

    #[test]
    fn options() {
        let config = parse_args(&args(&["--frames-in-flight", "3", "--no-vsync"])).unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert!(!config.vsync);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&["--frames-in-flight"])).is_err());
        assert!(parse_args(&args(&["--frames-in-flight", "0"])).is_err());
        assert!(parse_args(&args(&["--frames-in-flight", "two"])).is_err());
        assert!(parse_args(&args(&["--fullscreen"])).is_err());
    }
}
