use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use vision::{VisionCliArgs, VisionConfig};

/// Railway surveillance detectors with a live preview and alert routing.
#[derive(Debug, Parser)]
#[command(name = "railguard", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the detection pipeline against a camera or video file.
    Watch(VisionCliArgs),
    /// Serve the alert notification routes.
    AlertEndpoint(EndpointArgs),
}

#[derive(Debug, Args)]
struct EndpointArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind: SocketAddr,
}

impl Cli {
    pub fn execute(self) -> Result<()> {
        match self.command {
            Command::Watch(args) => {
                let config = VisionConfig::try_from(args).context("invalid watch arguments")?;
                info!(
                    detectors = ?config.detectors,
                    mode = %config.mode,
                    "starting detection pipeline"
                );
                vision::run(config)
            }
            Command::AlertEndpoint(args) => vision::run_alert_endpoint(args.bind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_accepts_detector_list_and_overrides() {
        let cli = Cli::try_parse_from([
            "railguard",
            "watch",
            "--mode",
            "file",
            "--file",
            "clip.mp4",
            "--detectors",
            "trespassing,crowd",
            "--confidence",
            "crowd=0.3",
        ])
        .unwrap();
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        let config = VisionConfig::try_from(args).unwrap();
        assert_eq!(config.detectors.len(), 2);
        assert_eq!(config.confidence[&vision::DetectorKind::Crowd], 0.3);
    }

    #[test]
    fn alert_endpoint_defaults_to_port_8000() {
        let cli = Cli::try_parse_from(["railguard", "alert-endpoint"]).unwrap();
        let Command::AlertEndpoint(args) = cli.command else {
            panic!("expected alert-endpoint");
        };
        assert_eq!(args.bind, "0.0.0.0:8000".parse::<SocketAddr>().unwrap());
    }
}
