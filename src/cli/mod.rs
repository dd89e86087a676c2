//! CLI Module
//!
//! Command-line interface for the songchain pipeline.

pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::request::BackendPreference;

/// Songchain - multi-clip song generation
#[derive(Parser, Debug)]
#[command(name = "songchain")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Pipeline configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Use the built-in synthetic backends instead of model bridges
    #[arg(long, global = true)]
    pub synthetic: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// What to generate
#[derive(Args, Debug, Clone)]
pub struct SongArgs {
    /// Text prompt describing the song
    pub prompt: String,

    /// Lyrics to sing
    #[arg(long, conflicts_with = "lyrics_file")]
    pub lyrics: Option<String>,

    /// Read lyrics from a file
    #[arg(long)]
    pub lyrics_file: Option<PathBuf>,

    /// Number of clips to chain
    #[arg(short = 'n', long)]
    pub clips: Option<usize>,

    #[arg(long)]
    pub genre: Option<String>,

    #[arg(long)]
    pub mood: Option<String>,

    /// Tempo in BPM
    #[arg(long)]
    pub tempo: Option<u32>,

    /// Comma-separated instrument list
    #[arg(long, value_delimiter = ',')]
    pub instruments: Vec<String>,

    /// auto, primary or fallback
    #[arg(long, default_value = "auto")]
    pub backend: BackendPreference,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Diffusion steps for the primary backend
    #[arg(long)]
    pub steps: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a song and export it as WAV
    #[command(name = "generate")]
    Generate {
        #[command(flatten)]
        song: SongArgs,

        /// Output WAV path
        #[arg(short, long, default_value = "song.wav")]
        output: PathBuf,

        /// 16, 24 or 32 (float)
        #[arg(long, default_value_t = 16)]
        bit_depth: u16,

        /// Write the song report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Estimate how long a song would take on this machine
    #[command(name = "estimate")]
    Estimate {
        #[command(flatten)]
        song: SongArgs,

        /// Override detected hardware: cpu, or nvidia:<vram GB>
        #[arg(long)]
        hardware: Option<String>,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show detected hardware and backend availability
    #[command(name = "probe")]
    Probe {
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Write the default configuration to a file
    #[command(name = "init-config")]
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_generate() {
        let cli = Cli::try_parse_from([
            "songchain",
            "--synthetic",
            "generate",
            "rainy day",
            "-n",
            "2",
            "--instruments",
            "piano,strings",
            "--backend",
            "fallback",
            "-o",
            "out.wav",
        ])
        .unwrap();
        assert!(cli.synthetic);
        match cli.command {
            Some(Commands::Generate { song, output, .. }) => {
                assert_eq!(song.clips, Some(2));
                assert_eq!(song.instruments, vec!["piano", "strings"]);
                assert_eq!(song.backend, BackendPreference::Fallback);
                assert_eq!(output, PathBuf::from("out.wav"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
