//! CLI argument definitions

use crate::session::SamplingParams;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "stacksnap",
    about = "Sample the call stacks of a busy thread without its cooperation",
    after_help = "\
EXAMPLES:
    stacksnap                                   300 samples, 100 ms apart
    stacksnap --samples 50 --interval-ms 10     Short fast burst
    stacksnap --depth 64 --export profile.json  Deeper workload, save the profile"
)]
pub struct Args {
    /// Milliseconds between samples
    #[arg(long, default_value = "100", value_name = "MS")]
    pub interval_ms: u64,

    /// Samples per profile
    #[arg(long, default_value = "300")]
    pub samples: usize,

    /// Milliseconds to wait before the first sample
    #[arg(long, default_value = "0", value_name = "MS")]
    pub initial_delay_ms: u64,

    /// Recursion depth of the built-in workload thread
    #[arg(long, default_value = "16")]
    pub depth: usize,

    /// Export the profile as JSON
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    #[must_use]
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            sampling_interval: Duration::from_millis(self.interval_ms),
            samples_per_profile: self.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_sampling_params() {
        let args = Args::parse_from(["stacksnap"]);
        assert_eq!(args.sampling_params(), SamplingParams::default());
        assert_eq!(args.depth, 16);
        assert!(args.export.is_none());
    }

    #[test]
    fn test_explicit_values() {
        let args = Args::parse_from([
            "stacksnap",
            "--interval-ms",
            "5",
            "--samples",
            "20",
            "--initial-delay-ms",
            "50",
            "--export",
            "out.json",
            "-q",
        ]);
        let params = args.sampling_params();
        assert_eq!(params.sampling_interval, Duration::from_millis(5));
        assert_eq!(params.samples_per_profile, 20);
        assert_eq!(params.initial_delay, Duration::from_millis(50));
        assert_eq!(args.export, Some(PathBuf::from("out.json")));
        assert!(args.quiet);
    }
}
