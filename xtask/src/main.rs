use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

/// Frame-pointer unwinding needs every frame to keep its frame record
const FRAME_POINTER_FLAGS: &str = "-C force-frame-pointers=yes";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Run the workspace tests with frame pointers forced on
    Test {
        /// Also run the ignored (environment-dependent) tests
        #[arg(long)]
        include_ignored: bool,
        #[arg(long)]
        release: bool,
    },
    /// Sample the built-in workload and print the profile summary
    Demo {
        #[arg(long)]
        release: bool,
        /// Extra arguments forwarded to the stacksnap binary
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::Test { include_ignored, release } => run_tests(include_ignored, release)?,
        Cmd::Demo { release, args } => run_demo(release, &args)?,
    }

    Ok(())
}

fn cargo(subcommand: &str, release: bool) -> Command {
    let mut cmd = Command::new("cargo");
    cmd.arg(subcommand);
    if release {
        cmd.arg("--release");
    }

    let rustflags = match std::env::var("RUSTFLAGS") {
        Ok(existing) if !existing.is_empty() => format!("{existing} {FRAME_POINTER_FLAGS}"),
        _ => FRAME_POINTER_FLAGS.to_string(),
    };
    cmd.env("RUSTFLAGS", rustflags);
    cmd
}

fn run_tests(include_ignored: bool, release: bool) -> Result<()> {
    let mut cmd = cargo("test", release);
    cmd.arg("--workspace").arg("--exclude").arg("xtask");
    if include_ignored {
        cmd.arg("--").arg("--include-ignored");
    }

    let status = cmd.status().context("Failed to run cargo test")?;
    if !status.success() {
        anyhow::bail!("Tests failed");
    }

    println!("✓ Tests passed (frame pointers forced)");
    Ok(())
}

fn run_demo(release: bool, args: &[String]) -> Result<()> {
    let mut cmd = cargo("run", release);
    cmd.arg("--package").arg("stacksnap").arg("--").args(args);

    let status = cmd.status().context("Failed to run stacksnap")?;
    if !status.success() {
        anyhow::bail!("stacksnap exited with {status}");
    }

    Ok(())
}
