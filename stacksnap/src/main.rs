//! # stacksnap - Main Entry Point
//!
//! Spawns a workload thread with a known call depth, samples it from a
//! dedicated sampling thread for one burst, and prints what was captured.
//! `--export` writes the profile as JSON.

#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use stacksnap::cli::Args;
use stacksnap::export::ProfileJsonExporter;
use stacksnap::profile::CallStackProfile;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("access is denied") {
        EXIT_NOPERM
    } else if msg.contains("invalid argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    if args.interval_ms == 0 && args.samples > 1 {
        anyhow::bail!("Invalid argument: --interval-ms must be at least 1 when taking several samples");
    }

    if !args.quiet {
        println!("stacksnap v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "burst: {} samples every {} ms, workload depth {}",
            args.samples, args.interval_ms, args.depth
        );
    }

    let profile = sample_workload(&args)?;

    if !args.quiet {
        print_summary(&profile);
    }

    if let Some(ref export_path) = args.export {
        ProfileJsonExporter::new(&profile)
            .pretty(true)
            .export_to_file(export_path)
            .context("Failed to export profile")?;
        if !args.quiet {
            println!("saved: {}", export_path.display());
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "macos", all(windows, target_arch = "x86_64")))]
fn sample_workload(args: &Args) -> Result<CallStackProfile> {
    use crossbeam_channel::bounded;
    use log::info;
    use stacksnap::capture::StackBuffer;
    use stacksnap::sampler::DefaultStackSampler;
    use stacksnap::session::collect_profile;
    use stacksnap::workload::Workload;
    use std::sync::atomic::AtomicBool;

    /// Used when the stack size limit is unlimited
    const FALLBACK_BUFFER_SIZE: usize = 8 * 1024 * 1024;

    let workload = Workload::spawn(args.depth).context("Failed to start workload thread")?;
    let token = workload.token();
    info!("Sampling {} (stack base 0x{:x})", token.tid(), token.stack_base());

    let params = args.sampling_params();
    let (tx, rx) = bounded(1);
    let sampling_thread = std::thread::Builder::new()
        .name("stacksnap-sampler".into())
        .spawn(move || {
            let result = DefaultStackSampler::for_thread(token).map(|mut sampler| {
                let mut buffer = StackBuffer::for_current_platform()
                    .unwrap_or_else(|| StackBuffer::new(FALLBACK_BUFFER_SIZE));
                collect_profile(&mut sampler, &mut buffer, &params, &AtomicBool::new(false))
            });
            let _ = tx.send(result);
        })
        .context("Failed to spawn sampling thread")?;

    let profile = rx
        .recv()
        .context("Sampling thread exited without a profile")?
        .context("Failed to set up the sampler")?;
    let _ = sampling_thread.join();
    workload.stop();
    Ok(profile)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", all(windows, target_arch = "x86_64"))))]
fn sample_workload(_args: &Args) -> Result<CallStackProfile> {
    Err(stacksnap::domain::SamplerError::UnsupportedPlatform.into())
}

fn print_summary(profile: &CallStackProfile) {
    println!(
        "\nsamples: {} ({} dropped) in {:.1}s",
        profile.sample_count(),
        profile.dropped_samples,
        profile.profile_duration.as_secs_f64()
    );
    println!(
        "frames: {} total, {:.1} per sample, {} unknown",
        profile.frame_count(),
        profile.mean_depth(),
        profile.unknown_frame_count()
    );

    if profile.modules.is_empty() {
        return;
    }
    println!("\n{:>3}  {:<18} {:>10}  {:<34} PATH", "#", "BASE", "SIZE", "ID");
    for (index, module) in profile.modules.iter().enumerate() {
        println!(
            "{index:>3}  0x{:<16x} {:>10}  {:<34} {}",
            module.base_address, module.size, module.unique_id, module.file_path
        );
    }
}
