//! JSON profile document
//!
//! Addresses are written as `0x`-prefixed hex strings; frames keep their
//! module index (`null` for unknown) so a consumer can symbolize
//! `pc - base_address` against the module's file and build id.

use crate::domain::ExportError;
use crate::profile::CallStackProfile;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Export document root
#[derive(Debug, Serialize)]
struct ProfileDocument<'a> {
    #[serde(rename = "samplingPeriodMs")]
    sampling_period_ms: f64,
    #[serde(rename = "durationMs")]
    duration_ms: f64,
    #[serde(rename = "droppedSamples")]
    dropped_samples: usize,
    modules: Vec<ModuleEntry<'a>>,
    samples: Vec<SampleEntry>,
}

#[derive(Debug, Serialize)]
struct ModuleEntry<'a> {
    base: String,
    size: usize,
    #[serde(rename = "id")]
    unique_id: &'a str,
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct SampleEntry {
    milestones: u32,
    frames: Vec<FrameEntry>,
}

#[derive(Debug, Serialize)]
struct FrameEntry {
    pc: String,
    module: Option<usize>,
}

#[allow(clippy::cast_precision_loss)]
fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

pub struct ProfileJsonExporter<'a> {
    profile: &'a CallStackProfile,
    pretty: bool,
}

impl<'a> ProfileJsonExporter<'a> {
    #[must_use]
    pub fn new(profile: &'a CallStackProfile) -> Self {
        Self { profile, pretty: false }
    }

    #[must_use]
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    fn document(&self) -> ProfileDocument<'a> {
        let profile = self.profile;
        ProfileDocument {
            sampling_period_ms: millis(profile.sampling_period),
            duration_ms: millis(profile.profile_duration),
            dropped_samples: profile.dropped_samples,
            modules: profile
                .modules
                .iter()
                .map(|module| ModuleEntry {
                    base: format!("0x{:x}", module.base_address),
                    size: module.size,
                    unique_id: &module.unique_id,
                    path: &module.file_path,
                })
                .collect(),
            samples: profile
                .samples
                .iter()
                .map(|sample| SampleEntry {
                    milestones: sample.annotation.process_milestones,
                    frames: sample
                        .frames
                        .iter()
                        .map(|frame| FrameEntry {
                            pc: format!("0x{:x}", frame.instruction_pointer),
                            module: frame.module_index.get(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Serialize the profile into `writer`
    ///
    /// # Errors
    ///
    /// Fails if serialization or the write fails.
    pub fn export<W: Write>(&self, mut writer: W) -> Result<(), ExportError> {
        let document = self.document();
        if self.pretty {
            serde_json::to_writer_pretty(&mut writer, &document)?;
        } else {
            serde_json::to_writer(&mut writer, &document)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the profile to a new file at `path`
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be created or written.
    pub fn export_to_file(&self, path: &Path) -> Result<(), ExportError> {
        let file = std::fs::File::create(path)
            .map_err(|err| ExportError::WriteFailed(format!("{}: {err}", path.display())))?;
        self.export(std::io::BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileBuilder;
    use stacksnap_common::{Frame, Module, ModuleIndex, Sample};

    #[test]
    fn test_document_layout() {
        let mut builder = ProfileBuilder::new();
        let mut sample = Sample::new();
        sample.frames.push(Frame::new(0x40_1234, ModuleIndex(0)));
        sample.frames.push(Frame::new(0x7000_0000, ModuleIndex::UNKNOWN));
        builder.on_sample_completed(sample);
        let module = Module {
            base_address: 0x40_0000,
            size: 0x1000,
            unique_id: "ABCD0".to_string(),
            file_path: "/bin/app".to_string(),
            load_bias: 0x40_0000,
        };
        let profile =
            builder.on_profile_completed(vec![module], Duration::from_millis(30), Duration::from_millis(10));

        let mut out = Vec::new();
        ProfileJsonExporter::new(&profile).export(&mut out).expect("export");
        let json: serde_json::Value = serde_json::from_slice(&out).expect("valid JSON");

        assert_eq!(json["samplingPeriodMs"], 10.0);
        assert_eq!(json["modules"][0]["base"], "0x400000");
        assert_eq!(json["modules"][0]["id"], "ABCD0");
        assert_eq!(json["samples"][0]["frames"][0]["pc"], "0x401234");
        assert_eq!(json["samples"][0]["frames"][0]["module"], 0);
        assert!(json["samples"][0]["frames"][1]["module"].is_null());
    }
}
