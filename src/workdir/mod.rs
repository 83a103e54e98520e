use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::schedule::types::Task;

pub mod archive;

/// Local areas shared with the decoder: `input` is watched by the decoder,
/// `output` receives its artifacts and `details` holds per-task scratch data.
#[derive(Debug, Clone)]
pub struct Workdir {
    input: PathBuf,
    output: PathBuf,
    details: PathBuf,
}

/// True for a bare file name that stays inside the directory it is joined
/// to: no separators, no `.`/`..`, not empty.
pub fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains(['/', '\\'])
        && Path::new(filename).file_name().and_then(|n| n.to_str()) == Some(filename)
}

fn stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

async fn remove_file(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn remove_dir(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl Workdir {
    pub fn new(input: PathBuf, output: PathBuf, details: PathBuf) -> Self {
        Self { input, output, details }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    pub async fn ensure(&self) -> Result<()> {
        for dir in [&self.input, &self.output, &self.details] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn input_path(&self, filename: &str) -> PathBuf {
        self.input.join(filename)
    }

    pub fn output_path(&self, filename: &str) -> PathBuf {
        self.output.join(filename)
    }

    pub fn sidecar_path(&self, filename: &str) -> PathBuf {
        self.input.join(format!("{}.json", stem(filename)))
    }

    /// Where a payload is written before it is moved into the input area.
    pub async fn staging_path(&self, filename: &str) -> Result<PathBuf> {
        let dir = self.details.join(stem(filename));
        fs::create_dir_all(&dir).await?;
        Ok(dir.join(format!("{}.part", filename)))
    }

    /// Removes everything left in the input area by a previous run.
    pub async fn sweep_input(&self) -> Result<usize> {
        info!("Attempting to empty input folder of contents...");
        let mut entries = match fs::read_dir(&self.input).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Input folder does not exist, nothing to sweep");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
            info!("Input folder item {} removed", path.display());
            removed += 1;
        }

        if removed == 0 {
            info!("Input folder already empty");
        }
        Ok(removed)
    }

    /// Writes the decoder metadata for `task`. Returns false when the task
    /// carries neither a channel count nor output formats.
    pub async fn write_sidecar(&self, task: &Task) -> Result<bool> {
        let Some(metadata) = sidecar(task) else {
            info!("Metadata file for {} was not created", stem(&task.original_filename));
            return Ok(false);
        };

        let path = self.sidecar_path(&task.original_filename);
        fs::write(&path, serde_json::to_vec(&metadata)?)
            .await
            .with_context(|| format!("failed to write metadata file {}", path.display()))?;
        info!("Metadata file for {} saved", stem(&task.original_filename));
        Ok(true)
    }

    /// Output files produced for `converted_filename`, excluding the mirrored
    /// payload copies named in `mirrored`.
    pub async fn collect_artifacts(&self, converted_filename: &str, mirrored: &[&str]) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}.", stem(converted_filename));
        let mut entries = fs::read_dir(&self.output).await?;
        let mut artifacts = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && !mirrored.contains(&name) {
                artifacts.push(entry.path());
            }
        }

        artifacts.sort();
        Ok(artifacts)
    }

    /// Removes every local trace of the given task files. Safe to repeat;
    /// missing files are not errors. `destructive` also drops the output
    /// artifacts, used on every failure path.
    pub async fn cleanup(&self, filenames: &[&str], destructive: bool) {
        let mut seen: Vec<&str> = Vec::new();
        for &filename in filenames {
            if seen.contains(&filename) {
                continue;
            }
            if !is_safe_filename(filename) {
                if !filename.is_empty() {
                    warn!("CLEANUP: refusing to touch unsafe file name {:?}", filename);
                }
                continue;
            }
            seen.push(filename);
            self.cleanup_one(filename, destructive).await;
        }
    }

    async fn cleanup_one(&self, filename: &str, destructive: bool) {
        let name = stem(filename);

        report("input file", filename, remove_file(&self.input_path(filename)).await);
        report("metadata file", name, remove_file(&self.sidecar_path(filename)).await);
        report("details files", name, remove_dir(&self.details.join(name)).await);
        report("output directory", name, remove_dir(&self.output.join(name)).await);

        if destructive {
            match self.collect_artifacts(filename, &[]).await {
                Ok(files) => {
                    for file in files {
                        let label = file.display().to_string();
                        report("output file", &label, remove_file(&file).await);
                    }
                }
                Err(e) if is_not_found(&e) => {}
                Err(e) => warn!("CLEANUP: Error during removal of output files: {}", e),
            }
        }
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

fn report(what: &str, name: &str, result: io::Result<bool>) {
    match result {
        Ok(true) => info!("CLEANUP: {} {} removed", what, name),
        Ok(false) => debug!("CLEANUP: {} {} already removed", what, name),
        Err(e) => warn!("CLEANUP: Error during removal of {} {}: {}", what, name, e),
    }
}

/// Decoder metadata: one participant per channel, requested output formats
/// without their leading dot, and custom fields merged at the top level.
pub fn sidecar(task: &Task) -> Option<Value> {
    if task.channel_count.is_none() && task.output_formats.is_none() {
        return None;
    }

    let far_talk = matches!(task.recording_type.as_deref(), Some("fartalk") | Some("boundary"));
    let participants: Vec<Value> = (1..=task.channel_count.unwrap_or(0))
        .map(|channel| json!({
            "ChannelId": channel,
            "recorder": 1,
            "UserId": channel,
            "FarTalkMic": far_talk,
            "Transcribe": true,
        }))
        .collect();

    let mut data = Map::new();
    data.insert("Participants".to_string(), Value::Array(participants));
    if let Some(formats) = &task.output_formats {
        let formats = formats.iter().map(|f| Value::String(f.replacen('.', "", 1))).collect();
        data.insert("output".to_string(), Value::Array(formats));
    }
    for (key, value) in &task.custom_data {
        data.insert(key.clone(), value.clone());
    }

    Some(Value::Object(data))
}
