//! Per-chat output directory lifecycle.
//!
//! Each agent run gets a throwaway directory under the bot's outputs base
//! where the agent drops files it wants delivered back into the chat. The
//! manager prepares the directory before a run, scans it afterwards, and
//! removes it best-effort once files have been sent.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Extensions treated as images when scanning outputs.
const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "tiff",
];

/// Extensions whose content is safe to inline as a text message.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "log", "json", "yaml", "yml", "toml", "csv",
    "xml", "html", "css", "js", "ts", "py", "rs", "sh", "sql",
];

/// A regular file found in an outputs directory.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub file_path: PathBuf,
    pub file_name: String,
    pub extension: String,
    pub is_image: bool,
    pub size_bytes: u64,
}

/// Manages the per-chat output directories under a single base directory.
#[derive(Debug, Clone)]
pub struct OutputsManager {
    base_dir: PathBuf,
}

impl OutputsManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Remove any previous directory for this chat and recreate it empty.
    /// Returns the path the agent should write into.
    pub async fn prepare_dir(&self, chat_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.base_dir.join(sanitize_component(chat_id));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Enumerate non-empty regular files directly inside `dir` (no recursion).
    /// IO errors degrade to an empty listing with a warning.
    pub async fn scan_outputs(&self, dir: &Path) -> Vec<OutputFile> {
        let mut files = Vec::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to scan outputs dir");
                return files;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to read outputs entry");
                    break;
                }
            };

            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to stat output file");
                    continue;
                }
            };
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }

            let file_path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let extension = file_path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();

            files.push(OutputFile {
                is_image: is_image_extension(&extension),
                file_path,
                file_name,
                extension,
                size_bytes: meta.len(),
            });
        }

        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        files
    }

    /// Best-effort recursive removal. Errors are swallowed with a warning.
    pub async fn cleanup(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Failed to clean up outputs dir");
            }
        }
    }
}

/// Whether `ext` (lowercase, no dot) is in the image extension set.
pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&ext)
}

/// Whether a file with this extension can be read and sent as plain text.
pub fn is_text_file(ext: &str) -> bool {
    TEXT_EXTENSIONS.contains(&ext)
}

/// Coarse platform file-type bucket used when uploading attachments.
pub fn platform_file_type(ext: &str) -> &'static str {
    match ext {
        "pdf" => "pdf",
        "doc" | "docx" => "doc",
        "xls" | "xlsx" => "xls",
        "ppt" | "pptx" => "ppt",
        "mp4" | "mov" | "avi" => "mp4",
        "opus" | "ogg" | "mp3" | "wav" => "opus",
        _ => "stream",
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.replace(['/', '\\', ':'], "_")
}
