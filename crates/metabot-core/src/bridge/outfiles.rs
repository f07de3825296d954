//! Output file emission after a task finishes.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::outputs::{is_text_file, OutputFile, OutputsManager};
use crate::sender::PlatformSender;
use crate::stream::{extract_image_paths, CardState, StreamProcessor};

/// Images above this size are sent as plain files instead.
const IMAGE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Files above this size are not sent at all.
const FILE_MAX_BYTES: u64 = 30 * 1024 * 1024;

/// Text files below this size can be inlined when the upload fails.
const INLINE_TEXT_MAX_BYTES: u64 = 30 * 1024;

/// Send everything the agent produced back into the chat.
///
/// Step 1 walks the outputs directory; step 2 falls back to image paths the
/// stream processor observed plus paths referenced in the final response
/// text, covering images written outside the outputs directory.
pub async fn send_output_files(
    sender: &dyn PlatformSender,
    outputs: &OutputsManager,
    chat_id: &str,
    outputs_dir: &std::path::Path,
    processor: &StreamProcessor,
    final_state: &CardState,
) {
    let mut sent: HashSet<PathBuf> = HashSet::new();

    for file in outputs.scan_outputs(outputs_dir).await {
        if send_one(sender, chat_id, &file).await {
            sent.insert(file.file_path.clone());
        }
    }

    // Fallback image pass.
    let mut fallback: Vec<PathBuf> = processor.image_paths().to_vec();
    for path in extract_image_paths(&final_state.response_text) {
        if !fallback.contains(&path) {
            fallback.push(path);
        }
    }

    for path in fallback {
        if sent.contains(&path) || !path.is_file() {
            continue;
        }
        if sender.send_image_file(chat_id, &path).await {
            sent.insert(path);
        }
    }
}

async fn send_one(sender: &dyn PlatformSender, chat_id: &str, file: &OutputFile) -> bool {
    if file.is_image && file.size_bytes < IMAGE_MAX_BYTES {
        if sender.send_image_file(chat_id, &file.file_path).await {
            return true;
        }
        warn!(file = %file.file_name, "Image send failed, falling back to file upload");
    }

    if file.size_bytes >= FILE_MAX_BYTES {
        info!(
            file = %file.file_name,
            size = file.size_bytes,
            "Output file too large to send"
        );
        return false;
    }

    if sender
        .send_local_file(chat_id, &file.file_path, &file.file_name)
        .await
    {
        return true;
    }

    // Small text files can still reach the user as a plain message.
    if is_text_file(&file.extension) && file.size_bytes < INLINE_TEXT_MAX_BYTES {
        match tokio::fs::read_to_string(&file.file_path).await {
            Ok(content) => {
                let text = format!("📄 {}\n\n{}", file.file_name, content);
                if let Err(e) = sender.send_text(chat_id, &text).await {
                    warn!(file = %file.file_name, error = %e, "Inline text send failed");
                    return false;
                }
                return true;
            }
            Err(e) => {
                warn!(file = %file.file_name, error = %e, "Failed to read text file for inlining");
            }
        }
    }

    false
}
