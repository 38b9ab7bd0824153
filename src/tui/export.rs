use crate::history;
use crate::model::HistoryRecord;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

// Global clipboard manager channel - initialized once on first use
static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// Default export file name for a record, unique per record.
pub fn export_file_name(r: &HistoryRecord) -> String {
    format!(
        "fracture-scan-{}-{}.json",
        r.timestamp.unix_timestamp(),
        &r.id[..8.min(r.id.len())]
    )
}

/// Export a single record to the current directory.
/// Returns the absolute path of the exported file.
pub fn export_record_json(r: &Arc<HistoryRecord>) -> Result<PathBuf> {
    let current_dir = std::env::current_dir().context("get current directory")?;
    let path = current_dir.join(export_file_name(r));
    history::export_json(&path, std::slice::from_ref(r))?;
    Ok(path)
}

/// Initialize the clipboard manager thread if not already initialized.
/// Clipboard operations run sequentially on one background thread, and each
/// clipboard instance stays alive long enough for clipboard managers to read it.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                if let Ok(mut clipboard) = Clipboard::new() {
                    if clipboard.set_text(&text).is_ok() {
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Copy text to clipboard without blocking the UI thread.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}
