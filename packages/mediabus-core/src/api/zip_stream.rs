//! On-the-fly ZIP packing for folder and batch downloads.
//!
//! Planning is separated from streaming: a plan is the deterministic,
//! name-sorted entry list (directories before their children, hidden entries
//! filtered), and the writer streams it through a duplex pipe into the
//! response body. Cancellation is checked between every entry and between
//! every chunk; a client disconnect surfaces as a pipe write error, ending
//! the writer task and closing the ticket.

use std::io;
use std::path::{Path, PathBuf};

use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use futures::AsyncWriteExt;
use thiserror::Error;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_util::io::ReaderStream;

use crate::protocol_constants::TRANSFER_CHUNK_SIZE;
use crate::runtime::TransferTicket;
use crate::utils::unique_name;

/// Pipe capacity between the ZIP writer task and the response body.
const ZIP_PIPE_CAPACITY: usize = 64 * 1024;

/// One planned archive entry. Directories carry a trailing `/` and no source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ZipEntryPlan {
    pub entry_name: String,
    pub source: Option<PathBuf>,
    pub size: Option<u64>,
}

impl ZipEntryPlan {
    fn directory(entry_name: String) -> Self {
        Self {
            entry_name,
            source: None,
            size: None,
        }
    }

    fn file(entry_name: String, source: PathBuf, size: u64) -> Self {
        Self {
            entry_name,
            source: Some(source),
            size: Some(size),
        }
    }
}

#[derive(Debug, Error)]
enum ZipStreamError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive encoding error: {0}")]
    Zip(#[from] async_zip::error::ZipError),
}

/// Plans all entries beneath `dir`, sorted by lowercased name at every
/// level, each directory preceding its children.
pub(crate) fn plan_directory(dir: &Path, show_hidden: bool) -> io::Result<Vec<ZipEntryPlan>> {
    let mut plans = Vec::new();
    walk(dir, "", show_hidden, &mut plans)?;
    Ok(plans)
}

/// Plans a batch selection of files and folders, de-duplicating top-level
/// entry names by appending ` (n)` before any extension.
pub(crate) fn plan_batch(
    selection: &[(String, PathBuf)],
    show_hidden: bool,
) -> io::Result<Vec<ZipEntryPlan>> {
    let mut plans = Vec::new();
    let mut used: Vec<String> = Vec::new();

    for (name, path) in selection {
        let entry_name = unique_name(name, |candidate| used.iter().any(|u| u == candidate));
        used.push(entry_name.clone());

        if path.is_dir() {
            plans.push(ZipEntryPlan::directory(format!("{}/", entry_name)));
            walk(path, &format!("{}/", entry_name), show_hidden, &mut plans)?;
        } else {
            let size = std::fs::metadata(path)?.len();
            plans.push(ZipEntryPlan::file(entry_name, path.clone(), size));
        }
    }
    Ok(plans)
}

fn walk(
    dir: &Path,
    prefix: &str,
    show_hidden: bool,
    out: &mut Vec<ZipEntryPlan>,
) -> io::Result<()> {
    let mut children: Vec<(String, PathBuf, bool, u64)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !show_hidden && name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata()?;
        children.push((name, entry.path(), metadata.is_dir(), metadata.len()));
    }
    children.sort_by_key(|(name, ..)| name.to_lowercase());

    for (name, path, is_dir, size) in children {
        let entry_name = format!("{}{}", prefix, name);
        if is_dir {
            out.push(ZipEntryPlan::directory(format!("{}/", entry_name)));
            walk(&path, &format!("{}/", entry_name), show_hidden, out)?;
        } else {
            out.push(ZipEntryPlan::file(entry_name, path, size));
        }
    }
    Ok(())
}

/// Builds the chunked ZIP response, spawning the writer task.
///
/// The ticket travels into the task and closes when the archive is fully
/// written or the client disconnects (pipe write failure).
pub(crate) fn zip_response(
    archive_name: &str,
    plans: Vec<ZipEntryPlan>,
    ticket: TransferTicket,
) -> Response {
    let (writer, reader) = tokio::io::duplex(ZIP_PIPE_CAPACITY);

    tokio::spawn(async move {
        match write_archive(writer, &plans, &ticket).await {
            Ok(()) => log::debug!("[Zip] Archive streamed ({} entries)", plans.len()),
            Err(ZipStreamError::Cancelled) => {
                log::info!("[Zip] Archive stream cancelled by revocation")
            }
            Err(ZipStreamError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                log::info!("[Zip] Client disconnected mid-archive")
            }
            Err(e) => log::error!("[Zip] Archive stream failed: {}", e),
        }
        ticket.close();
    });

    let body = Body::from_stream(ReaderStream::with_capacity(reader, TRANSFER_CHUNK_SIZE));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}.zip\"",
                archive_name.replace('"', "_")
            ),
        )
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .expect("static zip response headers are valid")
}

async fn write_archive(
    writer: DuplexStream,
    plans: &[ZipEntryPlan],
    ticket: &TransferTicket,
) -> Result<(), ZipStreamError> {
    let mut archive = ZipFileWriter::with_tokio(writer);

    for plan in plans {
        if ticket.cancelled() {
            return Err(ZipStreamError::Cancelled);
        }

        match &plan.source {
            None => {
                let builder =
                    ZipEntryBuilder::new(plan.entry_name.clone().into(), Compression::Stored);
                archive.write_entry_whole(builder, &[]).await?;
            }
            Some(path) => {
                let builder =
                    ZipEntryBuilder::new(plan.entry_name.clone().into(), Compression::Deflate);
                let mut entry = archive.write_entry_stream(builder).await?;
                let mut file = tokio::fs::File::open(path).await?;
                let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
                loop {
                    if ticket.cancelled() {
                        return Err(ZipStreamError::Cancelled);
                    }
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    entry.write_all(&buf[..n]).await?;
                    ticket.add_progress(n as u64);
                }
                entry.close().await?;
            }
        }
    }

    archive.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, bytes: &[u8]) {
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn directory_plan_is_lowercase_sorted_with_dirs_before_children() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("Zeta.txt"), b"z");
        touch(&root.join("alpha.txt"), b"a");
        fs::create_dir(root.join("Beta")).unwrap();
        touch(&root.join("Beta").join("inner.txt"), b"i");

        let plans = plan_directory(root, false).unwrap();
        let names: Vec<&str> = plans.iter().map(|p| p.entry_name.as_str()).collect();
        assert_eq!(names, vec!["alpha.txt", "Beta/", "Beta/inner.txt", "Zeta.txt"]);
    }

    #[test]
    fn hidden_entries_are_filtered_unless_shown() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join(".hidden"), b"h");
        touch(&root.join("visible.txt"), b"v");

        let plans = plan_directory(root, false).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].entry_name, "visible.txt");

        let plans = plan_directory(root, true).unwrap();
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn batch_plan_deduplicates_entry_names() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        touch(&dir_a.path().join("report.pdf"), b"a");
        touch(&dir_b.path().join("report.pdf"), b"bb");

        let selection = vec![
            ("report.pdf".to_string(), dir_a.path().join("report.pdf")),
            ("report.pdf".to_string(), dir_b.path().join("report.pdf")),
        ];
        let plans = plan_batch(&selection, false).unwrap();
        let names: Vec<&str> = plans.iter().map(|p| p.entry_name.as_str()).collect();
        assert_eq!(names, vec!["report.pdf", "report (1).pdf"]);
    }

    #[test]
    fn plan_sizes_sum_file_bytes_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("a.bin"), &[0u8; 10]);
        fs::create_dir(root.join("sub")).unwrap();
        touch(&root.join("sub").join("b.bin"), &[0u8; 32]);

        let plans = plan_directory(root, false).unwrap();
        let total: u64 = plans.iter().filter_map(|p| p.size).sum();
        assert_eq!(total, 42);
    }
}
