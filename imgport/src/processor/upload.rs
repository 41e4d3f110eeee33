//! Data sources fed by an HTTP upload stream.
//!
//! The stream's leading bytes decide the route: qcow2 images are
//! staged in scratch and converted, raw images are written straight to
//! the data file, archives are unpacked into the target directory.
//! The synchronous source finishes the pipeline inside the request;
//! the asynchronous source stops at a validation checkpoint so the
//! server can acknowledge the client before Convert/Resize run.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use crate::constants::files;
use crate::errors::{ImportError, ImportResult};
use crate::pipeline;
use crate::processor::{ContentType, DataSource, ProcessingPhase};

// QCOW2 header magic, "QFI\xfb".
const QCOW2_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xfb];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamFormat {
    Raw,
    Qcow2,
}

/// The incoming byte stream plus the header bytes consumed while
/// sniffing the format.
struct UploadStream<R> {
    reader: Option<R>,
    header: Vec<u8>,
}

impl<R: Read> UploadStream<R> {
    fn new(reader: R) -> Self {
        UploadStream {
            reader: Some(reader),
            header: Vec::new(),
        }
    }

    /// Read just enough of the stream to recognize the image format.
    /// Anything that does not carry the qcow2 magic is treated as raw.
    fn sniff(&mut self) -> ImportResult<StreamFormat> {
        let reader = self.reader_mut()?;
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader
                .read(&mut header[filled..])
                .map_err(|e| ImportError::Stream(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.header = header[..filled].to_vec();
        if self.header == QCOW2_MAGIC {
            Ok(StreamFormat::Qcow2)
        } else {
            Ok(StreamFormat::Raw)
        }
    }

    /// Drain the stream (header first) into `file` and fsync it.
    fn write_to(&mut self, file: &mut File) -> ImportResult<u64> {
        file.write_all(&self.header)
            .map_err(|e| ImportError::Stream(e.to_string()))?;
        let written = self.header.len() as u64;
        let reader = self.reader_mut()?;
        let copied = io::copy(reader, file).map_err(|e| ImportError::Stream(e.to_string()))?;
        file.sync_all()
            .map_err(|e| ImportError::Stream(e.to_string()))?;
        Ok(written + copied)
    }

    /// Hand the remaining stream (header included) to a consumer.
    fn take_reader(&mut self) -> ImportResult<impl Read> {
        let header = std::mem::take(&mut self.header);
        let reader = self
            .reader
            .take()
            .ok_or_else(|| ImportError::Stream("upload stream already consumed".into()))?;
        Ok(io::Cursor::new(header).chain(reader))
    }

    fn reader_mut(&mut self) -> ImportResult<&mut R> {
        self.reader
            .as_mut()
            .ok_or_else(|| ImportError::Stream("upload stream already consumed".into()))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Open the transfer destination. Block devices are opened in place,
/// regular files are created fresh.
fn open_data_file(path: &Path) -> io::Result<File> {
    let is_block = std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);
    if is_block {
        OpenOptions::new().write(true).open(path)
    } else {
        File::create(path)
    }
}

fn finish_data_file(path: &Path) -> ImportResult<()> {
    let is_file = std::fs::metadata(path)
        .map(|m| m.file_type().is_file())
        .unwrap_or(false);
    if is_file {
        pipeline::set_data_file_permissions(path)?;
    }
    Ok(())
}

/// Synchronous upload source: the whole pipeline runs inside the
/// request.
pub struct UploadDataSource<R> {
    stream: UploadStream<R>,
    content_type: ContentType,
    staged_url: Option<String>,
}

impl<R: Read + Send> UploadDataSource<R> {
    pub fn new(reader: R, content_type: ContentType) -> Self {
        UploadDataSource {
            stream: UploadStream::new(reader),
            content_type,
            staged_url: None,
        }
    }
}

impl<R: Read + Send> DataSource for UploadDataSource<R> {
    fn info(&mut self) -> ImportResult<ProcessingPhase> {
        match self.content_type {
            ContentType::Archive => Ok(ProcessingPhase::TransferTarget),
            ContentType::Kubevirt => match self.stream.sniff()? {
                // Raw bytes are already in final form; skip staging.
                StreamFormat::Raw => Ok(ProcessingPhase::TransferDataFile),
                StreamFormat::Qcow2 => Ok(ProcessingPhase::TransferScratch),
            },
        }
    }

    fn transfer(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        match self.content_type {
            ContentType::Archive => {
                unpack_archive(&mut self.stream, path)?;
                Ok(ProcessingPhase::Complete)
            }
            ContentType::Kubevirt => {
                let staged = stage_to_scratch(&mut self.stream, path)?;
                self.staged_url = Some(staged);
                Ok(ProcessingPhase::Process)
            }
        }
    }

    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        let mut file = open_data_file(path).map_err(|e| ImportError::Stream(e.to_string()))?;
        let written = self.stream.write_to(&mut file)?;
        finish_data_file(path)?;
        tracing::info!(dest = %path.display(), written, "upload written to data file");
        self.staged_url = Some(pipeline::file_url(path));
        Ok(ProcessingPhase::Resize)
    }

    fn process(&mut self) -> ImportResult<ProcessingPhase> {
        Ok(ProcessingPhase::Convert)
    }

    fn url(&self) -> Option<String> {
        self.staged_url.clone()
    }

    fn close(&mut self) -> ImportResult<()> {
        self.stream.close();
        Ok(())
    }
}

/// Asynchronous upload source: stops at a validation checkpoint once
/// the bytes are staged, then resumes with the remaining phases after
/// the HTTP response has gone out. Archive content has nothing left to
/// do after the unpack, so it completes without pausing.
pub struct AsyncUploadDataSource<R> {
    stream: UploadStream<R>,
    content_type: ContentType,
    staged_url: Option<String>,
    resume: ProcessingPhase,
}

impl<R: Read + Send> AsyncUploadDataSource<R> {
    pub fn new(reader: R, content_type: ContentType) -> Self {
        AsyncUploadDataSource {
            stream: UploadStream::new(reader),
            content_type,
            staged_url: None,
            resume: ProcessingPhase::Error,
        }
    }
}

impl<R: Read + Send> DataSource for AsyncUploadDataSource<R> {
    fn info(&mut self) -> ImportResult<ProcessingPhase> {
        match self.content_type {
            ContentType::Archive => Ok(ProcessingPhase::TransferTarget),
            ContentType::Kubevirt => match self.stream.sniff()? {
                StreamFormat::Raw => Ok(ProcessingPhase::TransferDataFile),
                StreamFormat::Qcow2 => Ok(ProcessingPhase::TransferScratch),
            },
        }
    }

    fn transfer(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        match self.content_type {
            ContentType::Archive => {
                unpack_archive(&mut self.stream, path)?;
                Ok(ProcessingPhase::Complete)
            }
            ContentType::Kubevirt => {
                let staged = stage_to_scratch(&mut self.stream, path)?;
                self.staged_url = Some(staged);
                self.resume = ProcessingPhase::Convert;
                Ok(ProcessingPhase::ValidatePause)
            }
        }
    }

    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        let mut file = open_data_file(path).map_err(|e| ImportError::Stream(e.to_string()))?;
        let written = self.stream.write_to(&mut file)?;
        finish_data_file(path)?;
        tracing::info!(dest = %path.display(), written, "upload staged on target");
        self.staged_url = Some(pipeline::file_url(path));
        self.resume = ProcessingPhase::Resize;
        Ok(ProcessingPhase::ValidatePause)
    }

    fn process(&mut self) -> ImportResult<ProcessingPhase> {
        Err(ImportError::Internal(
            "async upload source has no process step".into(),
        ))
    }

    fn url(&self) -> Option<String> {
        self.staged_url.clone()
    }

    fn resume_phase(&self) -> ProcessingPhase {
        self.resume
    }

    fn close(&mut self) -> ImportResult<()> {
        self.stream.close();
        Ok(())
    }
}

/// Unpack the stream as a tarball into the target directory.
fn unpack_archive<R: Read>(stream: &mut UploadStream<R>, dir: &Path) -> ImportResult<()> {
    let reader = stream.take_reader()?;
    tar::Archive::new(reader)
        .unpack(dir)
        .map_err(|e| ImportError::Stream(format!("unpacking archive: {}", e)))?;
    tracing::info!(dir = %dir.display(), "archive unpacked");
    Ok(())
}

/// Write the stream into a staging file under the scratch directory.
/// A destination that cannot be created is reported as an invalid
/// path so the driver can ask the operator for scratch space.
fn stage_to_scratch<R: Read>(
    stream: &mut UploadStream<R>,
    scratch_dir: &Path,
) -> ImportResult<String> {
    let dest = scratch_dir.join(files::SCRATCH_IMAGE_NAME);
    let mut file = File::create(&dest).map_err(|err| {
        tracing::warn!(dest = %dest.display(), %err, "cannot create scratch staging file");
        ImportError::InvalidPath
    })?;
    let written = stream.write_to(&mut file)?;
    tracing::info!(dest = %dest.display(), written, "upload staged in scratch");
    Ok(pipeline::file_url(&dest))
}
