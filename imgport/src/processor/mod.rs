//! Phase state machine driving a data source into the target.
//!
//! The processor repeatedly dispatches on its current phase, lets the
//! source (or qemu, for Convert/Resize) decide the next one, and
//! terminates on `Complete` or error. `Pause` is a yield point for the
//! asynchronous upload path: the driver hands control back to the
//! caller and a later resume restarts the loop at the phase the source
//! nominates.
//!
//! Phase map:
//! ```text
//! Info ──→ TransferScratch ─┐
//!    │                      ├──→ Process ──→ Convert ──→ Resize ──→ Complete
//!    ├──→ TransferTarget ───┘
//!    └──→ TransferDataFile ──→ ValidatePause ──→ Pause ··(resume)··→ Convert/Resize
//! ```

mod upload;

pub use upload::{AsyncUploadDataSource, UploadDataSource};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::{ImportError, ImportResult};
use crate::pipeline::{self, TargetLayout};
use crate::qemu::QemuOperations;
use crate::size::Quantity;
use crate::space;
use crate::trace::ErrorTrace;

/// The phase a processing run is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingPhase {
    /// Initial probe; the source decides where to go next.
    Info,
    /// The source writes data into the scratch directory.
    TransferScratch,
    /// The source writes data directly into the target directory.
    TransferTarget,
    /// The source streams directly into the named data file.
    TransferDataFile,
    /// Post-transfer fix-ups before conversion.
    Process,
    /// Validate the staged image, then yield.
    ValidatePause,
    /// Convert the source URL to a RAW image at the data file.
    Convert,
    /// Expand the image to the requested size.
    Resize,
    /// Yield point; the caller resumes later.
    Pause,
    /// Terminal success.
    Complete,
    /// Terminal failure.
    Error,
}

impl ProcessingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingPhase::Info => "Info",
            ProcessingPhase::TransferScratch => "TransferScratch",
            ProcessingPhase::TransferTarget => "TransferTarget",
            ProcessingPhase::TransferDataFile => "TransferDataFile",
            ProcessingPhase::Process => "Process",
            ProcessingPhase::ValidatePause => "ValidatePause",
            ProcessingPhase::Convert => "Convert",
            ProcessingPhase::Resize => "Resize",
            ProcessingPhase::Pause => "Pause",
            ProcessingPhase::Complete => "Complete",
            ProcessingPhase::Error => "Error",
        }
    }

    /// True for the phases that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingPhase::Complete | ProcessingPhase::Error)
    }
}

impl fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingPhase {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Info" => Ok(ProcessingPhase::Info),
            "TransferScratch" => Ok(ProcessingPhase::TransferScratch),
            "TransferTarget" => Ok(ProcessingPhase::TransferTarget),
            "TransferDataFile" => Ok(ProcessingPhase::TransferDataFile),
            "Process" => Ok(ProcessingPhase::Process),
            "ValidatePause" => Ok(ProcessingPhase::ValidatePause),
            "Convert" => Ok(ProcessingPhase::Convert),
            "Resize" => Ok(ProcessingPhase::Resize),
            "Pause" => Ok(ProcessingPhase::Pause),
            "Complete" => Ok(ProcessingPhase::Complete),
            "Error" => Ok(ProcessingPhase::Error),
            other => Err(ImportError::UnknownPhase(other.to_string())),
        }
    }
}

/// What kind of content the target receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    /// Disk-image content; follows the Convert/Resize path.
    #[default]
    Kubevirt,
    /// A tarball unpacked into the target directory; Convert and
    /// Resize are skipped.
    Archive,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Kubevirt => "kubevirt",
            ContentType::Archive => "archive",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubevirt" => Ok(ContentType::Kubevirt),
            "archive" => Ok(ContentType::Archive),
            other => Err(ImportError::Internal(format!(
                "unknown content type {:?}",
                other
            ))),
        }
    }
}

/// Contract for anything that can feed the processor.
///
/// Implementations live outside the core (network clients) or in
/// [`upload`] (the HTTP stream sources). The processor never inspects
/// which variant it drives.
pub trait DataSource: Send {
    /// Initial probe; returns the phase to enter next.
    fn info(&mut self) -> ImportResult<ProcessingPhase>;

    /// Copy bytes to `path` (scratch or target directory). Returns
    /// [`ImportError::InvalidPath`] when the destination is unusable.
    fn transfer(&mut self, path: &Path) -> ImportResult<ProcessingPhase>;

    /// Stream directly into the named file. Only async-capable
    /// sources support this.
    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        let _ = path;
        Err(ImportError::Internal(
            "source does not support direct file transfer".into(),
        ))
    }

    /// Post-transfer fix-ups before conversion.
    fn process(&mut self) -> ImportResult<ProcessingPhase>;

    /// The URL Convert feeds to qemu; `file://` for staged bytes,
    /// remote for pass-through sources.
    fn url(&self) -> Option<String>;

    /// Phase to restart at after a pause. Sources that cannot resume
    /// report `Error`.
    fn resume_phase(&self) -> ProcessingPhase {
        ProcessingPhase::Error
    }

    /// Release any open readers or temp files.
    fn close(&mut self) -> ImportResult<()> {
        Ok(())
    }
}

/// How a pausable run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The run reached `Complete`.
    Done,
    /// The run yielded at a pause point; call
    /// [`DataProcessor::process_data_resume`] to finish it.
    Paused,
}

/// Drives one source through the phase machine into one target.
///
/// The processor exclusively owns its scratch directory and removes it
/// on every exit path. `available_space` is sampled once at
/// construction and never refreshed.
pub struct DataProcessor {
    current_phase: ProcessingPhase,
    source: Box<dyn DataSource>,
    qemu: Arc<dyn QemuOperations>,
    layout: TargetLayout,
    scratch_dir: PathBuf,
    requested_size: Option<Quantity>,
    available_space: i64,
    filesystem_overhead: f64,
}

impl DataProcessor {
    pub fn new(
        source: Box<dyn DataSource>,
        qemu: Arc<dyn QemuOperations>,
        layout: TargetLayout,
        scratch_dir: impl Into<PathBuf>,
        requested_size: Option<Quantity>,
        filesystem_overhead: f64,
    ) -> Self {
        // Snapshot the target size bound before any data moves.
        let mut available_space = layout.available_space();
        if let Some(requested) = requested_size {
            available_space = Quantity::from_bytes(available_space).min(requested).bytes();
        }
        DataProcessor {
            current_phase: ProcessingPhase::Info,
            source,
            qemu,
            layout,
            scratch_dir: scratch_dir.into(),
            requested_size,
            available_space,
            filesystem_overhead,
        }
    }

    pub fn current_phase(&self) -> ProcessingPhase {
        self.current_phase
    }

    /// Run the full pipeline to completion. A source that pauses here
    /// is misconfigured: pauses belong to the async path.
    pub fn process_data(&mut self) -> ImportResult<()> {
        let _scratch = ScratchGuard::arm(&self.scratch_dir);
        match self.run_loop()? {
            ProcessOutcome::Done => Ok(()),
            ProcessOutcome::Paused => Err(ImportError::Internal(
                "processing paused outside of async mode".into(),
            )),
        }
    }

    /// Run the pipeline until it completes or yields at a pause
    /// point. Scratch contents survive a pause; the resume run cleans
    /// them up.
    pub fn process_data_with_pause(&mut self) -> ImportResult<ProcessOutcome> {
        let scratch = ScratchGuard::arm(&self.scratch_dir);
        match self.run_loop() {
            Ok(ProcessOutcome::Paused) => {
                scratch.disarm();
                Ok(ProcessOutcome::Paused)
            }
            other => other,
        }
    }

    /// Restart a paused run at the phase the source nominates and
    /// drive it to completion.
    pub fn process_data_resume(&mut self) -> ImportResult<()> {
        let _scratch = ScratchGuard::arm(&self.scratch_dir);
        let resume = self.source.resume_phase();
        if resume == ProcessingPhase::Error {
            return Err(ImportError::Internal(
                "source cannot resume after pause".into(),
            ));
        }
        tracing::info!(phase = %resume, "resuming processing");
        self.current_phase = resume;
        match self.run_loop()? {
            ProcessOutcome::Done => Ok(()),
            ProcessOutcome::Paused => Err(ImportError::Internal(
                "processing paused during resume".into(),
            )),
        }
    }

    fn run_loop(&mut self) -> ImportResult<ProcessOutcome> {
        loop {
            match self.current_phase {
                ProcessingPhase::Complete => {
                    if let Err(err) = self.source.close() {
                        tracing::warn!(%err, "failed to close data source");
                    }
                    return Ok(ProcessOutcome::Done);
                }
                ProcessingPhase::Pause => return Ok(ProcessOutcome::Paused),
                _ => {}
            }
            match self.step() {
                Ok(next) => {
                    self.current_phase = next;
                    tracing::debug!(phase = %self.current_phase, "new phase");
                }
                Err(err) => {
                    self.current_phase = ProcessingPhase::Error;
                    tracing::error!("{}", ErrorTrace::wrap(&err));
                    if let Err(close_err) = self.source.close() {
                        tracing::warn!(err = %close_err, "failed to close data source");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn step(&mut self) -> ImportResult<ProcessingPhase> {
        match self.current_phase {
            ProcessingPhase::Info => self.source.info(),
            ProcessingPhase::TransferScratch => {
                match self.source.transfer(&self.scratch_dir) {
                    // An unusable scratch path means the operator has to
                    // allocate scratch space and retry.
                    Err(ImportError::InvalidPath) => Err(ImportError::RequiresScratchSpace),
                    other => other,
                }
            }
            ProcessingPhase::TransferTarget => self.source.transfer(self.layout.transfer_dir()),
            ProcessingPhase::TransferDataFile => {
                self.source.transfer_file(self.layout.data_file())
            }
            ProcessingPhase::Process => self.source.process(),
            ProcessingPhase::ValidatePause => {
                self.validate()?;
                Ok(ProcessingPhase::Pause)
            }
            ProcessingPhase::Convert => self.convert(),
            ProcessingPhase::Resize => self.resize(),
            phase => Err(ImportError::UnknownPhase(phase.to_string())),
        }
    }

    /// Validate then convert the source URL into the data file.
    fn convert(&mut self) -> ImportResult<ProcessingPhase> {
        let url = self.source_url()?;
        self.validate_url(&url)?;
        tracing::debug!(%url, "converting source to raw");
        self.qemu
            .convert_to_raw_stream(&url, self.layout.data_file())
            .map_err(|e| ImportError::ConversionFailed(e.to_string()))?;
        if self.layout.is_filesystem() {
            pipeline::set_data_file_permissions(self.layout.data_file())?;
        }
        Ok(ProcessingPhase::Resize)
    }

    /// Resize is a no-op when no size was requested or the data file
    /// is a block device.
    fn resize(&self) -> ImportResult<ProcessingPhase> {
        if let Some(requested) = self.requested_size {
            if space::available_space_block(self.layout.data_file()) < 0 {
                self.resize_image(requested)?;
            }
        }
        Ok(ProcessingPhase::Complete)
    }

    fn resize_image(&self, requested: Quantity) -> ImportResult<()> {
        let data_file = self.layout.data_file();
        let min_size = Quantity::from_bytes(self.available_space).min(requested);
        if min_size != requested {
            // Provisioners sometimes hand out less than was asked for;
            // expand only as far as the volume allows.
            tracing::warn!(
                %requested,
                available = %min_size,
                "available space is less than requested, resizing image to available space"
            );
        }
        let info = self.qemu.info(&pipeline::file_url(data_file))?;
        if info.virtual_size == min_size.bytes() {
            tracing::debug!(size = %min_size, "image already at requested size");
            return Ok(());
        }
        tracing::debug!(size = %min_size, "expanding image");
        self.qemu.resize(data_file, min_size).map_err(|e| match e {
            shrink @ ImportError::ResizeShrinkRefused { .. } => shrink,
            other => ImportError::ResizeFailed(other.to_string()),
        })
    }

    fn validate(&self) -> ImportResult<()> {
        let url = self.source_url()?;
        self.validate_url(&url)
    }

    fn validate_url(&self, url: &str) -> ImportResult<()> {
        tracing::debug!(%url, "validating source image");
        self.qemu.validate(url, self.effective_available())
    }

    fn source_url(&self) -> ImportResult<String> {
        self.source
            .url()
            .ok_or_else(|| ImportError::Internal("source provided no url".into()))
    }

    /// The validation bound: filesystem targets reserve the overhead
    /// fraction, block targets use the raw device size.
    fn effective_available(&self) -> i64 {
        if self.layout.is_filesystem() {
            space::effective_available(self.available_space, self.filesystem_overhead)
        } else {
            self.available_space
        }
    }
}

/// Removes the scratch directory on drop. Armed only when the
/// directory had usable filesystem space at entry.
struct ScratchGuard {
    dir: Option<PathBuf>,
}

impl ScratchGuard {
    fn arm(dir: &Path) -> Self {
        let dir = (space::available_space(dir) > 0).then(|| dir.to_path_buf());
        ScratchGuard { dir }
    }

    /// Leave the directory in place (pause path).
    fn disarm(mut self) {
        self.dir = None;
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            match fs::remove_dir_all(&dir) {
                Ok(()) => tracing::debug!(dir = %dir.display(), "removed scratch directory"),
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), %err, "failed to remove scratch directory")
                }
            }
        }
    }
}
