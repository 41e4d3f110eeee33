//! Error wrapper carrying a pruned stack trace.
//!
//! Failures that terminate a processor run are logged with the call
//! path that produced them, limited to this project's own frames.
//! Frames are captured eagerly at construction; the walk stops at the
//! first frame that lives outside the project tree.

use std::fmt;

use backtrace::Backtrace;

/// Marker identifying this project's source files in frame paths.
///
/// Determining the project root dynamically is fragile, so the marker
/// is hardcoded the same way the crate name is.
const PROJECT_MARKER: &str = "imgport";

/// A message with the pruned stack frames that led to it.
pub struct ErrorTrace {
    message: String,
    frames: Vec<TraceFrame>,
}

/// One retained stack frame.
#[derive(Debug, Clone)]
pub(crate) struct TraceFrame {
    pub(crate) function: String,
    pub(crate) line: u32,
}

impl ErrorTrace {
    /// Capture the current call stack under `message`.
    pub fn new(message: impl Into<String>) -> Self {
        ErrorTrace {
            message: message.into().trim_end_matches('\n').to_string(),
            frames: capture_project_frames(),
        }
    }

    /// Wrap an existing error, capturing the stack at the wrap site.
    pub fn wrap(err: &dyn std::error::Error) -> Self {
        Self::new(err.to_string())
    }

    /// The wrapped message, without the trace.
    pub fn message(&self) -> &str {
        &self.message
    }

    #[cfg(test)]
    pub(crate) fn from_parts(message: &str, frames: Vec<TraceFrame>) -> Self {
        ErrorTrace {
            message: message.to_string(),
            frames,
        }
    }
}

impl fmt::Display for ErrorTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR: {}\n\tStack Trace:\n", self.message)?;
        // Deepest frame is captured first and printed last.
        for frame in self.frames.iter().rev() {
            writeln!(f, "\t=> {}(L{})", frame.function, frame.line)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ErrorTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for ErrorTrace {}

/// Walk the stack, skip this module's own frames, then keep frames
/// whose file path lies within the project tree. The walk ends at the
/// first foreign frame so library plumbing never shows up.
fn capture_project_frames() -> Vec<TraceFrame> {
    let bt = Backtrace::new();
    let mut frames = Vec::new();
    let mut in_project = false;
    'walk: for frame in bt.frames() {
        for symbol in frame.symbols() {
            let (Some(file), Some(name), Some(line)) =
                (symbol.filename(), symbol.name(), symbol.lineno())
            else {
                continue;
            };
            let function = name.to_string();
            // Skip the capture machinery itself.
            if function.contains("::trace::") {
                continue;
            }
            if file.to_string_lossy().contains(PROJECT_MARKER) {
                in_project = true;
                frames.push(TraceFrame { function, line });
            } else if in_project {
                break 'walk;
            }
        }
    }
    frames
}
