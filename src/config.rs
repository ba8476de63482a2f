use std::path::PathBuf;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::ErrorReport;

/// Call-depth ceiling for the default interpreter backend.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;

/// Wall-clock budget for one on-function call under the default backend.
pub const DEFAULT_ON_FN_TIME_LIMIT: Duration = Duration::from_millis(10);

/// Init settings, consumed by [`crate::Grug::new`]. Everything has a
/// default: an empty config scans `./mods` with the interpreter backend
/// and logs error reports as warnings.
#[derive(Default)]
pub struct GrugConfig {
    /// Root of the mod tree. Missing is fine, the tree is just empty
    /// until it appears; existing as a non-directory is a config error.
    pub mods_folder: Option<PathBuf>,
    /// Compilation backend. `None` selects the reference interpreter.
    pub backend: Option<Box<dyn Backend>>,
    /// Receives every non-fatal error report: runtime errors, deletions
    /// of scripts with live entities, unreadable directories.
    pub error_handler: Option<Box<dyn FnMut(&ErrorReport)>>,
    pub fast_mode: bool,
    /// Interpreter limits. Custom backends bring their own budgets.
    pub max_call_depth: Option<usize>,
    pub on_fn_time_limit: Option<Duration>,
}

impl GrugConfig {
    pub fn with_mods_folder(path: impl Into<PathBuf>) -> Self {
        GrugConfig { mods_folder: Some(path.into()), ..GrugConfig::default() }
    }
}
