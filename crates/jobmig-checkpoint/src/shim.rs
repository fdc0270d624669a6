//! Launch-time checkpoint shim.
//!
//! Runs on the compute side when a task starts and exits. On start it
//! prefixes the task's command with the checkpoint start script, which
//! brings up a coordinator and runs the program under it, then records the
//! job as checkpointable. On exit it removes the coordinator marker left
//! in the job's checkpoint directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use jobmig_core::JobId;
use tracing::{debug, info};

use crate::error::CheckpointResult;
use crate::service::CheckpointMarker;

/// Script that starts a coordinator and execs the wrapped command.
pub const DEFAULT_START_SCRIPT: &str = "/usr/libexec/jobmig/cr_start.sh";

/// Marker file the coordinator leaves under `<ckpt_dir>/<job_id>/`.
pub const COORDINATOR_FILE: &str = "coordinator";

/// Set in the environment of interactive step launches, which are never
/// wrapped.
pub const INTERACTIVE_ENV: &str = "SRUN_DEBUG";

/// User option that opts a job out of checkpointing.
pub const OPT_OUT_FLAG: &str = "--no-checkpoint";

/// Launch-time hooks that wrap a job's command for checkpointing.
#[derive(Debug, Clone)]
pub struct CheckpointShim {
    start_script: PathBuf,
    disabled: bool,
}

impl Default for CheckpointShim {
    fn default() -> Self {
        Self::new(DEFAULT_START_SCRIPT)
    }
}

impl CheckpointShim {
    pub fn new(start_script: impl Into<PathBuf>) -> Self {
        Self {
            start_script: start_script.into(),
            disabled: false,
        }
    }

    /// Apply user options. Only [`OPT_OUT_FLAG`] is recognized.
    pub fn with_options<S: AsRef<str>>(mut self, options: &[S]) -> Self {
        if options.iter().any(|o| o.as_ref() == OPT_OUT_FLAG) {
            self.disabled = true;
        }
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Called at task start. Returns the argv to launch.
    ///
    /// `env` looks up the task's environment.
    pub fn task_init<M, E>(&self, job_id: JobId, argv: Vec<String>, env: E, marker: &M) -> Vec<String>
    where
        M: CheckpointMarker + ?Sized,
        E: Fn(&str) -> Option<String>,
    {
        if self.disabled {
            debug!(job_id, "checkpointing disabled by user option");
            marker.mark_job_checkpointable(job_id, false);
            return argv;
        }

        if env(INTERACTIVE_ENV).is_some() {
            debug!(job_id, "interactive step launch, leaving command untouched");
            return argv;
        }

        let mut wrapped = Vec::with_capacity(argv.len() + 1);
        wrapped.push(self.start_script.display().to_string());
        wrapped.extend(argv);

        marker.mark_job_checkpointable(job_id, true);
        info!(job_id, script = %self.start_script.display(), "task wrapped for checkpointing");
        wrapped
    }

    /// Called at task exit. Returns whether a coordinator marker was removed.
    pub fn task_exit(&self, checkpoint_dir: &Path, job_id: JobId) -> CheckpointResult<bool> {
        let marker = checkpoint_dir.join(job_id.to_string()).join(COORDINATOR_FILE);
        match std::fs::remove_file(&marker) {
            Ok(()) => {
                debug!(job_id, path = ?marker, "coordinator marker removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Marks(RefCell<HashMap<JobId, bool>>);

    impl CheckpointMarker for Marks {
        fn mark_job_checkpointable(&self, job_id: JobId, capable: bool) {
            self.0.borrow_mut().insert(job_id, capable);
        }
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn wraps_batch_launch_and_marks_job() {
        let shim = CheckpointShim::new("/opt/cr_start.sh");
        let marks = Marks::default();

        let out = shim.task_init(42, argv(&["./solver", "-n", "8"]), no_env, &marks);

        assert_eq!(out, argv(&["/opt/cr_start.sh", "./solver", "-n", "8"]));
        assert_eq!(marks.0.borrow().get(&42), Some(&true));
    }

    #[test]
    fn opt_out_leaves_command_and_marks_not_capable() {
        let shim = CheckpointShim::default().with_options(&["--no-checkpoint"]);
        assert!(shim.is_disabled());
        let marks = Marks::default();

        let out = shim.task_init(7, argv(&["./a.out"]), no_env, &marks);

        assert_eq!(out, argv(&["./a.out"]));
        assert_eq!(marks.0.borrow().get(&7), Some(&false));
    }

    #[test]
    fn interactive_launch_is_untouched() {
        let shim = CheckpointShim::default();
        let marks = Marks::default();

        let out = shim.task_init(
            9,
            argv(&["hostname"]),
            |k| (k == INTERACTIVE_ENV).then(|| "0".to_string()),
            &marks,
        );

        assert_eq!(out, argv(&["hostname"]));
        assert!(marks.0.borrow().is_empty());
    }

    #[test]
    fn unknown_options_are_ignored() {
        let shim = CheckpointShim::default().with_options(&["--verbose"]);
        assert!(!shim.is_disabled());
    }

    #[test]
    fn task_exit_removes_coordinator_marker() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("42");
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join(COORDINATOR_FILE), b"host:7779").unwrap();

        let shim = CheckpointShim::default();
        assert!(shim.task_exit(dir.path(), 42).unwrap());
        assert!(!job_dir.join(COORDINATOR_FILE).exists());

        // Second exit finds nothing to remove.
        assert!(!shim.task_exit(dir.path(), 42).unwrap());
    }
}
