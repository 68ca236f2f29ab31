//! Rule runners: what a worker executes for one event.
//!
//! [`CommandRunner`] runs an external program with the event in its
//! environment. The child is spawned with `kill_on_drop`, so aborting the
//! worker task after a hard timeout also kills the process.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use hotplug_core::db::is_valid_tag;
use hotplug_core::{Action, Device, Execution, SeqNum};
use tokio::process::Command;

/// Exit status (`EX_TEMPFAIL`) a rules program uses to report a locked device.
pub const EXIT_DEVICE_LOCKED: i32 = 75;

/// Environment variable set when the lock ceiling forced this run.
pub const IGNORE_LOCK_ENV: &str = "HOTPLUG_IGNORE_LOCK";

/// One unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub seq: SeqNum,
    pub action: Action,
    pub device: Device,
    /// Run even if the device is still locked.
    pub ignore_lock: bool,
}

/// Executes the rules for one event inside a worker.
pub trait RuleRunner: Send + Sync + 'static {
    fn run(&self, job: Job) -> impl Future<Output = Execution> + Send;
}

/// Runs no rules: every event succeeds with its device unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRunner;

impl RuleRunner for PassthroughRunner {
    fn run(&self, job: Job) -> impl Future<Output = Execution> + Send {
        async move { Execution::success(job.device) }
    }
}

/// Runs an external rules program once per event.
///
/// Exit status 0 is success and every `KEY=VALUE` line on stdout is merged
/// into the device (`TAG=name` adds a tag). Exit status
/// [`EXIT_DEVICE_LOCKED`] reports a locked device. Anything else is a rule
/// engine failure.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, job: &Job) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.envs(&job.device.properties)
            .env("ACTION", job.action.to_string())
            .env("DEVPATH", job.device.devpath.as_str())
            .env("SUBSYSTEM", &job.device.subsystem)
            .env("SEQNUM", job.seq.to_string());
        if let Some(old) = &job.device.devpath_old {
            cmd.env("DEVPATH_OLD", old.as_str());
        }
        if let Some(devtype) = &job.device.devtype {
            cmd.env("DEVTYPE", devtype);
        }
        if let Some(devnum) = job.device.devnum {
            cmd.env("MAJOR", devnum.major.to_string())
                .env("MINOR", devnum.minor.to_string());
        }
        if let Some(ifindex) = job.device.ifindex {
            cmd.env("IFINDEX", ifindex.to_string());
        }
        if job.ignore_lock {
            cmd.env(IGNORE_LOCK_ENV, "1");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_program(&self, job: Job) -> Execution {
        let output = match self.command(&job).output().await {
            Ok(output) => output,
            Err(err) => {
                return Execution::failed(
                    job.device,
                    format!("failed to run {}: {err}", self.program.display()),
                )
            }
        };

        match output.status.code() {
            Some(0) => {
                let mut device = job.device;
                apply_rule_output(&mut device, &String::from_utf8_lossy(&output.stdout));
                Execution::success(device)
            }
            Some(EXIT_DEVICE_LOCKED) => Execution::locked(job.device),
            Some(code) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = match stderr.trim() {
                    "" => format!("exit status {code}"),
                    detail => format!("exit status {code}: {detail}"),
                };
                Execution::failed(job.device, reason)
            }
            None => Execution::failed(job.device, "terminated by signal"),
        }
    }
}

impl RuleRunner for CommandRunner {
    fn run(&self, job: Job) -> impl Future<Output = Execution> + Send {
        self.run_program(job)
    }
}

/// Merge `KEY=VALUE` lines into `device`; `TAG=name` adds a tag.
pub fn apply_rule_output(device: &mut Device, stdout: &str) {
    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if key == "TAG" {
            if is_valid_tag(value) {
                device.tags.insert(value.to_string());
            } else if !value.is_empty() {
                tracing::warn!(devpath = %device.devpath, tag = value, "ignoring invalid tag from rules");
            }
        } else {
            device.properties.insert(key.to_string(), value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotplug_core::Outcome;
    use std::io::Write;
    use tempfile::TempDir;

    fn job(ignore_lock: bool) -> Job {
        Job {
            seq: SeqNum(12),
            action: Action::Add,
            device: Device::new("/devices/virtual/block/loop0", Action::Add, "block"),
            ignore_lock,
        }
    }

    #[cfg(unix)]
    fn script(dir: &TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("rules.sh");
        let mut file = std::fs::File::create(&path).expect("create script");
        writeln!(file, "#!/bin/sh\n{body}").expect("write script");
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[test]
    fn rule_output_sets_properties_and_tags() {
        let mut device = Device::new("/devices/usb1", Action::Add, "usb");
        apply_rule_output(&mut device, "ID_MODEL=stick\nTAG=uaccess\nnoise\n=skipped\n");
        assert_eq!(device.properties.get("ID_MODEL").map(String::as_str), Some("stick"));
        assert!(device.tags.contains("uaccess"));
        assert_eq!(device.properties.len(), 1);
    }

    #[test]
    fn rule_output_drops_tags_that_are_not_one_component() {
        let mut device = Device::new("/devices/usb1", Action::Add, "usb");
        apply_rule_output(&mut device, "TAG=/tmp/elsewhere\nTAG=..\nTAG=a/b\nTAG=seat\n");
        assert_eq!(device.tags.iter().collect::<Vec<_>>(), vec!["seat"]);
    }

    #[tokio::test]
    async fn passthrough_succeeds_unchanged() {
        let job = job(false);
        let execution = PassthroughRunner.run(job.clone()).await;
        assert_eq!(execution, Execution::success(job.device));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_zero_is_success_with_properties() {
        let dir = TempDir::new().expect("tempdir");
        let runner = CommandRunner::new(script(&dir, "echo \"SEEN_SEQ=$SEQNUM\"\necho \"SEEN_ACTION=$ACTION\""));

        let execution = runner.run(job(false)).await;
        assert_eq!(execution.outcome, Outcome::Success);
        assert_eq!(execution.device.properties["SEEN_SEQ"], "12");
        assert_eq!(execution.device.properties["SEEN_ACTION"], "add");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tempfail_exit_is_device_locked() {
        let dir = TempDir::new().expect("tempdir");
        let runner = CommandRunner::new(script(&dir, "[ -n \"$HOTPLUG_IGNORE_LOCK\" ] && exit 0\nexit 75"));

        assert_eq!(runner.run(job(false)).await.outcome, Outcome::DeviceLocked);
        assert_eq!(runner.run(job(true)).await.outcome, Outcome::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_exit_is_failure_with_stderr() {
        let dir = TempDir::new().expect("tempdir");
        let runner = CommandRunner::new(script(&dir, "echo 'no such rule' >&2\nexit 3"));

        let execution = runner.run(job(false)).await;
        assert_eq!(
            execution.outcome,
            Outcome::RuleEngineFailure("exit status 3: no such rule".to_string())
        );
    }

    #[tokio::test]
    async fn missing_program_is_failure() {
        let runner = CommandRunner::new("/nonexistent/hotplug-rules");
        let execution = runner.run(job(false)).await;
        assert!(matches!(execution.outcome, Outcome::RuleEngineFailure(_)));
    }
}
