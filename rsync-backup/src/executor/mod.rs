//! Backup job executor - runs one host backup end to end.
//!
//! Stages, in order:
//! - connectivity probe (`NOOP` over ssh), failure is only a warning
//! - pre-backup hook (`PRE_BACKUP` over ssh), failure fails the run
//! - one rsync transfer per volume into the sync workspace
//! - finalize the workspace into a snapshot (successful runs only)
//! - retention sweep
//! - changed-file statistics
//! - notification

pub mod command;
pub mod stats;

use crate::config::{HostConfig, SshConfig, VolumeConfig};
use crate::notify::Notifier;
use crate::retention;
use crate::snapshot::{snapshot_now, SnapshotStore};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::{format_duration, format_size};
use chrono::{Local, NaiveDateTime};
use command::{render_command, CommandRunner, CommandSpec, LineSink, LogSink, ProcessRunner};
use stats::{find_changed_files_command, FindOutputConsumer};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{dispatcher, info, warn, Span};

/// Remote command used to probe connectivity
pub const PROBE_COMMAND: &str = "NOOP";

/// Remote command run before the transfer
pub const PRE_BACKUP_COMMAND: &str = "PRE_BACKUP";

/// rsync exit code for "some files vanished before they could be transferred"
const RSYNC_PARTIAL_VANISHED: i32 = 24;

/// Outcome of one host run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatistics {
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
    pub ok: bool,
    pub errors: Vec<String>,
    pub changed_file_count: u64,
    pub changed_file_size: u64,
}

impl RunStatistics {
    pub fn started_at(start: NaiveDateTime) -> Self {
        Self {
            start,
            end: None,
            ok: true,
            errors: Vec::new(),
            changed_file_count: 0,
            changed_file_size: 0,
        }
    }

    /// Record an error without failing the run
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.errors.push(message);
    }

    /// Record an error and mark the run failed
    pub fn fail(&mut self, message: impl Into<String>) {
        self.warn(message);
        self.ok = false;
    }

    /// End time, or the start time while the run is still going
    pub fn finished(&self) -> NaiveDateTime {
        self.end.unwrap_or(self.start)
    }

    pub fn duration_secs(&self) -> u64 {
        (self.finished() - self.start).num_seconds().max(0) as u64
    }

    /// Turn a failed run into an error carrying its messages
    pub fn ensure_ok(&self, host: &str) -> Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(BackupError::RunFailed(format!(
                "{}: {}",
                host,
                self.errors.join("; ")
            )))
        }
    }
}

/// Runs host backups through external ssh and rsync processes
pub struct BackupExecutor {
    runner: Arc<dyn CommandRunner>,
    ssh: SshConfig,
    notifier: Notifier,
}

impl BackupExecutor {
    pub fn new(ssh: SshConfig) -> Self {
        Self::with_runner(ssh, Arc::new(ProcessRunner::default()))
    }

    pub fn with_runner(ssh: SshConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            ssh,
            notifier: Notifier::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Back up one host.
    ///
    /// Stage failures are recorded in the returned statistics. Only a missing
    /// storage directory or a failed finalize is returned as an error; the
    /// notification is still sent in the latter case.
    pub async fn run(&self, host: &HostConfig) -> Result<RunStatistics> {
        let mut stats = RunStatistics::started_at(Local::now().naive_local());
        info!("Starting backup");

        let store = SnapshotStore::open(&host.host_storage_dir)?;
        let current = store.refresh_current_pointer()?;
        let workspace = store.open_workspace()?;

        let probe = self.ssh_command(host, Some(PROBE_COMMAND));
        match self.execute("SSH-TEST", &probe).await {
            Ok(0) => {}
            Ok(code) => stats.warn(format!(
                "Error when running remote {} command. Exit code {}",
                PROBE_COMMAND, code
            )),
            Err(e) => stats.warn(format!(
                "Error when running remote {} command: {}",
                PROBE_COMMAND, e
            )),
        }

        let hook = self.ssh_command(host, Some(PRE_BACKUP_COMMAND));
        match self.execute(PRE_BACKUP_COMMAND, &hook).await {
            Ok(0) => {}
            Ok(code) => stats.fail(format!(
                "Error when running remote {} command. Exit code {}",
                PRE_BACKUP_COMMAND, code
            )),
            Err(e) => stats.fail(format!(
                "Error when running remote {} command: {}",
                PRE_BACKUP_COMMAND, e
            )),
        }

        for volume in &host.volumes {
            let transfer = self.rsync_command(host, volume, current.as_deref(), &workspace);
            match self.execute("RSYNC", &transfer).await {
                Ok(0) => info!("Rsync exited with status 0 - backup succeeded."),
                Ok(RSYNC_PARTIAL_VANISHED) => info!(
                    "Rsync exited with status 24 - backup succeeded but some files vanished during transfer"
                ),
                Ok(code) => stats.fail(format!(
                    "Errors in rsync for {}: exit code {}",
                    volume.volume, code
                )),
                Err(e) => stats.fail(format!("Errors in rsync for {}: {}", volume.volume, e)),
            }
        }

        stats.end = Some(Local::now().naive_local());

        let mut outcome = Ok(());
        if stats.ok {
            match self.finalize(&store).await {
                Ok(snapshot) => {
                    self.enforce_retention(host, &store).await;
                    self.collect_statistics(&store, snapshot, &mut stats).await;

                    info!(
                        "Statistics: {} files changed, using {} of disk space. Duration: {}",
                        stats.changed_file_count,
                        format_size(stats.changed_file_size),
                        format_duration(stats.duration_secs())
                    );
                }
                Err(e) => {
                    stats.fail(format!("Failed to finalize backup: {}", e));
                    outcome = Err(e);
                }
            }
        }

        if let Some(target) = &host.notify {
            self.notifier.notify(target, &stats).await;
        }

        info!("Backup finished.");
        outcome.map(|_| stats)
    }

    /// ssh invocation; without a remote command this is the `--rsh` value for rsync
    pub fn ssh_command(&self, host: &HostConfig, remote_command: Option<&str>) -> CommandSpec {
        let mut command = CommandSpec::new(Vec::new()).with_env("SSH_AUTH_SOCK", "");
        command.push_template(&host.cmd_ssh);

        if let Some(port) = host.remote_ssh_port {
            command.arg("-p").arg(port.to_string());
        }
        command
            .arg("-i")
            .arg(self.ssh.private_key.to_string_lossy())
            .arg("-o")
            .arg(format!("UserKnownHostsFile {}", self.ssh.known_hosts.display()))
            .arg("-o")
            .arg("HashKnownHosts no");

        // The probe is what records the host key on first contact
        if remote_command == Some(PROBE_COMMAND) {
            command.arg("-o").arg("StrictHostKeyChecking no");
        }

        if let Some(remote_command) = remote_command {
            command
                .arg(format!("root@{}", host.remote_address))
                .arg(remote_command);
        }
        command
    }

    /// rsync invocation transferring one volume into the workspace
    pub fn rsync_command(
        &self,
        host: &HostConfig,
        volume: &VolumeConfig,
        current: Option<&Path>,
        workspace: &Path,
    ) -> CommandSpec {
        let mut command = CommandSpec::new(Vec::new()).with_env("SSH_AUTH_SOCK", "");
        command.push_template(&host.cmd_nice);
        command.push_template(&host.cmd_rsync);

        command
            .arg("-a")
            .arg("-v")
            // needs the storage filesystem mounted with user_xattr
            .arg("--fake-super")
            .arg("--delete")
            .arg("--numeric-ids")
            .arg("--relative")
            .arg("--sparse");

        if let Some(current) = current {
            command
                .arg("--link-dest")
                .arg(current.join(&volume.volume).to_string_lossy());
        }
        command.arg("--delete-excluded");
        for pattern in &volume.exclude {
            command.arg("--exclude").arg(pattern.as_str());
        }

        let rsh = self.ssh_command(host, None);
        command
            .arg("--rsh")
            .arg(render_command(&rsh.argv, &[]))
            .arg(format!("root@{}:/{}/", host.remote_address, volume.volume))
            .arg(format!("{}/", workspace.join(&volume.volume).display()));

        command
    }

    async fn execute(&self, label: &str, command: &CommandSpec) -> Result<i32> {
        let mut sink = LogSink::new(label);
        self.execute_with(label, command, &mut sink).await
    }

    async fn execute_with(
        &self,
        label: &str,
        command: &CommandSpec,
        sink: &mut dyn LineSink,
    ) -> Result<i32> {
        info!("Executing {}: {}", label, command);
        self.runner.run(label, command, sink).await
    }

    async fn finalize(&self, store: &SnapshotStore) -> Result<NaiveDateTime> {
        let store = store.clone();
        spawn_blocking_in_span(move || store.finalize()).await?
    }

    async fn enforce_retention(&self, host: &HostConfig, store: &SnapshotStore) {
        info!("Deleting old backups");

        let Some(strategy) = host.keep_strategy.clone() else {
            warn!("No keep strategy defined. Keeping all backups forever");
            return;
        };

        let store = store.clone();
        let sweep = spawn_blocking_in_span(move || {
            retention::prune(&store, strategy.as_ref(), snapshot_now())
        })
        .await;

        match sweep {
            Ok(Ok(report)) => info!(
                kept = report.kept.len(),
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Retention sweep finished"
            ),
            Ok(Err(e)) => warn!("Retention sweep failed: {}", e),
            Err(e) => warn!("Retention sweep aborted: {}", e),
        }
    }

    async fn collect_statistics(
        &self,
        store: &SnapshotStore,
        snapshot: NaiveDateTime,
        stats: &mut RunStatistics,
    ) {
        let command = find_changed_files_command(&store.snapshot_path(snapshot));
        let mut consumer = FindOutputConsumer::default();

        match self.execute_with("FIND", &command, &mut consumer).await {
            Ok(code) => {
                if code != 0 {
                    warn!("find exited with status {}, statistics may be incomplete", code);
                }
                stats.changed_file_count = consumer.total_count;
                stats.changed_file_size = consumer.total_size;
            }
            Err(e) => warn!("Failed to collect statistics: {}", e),
        }
    }
}

/// Run filesystem work on the blocking pool under the caller's span and subscriber
fn spawn_blocking_in_span<F, T>(work: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    let dispatch = dispatcher::get_default(|current| current.clone());
    tokio::task::spawn_blocking(move || {
        dispatcher::with_default(&dispatch, || span.in_scope(work))
    })
}
