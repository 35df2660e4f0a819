//! Build and flash pipeline.
//!
//! Both entry points take the exclusive section for their whole run. Holding
//! the [`ExclusiveGuard`] on the stack means the flag is released on every
//! exit: success, tool failure, spawn failure, early `?` or panic.
//!
//! Tool output is streamed line by line into the hub (`BUILD` / `FLASH`
//! tags). Success is decided by the exit status alone; build lines matching
//! `error`/`failed` are only counted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use microclaw_core::{replay_commands, ConfigStorage, EventTag, LogEvent};
use microclaw_protocol::{FlashReport, ReplayOutcome};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result, Stage};
use crate::exclusive::ExclusiveGuard;
use crate::hub::BroadcastHub;
use crate::session::SessionManager;

/// Flash offset of the second-stage bootloader.
pub const BOOTLOADER_OFFSET: u32 = 0x1000;
/// Flash offset of the partition table.
pub const PARTITIONS_OFFSET: u32 = 0x8000;
/// Flash offset of the application image.
pub const APPLICATION_OFFSET: u32 = 0x10000;

static BUILD_PROBLEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error|failed").expect("valid build problem pattern"));

/// Whether a build output line reports a problem.
pub fn is_build_problem(line: &str) -> bool {
    BUILD_PROBLEM.is_match(line)
}

/// An external program plus its leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Fixed parameters handed to the flashing tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSettings {
    pub chip: String,
    pub baud_rate: u32,
    pub before: String,
    pub after: String,
    pub flash_mode: String,
    pub flash_freq: String,
    pub flash_size: String,
    pub compress: bool,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            chip: "esp32".to_string(),
            baud_rate: 460_800,
            before: "default_reset".to_string(),
            after: "hard_reset".to_string(),
            flash_mode: "dio".to_string(),
            flash_freq: "40m".to_string(),
            flash_size: "detect".to_string(),
            compress: true,
        }
    }
}

impl FlashSettings {
    /// Arguments for writing `layout` through `port`.
    pub fn args(&self, port: &str, layout: &FlashLayout) -> Vec<String> {
        let mut args = vec![
            "--chip".to_string(),
            self.chip.clone(),
            "--port".to_string(),
            port.to_string(),
            "--baud".to_string(),
            self.baud_rate.to_string(),
            "--before".to_string(),
            self.before.clone(),
            "--after".to_string(),
            self.after.clone(),
            "write_flash".to_string(),
        ];
        if self.compress {
            args.push("-z".to_string());
        }
        args.extend([
            "--flash_mode".to_string(),
            self.flash_mode.clone(),
            "--flash_freq".to_string(),
            self.flash_freq.clone(),
            "--flash_size".to_string(),
            self.flash_size.clone(),
        ]);
        for (offset, image) in layout.segments() {
            args.push(format!("{:#x}", offset));
            args.push(image.display().to_string());
        }
        args
    }
}

/// Images to write and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashLayout {
    /// Only the application image.
    Application { image: PathBuf },
    /// Bootloader, partition table and application.
    Full {
        bootloader: PathBuf,
        partitions: PathBuf,
        application: PathBuf,
    },
}

impl FlashLayout {
    /// Full layout from a build output directory.
    pub fn from_build_dir(dir: &Path) -> Self {
        FlashLayout::Full {
            bootloader: dir.join("bootloader.bin"),
            partitions: dir.join("partitions.bin"),
            application: dir.join("firmware.bin"),
        }
    }

    /// `(offset, image)` pairs in ascending offset order.
    pub fn segments(&self) -> Vec<(u32, &Path)> {
        match self {
            FlashLayout::Application { image } => vec![(APPLICATION_OFFSET, image.as_path())],
            FlashLayout::Full {
                bootloader,
                partitions,
                application,
            } => vec![
                (BOOTLOADER_OFFSET, bootloader.as_path()),
                (PARTITIONS_OFFSET, partitions.as_path()),
                (APPLICATION_OFFSET, application.as_path()),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Build tool, run inside `project_dir`.
    pub build_tool: ToolCommand,
    /// Flashing tool; [`FlashSettings::args`] are appended.
    pub flash_tool: ToolCommand,
    pub project_dir: PathBuf,
    /// Build artifacts, relative to `project_dir`.
    pub build_output_dir: PathBuf,
    pub flash: FlashSettings,
    /// Wait after a flash before talking to the rebooted device.
    pub reboot_settle: Duration,
    /// Wait between replayed configuration commands.
    pub command_settle: Duration,
    /// Maximum characters of tool stderr carried in an error.
    pub stderr_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            build_tool: ToolCommand::new("pio", ["run"]),
            flash_tool: ToolCommand::new("python3", ["-m", "esptool"]),
            project_dir: PathBuf::from("firmware"),
            build_output_dir: PathBuf::from(".pio/build/esp32dev"),
            flash: FlashSettings::default(),
            reboot_settle: Duration::from_secs(5),
            command_settle: Duration::from_secs(1),
            stderr_limit: 500,
        }
    }
}

impl OrchestratorConfig {
    pub fn build_dir(&self) -> PathBuf {
        self.project_dir.join(&self.build_output_dir)
    }
}

/// Drives the external build and flashing tools.
pub struct Orchestrator {
    session: Arc<SessionManager>,
    storage: Arc<dyn ConfigStorage>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        session: Arc<SessionManager>,
        storage: Arc<dyn ConfigStorage>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            session,
            storage,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn hub(&self) -> &Arc<BroadcastHub> {
        self.session.hub()
    }

    /// Write `layout` to the device on `port`.
    ///
    /// Rejected with [`Error::Busy`] while another run holds the link.
    pub async fn flash(&self, layout: FlashLayout, port: &str) -> Result<FlashReport> {
        let port = require_port(port)?;
        let guard = self
            .session
            .exclusive()
            .try_acquire()
            .ok_or(Error::Busy)?;

        info!("Flash requested on {}", port);
        self.session.release_for_flash(&guard).await?;
        self.flash_stage(&layout, port).await?;
        Ok(FlashReport::success(port))
    }

    /// Build the firmware project, flash the full image set, then replay the
    /// stored configuration.
    ///
    /// Replay problems do not fail the run; they are reported in the returned
    /// [`FlashReport`] and as a warning event.
    pub async fn build_and_flash(&self, port: &str) -> Result<FlashReport> {
        let port = require_port(port)?;
        let guard = self
            .session
            .exclusive()
            .try_acquire()
            .ok_or(Error::Busy)?;

        info!("Build and flash requested on {}", port);
        self.session.release_for_flash(&guard).await?;

        self.hub().publish(LogEvent::system(format!(
            "Building firmware in {}...",
            self.config.project_dir.display()
        )));
        let problems = self
            .run_tool(
                Stage::Build,
                &self.config.build_tool,
                Vec::new(),
                Some(&self.config.project_dir),
            )
            .await?;
        if problems > 0 {
            warn!("Build succeeded with {} problem line(s)", problems);
        }
        self.hub()
            .publish(LogEvent::system("Build complete. Starting flash..."));

        let layout = FlashLayout::from_build_dir(&self.config.build_dir());
        self.flash_stage(&layout, port).await?;

        let replay = self.replay_config(&guard, port).await;

        let mut report = FlashReport::success(port);
        report.build_problems = Some(problems);
        report.config_replay = replay;
        Ok(report)
    }

    async fn flash_stage(&self, layout: &FlashLayout, port: &str) -> Result<()> {
        self.hub()
            .publish(LogEvent::system(format!("Starting Flash on {}...", port)));
        let args = self.config.flash.args(port, layout);
        self.run_tool(Stage::Flash, &self.config.flash_tool, args, None)
            .await?;
        self.hub()
            .publish(LogEvent::system("Flashing complete! Rebooting..."));
        info!("Flash on {} complete", port);
        Ok(())
    }

    /// Run one tool to completion, streaming its stdout into the hub.
    ///
    /// Returns the number of build-problem lines seen on stdout.
    async fn run_tool(
        &self,
        stage: Stage,
        tool: &ToolCommand,
        extra_args: Vec<String>,
        current_dir: Option<&Path>,
    ) -> Result<usize> {
        let tag = match stage {
            Stage::Build => EventTag::Build,
            Stage::Flash => EventTag::Flash,
        };

        let mut command = Command::new(&tool.program);
        command
            .args(&tool.args)
            .args(&extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = current_dir {
            command.current_dir(dir);
        }

        debug!("{} stage: {} {:?} {:?}", stage, tool.program, tool.args, extra_args);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let detail = format!("could not start {}: {}", tool.program, e);
                return Err(self.stage_failed(stage, detail));
            }
        };

        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_all(stderr)));

        let mut problems = 0;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).split(b'\n');
            loop {
                let chunk = match lines.next_segment().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{} output unreadable: {}", stage, e);
                        break;
                    }
                };
                let line = String::from_utf8_lossy(&chunk);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if stage == Stage::Build && is_build_problem(line) {
                    problems += 1;
                }
                self.hub().publish(LogEvent::new(tag, line));
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                let detail = format!("could not wait for {}: {}", tool.program, e);
                return Err(self.stage_failed(stage, detail));
            }
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            debug!("{} stage exited successfully", stage);
            return Ok(problems);
        }

        let stderr = stderr.trim();
        let detail = if stderr.is_empty() {
            format!("exited with {}", status)
        } else {
            truncate_tail(stderr, self.config.stderr_limit)
        };
        Err(self.stage_failed(stage, detail))
    }

    fn stage_failed(&self, stage: Stage, detail: String) -> Error {
        error!("{} failed: {}", stage, detail);
        self.hub()
            .publish(LogEvent::error(format!("{} Failed: {}", stage, detail)));
        Error::SubprocessFailure { stage, detail }
    }

    /// Best-effort restore of the stored configuration on the rebooted device.
    async fn replay_config(&self, guard: &ExclusiveGuard, port: &str) -> ReplayOutcome {
        let config = match self.storage.load() {
            Ok(config) => config,
            Err(e) => return self.replay_failed(format!("could not load configuration: {}", e)),
        };

        if config.is_empty() {
            debug!("No stored configuration to replay");
            return ReplayOutcome::Skipped;
        }
        let commands = replay_commands(&config);

        // Encode everything up front so a bad value sends nothing.
        let mut lines = Vec::with_capacity(commands.len());
        for command in &commands {
            match command.encode() {
                Ok(line) => lines.push(line),
                Err(e) => return self.replay_failed(e.to_string()),
            }
        }

        tokio::time::sleep(self.config.reboot_settle).await;
        self.hub()
            .publish(LogEvent::system("Restoring configuration..."));

        let opened = if self.session.is_open().await {
            false
        } else {
            if let Err(e) = self.session.connect_exclusive(guard, port).await {
                return self.replay_failed(e.to_string());
            }
            true
        };

        let mut outcome = ReplayOutcome::Applied {
            commands: lines.len(),
        };
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.command_settle).await;
            }
            if let Err(e) = self.session.send_exclusive(guard, line).await {
                outcome = self.replay_failed(e.to_string());
                break;
            }
            if commands[i].triggers_reboot() {
                debug!("Device will reboot after {}", commands[i].verb());
            }
        }

        if opened {
            self.session.disconnect().await;
        }
        if let ReplayOutcome::Applied { commands } = outcome {
            info!("Replayed {} configuration command(s)", commands);
            self.hub()
                .publish(LogEvent::system("Configuration restored"));
        }
        outcome
    }

    fn replay_failed(&self, reason: String) -> ReplayOutcome {
        warn!("Configuration replay failed: {}", reason);
        self.hub().publish(LogEvent::system(format!(
            "Warning: configuration not restored: {}",
            reason
        )));
        ReplayOutcome::Failed { reason }
    }
}

fn require_port(port: &str) -> Result<&str> {
    let port = port.trim();
    if port.is_empty() {
        return Err(Error::Connection {
            port: String::new(),
            reason: "Port required".to_string(),
        });
    }
    Ok(port)
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!("stderr unreadable: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Keep at most `limit` trailing characters of `text`.
fn truncate_tail(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - limit).collect();
    format!("...{}", tail)
}
