//! Integration tests for the MicroClaw coordinator.
//!
//! Serial traffic goes through the in-memory link; the build and flashing
//! tools are small `sh` scripts so the real subprocess path is exercised.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use microclaw_core::{DeviceConfig, EventTag, LogEvent, MemoryConfigStorage};
use microclaw_protocol::{LinkStatus, ReplayOutcome};
use microclaw_server::{
    Coordinator, CoordinatorConfig, Error, FlashLayout, MemoryOpener, OrchestratorConfig, Poller,
    Stage, Subscription, ToolCommand,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::time::timeout;

const PORT: &str = "/dev/ttyUSB0";

const FLASH_OK: &str = r#"echo "$@" >> "$FLASH_LOG"
echo "Connecting...."
echo "Writing at 0x00010000... (100 %)"
echo "Hash of data verified."
"#;

struct Rig {
    dir: TempDir,
    coordinator: Arc<Coordinator>,
    opener: MemoryOpener,
}

impl Rig {
    fn new(build_body: &str, flash_body: &str, stored: DeviceConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let flash_log = dir.path().join("flash.log");
        let project = dir.path().join("firmware");
        std::fs::create_dir_all(&project).unwrap();

        let build = write_script(dir.path(), "build.sh", build_body);
        let flash = write_script(
            dir.path(),
            "flash.sh",
            &format!("FLASH_LOG='{}'\n{}", flash_log.display(), flash_body),
        );

        let orchestrator = OrchestratorConfig {
            build_tool: ToolCommand::new("sh", [build.display().to_string()]),
            flash_tool: ToolCommand::new("sh", [flash.display().to_string()]),
            project_dir: project,
            reboot_settle: Duration::from_millis(10),
            command_settle: Duration::from_millis(5),
            ..Default::default()
        };

        let opener = MemoryOpener::new([PORT, "/dev/ttyACM0"]);
        let coordinator = Coordinator::new(
            Arc::new(opener.clone()),
            Arc::new(MemoryConfigStorage::new(stored)),
            CoordinatorConfig {
                poll_interval: Duration::from_secs(5),
                orchestrator,
            },
        );

        Self {
            dir,
            coordinator: Arc::new(coordinator),
            opener,
        }
    }

    fn flash_log(&self) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join("flash.log")).ok()
    }

    fn is_exclusive(&self) -> bool {
        self.coordinator.session().exclusive().is_held()
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    path
}

fn stored_config() -> DeviceConfig {
    DeviceConfig {
        wifi_ssid: "HomeNet".to_string(),
        wifi_password: "secret pass".to_string(),
        telegram_token: "123:abc".to_string(),
        gemini_key: "gem-key".to_string(),
        groq_key: "groq-key".to_string(),
        assistant_provider: "groq".to_string(),
        ..Default::default()
    }
}

fn drain(sub: &mut Subscription) -> Vec<LogEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

fn texts(events: &[LogEvent], tag: EventTag) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.tag == tag)
        .map(|e| e.text.clone())
        .collect()
}

async fn wait_until_exclusive(rig: &Rig) {
    timeout(Duration::from_secs(5), async {
        while !rig.is_exclusive() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run never entered the exclusive section");
}

// ============================================================================
// Session
// ============================================================================

#[tokio::test]
async fn test_send_reaches_device_verbatim() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());
    rig.coordinator.connect(PORT).await.unwrap();

    rig.coordinator.send("wifi_set \"A\" \"B\"").await.unwrap();

    assert_eq!(rig.opener.written(), "wifi_set \"A\" \"B\"\n");
}

#[tokio::test]
async fn test_send_when_closed_writes_nothing() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());

    let err = rig.coordinator.send("system_info").await.unwrap_err();

    assert!(matches!(err, Error::NotConnected));
    assert_eq!(rig.opener.written(), "");
    assert!(rig.opener.opened().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_never_interleave() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());
    rig.coordinator.connect(PORT).await.unwrap();
    let padding = "x".repeat(200);

    let mut handles = Vec::new();
    for i in 0..50 {
        let coordinator = Arc::clone(&rig.coordinator);
        let command = format!("cmd_{} {}", i, padding);
        handles.push(tokio::spawn(async move { coordinator.send(&command).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut written = rig.opener.written_lines();
    written.sort();
    let mut expected: Vec<String> = (0..50).map(|i| format!("cmd_{} {}", i, padding)).collect();
    expected.sort();
    assert_eq!(written, expected);
    assert!(rig.opener.written().ends_with('\n'));
}

#[tokio::test]
async fn test_status_line_tagged_as_sys_info() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());
    let tasks = rig.coordinator.start();
    let mut sub = rig.coordinator.subscribe();
    rig.coordinator.connect(PORT).await.unwrap();

    rig.opener
        .push_incoming(b"I (123) wifi: connected\r\n{\"heap_free\": 12000}\n");

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(event);
    }
    assert_eq!(seen[0].tag, EventTag::System);
    assert_eq!(seen[1].tag, EventTag::Device);
    assert_eq!(seen[1].text, "I (123) wifi: connected");
    assert_eq!(seen[2].tag, EventTag::SysInfo);
    assert_eq!(seen[2].text, "{\"heap_free\": 12000}");

    tasks.shutdown().await;
}

#[tokio::test]
async fn test_status_report() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());
    let _sub = rig.coordinator.subscribe();

    let status = rig.coordinator.status().await;
    assert_eq!(status.link, LinkStatus::Closed);
    assert_eq!(status.subscribers, 1);

    rig.opener.refuse("/dev/ttyACM0");
    assert!(rig.coordinator.connect("/dev/ttyACM0").await.is_err());
    assert!(rig.coordinator.status().await.last_error.is_some());

    rig.coordinator.connect(PORT).await.unwrap();
    let status = rig.coordinator.status().await;
    assert_eq!(status.link, LinkStatus::Open);
    assert_eq!(status.port.as_deref(), Some(PORT));
    assert_eq!(status.last_error, None);
    assert!(!status.exclusive);
}

#[tokio::test]
async fn test_list_ports_sorted() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());
    assert_eq!(rig.coordinator.list_ports(), vec!["/dev/ttyACM0", PORT]);
}

// ============================================================================
// Build and flash
// ============================================================================

#[tokio::test]
async fn test_build_failure_skips_flash() {
    let rig = Rig::new(
        "echo 'Compiling main.o'\necho 'main.cpp:3: error: boom'\necho 'link failed' >&2\nexit 1",
        FLASH_OK,
        stored_config(),
    );
    let mut sub = rig.coordinator.subscribe();

    let err = rig.coordinator.build_and_flash(PORT).await.unwrap_err();

    match err {
        Error::SubprocessFailure { stage, detail } => {
            assert_eq!(stage, Stage::Build);
            assert!(detail.contains("link failed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(rig.flash_log(), None);
    assert!(!rig.is_exclusive());
    assert_eq!(rig.opener.written(), "");

    let events = drain(&mut sub);
    assert_eq!(
        texts(&events, EventTag::Build),
        vec!["Compiling main.o", "main.cpp:3: error: boom"]
    );
    assert!(events.iter().any(|e| e.tag == EventTag::Error));
}

#[tokio::test]
async fn test_build_and_flash_replays_config_wifi_last() {
    let rig = Rig::new(
        "echo 'Compiling main.o'\necho 'warning: something failed softly'\nexit 0",
        FLASH_OK,
        stored_config(),
    );
    let mut sub = rig.coordinator.subscribe();

    let report = rig.coordinator.build_and_flash(PORT).await.unwrap();

    assert_eq!(report.status, "success");
    assert_eq!(report.build_problems, Some(1));
    assert_eq!(report.config_replay, ReplayOutcome::Applied { commands: 5 });
    assert!(!rig.is_exclusive());

    assert_eq!(
        rig.opener.written_lines(),
        vec![
            "set_tg_token \"123:abc\"",
            "set_api_key \"gem-key\"",
            "set_groq_key \"groq-key\"",
            "set_provider \"groq\"",
            "wifi_set \"HomeNet\" \"secret pass\"",
        ]
    );

    // Replay opened its own connection and closed it again.
    assert_eq!(rig.opener.opened(), vec![PORT]);
    assert!(!rig.coordinator.session().is_open().await);

    let log = rig.flash_log().unwrap();
    assert!(log.contains("--chip esp32 --port /dev/ttyUSB0 --baud 460800"));
    assert!(log.contains("0x1000"));
    assert!(log.contains("0x8000"));
    assert!(log.contains("0x10000"));
    assert!(log.contains("bootloader.bin"));

    let events = drain(&mut sub);
    assert_eq!(
        texts(&events, EventTag::Flash),
        vec!["Connecting....", "Writing at 0x00010000... (100 %)", "Hash of data verified."]
    );
    assert!(texts(&events, EventTag::System)
        .iter()
        .any(|t| t == "Flashing complete! Rebooting..."));
}

#[tokio::test]
async fn test_build_and_flash_with_empty_config_skips_replay() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());

    let report = rig.coordinator.build_and_flash(PORT).await.unwrap();

    assert_eq!(report.config_replay, ReplayOutcome::Skipped);
    assert!(rig.opener.opened().is_empty());
}

#[tokio::test]
async fn test_replay_failure_is_a_warning() {
    let rig = Rig::new("exit 0", FLASH_OK, stored_config());
    rig.opener.refuse(PORT);
    let mut sub = rig.coordinator.subscribe();

    let report = rig.coordinator.build_and_flash(PORT).await.unwrap();

    assert!(matches!(report.config_replay, ReplayOutcome::Failed { .. }));
    assert!(!rig.is_exclusive());
    let events = drain(&mut sub);
    assert!(texts(&events, EventTag::System)
        .iter()
        .any(|t| t.starts_with("Warning:")));
}

#[tokio::test]
async fn test_flash_closes_link_and_does_not_reconnect() {
    let rig = Rig::new("exit 0", FLASH_OK, stored_config());
    rig.coordinator.connect(PORT).await.unwrap();
    let mut sub = rig.coordinator.subscribe();

    let image = rig.dir.path().join("upload.bin");
    std::fs::write(&image, b"\xe9firmware").unwrap();
    let report = rig
        .coordinator
        .flash(FlashLayout::Application { image: image.clone() }, PORT)
        .await
        .unwrap();

    assert_eq!(report.config_replay, ReplayOutcome::Skipped);
    assert_eq!(report.build_problems, None);
    assert!(!rig.coordinator.session().is_open().await);
    assert_eq!(rig.opener.opened(), vec![PORT]);

    let log = rig.flash_log().unwrap();
    assert!(log.contains(&format!("0x10000 {}", image.display())));
    assert!(!log.contains("0x1000 "));

    let events = drain(&mut sub);
    let system = texts(&events, EventTag::System);
    assert_eq!(system[0], "Closing serial for flashing...");
}

#[tokio::test]
async fn test_flash_failure_reports_stderr() {
    let rig = Rig::new(
        "exit 0",
        "echo 'Connecting....'\necho 'A fatal error occurred: Failed to connect' >&2\nexit 2",
        DeviceConfig::default(),
    );

    let image = rig.dir.path().join("upload.bin");
    std::fs::write(&image, b"fw").unwrap();
    let err = rig
        .coordinator
        .flash(FlashLayout::Application { image }, PORT)
        .await
        .unwrap_err();

    match err {
        Error::SubprocessFailure { stage, detail } => {
            assert_eq!(stage, Stage::Flash);
            assert_eq!(detail, "A fatal error occurred: Failed to connect");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!rig.is_exclusive());
}

#[tokio::test]
async fn test_missing_tool_clears_exclusive_flag() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());
    let mut config = rig.coordinator.orchestrator_config().clone();
    config.build_tool = ToolCommand::new("/nonexistent/microclaw-build-tool", Vec::<String>::new());
    let coordinator = Coordinator::new(
        Arc::new(rig.opener.clone()),
        Arc::new(MemoryConfigStorage::default()),
        CoordinatorConfig {
            poll_interval: Duration::from_secs(5),
            orchestrator: config,
        },
    );

    let err = coordinator.build_and_flash(PORT).await.unwrap_err();

    assert!(matches!(
        err,
        Error::SubprocessFailure {
            stage: Stage::Build,
            ..
        }
    ));
    assert!(!coordinator.session().exclusive().is_held());
    assert_eq!(rig.flash_log(), None);
}

#[tokio::test]
async fn test_missing_flash_tool_clears_exclusive_flag() {
    let rig = Rig::new("exit 0", FLASH_OK, DeviceConfig::default());
    let mut config = rig.coordinator.orchestrator_config().clone();
    config.flash_tool = ToolCommand::new("/nonexistent/microclaw-flash-tool", Vec::<String>::new());
    let coordinator = Coordinator::new(
        Arc::new(rig.opener.clone()),
        Arc::new(MemoryConfigStorage::default()),
        CoordinatorConfig {
            poll_interval: Duration::from_secs(5),
            orchestrator: config,
        },
    );
    coordinator.connect(PORT).await.unwrap();
    let mut sub = coordinator.subscribe();

    let image = rig.dir.path().join("upload.bin");
    std::fs::write(&image, b"fw").unwrap();
    let err = coordinator
        .flash(FlashLayout::Application { image }, PORT)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::SubprocessFailure {
            stage: Stage::Flash,
            ..
        }
    ));
    assert!(!coordinator.session().exclusive().is_held());
    assert!(!coordinator.session().is_open().await);
    let errors = texts(&drain(&mut sub), EventTag::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Flash Failed: could not start"));

    // Ordinary traffic is accepted again.
    coordinator.connect(PORT).await.unwrap();
    coordinator.send("system_info").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_run_rejected_busy() {
    let rig = Rig::new(
        "exit 0",
        &format!("sleep 0.5\n{}", FLASH_OK),
        DeviceConfig::default(),
    );
    assert!(!rig.is_exclusive());

    let image = rig.dir.path().join("upload.bin");
    std::fs::write(&image, b"fw").unwrap();

    let coordinator = Arc::clone(&rig.coordinator);
    let layout = FlashLayout::Application { image };
    let first = tokio::spawn(async move { coordinator.flash(layout, PORT).await });

    wait_until_exclusive(&rig).await;

    let second = rig.coordinator.build_and_flash(PORT).await;
    assert!(matches!(second, Err(Error::Busy)));
    assert!(rig.is_exclusive());

    let report = first.await.unwrap().unwrap();
    assert_eq!(report.status, "success");
    assert!(!rig.is_exclusive());
}

#[tokio::test]
async fn test_ordinary_traffic_suspended_during_run() {
    let rig = Rig::new(
        "sleep 0.5\nexit 0",
        FLASH_OK,
        DeviceConfig::default(),
    );
    rig.coordinator.connect(PORT).await.unwrap();
    let poller = Poller::new(
        Arc::clone(rig.coordinator.session()),
        Duration::from_secs(5),
    );

    let coordinator = Arc::clone(&rig.coordinator);
    let run = tokio::spawn(async move { coordinator.build_and_flash(PORT).await });
    wait_until_exclusive(&rig).await;

    assert!(!poller.tick().await);
    assert!(matches!(rig.coordinator.send("restart").await, Err(Error::Busy)));
    assert!(matches!(rig.coordinator.connect(PORT).await, Err(Error::Busy)));
    assert_eq!(rig.coordinator.status().await.exclusive, true);

    run.await.unwrap().unwrap();
    assert_eq!(rig.opener.written(), "");
}
