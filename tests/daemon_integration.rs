//! End-to-end lifecycle checks against a real `Supervisor`.
//! SteamCMD and the game server are replaced by small shell scripts.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use reforger_core::config::GlobalConfig;
use reforger_core::events::InstallProgress;
use reforger_core::instance::{ServerConfig, INSTALL_MARKER};
use reforger_core::process_monitor;
use reforger_core::supervisor::error::SupervisorError;
use reforger_core::supervisor::Supervisor;
use tempfile::TempDir;

/// Writes a server binary into `+force_install_dir` ($2) like a real install would.
const FAKE_STEAMCMD: &str = r#"#!/bin/sh
dir="$2"
echo "Redirecting stderr to 'stderr.txt'"
echo "Logging in user 'anonymous' to Steam Public ...OK"
echo " Update state (0x61) downloading, progress: 42.50 (1000 / 2353)"
echo " Update state (0x81) verifying update, progress: 90.00 (2100 / 2353)"
cat > "$dir/ArmaReforgerServer" <<'EOS'
#!/bin/sh
echo "server up $*"
exec sleep 30
EOS
chmod 755 "$dir/ArmaReforgerServer"
echo "Success! App '1874880' fully installed."
"#;

const SLOW_STEAMCMD: &str = "#!/bin/sh\necho \"Loading Steam API...OK\"\nexec sleep 30\n";

const STUBBORN_SERVER: &str = "#!/bin/sh\ntrap '' TERM\necho \"ignoring TERM\"\nwhile true; do sleep 1; done\n";

/// Mirrors `steamcmd.sh`, which runs the real client as a child process.
const FORKING_STEAMCMD: &str = "#!/bin/sh\nsleep 30 &\necho $! > \"$2/helper.pid\"\nwait\n";

const IDLE_SERVER: &str = "#!/bin/sh\nexec sleep 30\n";

const CRASHING_SERVER: &str = "#!/bin/sh\necho \"boom\" >&2\nexit 3\n";

fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct Harness {
    _dir: TempDir,
    cfg: GlobalConfig,
    sup: Supervisor,
}

impl Harness {
    async fn new(steamcmd: &str, stop_timeout_secs: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = GlobalConfig::with_data_dir(dir.path());
        cfg.stop_timeout_secs = stop_timeout_secs;
        cfg.install_timeout_secs = 60;
        cfg.steamcmd_url = Some("http://127.0.0.1:9/unreachable.tar.gz".into());
        write_script(&cfg.steamcmd_dir().join("steamcmd.sh"), steamcmd);

        let sup = Supervisor::new(cfg.clone());
        sup.initialize().await.unwrap();
        Self { _dir: dir, cfg, sup }
    }

    fn instance_dir(&self, id: &str) -> PathBuf {
        self.cfg.instances_dir().join(id)
    }

    /// Mark `id` installed with the given server script, skipping SteamCMD.
    fn fake_install(&self, id: &str, server: &str) {
        let root = self.instance_dir(id);
        write_script(&root.join(&self.cfg.server_executable), server);
        std::fs::write(root.join(INSTALL_MARKER), "{}").unwrap();
    }
}

fn alpha() -> ServerConfig {
    ServerConfig {
        name: "Alpha".into(),
        port: 2302,
        max_players: 16,
        steam_app_id: 1874880,
        password: None,
        admin_password: None,
    }
}

async fn collect_until_done(sup: &Supervisor, id: &str, run: impl std::future::Future) -> Vec<InstallProgress> {
    let mut sub = sup.events().install.subscribe(id);
    run.await;
    let mut seen = Vec::new();
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(20), sub.recv())
            .await
            .expect("install did not finish")
            .expect("topic closed");
        let done = ev.done;
        seen.push(ev);
        if done {
            return seen;
        }
    }
}

async fn wait_until_stopped(sup: &Supervisor, id: &str, within: Duration) {
    let deadline = Instant::now() + within;
    while sup.get(id).await.unwrap().is_running {
        assert!(Instant::now() < deadline, "'{}' still running", id);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_alpha_lifecycle() {
    let h = Harness::new(FAKE_STEAMCMD, 5).await;
    let sup = &h.sup;

    let created = sup.create("alpha", alpha()).await.unwrap();
    assert!(!created.is_installed);
    assert!(!created.is_running);
    assert_eq!(created.state, "stopped");

    let events = collect_until_done(sup, "alpha", async {
        let started = sup.install("alpha").await.unwrap();
        assert!(started.started);
        assert_eq!(started.server_id, "alpha");
    })
    .await;

    let last = events.last().unwrap();
    assert_eq!(last.progress, 100);
    assert_eq!(last.error, None);
    for pair in events.windows(2) {
        assert!(pair[0].progress <= pair[1].progress, "progress went backwards: {:?}", events);
    }
    assert!(events.iter().any(|e| e.progress > 0 && e.progress < 100));
    println!("✓ install reached 100% over {} events", events.len());

    let got = sup.get("alpha").await.unwrap();
    assert!(got.is_installed);
    assert!(!sup.install_status("alpha").await.unwrap().installing);

    let started = sup.start("alpha").await.unwrap();
    assert!(!started.already_running);
    assert!(started.instance.is_running);
    assert_eq!(started.instance.state, "running");

    let again = sup.start("alpha").await.unwrap();
    assert!(again.already_running);
    assert_eq!(sup.running_ids().await, vec!["alpha"]);

    let runtime = std::fs::read_to_string(h.instance_dir("alpha").join("serverConfig.json")).unwrap();
    assert!(runtime.contains("\"Alpha\""));

    // The server prints its arguments on startup.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let lines = sup.console("alpha", None).await.unwrap();
        if lines.iter().any(|l| l.data.contains("server up") && l.data.contains("-port=2302")) {
            break;
        }
        assert!(Instant::now() < deadline, "no startup line in {:?}", lines);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let stats = sup.stats("alpha").await.unwrap();
    assert!(stats.running);
    assert!(stats.pid.is_some());
    assert!(stats.players.is_empty());

    let stopped = sup.stop("alpha").await.unwrap();
    assert!(!stopped.not_running);
    assert!(!stopped.instance.is_running);
    assert_eq!(stopped.instance.state, "stopped");
    assert!(!sup.stats("alpha").await.unwrap().running);

    sup.delete("alpha").await.unwrap();
    assert!(matches!(sup.get("alpha").await.unwrap_err(), SupervisorError::NotFound(_)));
    assert!(!h.instance_dir("alpha").exists());
    println!("✓ alpha lifecycle passed");
}

#[tokio::test]
async fn test_stop_escalates_to_kill() {
    let h = Harness::new(FAKE_STEAMCMD, 1).await;
    h.sup.create("stubborn", ServerConfig::new("Stubborn")).await.unwrap();
    h.fake_install("stubborn", STUBBORN_SERVER);

    let started = h.sup.start("stubborn").await.unwrap();
    assert!(started.instance.is_running);
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let began = Instant::now();
    let out = h.sup.stop("stubborn").await.unwrap();
    assert!(!out.not_running);
    assert!(!out.instance.is_running);
    assert!(began.elapsed() < Duration::from_secs(10), "stop took {:?}", began.elapsed());

    let lines = h.sup.console("stubborn", None).await.unwrap();
    assert!(
        lines.iter().any(|l| l.data.contains("forcing shutdown")),
        "no escalation line in {:?}",
        lines
    );
    println!("✓ stop escalated to kill in {:?}", began.elapsed());
}

#[tokio::test]
async fn test_stop_when_not_running_is_noop() {
    let h = Harness::new(FAKE_STEAMCMD, 5).await;
    h.sup.create("idle", ServerConfig::new("Idle")).await.unwrap();
    for _ in 0..2 {
        let out = h.sup.stop("idle").await.unwrap();
        assert!(out.not_running);
    }
}

#[tokio::test]
async fn test_crash_is_observed() {
    let h = Harness::new(FAKE_STEAMCMD, 5).await;
    h.sup.create("crashy", ServerConfig::new("Crashy")).await.unwrap();
    h.fake_install("crashy", CRASHING_SERVER);

    h.sup.start("crashy").await.unwrap();
    wait_until_stopped(&h.sup, "crashy", Duration::from_secs(5)).await;

    let got = h.sup.get("crashy").await.unwrap();
    assert_eq!(got.state, "stopped");
    let lines = h.sup.console("crashy", None).await.unwrap();
    assert!(lines.iter().any(|l| l.data.contains("boom")), "{:?}", lines);

    // Output survives the exit until the next start.
    let last_id = lines.last().unwrap().id;
    assert!(h.sup.console("crashy", Some(last_id)).await.unwrap().is_empty());

    // A crashed server can be started again.
    let again = h.sup.start("crashy").await.unwrap();
    assert!(!again.already_running);
    println!("✓ crash observed and restart allowed");
}

#[tokio::test]
async fn test_delete_running_instance() {
    let h = Harness::new(FAKE_STEAMCMD, 5).await;
    h.sup.create("doomed", ServerConfig::new("Doomed")).await.unwrap();
    h.fake_install("doomed", "#!/bin/sh\nexec sleep 30\n");

    h.sup.start("doomed").await.unwrap();
    let pid = h.sup.stats("doomed").await.unwrap().pid.unwrap();

    h.sup.delete("doomed").await.unwrap();
    assert!(!h.instance_dir("doomed").exists());
    assert!(!process_monitor::is_running(pid));
    assert!(h.sup.running_ids().await.is_empty());
    assert!(matches!(
        h.sup.console("doomed", None).await.unwrap_err(),
        SupervisorError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_install_conflicts_and_cancel_on_delete() {
    let h = Harness::new(SLOW_STEAMCMD, 5).await;
    h.sup.create("slow", ServerConfig::new("Slow")).await.unwrap();

    h.sup.install("slow").await.unwrap();
    assert_eq!(h.sup.get("slow").await.unwrap().state, "installing");
    assert!(matches!(
        h.sup.install("slow").await.unwrap_err(),
        SupervisorError::Conflict(_)
    ));
    assert!(matches!(
        h.sup.start("slow").await.unwrap_err(),
        SupervisorError::Conflict(_)
    ));

    let began = Instant::now();
    h.sup.delete("slow").await.unwrap();
    assert!(began.elapsed() < Duration::from_secs(10));
    assert!(!h.instance_dir("slow").exists());
    println!("✓ delete aborted a running install");
}

#[tokio::test]
async fn test_failed_install_stays_uninstalled() {
    let h = Harness::new("#!/bin/sh\necho \"ERROR! Failed to install app '1874880' (No subscription)\"\nexit 8\n", 5).await;
    h.sup.create("broken", ServerConfig::new("Broken")).await.unwrap();
    // Left over from an earlier install.
    std::fs::write(h.instance_dir("broken").join(INSTALL_MARKER), "{}").unwrap();

    let events = collect_until_done(&h.sup, "broken", async {
        h.sup.install("broken").await.unwrap();
    })
    .await;

    let last = events.last().unwrap();
    assert_eq!(last.error, Some(true));
    assert_eq!(last.exit_code, Some(8));
    assert!(!h.sup.get("broken").await.unwrap().is_installed);
    assert!(matches!(
        h.sup.start("broken").await.unwrap_err(),
        SupervisorError::NotInstalled(_)
    ));
}

#[tokio::test]
async fn test_files_stay_inside_instance() {
    let h = Harness::new(FAKE_STEAMCMD, 5).await;
    h.sup.create("files", ServerConfig::new("Files")).await.unwrap();

    h.sup.write_file("files", "config/motd.txt", "welcome").await.unwrap();
    let content = serde_json::to_value(h.sup.read_path("files", "config/motd.txt").await.unwrap()).unwrap();
    assert_eq!(content["type"], "file");
    assert_eq!(content["content"], "welcome");

    for bad in ["../escape.txt", "/etc/passwd", "config/../../x"] {
        let err = h.sup.write_file("files", bad, "x").await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidPath(_)), "{}: {:?}", bad, err);
    }
    assert!(!h.cfg.instances_dir().join("escape.txt").exists());

    // A symlinked folder must not let new files land outside the instance.
    let outside = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink(outside.path(), h.instance_dir("files").join("link")).unwrap();
    let err = h.sup.write_file("files", "link/pwned.txt", "x").await.unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidPath(_)), "{:?}", err);
    assert!(!outside.path().join("pwned.txt").exists());

    h.sup.delete_file("files", "config/motd.txt").await.unwrap();
    assert!(!h.instance_dir("files").join("config/motd.txt").exists());
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let h = Harness::new(FAKE_STEAMCMD, 1).await;
    for id in ["one", "two"] {
        h.sup.create(id, ServerConfig::new(id)).await.unwrap();
        h.fake_install(id, "#!/bin/sh\nexec sleep 30\n");
        h.sup.start(id).await.unwrap();
    }
    assert_eq!(h.sup.running_ids().await.len(), 2);

    h.sup.shutdown().await;
    assert!(h.sup.running_ids().await.is_empty());
}

#[tokio::test]
async fn test_delete_during_install_kills_steamcmd_children() {
    let h = Harness::new(FORKING_STEAMCMD, 5).await;
    h.sup.create("forky", ServerConfig::new("Forky")).await.unwrap();
    h.sup.install("forky").await.unwrap();

    let pid_file = h.instance_dir("forky").join("helper.pid");
    let deadline = Instant::now() + Duration::from_secs(5);
    let helper: u32 = loop {
        if let Some(pid) = std::fs::read_to_string(&pid_file)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
        {
            break pid;
        }
        assert!(Instant::now() < deadline, "SteamCMD helper never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(process_monitor::is_running(helper));

    h.sup.delete("forky").await.unwrap();
    assert!(!h.instance_dir("forky").exists());

    let deadline = Instant::now() + Duration::from_secs(3);
    while process_monitor::is_running(helper) {
        assert!(Instant::now() < deadline, "helper {} survived the delete", helper);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("✓ delete tore down the whole SteamCMD tree");
}

fn started_lines(lines: &[reforger_core::events::ConsoleLine]) -> usize {
    lines
        .iter()
        .filter(|l| l.data.contains("Server process started"))
        .count()
}

#[tokio::test]
async fn test_concurrent_lifecycle_calls_are_serialized() {
    let h = Harness::new(FAKE_STEAMCMD, 2).await;
    h.sup.create("race", ServerConfig::new("Race")).await.unwrap();
    h.fake_install("race", IDLE_SERVER);

    // Two starts at once: one spawns, the other sees it running.
    let (a, b) = tokio::join!(h.sup.start("race"), h.sup.start("race"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.already_running ^ b.already_running, "{} / {}", a.already_running, b.already_running);
    assert_eq!(h.sup.running_ids().await, vec!["race"]);
    let lines = h.sup.console("race", None).await.unwrap();
    assert_eq!(started_lines(&lines), 1, "{:?}", lines);

    h.sup.stop("race").await.unwrap();
    assert!(h.sup.running_ids().await.is_empty());

    // Start against stop: whichever wins, the end state matches the outcomes.
    for _ in 0..3 {
        let (started, stopped) = tokio::join!(h.sup.start("race"), h.sup.stop("race"));
        let (started, stopped) = (started.unwrap(), stopped.unwrap());
        assert!(!started.already_running);

        let now = h.sup.get("race").await.unwrap();
        // Stop first found nothing to stop, so the start is what remains.
        assert_eq!(now.is_running, stopped.not_running);
        assert_eq!(h.sup.running_ids().await.len(), usize::from(now.is_running));

        h.sup.stop("race").await.unwrap();
        assert!(!h.sup.get("race").await.unwrap().is_running);
    }
    println!("✓ lifecycle calls on one id never overlapped");
}
