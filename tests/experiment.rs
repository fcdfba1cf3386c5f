use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use arena_harness::adapter::{SubprocessAdapter, SubprocessConfig};
use arena_harness::prelude::*;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn init_test_logger() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Keeps the kind of every event seen by the harness.
#[derive(Clone, Default)]
struct KindLog(Arc<Mutex<Vec<EventKind>>>);

impl OutputHandler for KindLog {
    fn handle(&mut self, event: &ParsedEvent) {
        self.0.lock().unwrap().push(event.kind());
    }
}

fn commands_file(test: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "arena-harness-{test}-{}.txt",
        std::process::id()
    ))
}

/// Console of a server playing one warmup and one match, then waiting for `killserver`.
///
/// Everything written to the server's stdin is copied to `commands`.
fn one_match_script(commands: &PathBuf) -> String {
    let out = commands.display();
    format!(
        r#"
exec 3<&0; cat <&3 > '{out}' 2>/dev/null &
echo 'Warmup: 20' >&2
echo 'map: oa_dm1' >&2
echo 'num score ping name            lastmsg address               qport rate' >&2
echo '--- ----- ---- --------------- ------- --------------------- ----- -----' >&2
echo '  0     0    0 Sarge                 0 bot                       0 16384' >&2
echo '  1     3   48 alice                50 192.168.1.20:27960    12345 25000' >&2
echo '' >&2
echo 'ShutdownGame:' >&2
echo '------- Game Initialization -------' >&2
echo 'Exit: Fraglimit hit.' >&2
echo 'ShutdownGame:' >&2
i=0
while [ $i -lt 100 ] && ! grep -q killserver '{out}' 2>/dev/null; do
    sleep 0.05
    i=$((i+1))
done
echo 'ClientDisconnect: 1' >&2
"#
    )
}

fn harness_for(script: String, config: Configuration) -> Harness {
    init_test_logger();
    let bridge = AsyncBridge::new();
    let adapter = SubprocessAdapter::new(
        SubprocessConfig {
            binary: "sh".into(),
            args: vec!["-c".into(), script],
        },
        bridge.clone(),
    );
    Harness::with_adapter(config, Box::new(adapter), bridge)
}

fn sent_commands(path: &PathBuf) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| line.trim_end_matches('\r').to_owned())
        .collect()
}

#[test]
fn last_round_kills_the_server() {
    let commands = commands_file("last-round");
    let config = Configuration::new()
        .with_latencies(vec![0, 100])
        .unwrap()
        .with_repeats(1)
        .with_nplayers_threshold(1)
        .with_verbose(false);
    let kinds = KindLog::default();

    let summary = harness_for(one_match_script(&commands), config)
        .with_output(Box::new(kinds.clone()))
        .run()
        .unwrap();

    assert!(summary.finished);
    assert_eq!(summary.max_rounds, 2);
    assert_eq!(summary.rounds_completed, 1);
    assert_eq!(summary.humans, 0);
    assert_eq!(summary.bots, 1);
    assert_eq!(summary.events, kinds.0.lock().unwrap().len());
    assert_eq!(
        kinds
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|kind| **kind == EventKind::ServerShutdown)
            .count(),
        2
    );

    let sent = sent_commands(&commands);
    let _ = std::fs::remove_file(&commands);
    let position = |command: &str| sent.iter().position(|c| c == command);
    assert!(sent.contains(&"set timelimit 10".to_owned()));
    assert!(sent.contains(&"say Latency control disabled".to_owned()));
    // commands reach the server in the order they were sent
    let warmup = format!(
        "set g_warmup {}",
        arena_harness::game_manager::GameSettings::default().warmup_time
    );
    assert!(position(&warmup).is_some());
    assert!(position("set g_doWarmup 1") < position(&warmup));
    assert!(position("say Match ended! fraglimit hit.").is_some());
    assert!(position("say Match ended! fraglimit hit.") < position("killserver"));
    assert_eq!(sent.iter().filter(|c| *c == "killserver").count(), 1);
    assert!(!sent.contains(&"say Match completed!".to_owned()));
}

#[test]
fn warmup_without_players_is_rearmed() {
    let commands = commands_file("rearm");
    let out = commands.display();
    let script = format!(
        r#"
exec 3<&0; cat <&3 > '{out}' 2>/dev/null &
echo 'Warmup: 20' >&2
echo 'ShutdownGame:' >&2
i=0
while [ $i -lt 100 ]; do
    n=$(grep -c 'g_doWarmup 1' '{out}' 2>/dev/null)
    [ "${{n:-0}}" -ge 2 ] && break
    sleep 0.05
    i=$((i+1))
done
"#
    );
    let config = Configuration::new()
        .with_nplayers_threshold(2)
        .with_game_settings(arena_harness::game_manager::GameSettings {
            warmup_time: 30,
            ..Default::default()
        })
        .with_verbose(false);

    let summary = harness_for(script, config).run().unwrap();
    assert!(!summary.finished);
    assert_eq!(summary.rounds_completed, 0);
    assert_eq!(summary.humans, 0);

    let sent = sent_commands(&commands);
    let _ = std::fs::remove_file(&commands);
    // once from the default config, once for the re-armed warmup
    assert_eq!(sent.iter().filter(|c| *c == "set g_doWarmup 1").count(), 2);
    assert!(!sent.contains(&"killserver".to_owned()));
}

#[test]
fn connect_failure_is_an_error() {
    init_test_logger();
    let bridge = AsyncBridge::new();
    let adapter = SubprocessAdapter::new(
        SubprocessConfig {
            binary: "/nonexistent/oa_ded".into(),
            args: vec![],
        },
        bridge.clone(),
    );
    let result = Harness::with_adapter(Configuration::new(), Box::new(adapter), bridge).run();
    assert!(result.is_err());
}
