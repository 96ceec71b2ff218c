mod common;

use common::{eventually, game_rule, manager_for, test_config, FakeHost, TRIM_BYTES};
use std::time::Duration;
use taskwarden_daemon::collector::NewProcessEvent;
use taskwarden_daemon::foreground::ForegroundEvent;
use taskwarden_daemon::manager::ManagerEvent;
use taskwarden_daemon::power::{PowerBehaviour, PowerPlan};
use taskwarden_daemon::record::HandlingState;
use taskwarden_daemon::config::RuleConfig;
use taskwarden_daemon::rule::strategy::{AffinityStrategy, Priority, PriorityStrategy};
use taskwarden_daemon::rule::ForegroundMode;
use tokio::sync::broadcast;

const GAME: u32 = 4242;
const SHELL: u32 = 4243;

fn drain(rx: &mut broadcast::Receiver<ManagerEvent>) -> Vec<ManagerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn state_of(manager: &taskwarden_daemon::manager::ProcessManager, pid: u32) -> Option<HandlingState> {
    manager.get(pid).map(|r| r.state())
}

#[tokio::test]
async fn test_game_is_adjusted_and_cleaned_up_on_exit() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    host.spawn(SHELL, "bash");
    let manager = manager_for(&host, test_config(vec![game_rule()]));
    let mut events = manager.subscribe();

    let summary = manager.full_scan().await.unwrap();
    assert_eq!(summary.seen, 2);
    assert_eq!(summary.triaged, 2);
    assert_eq!(summary.modified, 1);

    assert_eq!(host.priority_of(GAME), Priority::High);
    assert_eq!(host.affinity_of(GAME), 0b0011);
    assert_eq!(host.forced_plan(), Some(PowerPlan::HighPerformance));
    assert_eq!(host.priority_of(SHELL), Priority::Normal);
    assert_eq!(state_of(&manager, GAME), Some(HandlingState::Modified));
    assert_eq!(state_of(&manager, SHELL), Some(HandlingState::Abandoned));
    assert!(manager.is_running(GAME));
    assert!(!manager.is_running(SHELL));
    assert!(manager.is_power_owner(GAME));

    host.kill(GAME);
    assert!(eventually(|| !manager.is_running(GAME)).await);
    assert!(manager.get(GAME).is_none());
    assert!(!manager.is_power_owner(GAME));
    assert_eq!(host.forced_plan(), None);
    let rule = manager.watchlist().get("games").unwrap();
    assert!(rule.recently_modified().is_empty());
    assert!(!rule.is_tracking(GAME));

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        ManagerEvent::Modified { info } if info.pid == GAME && info.new_priority == Some(Priority::High)
    )));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ManagerEvent::Exited { pid: GAME, .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_limit_rule_narrows_game_to_four_cores() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let mut rule = game_rule();
    rule.affinity = Some(0b1111);
    rule.affinity_strategy = AffinityStrategy::Limit;
    rule.power_plan = None;
    let manager = manager_for(&host, test_config(vec![rule]));

    let summary = manager.full_scan().await.unwrap();
    assert_eq!(summary.modified, 1);
    assert_eq!(host.priority_of(GAME), Priority::High);
    let mask = host.affinity_of(GAME);
    assert_eq!(mask.count_ones(), 4);
    assert_eq!(mask & !0b1111_1111, 0);
    assert_eq!(state_of(&manager, GAME), Some(HandlingState::Modified));
}

#[tokio::test]
async fn test_power_only_rule_is_not_reforced_on_rescan() {
    let host = FakeHost::new();
    host.spawn(GAME, "render.exe");
    let mut rule = RuleConfig::named("render");
    rule.executables = vec!["render.exe".to_string()];
    rule.power_plan = Some(PowerPlan::HighPerformance);
    let manager = manager_for(&host, test_config(vec![rule]));
    let mut events = manager.subscribe();

    assert_eq!(manager.full_scan().await.unwrap().modified, 1);
    for _ in 0..3 {
        assert_eq!(manager.full_scan().await.unwrap().modified, 0);
    }

    let rule = manager.watchlist().get("render").unwrap();
    assert_eq!(rule.adjust_count(), 1);
    assert_eq!(host.forced_plan(), Some(PowerPlan::HighPerformance));
    assert_eq!(host.power_owner_count(), 1);
    let modified = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, ManagerEvent::Modified { .. }))
        .count();
    assert_eq!(modified, 1);
}

#[tokio::test]
async fn test_power_plan_with_held_priority_is_not_reported_twice() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let mut rule = game_rule();
    rule.priority = Some(Priority::Normal);
    rule.affinity = None;
    rule.affinity_strategy = Default::default();
    let manager = manager_for(&host, test_config(vec![rule]));

    assert_eq!(manager.full_scan().await.unwrap().modified, 1);
    assert_eq!(manager.full_scan().await.unwrap().modified, 0);
    assert_eq!(manager.full_scan().await.unwrap().modified, 0);
    assert_eq!(manager.watchlist().get("games").unwrap().adjust_count(), 1);
    assert_eq!(host.forced_plan(), Some(PowerPlan::HighPerformance));
}

#[tokio::test]
async fn test_rescan_does_not_fight_held_settings() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let manager = manager_for(&host, test_config(vec![game_rule()]));

    manager.full_scan().await.unwrap();
    let writes = host.write_count();

    let summary = manager.full_scan().await.unwrap();
    assert_eq!(summary.modified, 0);
    assert_eq!(host.write_count(), writes);
    assert_eq!(state_of(&manager, GAME), Some(HandlingState::Unmodified));
    assert!(manager.is_running(GAME));
}

#[tokio::test]
async fn test_repeated_reversal_grants_free_will() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let mut rule = game_rule();
    rule.affinity = None;
    rule.affinity_strategy = Default::default();
    rule.power_plan = None;
    let manager = manager_for(&host, test_config(vec![rule]));
    let mut events = manager.subscribe();

    manager.full_scan().await.unwrap();
    assert_eq!(host.priority_of(GAME), Priority::High);

    host.revert_priority(GAME, Priority::Normal);
    manager.full_scan().await.unwrap();
    // a single reversal is tolerated, but not fought either
    assert_eq!(host.priority_of(GAME), Priority::Normal);
    assert!(!drain(&mut events).iter().any(|e| matches!(e, ManagerEvent::FreeWill { .. })));

    manager.full_scan().await.unwrap();
    let granted = drain(&mut events);
    assert!(granted.iter().any(|e| matches!(e, ManagerEvent::FreeWill { pid: GAME, .. })));

    let writes = host.write_count();
    manager.full_scan().await.unwrap();
    assert_eq!(host.write_count(), writes);
    assert_eq!(host.priority_of(GAME), Priority::Normal);
    assert!(!drain(&mut events).iter().any(|e| matches!(e, ManagerEvent::FreeWill { .. })));
}

#[tokio::test]
async fn test_push_and_pull_discovery_do_not_double_triage() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let manager = manager_for(&host, test_config(vec![game_rule()]));

    assert!(manager.observe_new(NewProcessEvent::pid_only(GAME)));
    assert!(!manager.observe_new(NewProcessEvent::pid_only(GAME)));

    let summary = manager.full_scan().await.unwrap();
    assert_eq!(summary.triaged, 0);
    assert_eq!(summary.skipped, 1);

    assert!(eventually(|| host.priority_of(GAME) == Priority::High).await);
    assert_eq!(
        host.writes.lock().iter().filter(|(pid, w)| *pid == GAME && w.starts_with("priority")).count(),
        1
    );
}

#[tokio::test]
async fn test_push_event_for_vanished_process_is_dropped() {
    let host = FakeHost::new();
    let manager = manager_for(&host, test_config(vec![game_rule()]));
    assert!(!manager.observe_new(NewProcessEvent::pid_only(GAME)));
    assert!(manager.get(GAME).is_none());
}

#[tokio::test]
async fn test_recycled_pid_gets_a_fresh_record() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let manager = manager_for(&host, test_config(vec![game_rule()]));
    let mut events = manager.subscribe();

    manager.full_scan().await.unwrap();
    assert!(manager.is_running(GAME));

    host.recycle(GAME, "bash");
    manager.full_scan().await.unwrap();

    let record = manager.get(GAME).unwrap();
    assert_eq!(record.name, "bash");
    assert_eq!(record.state(), HandlingState::Abandoned);
    assert!(!manager.is_running(GAME));
    assert!(!manager.is_power_owner(GAME));
    assert_eq!(host.forced_plan(), None);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ManagerEvent::Exited { pid: GAME, name } if name == "game.exe")));
}

#[tokio::test]
async fn test_ignored_pid_is_left_alone_until_unignored() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let manager = manager_for(&host, test_config(vec![game_rule()]));

    assert!(manager.ignore_pid(GAME));
    manager.full_scan().await.unwrap();
    assert_eq!(state_of(&manager, GAME), Some(HandlingState::Abandoned));
    assert_eq!(host.priority_of(GAME), Priority::Normal);
    assert_eq!(manager.status().ignored_pids, vec![GAME]);

    assert!(manager.unignore_pid(GAME));
    manager.full_scan().await.unwrap();
    assert_eq!(host.priority_of(GAME), Priority::High);
}

#[tokio::test]
async fn test_ignored_and_protected_names() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    host.spawn(SHELL, "tool");
    let mut tool = game_rule();
    tool.name = "tools".to_string();
    tool.executables = vec!["tool".to_string()];
    let mut config = test_config(vec![game_rule(), tool]);
    config.protection.protected_names.push("game.exe".to_string());
    config.protection.ignored_names.push("TOOL".to_string());
    let manager = manager_for(&host, config);

    manager.full_scan().await.unwrap();
    // protected: power only
    assert_eq!(host.priority_of(GAME), Priority::Normal);
    assert_eq!(host.forced_plan(), Some(PowerPlan::HighPerformance));
    assert_eq!(state_of(&manager, GAME), Some(HandlingState::Modified));
    assert!(manager.get(GAME).unwrap().is_protected());

    assert_eq!(state_of(&manager, SHELL), Some(HandlingState::Abandoned));
    assert_eq!(host.priority_of(SHELL), Priority::Normal);
}

#[tokio::test]
async fn test_access_denied_is_not_retried() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    host.deny(GAME);
    let manager = manager_for(&host, test_config(vec![game_rule()]));

    manager.full_scan().await.unwrap();
    assert_eq!(state_of(&manager, GAME), Some(HandlingState::AccessDenied));
    assert!(!manager.is_running(GAME));

    let summary = manager.full_scan().await.unwrap();
    assert_eq!(summary.triaged, 0);
    assert_eq!(summary.skipped, 1);
}

#[tokio::test]
async fn test_young_processes_are_not_cached() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let mut config = test_config(vec![game_rule()]);
    config.general.min_running_age_secs = 3600;
    let manager = manager_for(&host, config);

    manager.full_scan().await.unwrap();
    assert_eq!(host.priority_of(GAME), Priority::High);
    assert!(!manager.is_running(GAME));
    assert_eq!(manager.status().tracked, 1);
    assert_eq!(manager.status().running, 0);
}

#[tokio::test]
async fn test_free_memory_trims_matched_processes() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    host.spawn(GAME + 10, "game.exe");
    host.spawn(SHELL, "bash");
    let manager = manager_for(&host, test_config(vec![game_rule()]));

    let summary = manager.free_memory(Some(GAME + 10)).await;
    assert_eq!(summary.trimmed_bytes, TRIM_BYTES);
    assert_eq!(*host.trims.lock(), vec![GAME]);

    // an ordinary scan never trims
    let summary = manager.full_scan().await.unwrap();
    assert_eq!(summary.trimmed_bytes, 0);
    assert_eq!(host.trims.lock().len(), 1);
}

#[tokio::test]
async fn test_hasten_requests_collapse() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let manager = manager_for(&host, test_config(vec![game_rule()]));
    let mut events = manager.subscribe();

    assert!(manager.hasten_scan());
    assert!(!manager.hasten_scan());
    assert!(eventually(|| host.priority_of(GAME) == Priority::High).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let scans = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, ManagerEvent::ScanCompleted { .. }))
        .count();
    assert_eq!(scans, 1);
    assert!(manager.hasten_scan());
}

#[tokio::test]
async fn test_foreground_changes_pause_and_resume() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let mut rule = game_rule();
    rule.foreground_mode = ForegroundMode::Standard;
    rule.background_priority = Some(Priority::Idle);
    rule.power_plan = None;
    let manager = manager_for(&host, test_config(vec![rule]));

    // nothing reported yet: everything counts as foreground
    manager.full_scan().await.unwrap();
    assert_eq!(host.priority_of(GAME), Priority::High);

    manager.on_foreground_changed(ForegroundEvent { pid: 1, fullscreen: false });
    assert_eq!(host.priority_of(GAME), Priority::Idle);
    assert_eq!(state_of(&manager, GAME), Some(HandlingState::Paused));

    // paused processes are not re-triaged by scans
    manager.full_scan().await.unwrap();
    assert_eq!(host.priority_of(GAME), Priority::Idle);

    manager.on_foreground_changed(ForegroundEvent { pid: GAME, fullscreen: true });
    assert_eq!(host.priority_of(GAME), Priority::High);
    assert_ne!(state_of(&manager, GAME), Some(HandlingState::Paused));
    assert_eq!(manager.status().foreground_pid, Some(GAME));

    manager.on_foreground_changed(ForegroundEvent { pid: 1, fullscreen: false });
    assert_eq!(host.priority_of(GAME), Priority::Idle);
}

#[tokio::test]
async fn test_background_process_discovered_after_foreground_report() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let mut rule = game_rule();
    rule.foreground_mode = ForegroundMode::Standard;
    rule.background_priority = Some(Priority::BelowNormal);
    rule.priority_strategy = PriorityStrategy::Force;
    rule.power_plan = None;
    let manager = manager_for(&host, test_config(vec![rule]));

    manager.on_foreground_changed(ForegroundEvent { pid: 1, fullscreen: false });
    manager.full_scan().await.unwrap();
    assert_eq!(host.priority_of(GAME), Priority::BelowNormal);
    assert_eq!(state_of(&manager, GAME), Some(HandlingState::Paused));
}

#[tokio::test]
async fn test_manual_power_behaviour_releases_forces() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let manager = manager_for(&host, test_config(vec![game_rule()]));

    manager.full_scan().await.unwrap();
    assert_eq!(host.forced_plan(), Some(PowerPlan::HighPerformance));

    manager.on_power_behaviour_changed(PowerBehaviour::Manual);
    assert_eq!(manager.power_behaviour(), PowerBehaviour::Manual);
    assert_eq!(host.forced_plan(), None);
    assert!(!manager.is_power_owner(GAME));

    host.spawn(GAME + 1, "game.exe");
    manager.full_scan().await.unwrap();
    assert_eq!(host.priority_of(GAME + 1), Priority::High);
    assert_eq!(host.forced_plan(), None);
}

#[tokio::test]
async fn test_maintenance_expires_tables() {
    let host = FakeHost::new();
    host.spawn(SHELL, "bash");
    let mut config = test_config(vec![game_rule()]);
    config.general.push_block_secs = 0;
    let manager = manager_for(&host, config);

    manager.full_scan().await.unwrap();
    host.kill(SHELL);
    manager.observe_new(NewProcessEvent::pid_only(GAME));

    let report = manager.maintenance();
    assert_eq!(report.evicted, 1);
    assert_eq!(report.unblocked, 1);
    assert!(manager.get(SHELL).is_none());
}

#[tokio::test]
async fn test_start_scans_and_shutdown_releases_everything() {
    let host = FakeHost::new();
    host.spawn(GAME, "game.exe");
    let manager = manager_for(&host, test_config(vec![game_rule()]));

    manager.start().unwrap();
    assert!(eventually(|| manager.is_running(GAME)).await);
    assert_eq!(host.forced_plan(), Some(PowerPlan::HighPerformance));

    manager.shutdown().await;
    assert!(manager.is_cancelled());
    assert_eq!(host.forced_plan(), None);
    assert_eq!(manager.running_count(), 0);
    assert!(manager.get(GAME).is_none());
    assert!(manager.full_scan().await.map_or(true, |s| s.triaged == 0));
}
