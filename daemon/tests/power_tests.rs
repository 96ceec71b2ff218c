use std::fs;
use std::path::Path;
use taskwarden_daemon::power::{GovernorPower, PowerControl, PowerPlan};
use tempfile::TempDir;

fn fake_sysfs(cpus: usize, governor: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    for cpu in 0..cpus {
        let cpufreq = dir.path().join(format!("cpu{}", cpu)).join("cpufreq");
        fs::create_dir_all(&cpufreq).unwrap();
        fs::write(cpufreq.join("scaling_governor"), format!("{}\n", governor)).unwrap();
    }
    // not a cpu directory
    fs::create_dir_all(dir.path().join("cpuidle")).unwrap();
    dir
}

fn governor(root: &Path, cpu: usize) -> String {
    let file = root.join(format!("cpu{}/cpufreq/scaling_governor", cpu));
    fs::read_to_string(file).unwrap().trim().to_string()
}

#[test]
fn test_force_and_release_restores_governor() {
    let sysfs = fake_sysfs(2, "schedutil");
    let power = GovernorPower::with_root(sysfs.path());

    assert!(power.force(PowerPlan::HighPerformance, 100));
    assert!(power.is_forced());
    assert_eq!(governor(sysfs.path(), 0), "performance");
    assert_eq!(governor(sysfs.path(), 1), "performance");

    power.release(100);
    assert!(!power.is_forced());
    assert_eq!(governor(sysfs.path(), 0), "schedutil");
}

#[test]
fn test_force_survives_while_any_owner_holds_it() {
    let sysfs = fake_sysfs(1, "schedutil");
    let power = GovernorPower::with_root(sysfs.path());

    assert!(power.force(PowerPlan::HighPerformance, 1));
    assert!(power.force(PowerPlan::PowerSaver, 2));
    assert_eq!(governor(sysfs.path(), 0), "performance");

    power.release(1);
    assert!(power.is_forced());
    assert_eq!(governor(sysfs.path(), 0), "powersave");

    // unknown owner changes nothing
    power.release(42);
    assert_eq!(governor(sysfs.path(), 0), "powersave");

    power.release(2);
    assert_eq!(governor(sysfs.path(), 0), "schedutil");
}

#[test]
fn test_force_without_cpufreq_fails() {
    let dir = TempDir::new().unwrap();
    let power = GovernorPower::with_root(dir.path());
    assert!(!power.force(PowerPlan::Balanced, 1));
    assert!(!power.is_forced());
}
