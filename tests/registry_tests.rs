//! File-backed registry behaviour across store instances and against
//! records written by hand.

use modhost::{FileRegistry, InstallMethod, ModulePath, ModuleStatus, RegistryEntry, RegistryStore};
use std::fs;
use tempfile::TempDir;

fn p(s: &str) -> ModulePath {
    s.parse().unwrap()
}

fn record(path: &str, status: ModuleStatus) -> RegistryEntry {
    RegistryEntry::new(p(path), status, InstallMethod::All, "t")
}

#[test]
fn test_records_survive_reopening() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = FileRegistry::new(dir.path());
        store.put(record("motion-detection/pi.cam", ModuleStatus::Installed)).unwrap();
        store.mark_removed(&p("motion-detection/pi.cam")).unwrap();
    }

    let store = FileRegistry::new(dir.path());
    assert!(dir.path().join("motion-detection__pi.cam.json").is_file());
    let entry = store.get(&p("motion-detection/pi.cam")).unwrap().unwrap();
    assert_eq!(entry.status, ModuleStatus::Removed);
    assert!(entry.installed_at.is_some());
}

#[test]
fn test_hand_written_record_is_readable() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("sensors__temp.json"),
        r#"{
            "modulePath": "sensors/temp",
            "name": "temp",
            "version": "1.4.2",
            "category": "sensors",
            "status": "active",
            "installedAt": "2024-03-01T08:15:30.250Z",
            "updatedAt": "2024-03-02T09:00:00.000Z",
            "installedBy": "root",
            "installMethod": "targeted",
            "capabilities": ["has-service", "produces-sensor-data"],
            "dependencies": ["iot/broker"],
            "packages": ["python3-smbus"]
        }"#,
    )
    .unwrap();

    let mut store = FileRegistry::new(dir.path());
    let entry = store.get(&p("sensors/temp")).unwrap().unwrap();
    assert_eq!(entry.status, ModuleStatus::Active);
    assert_eq!(entry.install_method, InstallMethod::Targeted);
    assert_eq!(entry.fingerprint, None);
    assert_eq!(entry.dependencies, vec![p("iot/broker")]);
    let original = entry.installed_at;

    // Rewriting keeps the original install time
    let rewritten = store.put(record("sensors/temp", ModuleStatus::Installed)).unwrap();
    assert_eq!(rewritten.installed_at, original);
    assert_eq!(
        original.unwrap().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "2024-03-01T08:15:30.250Z"
    );
}

#[test]
fn test_record_under_wrong_name_is_ignored_by_list() {
    let dir = TempDir::new().unwrap();
    let mut store = FileRegistry::new(dir.path());
    store.put(record("iot/a", ModuleStatus::Installed)).unwrap();
    fs::copy(dir.path().join("iot__a.json"), dir.path().join("iot__b.json")).unwrap();

    let listed: Vec<_> = store.list().unwrap().into_iter().map(|e| e.module_path).collect();
    assert_eq!(listed, vec![p("iot/a")]);
}

#[test]
fn test_interrupted_write_leaves_previous_record() {
    let dir = TempDir::new().unwrap();
    let mut store = FileRegistry::new(dir.path());
    store.put(record("iot/a", ModuleStatus::Installed)).unwrap();

    // A crash between temp write and rename leaves only the temp file behind
    let torn = r#"{"modulePath": "iot/a", "sta"#;
    fs::write(dir.path().join(".iot__a.json.tmp-4242"), torn).unwrap();

    let entry = store.get(&p("iot/a")).unwrap().unwrap();
    assert_eq!(entry.status, ModuleStatus::Installed);
    assert_eq!(store.list().unwrap().len(), 1);
}

#[test]
fn test_put_replaces_torn_record() {
    let dir = TempDir::new().unwrap();
    let mut store = FileRegistry::new(dir.path());
    fs::write(dir.path().join("iot__a.json"), "{ torn").unwrap();
    assert!(store.get(&p("iot/a")).is_err());
    assert!(store.list().unwrap().is_empty());

    let stored = store.put(record("iot/a", ModuleStatus::Installed)).unwrap();

    assert!(stored.installed_at.is_some());
    assert_eq!(store.get(&p("iot/a")).unwrap().unwrap(), stored);
    assert_eq!(store.list().unwrap().len(), 1);
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(leftovers, vec!["iot__a.json"]);
}
