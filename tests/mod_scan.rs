use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use grug::{ConfigError, Grug, GrugConfig, GrugError, RuntimeErrorKind};

fn write_script(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create mod directory");
    }
    fs::write(path, contents).expect("write script");
}

fn rewrite_script(root: &Path, rel: &str, contents: &str) {
    // Coarse filesystem clocks can swallow back-to-back writes.
    thread::sleep(Duration::from_millis(20));
    write_script(root, rel, contents);
}

fn grug_at(root: &Path) -> Grug {
    Grug::new(GrugConfig::with_mods_folder(root)).expect("scan mods folder")
}

fn grug_with_log(root: &Path) -> (Grug, Rc<RefCell<Vec<String>>>) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let config = GrugConfig {
        error_handler: Some(Box::new(move |report| sink.borrow_mut().push(report.to_string()))),
        ..GrugConfig::with_mods_folder(root)
    };
    let grug = Grug::new(config).expect("scan mods folder");
    (grug, log)
}

#[test]
fn initial_scan_loads_conforming_scripts() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "guard-Soldier.grug", "health: number = 100\n");
    write_script(root, "dungeon/boss-Monster.grug", "rage: number = 0\n");
    write_script(root, "notes.txt", "not a script\n");
    write_script(root, "plain.grug", "health: number = 1\n");

    let g = grug_at(root);
    let guard = g.script("guard-Soldier.grug").expect("guard should load");
    let boss = g.script("dungeon/boss-Monster.grug").expect("boss should load");
    assert_ne!(guard, boss);
    assert!(g.script("notes.txt").is_none(), "non-script files are ignored");
    assert!(g.script("plain.grug").is_none(), "scripts need a name-Type stem");

    let file = g.file(guard).expect("guard metadata");
    assert_eq!(file.entity_name(), "guard");
    assert_eq!(file.entity_type(), "Soldier");
    assert!(file.is_loaded());
    assert!(file.error().is_none());
    assert!(file.ast().is_some());

    assert!(g.mods().dirs().iter().any(|d| d.name() == "dungeon"));
}

#[test]
fn idle_scans_report_nothing_and_keep_ids() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "guard-Soldier.grug", "health: number = 100\n");

    let mut g = grug_at(root);
    let id = g.script("guard-Soldier.grug").expect("guard should load");
    assert!(g.update().is_empty(), "nothing on disk changed");
    assert!(g.update().is_empty());
    assert_eq!(g.script("guard-Soldier.grug"), Some(id), "idle scans keep ids stable");
}

#[test]
fn edits_are_reported_under_the_same_id() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "guard-Soldier.grug", "health: number = 100\n");

    let mut g = grug_at(root);
    let id = g.script("guard-Soldier.grug").expect("guard should load");

    rewrite_script(root, "guard-Soldier.grug", "health: number = 150\n");
    assert_eq!(g.update(), vec![id]);
    assert_eq!(g.script("guard-Soldier.grug"), Some(id));
    assert!(g.file(id).expect("guard metadata").error().is_none());
}

#[test]
fn new_files_and_directories_are_picked_up() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "guard-Soldier.grug", "health: number = 100\n");

    let mut g = grug_at(root);
    write_script(root, "imp-Goblin.grug", "mood: number = 1\n");
    write_script(root, "caves/troll-Monster.grug", "clubs: number = 2\n");

    let changed = g.update();
    let imp = g.script("imp-Goblin.grug").expect("imp should load");
    let troll = g.script("caves/troll-Monster.grug").expect("troll should load");
    assert_eq!(changed.len(), 2);
    assert!(changed.contains(&imp));
    assert!(changed.contains(&troll));
}

#[test]
fn deleting_a_script_with_live_entities_is_reported() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "guard-Soldier.grug",
        "health: number = 100\n\non_poke() {\n    health = health - 1\n}\n",
    );

    let (mut g, log) = grug_with_log(root);
    let id = g.script("guard-Soldier.grug").expect("guard should load");
    let entity = g.create_entity(id, 7).expect("create entity");

    fs::remove_file(root.join("guard-Soldier.grug")).expect("delete script");
    let changed = g.update();
    assert!(changed.is_empty(), "deletions are reported, not returned");
    assert!(g.script("guard-Soldier.grug").is_none());
    {
        let log = log.borrow();
        assert!(
            log.iter().any(|line| line.contains("guard-Soldier.grug")
                && line.contains("deleted")
                && line.contains("1 live entit")),
            "expected a deletion report, got {log:?}"
        );
    }

    // The entity outlives its script; calling into it fails politely.
    let on_poke = g.fn_id("Soldier", "on_poke");
    let err = g.call_argless(on_poke, entity).expect_err("calls into a deleted script must fail");
    assert!(
        matches!(err, GrugError::Runtime(e) if e.kind == RuntimeErrorKind::GameFnError),
        "expected a game function error"
    );
    assert!(g.destroy_entity(entity));
}

#[test]
fn recreating_a_deleted_script_mints_a_fresh_id() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "guard-Soldier.grug", "health: number = 100\n");

    let mut g = grug_at(root);
    let old = g.script("guard-Soldier.grug").expect("guard should load");

    fs::remove_file(root.join("guard-Soldier.grug")).expect("delete script");
    g.update();
    write_script(root, "guard-Soldier.grug", "health: number = 100\n");
    let changed = g.update();

    let new = g.script("guard-Soldier.grug").expect("guard should reload");
    assert_eq!(changed, vec![new]);
    assert_ne!(old, new, "file ids are never reused");
    assert!(g.file(old).is_none(), "the dead id stays dead");
}

#[test]
fn resource_mtime_drift_reloads_the_referencing_script() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "dog-Animal.grug",
        "bark: resource<\".wav\"> = \"sounds/bark.wav\"\n\non_spawn() {\n}\n",
    );

    let mut g = grug_at(root);
    let id = g.script("dog-Animal.grug").expect("dog should load");
    assert!(g.file(id).expect("dog metadata").error().is_none());
    assert!(g.update().is_empty(), "a missing resource is not drift");

    // The resource appearing counts as a change to the script using it.
    write_script(root, "sounds/bark.wav", "RIFF");
    assert_eq!(g.update(), vec![id]);
    assert!(g.update().is_empty());

    rewrite_script(root, "sounds/bark.wav", "RIFF2");
    assert_eq!(g.update(), vec![id], "a touched resource reloads the script");
}

#[test]
fn loading_a_script_registers_its_on_fns() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "guard-Soldier.grug",
        "on_spawn() {\n}\n\non_tick(dt: number) {\n}\n",
    );

    let g = grug_at(root);
    let entries = g.on_fns();
    assert!(entries
        .iter()
        .any(|e| e.entity_type == "Soldier" && e.on_fn_name == "on_spawn"));
    assert!(entries
        .iter()
        .any(|e| e.entity_type == "Soldier" && e.on_fn_name == "on_tick"));
}

#[test]
fn a_missing_mods_root_is_an_empty_tree() {
    let dir = tempfile::tempdir().expect("temp dir");
    let root = dir.path().join("not_yet");

    let (mut g, log) = grug_with_log(&root);
    assert!(g.mods().files().is_empty());
    assert!(g.mods().dirs().is_empty());
    g.update();
    assert!(log.borrow().is_empty(), "a missing root is not an error: {:?}", log.borrow());

    // The folder appearing later is picked up by the next scan.
    write_script(&root, "imp-Goblin.grug", "mood: number = 1\n");
    assert_eq!(g.update().len(), 1);
    assert!(g.script("imp-Goblin.grug").is_some());
}

#[test]
fn config_rejects_unusable_roots() {
    let dir = tempfile::tempdir().expect("temp dir");
    let file_path = dir.path().join("mods.txt");
    fs::write(&file_path, "x").expect("write plain file");

    let Err(err) = Grug::new(GrugConfig::with_mods_folder(&file_path)) else {
        panic!("a plain file must be rejected as a mods root");
    };
    assert!(matches!(err, GrugError::Config(ConfigError::ModsFolderNotADirectory(_))));

    let Err(err) = Grug::new(GrugConfig::with_mods_folder("")) else {
        panic!("an empty path must be rejected");
    };
    assert!(matches!(err, GrugError::Config(ConfigError::EmptyModsFolder)));
}
