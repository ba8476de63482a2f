use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use grug::{
    Ast, Backend, BackendFileId, CompileError, Grug, GrugConfig, GrugError, HostCalls,
    InvokeError, RuntimeErrorKind, Value,
};

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

/// Backend stub that counts compiles and records fast-mode toggles. With
/// `reject` set it refuses every script instead.
#[derive(Default)]
struct StubBackend {
    compiles: Rc<RefCell<usize>>,
    modes: Rc<RefCell<Vec<bool>>>,
    reject: bool,
    next: u64,
}

impl Backend for StubBackend {
    fn compile(&mut self, _ast: &Ast) -> anyhow::Result<BackendFileId> {
        if self.reject {
            return Err(CompileError { message: "refused by the stub".into(), line: None }.into());
        }
        *self.compiles.borrow_mut() += 1;
        let id = BackendFileId(self.next);
        self.next += 1;
        Ok(id)
    }

    fn remove(&mut self, _unit: BackendFileId) {}

    fn init_members(
        &mut self,
        _unit: BackendFileId,
        _me: u64,
        _members: &mut [Value],
        _host: &mut dyn HostCalls,
    ) -> Result<(), InvokeError> {
        Ok(())
    }

    fn invoke(
        &mut self,
        _unit: BackendFileId,
        _on_fn: &str,
        _me: u64,
        _members: &mut [Value],
        _args: &[Value],
        _host: &mut dyn HostCalls,
    ) -> Result<(), InvokeError> {
        Ok(())
    }

    fn set_fast_mode(&mut self, fast: bool) {
        self.modes.borrow_mut().push(fast);
    }
}

#[test]
fn reload_reinitializes_entity_members() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "counter-Widget.grug",
        "count: number = 1\n\non_bump() {\n    count = count + 1\n}\n",
    );

    let mut g = grug_at(root);
    let id = g.script("counter-Widget.grug").expect("widget should load");
    let entity = g.create_entity(id, 1).expect("create entity");
    assert_eq!(g.members(entity), Some(&[Value::Number(1.0)][..]));

    let bump = g.fn_id("Widget", "on_bump");
    g.call_argless(bump, entity).expect("bump the counter");
    assert_eq!(g.members(entity), Some(&[Value::Number(2.0)][..]));

    rewrite_script(
        root,
        "counter-Widget.grug",
        "count: number = 10\n\non_bump() {\n    count = count + 1\n}\n",
    );
    let changed = g.update();
    assert!(changed.contains(&id));
    assert_eq!(
        g.members(entity),
        Some(&[Value::Number(10.0)][..]),
        "a reload reruns the member initializers"
    );
}

#[test]
fn a_broken_edit_keeps_the_old_version_serving() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "mage-Caster.grug",
        "power: number = 3\n\non_cast() {\n    power = power * 2\n}\n",
    );

    let mut g = grug_at(root);
    let id = g.script("mage-Caster.grug").expect("mage should load");
    let entity = g.create_entity(id, 9).expect("create entity");
    let cast = g.fn_id("Caster", "on_cast");
    g.call_argless(cast, entity).expect("first cast");
    assert_eq!(g.members(entity), Some(&[Value::Number(6.0)][..]));

    rewrite_script(root, "mage-Caster.grug", "power: number = \n");
    let changed = g.update();
    assert_eq!(changed, vec![id], "a failed load still counts as a change");

    let file = g.file(id).expect("mage metadata");
    let error = file.error().expect("the parse error is recorded");
    assert_eq!(error.line, Some(1));
    assert!(file.is_loaded(), "the previous compile keeps serving");

    // Old behavior, old member values: the broken edit never ran.
    g.call_argless(cast, entity).expect("cast against the old version");
    assert_eq!(g.members(entity), Some(&[Value::Number(12.0)][..]));

    rewrite_script(
        root,
        "mage-Caster.grug",
        "power: number = 5\n\non_cast() {\n    power = power + 1\n}\n",
    );
    let changed = g.update();
    assert_eq!(changed, vec![id]);
    assert!(g.file(id).expect("mage metadata").error().is_none(), "the fix clears the error");
    assert_eq!(g.members(entity), Some(&[Value::Number(5.0)][..]));
    g.call_argless(cast, entity).expect("cast against the fixed version");
    assert_eq!(g.members(entity), Some(&[Value::Number(6.0)][..]));
}

#[test]
fn an_unchanged_broken_file_is_not_retried() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "mage-Caster.grug", "power: number = \n");

    let mut g = grug_at(root);
    let id = g.script("mage-Caster.grug").expect("the file exists even though it is broken");
    assert!(g.file(id).expect("mage metadata").error().is_some());
    assert!(!g.file(id).expect("mage metadata").is_loaded());

    // The failure was recorded against the current mtime, so idle scans
    // leave it alone until the author edits the file again.
    assert!(g.update().is_empty());
    assert!(g.update().is_empty());

    rewrite_script(root, "mage-Caster.grug", "power: number = 5\n");
    assert_eq!(g.update(), vec![id]);
    assert!(g.file(id).expect("mage metadata").error().is_none());
}

#[test]
fn member_layout_changes_resize_entity_buffers() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "chest-Prop.grug", "gold: number = 15\n");

    let mut g = grug_at(root);
    let id = g.script("chest-Prop.grug").expect("chest should load");
    let entity = g.create_entity(id, 3).expect("create entity");
    assert_eq!(g.members(entity), Some(&[Value::Number(15.0)][..]));

    rewrite_script(root, "chest-Prop.grug", "gold: number = 15\nlocked: bool = true\n");
    g.update();
    assert_eq!(
        g.members(entity),
        Some(&[Value::Number(15.0), Value::Bool(true)][..]),
        "the buffer grows with the script"
    );

    rewrite_script(root, "chest-Prop.grug", "gold: number = 4\n");
    g.update();
    assert_eq!(g.members(entity), Some(&[Value::Number(4.0)][..]), "and shrinks back");
}

#[test]
fn swap_backend_recompiles_every_loaded_script() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "guard-Soldier.grug", "health: number = 100\n\non_poke() {\n    health = health - 1\n}\n");
    write_script(root, "imp-Goblin.grug", "mood: number = 1\n");

    let mut g = grug_at(root);
    let guard = g.script("guard-Soldier.grug").expect("guard should load");
    let entity = g.create_entity(guard, 5).expect("create entity");

    let compiles = Rc::new(RefCell::new(0usize));
    let modes = Rc::new(RefCell::new(Vec::new()));
    let stub = StubBackend {
        compiles: Rc::clone(&compiles),
        modes: Rc::clone(&modes),
        ..StubBackend::default()
    };
    let failed = g.swap_backend(Box::new(stub));
    assert!(failed.is_empty(), "the stub accepts everything");
    assert_eq!(*compiles.borrow(), 2, "both loaded scripts were recompiled");
    assert_eq!(modes.borrow().as_slice(), &[false], "the current fast mode is forwarded");

    // Calls now land in the stub, which treats every on fn as a no-op.
    let poke = g.fn_id("Soldier", "on_poke");
    g.call_argless(poke, entity).expect("stub invoke");
    assert_eq!(g.members(entity), Some(&[Value::Number(100.0)][..]));
}

#[test]
fn swap_backend_failures_leave_scripts_visible_but_uncallable() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "guard-Soldier.grug", "health: number = 100\n\non_poke() {\n}\n");

    let mut g = grug_at(root);
    let id = g.script("guard-Soldier.grug").expect("guard should load");
    let entity = g.create_entity(id, 5).expect("create entity");

    let failed = g.swap_backend(Box::new(StubBackend { reject: true, ..StubBackend::default() }));
    assert_eq!(failed, vec![id]);

    let file = g.file(id).expect("guard metadata");
    assert!(!file.is_loaded(), "no compiled version exists under the new backend");
    assert!(file.error().expect("compile error recorded").message.contains("refused"));
    assert!(file.ast().is_some(), "the parsed tree is kept for the next attempt");

    let poke = g.fn_id("Soldier", "on_poke");
    let err = g.call_argless(poke, entity).expect_err("no working version to call");
    assert!(matches!(err, GrugError::Runtime(e) if e.kind == RuntimeErrorKind::GameFnError));
}

#[test]
fn fast_mode_reaches_current_and_future_backends() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();

    let modes = Rc::new(RefCell::new(Vec::new()));
    let stub = StubBackend { modes: Rc::clone(&modes), ..StubBackend::default() };
    let config = GrugConfig {
        backend: Some(Box::new(stub)),
        fast_mode: true,
        ..GrugConfig::with_mods_folder(root)
    };
    let mut g = Grug::new(config).expect("scan mods folder");
    assert_eq!(modes.borrow().as_slice(), &[true], "init forwards the configured mode");

    g.set_fast_mode(false);
    assert_eq!(modes.borrow().as_slice(), &[true, false]);

    let late = Rc::new(RefCell::new(Vec::new()));
    g.swap_backend(Box::new(StubBackend { modes: Rc::clone(&late), ..StubBackend::default() }));
    assert_eq!(late.borrow().as_slice(), &[false], "a swapped-in backend inherits the mode");
}
