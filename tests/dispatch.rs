use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use grug::{ConfigError, Grug, GrugConfig, GrugError, RuntimeErrorKind, Value};

fn write_script(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create mod directory");
    }
    fs::write(path, contents).expect("write script");
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
fn every_game_fn_shape_is_callable_from_scripts() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "imp-Goblin.grug",
        "on_test() {\n    report(me, 1 + 1)\n    nudge()\n    x: number = roll()\n    stash(pair(x, 2))\n}\n",
    );

    let mut g = grug_at(root);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    g.register_game_fn_void("report", move |me, args| {
        sink.borrow_mut().push((me, args.to_vec()));
        Ok(())
    })
    .expect("register report");

    let nudges = Rc::new(RefCell::new(0usize));
    let count = Rc::clone(&nudges);
    g.register_game_fn_void_argless("nudge", move |_me| {
        *count.borrow_mut() += 1;
        Ok(())
    })
    .expect("register nudge");

    g.register_game_fn_value_argless("roll", |_me| Ok(Value::Number(7.0)))
        .expect("register roll");

    g.register_game_fn_value("pair", |_me, args| {
        let base = args[0].as_number().unwrap_or(0.0);
        let extra = args[1].as_number().unwrap_or(0.0);
        Ok(Value::Number(base + extra))
    })
    .expect("register pair");

    let stashed = Rc::new(RefCell::new(Vec::new()));
    let keep = Rc::clone(&stashed);
    g.register_game_fn_void("stash", move |_me, args| {
        keep.borrow_mut().push(args[0].clone());
        Ok(())
    })
    .expect("register stash");

    let id = g.script("imp-Goblin.grug").expect("imp should load");
    let entity = g.create_entity(id, 77).expect("create entity");
    assert_eq!(g.entity_id(entity), Some(77));
    assert_eq!(g.entity_file(entity), Some(id));

    let on_test = g.fn_id("Goblin", "on_test");
    g.call_argless(on_test, entity).expect("run on_test");

    assert_eq!(
        seen.borrow().as_slice(),
        &[(77, vec![Value::Id(77), Value::Number(2.0)])],
        "me crosses the boundary as the host id"
    );
    assert_eq!(*nudges.borrow(), 1);
    assert_eq!(stashed.borrow().as_slice(), &[Value::Number(9.0)]);
}

#[test]
fn duplicate_game_fn_names_are_a_config_error() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let mut g = grug_at(dir.path());

    g.register_game_fn_value_argless("roll", |_me| Ok(Value::Number(1.0)))
        .expect("first registration");
    let err = g
        .register_game_fn_void_argless("roll", |_me| Ok(()))
        .expect_err("second registration of the same name");
    assert!(
        matches!(err, GrugError::Config(ConfigError::DuplicateGameFn(name)) if name == "roll"),
        "the duplicate is rejected by name"
    );
}

#[test]
fn checked_calls_validate_arity_and_argument_tags() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "grunt-Soldier.grug",
        "health: number = 100\n\non_hit(amount: number) {\n    health = health - amount\n}\n",
    );

    let (mut g, log) = grug_with_log(root);
    let id = g.script("grunt-Soldier.grug").expect("grunt should load");
    let entity = g.create_entity(id, 11).expect("create entity");
    let hit = g.fn_id("Soldier", "on_hit");

    let err = g.call(hit, entity, &[]).expect_err("arity is checked");
    let GrugError::Runtime(e) = err else { panic!("expected a runtime error") };
    assert_eq!(e.kind, RuntimeErrorKind::GameFnError);
    assert!(e.reason.contains("expects 1 argument"), "got: {}", e.reason);
    assert_eq!(e.on_fn, "on_hit");
    assert_eq!(e.script, "grunt-Soldier.grug");

    let err = g.call(hit, entity, &[Value::Bool(true)]).expect_err("tags are checked");
    let GrugError::Runtime(e) = err else { panic!("expected a runtime error") };
    assert!(e.reason.contains("expects number, got bool"), "got: {}", e.reason);

    g.call(hit, entity, &[Value::Number(30.0)]).expect("a well-typed call runs");
    assert_eq!(g.members(entity), Some(&[Value::Number(70.0)][..]));
    assert_eq!(log.borrow().len(), 2, "both rejected calls were reported");
}

#[test]
fn checked_calls_validate_the_entity_type() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "imp-Goblin.grug", "pokes: number = 0\n\non_poke() {\n    pokes = pokes + 1\n}\n");

    let mut g = grug_at(root);
    let id = g.script("imp-Goblin.grug").expect("imp should load");
    let entity = g.create_entity(id, 4).expect("create entity");

    let wrong = g.fn_id("Monster", "on_poke");
    let err = g.call_argless(wrong, entity).expect_err("the id belongs to another type");
    let GrugError::Runtime(e) = err else { panic!("expected a runtime error") };
    assert_eq!(e.kind, RuntimeErrorKind::GameFnError);
    assert!(e.reason.contains("Monster"), "got: {}", e.reason);
    assert_eq!(g.members(entity), Some(&[Value::Number(0.0)][..]), "the call never ran");
}

#[test]
fn unchecked_calls_skip_boundary_validation() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "imp-Goblin.grug",
        "pokes: number = 0\n\non_poke() {\n    pokes = pokes + 1\n}\n\non_feed(amount: number) {\n    pokes = pokes + amount\n}\n",
    );

    let mut g = grug_at(root);
    let id = g.script("imp-Goblin.grug").expect("imp should load");
    let entity = g.create_entity(id, 4).expect("create entity");

    // Extra arguments pass straight through and are ignored by the script.
    let poke = g.fn_id("Goblin", "on_poke");
    g.call_unchecked(poke, entity, &[Value::Number(5.0)]).expect("extra args are tolerated");
    assert_eq!(g.members(entity), Some(&[Value::Number(1.0)][..]));

    // The entity-type check is skipped too; the name lookup still hits.
    let foreign = g.fn_id("Monster", "on_poke");
    g.call_unchecked(foreign, entity, &[]).expect("type checking skipped");
    assert_eq!(g.members(entity), Some(&[Value::Number(2.0)][..]));

    // Missing arguments surface from inside the backend instead.
    let feed = g.fn_id("Goblin", "on_feed");
    let err = g.call_unchecked(feed, entity, &[]).expect_err("the backend still needs its args");
    let GrugError::Runtime(e) = err else { panic!("expected a runtime error") };
    assert_eq!(e.kind, RuntimeErrorKind::GameFnError);
}

#[test]
fn entities_own_disjoint_member_buffers() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "grunt-Soldier.grug",
        "health: number = 100\n\non_hit(amount: number) {\n    health = health - amount\n}\n",
    );

    let mut g = grug_at(root);
    let id = g.script("grunt-Soldier.grug").expect("grunt should load");
    let first = g.create_entity(id, 1).expect("create first entity");
    let second = g.create_entity(id, 2).expect("create second entity");
    assert_ne!(first, second);

    let hit = g.fn_id("Soldier", "on_hit");
    g.call(hit, first, &[Value::Number(30.0)]).expect("hit the first entity");
    assert_eq!(g.members(first), Some(&[Value::Number(70.0)][..]));
    assert_eq!(g.members(second), Some(&[Value::Number(100.0)][..]), "the second is untouched");
}

#[test]
fn unimplemented_on_fns_are_a_quiet_no_op() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "imp-Goblin.grug", "pokes: number = 0\n\non_poke() {\n    pokes = pokes + 1\n}\n");

    let (mut g, log) = grug_with_log(root);
    let id = g.script("imp-Goblin.grug").expect("imp should load");
    let entity = g.create_entity(id, 4).expect("create entity");

    let dance = g.fn_id("Goblin", "on_dance");
    g.call_argless(dance, entity).expect("scripts implement only what they care about");
    assert!(log.borrow().is_empty());
}

#[test]
fn host_owned_buffers_use_the_raw_trio() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(
        root,
        "grunt-Soldier.grug",
        "health: number = 100\n\non_hit(amount: number) {\n    health = health - amount\n}\n",
    );

    let mut g = grug_at(root);
    let id = g.script("grunt-Soldier.grug").expect("grunt should load");

    let count = g.required_members(id).expect("the script has a compiled version");
    assert_eq!(count, 1);

    let mut buffer = vec![Value::Number(0.0); count];
    g.init_members(id, 55, &mut buffer).expect("init the raw buffer");
    assert_eq!(buffer, vec![Value::Number(100.0)]);

    let hit = g.fn_id("Soldier", "on_hit");
    g.call_in(hit, id, 55, &mut buffer, &[Value::Number(25.0)]).expect("raw call");
    assert_eq!(buffer, vec![Value::Number(75.0)]);

    let mut short = Vec::new();
    let err = g.init_members(id, 55, &mut short).expect_err("the buffer must fit the layout");
    assert!(matches!(err, GrugError::MembersLen { expected: 1, got: 0 }));
}

#[test]
fn a_failing_game_fn_aborts_the_call_and_reports() {
    let dir = tempfile::tempdir().expect("temp mods dir");
    let root = dir.path();
    write_script(root, "barrel-Prop.grug", "on_explode() {\n    boom()\n}\n");

    let (mut g, log) = grug_with_log(root);
    g.register_game_fn_void_argless("boom", |_me| Err("kaput".into()))
        .expect("register boom");

    let id = g.script("barrel-Prop.grug").expect("barrel should load");
    let entity = g.create_entity(id, 8).expect("create entity");
    let explode = g.fn_id("Prop", "on_explode");

    let err = g.call_argless(explode, entity).expect_err("the host error aborts the call");
    let GrugError::Runtime(e) = err else { panic!("expected a runtime error") };
    assert_eq!(e.kind, RuntimeErrorKind::GameFnError);
    assert!(e.reason.contains("kaput"), "got: {}", e.reason);
    assert_eq!(e.on_fn, "on_explode");
    assert_eq!(e.script, "barrel-Prop.grug");
    assert_eq!(log.borrow().len(), 1);
}
