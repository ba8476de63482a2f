use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::{GrugConfig, DEFAULT_MAX_CALL_DEPTH, DEFAULT_ON_FN_TIME_LIMIT};
use crate::dispatch::{check_args, GameFn, GameFns};
use crate::entity::{EntityId, EntityTable};
use crate::error::{
    CompileError, ConfigError, ErrorReport, GrugError, Result, RuntimeError, RuntimeErrorKind,
};
use crate::interp::Interpreter;
use crate::mods::{self, DirListing, FileError, FileId, ModDir, ModFile};
use crate::parser::parse;
use crate::registry::{OnFnEntry, OnFnId, OnFnRegistry};
use crate::resolve::resolve;
use crate::value::Value;

/// The whole mod-scripting system: the mod tree, the on-fn registry, the
/// registered game functions, the live entities and the one backend that
/// runs compiled scripts. Single-threaded by construction; game functions
/// receive the calling entity's id and values, never this struct, so a
/// game function can never re-enter the update cycle.
pub struct Grug {
    mods_root: PathBuf,
    tree: ModDir,
    paths: HashMap<FileId, String>,
    next_file_id: u64,
    registry: OnFnRegistry,
    game_fns: GameFns,
    entities: EntityTable,
    error_handler: Box<dyn FnMut(&ErrorReport)>,
    fast_mode: bool,
    // Declared last: fields drop in order, and units inside the backend
    // must outlive everything that still names their ids.
    backend: Box<dyn Backend>,
}

impl Grug {
    /// Builds the state and performs the first scan, so every script
    /// already on disk is loaded when this returns. Fails only on config
    /// errors; unreadable or broken scripts are per-file conditions
    /// delivered through the error handler.
    pub fn new(config: GrugConfig) -> Result<Grug> {
        let GrugConfig { mods_folder, backend, error_handler, fast_mode, max_call_depth, on_fn_time_limit } =
            config;
        let mods_root = mods_folder.unwrap_or_else(|| PathBuf::from("mods"));
        if mods_root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyModsFolder.into());
        }
        if mods_root.exists() && !mods_root.is_dir() {
            return Err(ConfigError::ModsFolderNotADirectory(mods_root).into());
        }
        let mut backend = backend.unwrap_or_else(|| {
            Box::new(Interpreter::new(
                max_call_depth.unwrap_or(DEFAULT_MAX_CALL_DEPTH),
                on_fn_time_limit.unwrap_or(DEFAULT_ON_FN_TIME_LIMIT),
            ))
        });
        backend.set_fast_mode(fast_mode);
        let error_handler =
            error_handler.unwrap_or_else(|| Box::new(|report: &ErrorReport| warn!("{report}")));
        let root_name = mods_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mods".into());
        let mut grug = Grug {
            mods_root,
            tree: ModDir::root(root_name),
            paths: HashMap::new(),
            next_file_id: 0,
            registry: OnFnRegistry::default(),
            game_fns: GameFns::default(),
            entities: EntityTable::default(),
            error_handler,
            fast_mode,
            backend,
        };
        grug.update();
        Ok(grug)
    }

    // ----- game function registration -----

    /// Exposes a host function taking arguments and returning a value.
    /// One registration call exists per arity/return shape; a name may be
    /// registered under exactly one of them.
    pub fn register_game_fn_value(
        &mut self,
        name: &str,
        f: impl FnMut(u64, &[Value]) -> std::result::Result<Value, String> + 'static,
    ) -> Result<()> {
        Ok(self.game_fns.register(name, GameFn::Value(Box::new(f)))?)
    }

    pub fn register_game_fn_void(
        &mut self,
        name: &str,
        f: impl FnMut(u64, &[Value]) -> std::result::Result<(), String> + 'static,
    ) -> Result<()> {
        Ok(self.game_fns.register(name, GameFn::Void(Box::new(f)))?)
    }

    pub fn register_game_fn_value_argless(
        &mut self,
        name: &str,
        f: impl FnMut(u64) -> std::result::Result<Value, String> + 'static,
    ) -> Result<()> {
        Ok(self.game_fns.register(name, GameFn::ValueArgless(Box::new(f)))?)
    }

    pub fn register_game_fn_void_argless(
        &mut self,
        name: &str,
        f: impl FnMut(u64) -> std::result::Result<(), String> + 'static,
    ) -> Result<()> {
        Ok(self.game_fns.register(name, GameFn::VoidArgless(Box::new(f)))?)
    }

    // ----- queries -----

    /// The stable id for `(entity type, on-fn name)`, minted on first use.
    pub fn fn_id(&mut self, entity_type: &str, on_fn_name: &str) -> OnFnId {
        self.registry.get_or_insert(entity_type, on_fn_name)
    }

    /// Every `(entity type, on-fn name)` pair seen so far, in id order.
    pub fn on_fns(&self) -> &[OnFnEntry] {
        self.registry.entries()
    }

    /// Looks a script up by mods-relative path, e.g.
    /// `animals/labrador-Dog.grug`.
    pub fn script(&self, path: &str) -> Option<FileId> {
        self.tree.file(path).map(|f| f.id)
    }

    pub fn file(&self, id: FileId) -> Option<&ModFile> {
        let rel = self.paths.get(&id)?;
        self.tree.file(rel)
    }

    /// Root of the live mod tree, for introspection.
    pub fn mods(&self) -> &ModDir {
        &self.tree
    }

    // ----- update cycle -----

    /// One reload cycle: scan the mods folder, load new and changed
    /// scripts, sweep deleted ones, re-initialize members of entities
    /// whose script reloaded. Returns the ids of added and changed files
    /// in walk order; the host re-runs its own per-file logic over them.
    pub fn update(&mut self) -> Vec<FileId> {
        let mut reports: Vec<ErrorReport> = Vec::new();
        let listing = mods::read_listing(&self.mods_root, &mut |r| reports.push(r));

        let mut resource_mtimes = HashMap::new();
        for path in mods::tracked_resources(&self.tree) {
            let mtime = fs::metadata(self.mods_root.join(&path)).and_then(|m| m.modified()).ok();
            resource_mtimes.insert(path, mtime);
        }
        let diff = mods::diff(&self.tree, &listing, &resource_mtimes);
        let removed = mods::reconcile(&mut self.tree, &listing, &mut self.next_file_id);
        for gone in &removed {
            self.paths.remove(&gone.id);
            if let Some(unit) = gone.unit {
                self.backend.remove(unit);
            }
            let entities = self.entities.referencing(gone.id);
            debug!("unloaded {}", gone.rel_path);
            if !entities.is_empty() {
                reports.push(ErrorReport::ScriptDeleted {
                    file: gone.id,
                    script: gone.rel_path.clone(),
                    entities,
                });
            }
        }

        let mut new_mtimes = HashMap::new();
        collect_mtimes(&listing, &mut new_mtimes);
        let mut changed = Vec::new();
        for rel in &diff.pending {
            let mtime = new_mtimes.get(rel).copied().flatten();
            if let Some((id, loaded)) = self.load_file(rel, mtime, &mut reports) {
                changed.push(id);
                if loaded {
                    self.reinit_entities(id, rel, &mut reports);
                }
            }
        }
        if !changed.is_empty() || !removed.is_empty() {
            debug!("scan: {} loaded, {} removed", changed.len(), removed.len());
        }

        for report in &reports {
            (self.error_handler)(report);
        }
        changed
    }

    /// Parses, resolves and compiles one script, recording the outcome on
    /// its tree node. Any failure keeps the previous working version
    /// serving and attaches the error to the node. Returns the file id
    /// and whether a fresh compile went live.
    fn load_file(
        &mut self,
        rel: &str,
        mtime: Option<SystemTime>,
        reports: &mut Vec<ErrorReport>,
    ) -> Option<(FileId, bool)> {
        let full = self.mods_root.join(rel);
        let source = fs::read_to_string(&full);

        let node = self.tree.file_mut(rel)?;
        let id = node.id;
        node.mtime = mtime;
        self.paths.insert(id, rel.to_string());

        let source = match source {
            Ok(source) => source,
            Err(err) => {
                node.error = Some(FileError { message: format!("cannot read: {err}"), line: None });
                reports.push(ErrorReport::Io { path: full, error: err.to_string() });
                return Some((id, false));
            }
        };
        let (ast, outcome) = match parse(&source)
            .and_then(|mut ast| resolve(&mut ast, &self.game_fns).map(|out| (ast, out)))
        {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!("script error in {rel}: {err}");
                node.error = Some(err.into());
                return Some((id, false));
            }
        };
        let resource_stats: Vec<(String, Option<SystemTime>)> = outcome
            .resources
            .iter()
            .map(|path| {
                let mtime =
                    fs::metadata(self.mods_root.join(path)).and_then(|m| m.modified()).ok();
                (path.clone(), mtime)
            })
            .collect();
        let node = self.tree.file_mut(rel)?;
        node.resources = resource_stats;
        match self.backend.compile(&ast) {
            Ok(unit) => {
                // Loading a script also claims ids for the on fns it
                // implements, so the introspection table covers scripts
                // the host never asked about.
                for f in &ast.on_functions {
                    self.registry.get_or_insert(&node.entity_type, &f.name);
                }
                if let Some(old) = node.unit.take() {
                    self.backend.remove(old);
                }
                node.unit = Some(unit);
                node.member_count = ast.members.len();
                node.ast = Some(ast);
                node.error = None;
                info!("loaded {rel}");
                Some((id, true))
            }
            Err(err) => {
                warn!("backend rejected {rel}: {err:#}");
                node.error = Some(compile_failure(&err));
                Some((id, false))
            }
        }
    }

    /// After a successful reload, every entity running the file gets its
    /// members buffer re-initialized from the new script.
    fn reinit_entities(&mut self, file: FileId, rel: &str, reports: &mut Vec<ErrorReport>) {
        let Some(node) = self.tree.file(rel) else { return };
        let Some(unit) = node.unit else { return };
        let count = node.member_count;
        for eid in self.entities.referencing(file) {
            let Some(entity) = self.entities.get_mut(eid) else { continue };
            entity.members.resize(count, Value::Number(0.0));
            let me = entity.host_id;
            if let Err(err) =
                self.backend.init_members(unit, me, &mut entity.members, &mut self.game_fns)
            {
                reports.push(ErrorReport::Runtime(RuntimeError {
                    kind: err.kind,
                    reason: err.reason,
                    on_fn: "init".into(),
                    script: rel.to_string(),
                }));
            }
        }
    }

    // ----- backend control -----

    /// Replaces the backend. Every loaded script is compiled into the new
    /// backend first; the old backend is dropped only after the last
    /// compile attempt, releasing all of its state at once. A script the
    /// new backend rejects is left with no working version and its id is
    /// returned; everything else keeps serving without interruption.
    pub fn swap_backend(&mut self, mut backend: Box<dyn Backend>) -> Vec<FileId> {
        backend.set_fast_mode(self.fast_mode);
        let mut loaded = Vec::new();
        self.tree.for_each_file(&mut |f| {
            if f.ast().is_some() {
                loaded.push(f.path().to_string());
            }
        });
        let mut failed = Vec::new();
        for rel in &loaded {
            let Some(node) = self.tree.file_mut(rel) else { continue };
            let Some(ast) = node.ast.as_ref() else { continue };
            match backend.compile(ast) {
                Ok(unit) => node.unit = Some(unit),
                Err(err) => {
                    warn!("new backend rejected {rel}: {err:#}");
                    node.unit = None;
                    node.error = Some(compile_failure(&err));
                    failed.push(node.id);
                }
            }
        }
        self.backend = backend;
        info!("backend swapped: {} scripts carried over, {} failed", loaded.len() - failed.len(), failed.len());
        failed
    }

    /// Forwards the speed-over-safety toggle to the current backend and
    /// remembers it for backends installed later.
    pub fn set_fast_mode(&mut self, fast: bool) {
        self.fast_mode = fast;
        self.backend.set_fast_mode(fast);
    }

    // ----- entities -----

    /// Creates an entity running `file`, owning a members buffer sized
    /// and initialized by the script. `host_id` is the id game functions
    /// receive as `me`. An initializer failure is reported through the
    /// error handler; the entity still exists with default members.
    pub fn create_entity(&mut self, file: FileId, host_id: u64) -> Result<EntityId> {
        let rel = self.paths.get(&file).ok_or(GrugError::UnknownFile(file))?.clone();
        let (unit, count) = {
            let node = self.tree.file(&rel).ok_or(GrugError::UnknownFile(file))?;
            (node.unit.ok_or(GrugError::FileNotCompiled(file))?, node.member_count)
        };
        let mut members = vec![Value::Number(0.0); count];
        if let Err(err) =
            self.backend.init_members(unit, host_id, &mut members, &mut self.game_fns)
        {
            let err = RuntimeError {
                kind: err.kind,
                reason: err.reason,
                on_fn: "init".into(),
                script: rel.clone(),
            };
            (self.error_handler)(&ErrorReport::Runtime(err));
        }
        let id = self.entities.insert(file, host_id, members);
        debug!("created {id} from {rel}");
        Ok(id)
    }

    /// Drops an entity and its members buffer. Returns whether it existed.
    pub fn destroy_entity(&mut self, entity: EntityId) -> bool {
        self.entities.remove(entity)
    }

    pub fn entity_file(&self, entity: EntityId) -> Option<FileId> {
        self.entities.get(entity).map(|e| e.file)
    }

    /// The host-supplied id the entity was created with.
    pub fn entity_id(&self, entity: EntityId) -> Option<u64> {
        self.entities.get(entity).map(|e| e.host_id)
    }

    pub fn members(&self, entity: EntityId) -> Option<&[Value]> {
        self.entities.get(entity).map(|e| e.members.as_slice())
    }

    pub fn members_mut(&mut self, entity: EntityId) -> Option<&mut [Value]> {
        self.entities.get_mut(entity).map(|e| e.members.as_mut_slice())
    }

    // ----- host-owned members buffers -----

    /// How many member values `file` declares, once it has a compiled
    /// version. Hosts that own their buffers size them with this.
    pub fn required_members(&self, file: FileId) -> Option<usize> {
        let node = self.file(file)?;
        node.unit.map(|_| node.member_count)
    }

    /// Initializes a host-owned members buffer, exactly as entity
    /// creation would.
    pub fn init_members(
        &mut self,
        file: FileId,
        host_id: u64,
        members: &mut [Value],
    ) -> Result<()> {
        let rel = self.paths.get(&file).ok_or(GrugError::UnknownFile(file))?.clone();
        let (unit, count) = {
            let node = self.tree.file(&rel).ok_or(GrugError::UnknownFile(file))?;
            (node.unit.ok_or(GrugError::FileNotCompiled(file))?, node.member_count)
        };
        if members.len() != count {
            return Err(GrugError::MembersLen { expected: count, got: members.len() });
        }
        self.backend.init_members(unit, host_id, members, &mut self.game_fns).map_err(|err| {
            let err = RuntimeError {
                kind: err.kind,
                reason: err.reason,
                on_fn: "init".into(),
                script: rel,
            };
            (self.error_handler)(&ErrorReport::Runtime(err.clone()));
            GrugError::Runtime(err)
        })
    }

    /// Calls an on function against a host-owned members buffer. Always
    /// validated like [`Grug::call`].
    pub fn call_in(
        &mut self,
        on_fn: OnFnId,
        file: FileId,
        host_id: u64,
        members: &mut [Value],
        args: &[Value],
    ) -> Result<()> {
        let Some(entry) = self.registry.entry(on_fn) else {
            return Err(GrugError::UnknownOnFn(on_fn));
        };
        let name = entry.on_fn_name.clone();
        let expected_type = entry.entity_type.clone();
        let rel = self.paths.get(&file).ok_or(GrugError::UnknownFile(file))?.clone();
        let node = self.tree.file(&rel).ok_or(GrugError::UnknownFile(file))?;
        let Some(unit) = node.unit else {
            return Err(GrugError::FileNotCompiled(file));
        };
        if members.len() != node.member_count {
            return Err(GrugError::MembersLen { expected: node.member_count, got: members.len() });
        }
        if node.entity_type != expected_type {
            let err = runtime_error(
                RuntimeErrorKind::GameFnError,
                format!("'{name}' belongs to entity type {expected_type}, but {rel} is {}", node.entity_type),
                &name,
                &rel,
            );
            (self.error_handler)(&ErrorReport::Runtime(err.clone()));
            return Err(err.into());
        }
        let Some(ast) = node.ast.as_ref() else {
            return Err(GrugError::FileNotCompiled(file));
        };
        let Some(f) = ast.on_function(&name) else {
            return Ok(());
        };
        if let Err(reason) = check_args(f, args) {
            let err = runtime_error(RuntimeErrorKind::GameFnError, reason, &name, &rel);
            (self.error_handler)(&ErrorReport::Runtime(err.clone()));
            return Err(err.into());
        }
        match self.backend.invoke(unit, &name, host_id, members, args, &mut self.game_fns) {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = runtime_error(err.kind, err.reason, &name, &rel);
                (self.error_handler)(&ErrorReport::Runtime(err.clone()));
                Err(err.into())
            }
        }
    }

    // ----- call dispatch -----

    /// Calls an on function with argument validation: exact arity and a
    /// tag match per argument, plus an entity-type check against the id's
    /// registry entry. Calling an on function the script does not
    /// implement is a successful no-op.
    pub fn call(&mut self, on_fn: OnFnId, entity: EntityId, args: &[Value]) -> Result<()> {
        self.dispatch(on_fn, entity, args, true)
    }

    pub fn call_argless(&mut self, on_fn: OnFnId, entity: EntityId) -> Result<()> {
        self.dispatch(on_fn, entity, &[], true)
    }

    /// [`Grug::call`] minus every pre-call check. Wrong argument shapes
    /// surface as runtime errors from inside the script instead of being
    /// caught at the boundary.
    pub fn call_unchecked(&mut self, on_fn: OnFnId, entity: EntityId, args: &[Value]) -> Result<()> {
        self.dispatch(on_fn, entity, args, false)
    }

    pub fn call_argless_unchecked(&mut self, on_fn: OnFnId, entity: EntityId) -> Result<()> {
        self.dispatch(on_fn, entity, &[], false)
    }

    fn dispatch(
        &mut self,
        on_fn: OnFnId,
        entity: EntityId,
        args: &[Value],
        checked: bool,
    ) -> Result<()> {
        let Some(entry) = self.registry.entry(on_fn) else {
            return Err(GrugError::UnknownOnFn(on_fn));
        };
        let name = entry.on_fn_name.clone();
        let expected_type = entry.entity_type.clone();
        let Some(file) = self.entities.get(entity).map(|e| e.file) else {
            return Err(GrugError::UnknownEntity(entity));
        };

        // A deleted or broken script must fail the call, not the host.
        let Some(rel) = self.paths.get(&file).cloned() else {
            let err = runtime_error(
                RuntimeErrorKind::GameFnError,
                format!("the script backing {entity} was deleted"),
                &name,
                "<deleted>",
            );
            (self.error_handler)(&ErrorReport::Runtime(err.clone()));
            return Err(err.into());
        };
        let Some(node) = self.tree.file(&rel) else {
            return Err(GrugError::UnknownFile(file));
        };
        let Some(unit) = node.unit else {
            let err = runtime_error(
                RuntimeErrorKind::GameFnError,
                format!("{rel} has no working compiled version"),
                &name,
                &rel,
            );
            (self.error_handler)(&ErrorReport::Runtime(err.clone()));
            return Err(err.into());
        };
        if checked && node.entity_type != expected_type {
            let err = runtime_error(
                RuntimeErrorKind::GameFnError,
                format!(
                    "'{name}' belongs to entity type {expected_type}, but {rel} is {}",
                    node.entity_type
                ),
                &name,
                &rel,
            );
            (self.error_handler)(&ErrorReport::Runtime(err.clone()));
            return Err(err.into());
        }
        let Some(ast) = node.ast.as_ref() else {
            return Err(GrugError::FileNotCompiled(file));
        };
        let Some(f) = ast.on_function(&name) else {
            // Scripts implement only the on functions they care about.
            return Ok(());
        };
        if checked {
            if let Err(reason) = check_args(f, args) {
                let err = runtime_error(RuntimeErrorKind::GameFnError, reason, &name, &rel);
                (self.error_handler)(&ErrorReport::Runtime(err.clone()));
                return Err(err.into());
            }
        }
        let Some(e) = self.entities.get_mut(entity) else {
            return Err(GrugError::UnknownEntity(entity));
        };
        let me = e.host_id;
        match self.backend.invoke(unit, &name, me, &mut e.members, args, &mut self.game_fns) {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = runtime_error(err.kind, err.reason, &name, &rel);
                (self.error_handler)(&ErrorReport::Runtime(err.clone()));
                Err(err.into())
            }
        }
    }
}

fn runtime_error(kind: RuntimeErrorKind, reason: String, on_fn: &str, script: &str) -> RuntimeError {
    RuntimeError { kind, reason, on_fn: on_fn.to_string(), script: script.to_string() }
}

/// Backends that know the offending source line report a [`CompileError`]
/// somewhere in their chain; keep the line when they do.
fn compile_failure(err: &anyhow::Error) -> FileError {
    let line = err.downcast_ref::<CompileError>().and_then(|e| e.line);
    FileError { message: format!("{err:#}"), line }
}

fn collect_mtimes(listing: &DirListing, out: &mut HashMap<String, Option<SystemTime>>) {
    for file in &listing.files {
        out.insert(file.rel_path.clone(), file.mtime);
    }
    for dir in &listing.dirs {
        collect_mtimes(dir, out);
    }
}
