use crate::ast::Ast;
use crate::error::InvokeError;
use crate::value::Value;

/// Identifies one compiled script inside a backend. Ids are minted by the
/// backend that compiled the script and mean nothing to any other backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendFileId(pub u64);

/// The host-side call surface a backend uses while script code runs.
/// Implemented by the registered game-function table; custom backends only
/// ever see it as a trait object.
pub trait HostCalls {
    /// Invokes a registered game function. `Ok(None)` for void functions.
    /// `Err` carries the reason the host gave and aborts the script call
    /// as a game-function error.
    fn call_game_fn(
        &mut self,
        name: &str,
        me: u64,
        args: &[Value],
    ) -> Result<Option<Value>, String>;
}

/// A compilation strategy for resolved scripts. The state owns exactly one
/// backend at a time; handing a new one to `swap_backend` recompiles every
/// loaded script before the old backend is dropped. Dropping a backend
/// must release everything it compiled, so a plain `Drop` impl is the
/// whole teardown story.
pub trait Backend {
    /// Compiles one resolved script. A failure leaves the script serving
    /// its previous compiled version, so partial state for the failed
    /// compile must not linger inside the backend. Failures carrying a
    /// [`crate::error::CompileError`] keep their source line in the
    /// file's recorded error.
    fn compile(&mut self, ast: &Ast) -> anyhow::Result<BackendFileId>;

    /// Discards one compiled script. Called when a script is removed from
    /// disk or replaced by a newer compile.
    fn remove(&mut self, unit: BackendFileId);

    /// Runs every member initializer of `unit` in declaration order,
    /// writing results into `members`. The buffer is pre-sized by the
    /// caller to the script's member count.
    fn init_members(
        &mut self,
        unit: BackendFileId,
        me: u64,
        members: &mut [Value],
        host: &mut dyn HostCalls,
    ) -> Result<(), InvokeError>;

    /// Runs one on function. `members` is the entity's live buffer and
    /// mutations must land in it, `args` follows the function's declared
    /// argument order.
    fn invoke(
        &mut self,
        unit: BackendFileId,
        on_fn: &str,
        me: u64,
        members: &mut [Value],
        args: &[Value],
        host: &mut dyn HostCalls,
    ) -> Result<(), InvokeError>;

    /// Toggles speed-over-safety execution. Backends without such a trade
    /// ignore it.
    fn set_fast_mode(&mut self, fast: bool) {
        let _ = fast;
    }
}
