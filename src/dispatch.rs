use std::collections::HashMap;

use crate::ast::OnFunction;
use crate::backend::HostCalls;
use crate::error::ConfigError;
use crate::value::Value;

/// A registered game function. The four variants mirror the four
/// registration calls: with or without arguments, returning a value or
/// not. Host closures report failure as a plain message string; the
/// dispatcher turns that into a game-function runtime error.
pub(crate) enum GameFn {
    VoidArgless(Box<dyn FnMut(u64) -> Result<(), String>>),
    Void(Box<dyn FnMut(u64, &[Value]) -> Result<(), String>>),
    ValueArgless(Box<dyn FnMut(u64) -> Result<Value, String>>),
    Value(Box<dyn FnMut(u64, &[Value]) -> Result<Value, String>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GameFnShape {
    VoidArgless,
    Void,
    ValueArgless,
    Value,
}

impl GameFnShape {
    pub(crate) fn takes_args(self) -> bool {
        matches!(self, GameFnShape::Void | GameFnShape::Value)
    }

    pub(crate) fn returns_value(self) -> bool {
        matches!(self, GameFnShape::ValueArgless | GameFnShape::Value)
    }
}

impl GameFn {
    fn shape(&self) -> GameFnShape {
        match self {
            GameFn::VoidArgless(_) => GameFnShape::VoidArgless,
            GameFn::Void(_) => GameFnShape::Void,
            GameFn::ValueArgless(_) => GameFnShape::ValueArgless,
            GameFn::Value(_) => GameFnShape::Value,
        }
    }
}

/// Name-keyed table of everything the host exposed to scripts. Doubles as
/// the [`HostCalls`] implementation handed to the backend during a call.
#[derive(Default)]
pub(crate) struct GameFns {
    fns: HashMap<String, GameFn>,
}

impl GameFns {
    pub(crate) fn register(&mut self, name: &str, f: GameFn) -> Result<(), ConfigError> {
        if self.fns.contains_key(name) {
            return Err(ConfigError::DuplicateGameFn(name.into()));
        }
        self.fns.insert(name.into(), f);
        Ok(())
    }

    pub(crate) fn shape(&self, name: &str) -> Option<GameFnShape> {
        self.fns.get(name).map(GameFn::shape)
    }
}

impl HostCalls for GameFns {
    fn call_game_fn(
        &mut self,
        name: &str,
        me: u64,
        args: &[Value],
    ) -> Result<Option<Value>, String> {
        let Some(f) = self.fns.get_mut(name) else {
            return Err(format!("game function '{name}' is not registered"));
        };
        match f {
            GameFn::VoidArgless(f) => f(me).map(|()| None),
            GameFn::Void(f) => f(me, args).map(|()| None),
            GameFn::ValueArgless(f) => f(me).map(Some),
            GameFn::Value(f) => f(me, args).map(Some),
        }
    }
}

/// Argument validation for the checked call path: exact arity, then tag
/// equality against each declared argument type. Never reads past the
/// declared argument list.
pub(crate) fn check_args(on_fn: &OnFunction, args: &[Value]) -> Result<(), String> {
    if args.len() != on_fn.args.len() {
        return Err(format!(
            "'{}' expects {} argument{}, got {}",
            on_fn.name,
            on_fn.args.len(),
            if on_fn.args.len() == 1 { "" } else { "s" },
            args.len()
        ));
    }
    for (declared, value) in on_fn.args.iter().zip(args) {
        let Some(expected) = declared.ty.value_tag() else {
            return Err(format!("argument '{}' has no passable type", declared.name));
        };
        if value.tag() != expected {
            return Err(format!(
                "argument '{}' of '{}' expects {}, got {}",
                declared.name,
                on_fn.name,
                expected,
                value.tag()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FnArg, Type};

    fn on_fn(args: Vec<FnArg>) -> OnFunction {
        OnFunction { name: "on_test".into(), args, body: vec![], line: 1 }
    }

    fn arg(name: &str, ty: Type) -> FnArg {
        FnArg { name: name.into(), ty, line: 1 }
    }

    #[test]
    fn check_args_accepts_matching_tags() {
        let f = on_fn(vec![
            arg("count", Type::Number),
            arg("label", Type::String),
            arg("target", Type::Id { entity_type: Some("Dog".into()) }),
        ]);
        let args =
            [Value::Number(3.0), Value::String("hi".into()), Value::Id(9)];
        assert!(check_args(&f, &args).is_ok());
    }

    #[test]
    fn check_args_rejects_arity_mismatch() {
        let f = on_fn(vec![arg("count", Type::Number)]);
        let err = check_args(&f, &[]).expect_err("missing argument");
        assert!(err.contains("expects 1 argument"));
    }

    #[test]
    fn check_args_rejects_tag_mismatch() {
        let f = on_fn(vec![arg("count", Type::Number)]);
        let err = check_args(&f, &[Value::Bool(true)]).expect_err("wrong tag");
        assert!(err.contains("expects number, got bool"));
    }

    #[test]
    fn resource_arguments_travel_as_strings() {
        let f = on_fn(vec![arg("sound", Type::Resource { extension: Some(".wav".into()) })]);
        assert!(check_args(&f, &[Value::String("bark.wav".into())]).is_ok());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut fns = GameFns::default();
        fns.register("print", GameFn::VoidArgless(Box::new(|_| Ok(()))))
            .expect("first registration");
        let err = fns
            .register("print", GameFn::VoidArgless(Box::new(|_| Ok(()))))
            .expect_err("second registration");
        assert!(matches!(err, ConfigError::DuplicateGameFn(_)));
    }
}
