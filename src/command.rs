//! Command tables: name → typed handler.
//!
//! Both the router (controller commands) and every executor (instrument commands) resolve
//! command names through a [`CommandTable`] built explicitly at construction time. A table
//! entry carries:
//!
//! - the handler, either synchronous or suspending ([`Handler`])
//! - its parameter list, used to bind positional/keyword arguments and to render a signature
//! - a one-line description and whether it is externally invokable (shown by `list_methods`)
//!
//! Unregistered names fail with [`CommandError::UnknownCommand`]; argument mismatches fail with
//! [`CommandError::BadArguments`] before the handler ever runs.

use crate::envelope::CommandOutput;
use crate::error::CommandError;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Handler that runs to completion without suspending.
pub type SyncHandler<C> = fn(&mut C, BoundArgs) -> Result<(), CommandError>;

/// Handler that may suspend (device I/O, timed waits).
pub type AsyncHandler<C> =
    for<'a> fn(&'a mut C, BoundArgs) -> BoxFuture<'a, Result<CommandOutput, CommandError>>;

/// A registered operation.
pub enum Handler<C> {
    /// Runs inline on the owner's task
    Sync(SyncHandler<C>),
    /// Awaited under the owner's timeout
    Async(AsyncHandler<C>),
}

impl<C> Clone for Handler<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Handler<C> {}

impl<C> fmt::Debug for Handler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Accepted JSON shape for a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// Any JSON number
    Float,
    /// Integer, or a float with no fractional part
    Int,
    /// JSON string
    Str,
    /// JSON bool; numbers are read as nonzero
    Bool,
    /// Passed through unchecked
    Any,
}

/// Largest magnitude a float carries without losing integer precision.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

impl ParamKind {
    fn as_str(self) -> &'static str {
        match self {
            ParamKind::Float => "float",
            ParamKind::Int => "int",
            ParamKind::Str => "str",
            ParamKind::Bool => "bool",
            ParamKind::Any => "any",
        }
    }

    /// Check a supplied value, normalizing bools and whole-valued floats given for ints.
    fn coerce(self, value: Value) -> Option<Value> {
        match (self, value) {
            (ParamKind::Any, v) => Some(v),
            (ParamKind::Float, v @ Value::Number(_)) => Some(v),
            (ParamKind::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Some(Value::Number(n))
            }
            // `201.0` is an int; `201.5` is not.
            (ParamKind::Int, Value::Number(n)) => n
                .as_f64()
                .filter(|x| x.fract() == 0.0 && x.abs() <= MAX_EXACT_INT)
                .map(|x| Value::from(x as i64)),
            (ParamKind::Str, v @ Value::String(_)) => Some(v),
            (ParamKind::Bool, v @ Value::Bool(_)) => Some(v),
            (ParamKind::Bool, Value::Number(n)) => {
                Some(Value::Bool(n.as_f64().is_some_and(|x| x != 0.0)))
            }
            _ => None,
        }
    }
}

/// One declared parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Param {
    /// Keyword name
    pub name: &'static str,
    /// Accepted shape
    pub kind: ParamKind,
    /// JSON literal used when the argument is omitted; `None` means required
    pub default: Option<&'static str>,
}

impl Param {
    /// Parameter with no default.
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            default: None,
        }
    }

    /// Parameter falling back to the JSON literal `default`.
    pub const fn optional(name: &'static str, kind: ParamKind, default: &'static str) -> Self {
        Self {
            name,
            kind,
            default: Some(default),
        }
    }
}

/// Arguments after binding against a parameter list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundArgs {
    command: String,
    values: BTreeMap<&'static str, Value>,
}

impl BoundArgs {
    /// Raw bound value.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Bound number.
    pub fn f64(&self, name: &str) -> Result<f64, CommandError> {
        self.value(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| self.missing(name))
    }

    /// Bound integer.
    pub fn i64(&self, name: &str) -> Result<i64, CommandError> {
        self.value(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| self.missing(name))
    }

    /// Bound string.
    pub fn str(&self, name: &str) -> Result<&str, CommandError> {
        self.value(name)
            .and_then(Value::as_str)
            .ok_or_else(|| self.missing(name))
    }

    /// Bound flag.
    pub fn bool(&self, name: &str) -> Result<bool, CommandError> {
        self.value(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| self.missing(name))
    }

    fn missing(&self, name: &str) -> CommandError {
        CommandError::BadArguments {
            command: self.command.clone(),
            reason: format!("argument '{name}' not bound"),
        }
    }
}

/// A table entry.
pub struct CommandSpec<C> {
    /// Name the command is invoked by
    pub name: &'static str,
    /// Declared parameters, positional order
    pub params: &'static [Param],
    /// One line shown by `list_methods`
    pub description: &'static str,
    /// Listed by `list_methods`
    pub exposed: bool,
    /// What runs
    pub handler: Handler<C>,
}

impl<C> CommandSpec<C> {
    /// Exposed synchronous command.
    pub fn sync(
        name: &'static str,
        params: &'static [Param],
        description: &'static str,
        handler: SyncHandler<C>,
    ) -> Self {
        Self {
            name,
            params,
            description,
            exposed: true,
            handler: Handler::Sync(handler),
        }
    }

    /// Exposed suspending command.
    pub fn suspending(
        name: &'static str,
        params: &'static [Param],
        description: &'static str,
        handler: AsyncHandler<C>,
    ) -> Self {
        Self {
            name,
            params,
            description,
            exposed: true,
            handler: Handler::Async(handler),
        }
    }

    /// Hide from `list_methods`; still invokable by name.
    pub fn internal(mut self) -> Self {
        self.exposed = false;
        self
    }

    /// `name(p: kind, q: kind = default)`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| match p.default {
                Some(default) => format!("{}: {} = {}", p.name, p.kind.as_str(), default),
                None => format!("{}: {}", p.name, p.kind.as_str()),
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }

    /// Bind positional and keyword arguments to the declared parameters.
    pub fn bind(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<BoundArgs, CommandError> {
        let bad = |reason: String| CommandError::BadArguments {
            command: self.name.to_string(),
            reason,
        };

        if args.len() > self.params.len() {
            return Err(bad(format!(
                "takes {} positional arguments but {} were given",
                self.params.len(),
                args.len()
            )));
        }
        if let Some(unknown) = kwargs
            .keys()
            .find(|key| !self.params.iter().any(|p| p.name == key.as_str()))
        {
            return Err(bad(format!("unexpected keyword argument '{unknown}'")));
        }

        let mut values = BTreeMap::new();
        for (index, param) in self.params.iter().enumerate() {
            let positional = args.get(index);
            let keyword = kwargs.get(param.name);
            let supplied = match (positional, keyword) {
                (Some(_), Some(_)) => {
                    return Err(bad(format!(
                        "got multiple values for argument '{}'",
                        param.name
                    )))
                }
                (Some(v), None) | (None, Some(v)) => v.clone(),
                (None, None) => match param.default {
                    Some(literal) => serde_json::from_str(literal).map_err(|e| {
                        CommandError::Failed(format!("bad default for '{}': {e}", param.name))
                    })?,
                    None => {
                        return Err(bad(format!(
                            "missing required argument '{}'",
                            param.name
                        )))
                    }
                },
            };
            let value = param.kind.coerce(supplied.clone()).ok_or_else(|| {
                bad(format!(
                    "argument '{}' expects {}, got {}",
                    param.name,
                    param.kind.as_str(),
                    supplied
                ))
            })?;
            values.insert(param.name, value);
        }

        Ok(BoundArgs {
            command: self.name.to_string(),
            values,
        })
    }
}

/// Discoverability entry for one exposed command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MethodInfo {
    /// Command name
    pub name: String,
    /// Rendered as `name(p: kind, q: kind = default)`
    pub signature: String,
    /// One-line description
    pub description: String,
}

/// Render methods as `{name: {"signature": …, "docstring": …}}`.
pub fn methods_to_value(methods: &[MethodInfo]) -> Value {
    let mut map = Map::new();
    for method in methods {
        let mut entry = Map::new();
        entry.insert("signature".into(), Value::String(method.signature.clone()));
        entry.insert("docstring".into(), Value::String(method.description.clone()));
        map.insert(method.name.clone(), Value::Object(entry));
    }
    Value::Object(map)
}

/// Name → handler mapping for one context type.
pub struct CommandTable<C> {
    commands: BTreeMap<&'static str, CommandSpec<C>>,
}

impl<C> Default for CommandTable<C> {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }
}

impl<C> CommandTable<C> {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a command.
    pub fn with(mut self, spec: CommandSpec<C>) -> Self {
        self.insert(spec);
        self
    }

    /// Add `spec`, replacing any entry with the same name.
    pub fn insert(&mut self, spec: CommandSpec<C>) {
        self.commands.insert(spec.name, spec);
    }

    /// Resolve a name and bind its arguments.
    pub fn resolve(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<(Handler<C>, BoundArgs), CommandError> {
        let spec = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        let bound = spec.bind(args, kwargs)?;
        Ok((spec.handler, bound))
    }

    /// Exposed commands, sorted by name.
    pub fn methods(&self) -> Vec<MethodInfo> {
        self.commands
            .values()
            .filter(|spec| spec.exposed)
            .map(|spec| MethodInfo {
                name: spec.name.to_string(),
                signature: spec.signature(),
                description: spec.description.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    #[derive(Default)]
    struct Counter {
        total: f64,
    }

    fn add(ctx: &mut Counter, args: BoundArgs) -> Result<(), CommandError> {
        ctx.total += args.f64("amount")? * args.i64("times")? as f64;
        Ok(())
    }

    fn read_total(ctx: &mut Counter, _args: BoundArgs) -> BoxFuture<'_, Result<CommandOutput, CommandError>> {
        async move { Ok(json!(ctx.total)) }.boxed()
    }

    const ADD_PARAMS: &[Param] = &[
        Param::required("amount", ParamKind::Float),
        Param::optional("times", ParamKind::Int, "1"),
    ];

    fn table() -> CommandTable<Counter> {
        CommandTable::new()
            .with(CommandSpec::sync("add", ADD_PARAMS, "Add `amount` `times` times", add))
            .with(CommandSpec::suspending("total", &[], "Read the total", read_total).internal())
    }

    #[test]
    fn resolves_and_runs_sync_handler() {
        let mut ctx = Counter::default();
        let mut kwargs = Map::new();
        kwargs.insert("times".into(), json!(3));
        let (handler, bound) = table().resolve("add", &[json!(2)], &kwargs).unwrap();
        match handler {
            Handler::Sync(f) => f(&mut ctx, bound).unwrap(),
            Handler::Async(_) => panic!("expected sync handler"),
        }
        assert_eq!(ctx.total, 6.0);
    }

    #[tokio::test]
    async fn resolves_and_runs_async_handler() {
        let mut ctx = Counter { total: 4.5 };
        let (handler, bound) = table().resolve("total", &[], &Map::new()).unwrap();
        match handler {
            Handler::Async(f) => assert_eq!(f(&mut ctx, bound).await.unwrap(), json!(4.5)),
            Handler::Sync(_) => panic!("expected async handler"),
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = table().resolve("launch", &[], &Map::new()).unwrap_err();
        assert_eq!(err, CommandError::UnknownCommand("launch".into()));
    }

    #[test]
    fn binding_errors_are_reported() {
        let t = table();
        let no_kwargs = Map::new();

        let too_many = t.resolve("add", &[json!(1), json!(2), json!(3)], &no_kwargs);
        assert!(matches!(too_many, Err(CommandError::BadArguments { .. })));

        let missing = t.resolve("add", &[], &no_kwargs);
        assert!(matches!(missing, Err(CommandError::BadArguments { reason, .. }) if reason.contains("amount")));

        let wrong_type = t.resolve("add", &[json!("lots")], &no_kwargs);
        assert!(matches!(wrong_type, Err(CommandError::BadArguments { reason, .. }) if reason.contains("expects float")));

        let mut dup = Map::new();
        dup.insert("amount".into(), json!(1));
        let duplicate = t.resolve("add", &[json!(1)], &dup);
        assert!(matches!(duplicate, Err(CommandError::BadArguments { reason, .. }) if reason.contains("multiple values")));

        let mut stray = Map::new();
        stray.insert("colour".into(), json!("red"));
        let unexpected = t.resolve("add", &[json!(1)], &stray);
        assert!(matches!(unexpected, Err(CommandError::BadArguments { reason, .. }) if reason.contains("colour")));
    }

    #[test]
    fn bool_params_accept_numbers() {
        const PARAMS: &[Param] = &[Param::optional("enable", ParamKind::Bool, "true")];
        let spec: CommandSpec<Counter> =
            CommandSpec::sync("toggle", PARAMS, "Toggle", |_, _| Ok(()));
        assert!(!spec.bind(&[json!(0)], &Map::new()).unwrap().bool("enable").unwrap());
        assert!(spec.bind(&[], &Map::new()).unwrap().bool("enable").unwrap());
    }

    #[test]
    fn int_params_accept_whole_floats() {
        let t = table();
        let mut kwargs = Map::new();
        kwargs.insert("times".into(), json!(201.0));
        let (_, bound) = t.resolve("add", &[json!(1)], &kwargs).unwrap();
        assert_eq!(bound.i64("times").unwrap(), 201);
        assert_eq!(bound.value("times"), Some(&json!(201)));

        kwargs.insert("times".into(), json!(201.5));
        let fractional = t.resolve("add", &[json!(1)], &kwargs);
        assert!(matches!(fractional, Err(CommandError::BadArguments { reason, .. }) if reason.contains("expects int")));

        kwargs.insert("times".into(), json!(1e300));
        assert!(t.resolve("add", &[json!(1)], &kwargs).is_err());
    }

    #[test]
    fn methods_list_only_exposed_commands() {
        let methods = table().methods();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].signature, "add(amount: float, times: int = 1)");

        let value = methods_to_value(&methods);
        assert_eq!(value["add"]["docstring"], json!("Add `amount` `times` times"));
    }
}
