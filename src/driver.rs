//! Instrument drivers.
//!
//! A driver is nothing more than a [`CommandTable`] over [`InstrumentContext`]. Every driver
//! starts from [`base_table`], which carries the primitive device operations and the commands
//! every instrument exposes:
//!
//! | Command | Kind | Exposed |
//! |---|---|---|
//! | `write_async(msg)` / `read_async()` / `sleep_async(period)` | suspending | no |
//! | `write(msg)` / `read()` / `ask(cmd)` / `sleep(period)` / `idn()` | queues follow-ups | yes |
//! | `list_methods()` | immediate | yes |
//!
//! The exposed commands never touch the device themselves. They queue the primitive
//! operations onto the instrument's own inbox with a [`Reply::Record`] describing what to
//! report when the primitive completes, so one physical instrument still sees exactly one
//! operation at a time.
//!
//! The set of known drivers is kept in a [`DriverRegistry`] keyed by the type name the
//! instrument reports in its identity string.

use crate::command::{methods_to_value, BoundArgs, CommandSpec, CommandTable, Param, ParamKind};
use crate::device::IDENTITY_QUERY;
use crate::envelope::{CommandOutput, QueueEntry, Reply};
use crate::error::CommandError;
use crate::executor::InstrumentContext;
use crate::outbox::Record;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Builds the command table for one driver type.
pub type TableBuilder = fn() -> CommandTable<InstrumentContext>;

/// Type name → table builder.
#[derive(Clone)]
pub struct DriverRegistry {
    builders: BTreeMap<String, TableBuilder>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DriverRegistry {
    /// Registry with no drivers.
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `PowerSupply` and `VNA` drivers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(POWER_SUPPLY, power_supply_table);
        registry.register(VNA, network_analyzer_table);
        registry
    }

    /// Register (or replace) a driver.
    pub fn register(&mut self, kind: impl Into<String>, builder: TableBuilder) {
        self.builders.insert(kind.into(), builder);
    }

    /// Build a fresh table for `kind`.
    pub fn build(&self, kind: &str) -> Option<CommandTable<InstrumentContext>> {
        self.builders.get(kind).map(|builder| builder())
    }

    /// Known type names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }
}

/// Type name reported by power supplies.
pub const POWER_SUPPLY: &str = "PowerSupply";
/// Type name reported by vector network analyzers.
pub const VNA: &str = "VNA";

/// Split an identity reply into `(type, id)`.
///
/// `"PowerSupply-4321\n"` → `("PowerSupply", "4321")`. Returns `None` when there is no `-`
/// or either half is empty.
pub fn parse_identity(reply: &str) -> Option<(&str, &str)> {
    let (kind, id) = reply.trim().split_once('-')?;
    let (kind, id) = (kind.trim(), id.trim());
    (!kind.is_empty() && !id.is_empty()).then_some((kind, id))
}

// ---------------------------------------------------------------------------
// Base command set
// ---------------------------------------------------------------------------

const MSG: &[Param] = &[Param::required("msg", ParamKind::Str)];
const CMD: &[Param] = &[Param::required("cmd", ParamKind::Str)];
const PERIOD: &[Param] = &[Param::required("period", ParamKind::Float)];
const SLEEP_ASYNC: &[Param] = &[Param::optional("period", ParamKind::Float, "5.0")];

/// Commands shared by every driver.
pub fn base_table() -> CommandTable<InstrumentContext> {
    CommandTable::new()
        .with(
            CommandSpec::suspending("write_async", MSG, "Write `msg` to the instrument", write_async)
                .internal(),
        )
        .with(
            CommandSpec::suspending(
                "read_async",
                &[],
                "Read until the termination character",
                read_async,
            )
            .internal(),
        )
        .with(
            CommandSpec::suspending("sleep_async", SLEEP_ASYNC, "Wait `period` seconds", sleep_async)
                .internal(),
        )
        .with(CommandSpec::sync(
            "write",
            MSG,
            "Write the command `msg` to the instrument",
            write,
        ))
        .with(CommandSpec::sync(
            "read",
            &[],
            "Read instrument buffer until termination character encountered",
            read,
        ))
        .with(CommandSpec::sync(
            "ask",
            CMD,
            "Ask (write then read response) of command `cmd`",
            ask,
        ))
        .with(CommandSpec::sync(
            "sleep",
            PERIOD,
            "Prevent commands from being sent to instrument for `period` seconds",
            sleep,
        ))
        .with(CommandSpec::sync(
            "idn",
            &[],
            "Get the ID of the instrument. Asks the *IDN? command",
            idn,
        ))
        .with(CommandSpec::sync(
            "list_methods",
            &[],
            "List the exposed commands of this instrument",
            list_methods,
        ))
}

fn write_async(
    ctx: &mut InstrumentContext,
    args: BoundArgs,
) -> BoxFuture<'_, Result<CommandOutput, CommandError>> {
    async move {
        let msg = args.str("msg")?;
        ctx.session().write(msg.as_bytes()).await?;
        Ok(Value::Null)
    }
    .boxed()
}

fn read_async(
    ctx: &mut InstrumentContext,
    _args: BoundArgs,
) -> BoxFuture<'_, Result<CommandOutput, CommandError>> {
    async move {
        let reply = ctx.session().read().await?;
        Ok(Value::String(String::from_utf8_lossy(&reply).into_owned()))
    }
    .boxed()
}

fn sleep_async(
    _ctx: &mut InstrumentContext,
    args: BoundArgs,
) -> BoxFuture<'_, Result<CommandOutput, CommandError>> {
    async move {
        let period = args.f64("period")?;
        let duration =
            Duration::try_from_secs_f64(period).map_err(|e| CommandError::BadArguments {
                command: "sleep_async".into(),
                reason: format!("invalid period {period}: {e}"),
            })?;
        tokio::time::sleep(duration).await;
        Ok(Value::Null)
    }
    .boxed()
}

/// Render a command result for a record: strings as-is, anything else as JSON.
pub fn output_text(output: &CommandOutput) -> String {
    match output {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn queue_write(ctx: &InstrumentContext, msg: &str, reply: Reply) {
    ctx.enqueue(QueueEntry::new("write_async", vec![json!(msg)]).with_reply(reply));
}

/// Queue a write followed by a read; `reply` receives the read.
fn queue_ask(ctx: &InstrumentContext, cmd: &str, reply: Reply) {
    queue_write(ctx, cmd, Reply::Discard);
    ctx.enqueue(QueueEntry::new("read_async", vec![]).with_reply(reply));
}

fn write(ctx: &mut InstrumentContext, args: BoundArgs) -> Result<(), CommandError> {
    let msg = args.str("msg")?.to_string();
    let id = ctx.id().to_string();
    tracing::debug!(instrument_id = %id, msg = %msg, "Queueing write");
    let record = format!("{id} / write: {msg}");
    queue_write(ctx, &msg, Reply::record(move |_| Record::text(record)));
    Ok(())
}

fn read(ctx: &mut InstrumentContext, _args: BoundArgs) -> Result<(), CommandError> {
    let id = ctx.id().to_string();
    ctx.enqueue(
        QueueEntry::new("read_async", vec![])
            .with_reply(Reply::record(move |r| format!("{id} / read: {}", output_text(r)).into())),
    );
    Ok(())
}

fn ask(ctx: &mut InstrumentContext, args: BoundArgs) -> Result<(), CommandError> {
    let cmd = args.str("cmd")?.to_string();
    let id = ctx.id().to_string();
    queue_ask(
        ctx,
        &cmd,
        Reply::record(move |r| format!("{id} / ask: {}", output_text(r)).into()),
    );
    Ok(())
}

fn sleep(ctx: &mut InstrumentContext, args: BoundArgs) -> Result<(), CommandError> {
    let period = args.f64("period")?;
    let id = ctx.id().to_string();
    ctx.enqueue(
        QueueEntry::new("sleep_async", vec![json!(period)])
            .with_reply(Reply::record(move |_| format!("{id} / sleep: {period} s").into())),
    );
    Ok(())
}

fn idn(ctx: &mut InstrumentContext, _args: BoundArgs) -> Result<(), CommandError> {
    let id = ctx.id().to_string();
    queue_ask(
        ctx,
        IDENTITY_QUERY,
        Reply::record(move |r| format!("{id} / idn: {}", output_text(r)).into()),
    );
    Ok(())
}

fn list_methods(ctx: &mut InstrumentContext, _args: BoundArgs) -> Result<(), CommandError> {
    ctx.report(methods_to_value(ctx.methods()));
    Ok(())
}

/// `"<id> (<type>) / <command>: "`
fn driver_prefix(ctx: &InstrumentContext, command: &str) -> String {
    format!("{} ({}) / {}: ", ctx.id(), ctx.kind(), command)
}

// ---------------------------------------------------------------------------
// PowerSupply
// ---------------------------------------------------------------------------

const VDC: &[Param] = &[Param::required("vdc", ParamKind::Float)];
const ENABLE: &[Param] = &[Param::optional("enable", ParamKind::Bool, "true")];

/// DC power supply: voltage and output control.
pub fn power_supply_table() -> CommandTable<InstrumentContext> {
    base_table()
        .with(CommandSpec::sync("set_voltage", VDC, "Set the voltage in V", set_voltage))
        .with(CommandSpec::sync("get_voltage", &[], "Get the voltage in V", get_voltage))
        .with(CommandSpec::sync(
            "set_output",
            ENABLE,
            "Enable (if `enable` is true) or disable the output",
            set_output,
        ))
        .with(CommandSpec::sync(
            "get_output",
            &[],
            "Get the current output state",
            get_output,
        ))
}

fn set_voltage(ctx: &mut InstrumentContext, args: BoundArgs) -> Result<(), CommandError> {
    let vdc = args.f64("vdc")?;
    let record = format!("{}{vdc} V", driver_prefix(ctx, "set_voltage"));
    queue_write(
        ctx,
        &format!("VOLT {vdc:.2}"),
        Reply::record(move |_| Record::text(record)),
    );
    Ok(())
}

fn get_voltage(ctx: &mut InstrumentContext, _args: BoundArgs) -> Result<(), CommandError> {
    let prefix = driver_prefix(ctx, "get_voltage");
    queue_ask(
        ctx,
        "VOLT?",
        Reply::record(move |r| format!("{prefix}{} V", output_text(r)).into()),
    );
    Ok(())
}

fn set_output(ctx: &mut InstrumentContext, args: BoundArgs) -> Result<(), CommandError> {
    let flag = if args.bool("enable")? { 1 } else { 0 };
    let record = format!("{}{flag}", driver_prefix(ctx, "set_output"));
    queue_write(
        ctx,
        &format!("OUTPUT {flag}"),
        Reply::record(move |_| Record::text(record)),
    );
    Ok(())
}

fn get_output(ctx: &mut InstrumentContext, _args: BoundArgs) -> Result<(), CommandError> {
    let prefix = driver_prefix(ctx, "get_output");
    queue_ask(
        ctx,
        "OUTPUT?",
        Reply::record(move |r| format!("{prefix}{}", output_text(r)).into()),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// VNA
// ---------------------------------------------------------------------------

const FREQUENCY_RANGE: &[Param] = &[
    Param::required("start", ParamKind::Float),
    Param::required("end", ParamKind::Float),
    Param::required("npoints", ParamKind::Int),
];

/// Vector network analyzer: sweep configuration.
pub fn network_analyzer_table() -> CommandTable<InstrumentContext> {
    base_table()
        .with(CommandSpec::sync(
            "set_frequency_range",
            FREQUENCY_RANGE,
            "Sets the frequency range from `start` to `end` in GHz, with `npoints` steps",
            set_frequency_range,
        ))
        .with(CommandSpec::sync(
            "get_frequency_range",
            &[],
            "Get the current frequency range: start(GHz)/end(GHz)/npoints(unitless)",
            get_frequency_range,
        ))
}

fn set_frequency_range(ctx: &mut InstrumentContext, args: BoundArgs) -> Result<(), CommandError> {
    let start = args.f64("start")?;
    let end = args.f64("end")?;
    let npoints = args.i64("npoints")?;
    let record = format!(
        "{}{start:.2} -> {end:.2} ({npoints})",
        driver_prefix(ctx, "set_frequency_range")
    );
    queue_write(ctx, &format!("SENSE:FREQUENCY:START {start:.2}"), Reply::Discard);
    queue_write(ctx, &format!("SENSE:FREQUENCY:STOP {end:.2}"), Reply::Discard);
    queue_write(
        ctx,
        &format!("SENSE:FREQUENCY:POINTS {npoints}"),
        Reply::record(move |_| Record::text(record)),
    );
    Ok(())
}

fn get_frequency_range(ctx: &mut InstrumentContext, _args: BoundArgs) -> Result<(), CommandError> {
    for (query, label, integral) in [
        ("SENSE:FREQUENCY:START?", "get_freq_start", false),
        ("SENSE:FREQUENCY:STOP?", "get_freq_stop", false),
        ("SENSE:FREQUENCY:POINTS?", "get_freq_npoints", true),
    ] {
        let prefix = driver_prefix(ctx, label);
        queue_ask(
            ctx,
            query,
            Reply::record(move |r| {
                let text = output_text(r);
                // Unparseable replies are reported verbatim.
                let shown = match text.parse::<f64>() {
                    Ok(v) if integral => format!("{}", v.round() as i64),
                    Ok(v) => format!("{v:.2}"),
                    Err(_) => text,
                };
                Record::text(format!("{prefix}{shown}"))
            }),
        );
    }
    Ok(())
}
