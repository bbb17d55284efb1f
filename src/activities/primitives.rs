//! Assignment, logging and raising faults

use parking_lot::Mutex;

use crate::runtime::activity::{Activity, Argument, CodeActivity};
use crate::runtime::context::ActivityContext;
use crate::runtime::value::{Value, ValueKind};

/// Host service that receives `WriteLog` lines, registered as `Arc<dyn LogSink>`
pub trait LogSink: Send + Sync {
    /// Record `line` written by activity `source`
    fn write(&self, source: &str, line: &str);
}

/// Sink that keeps every line in memory
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogSink {
    /// Lines written so far, oldest first
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl LogSink for MemoryLogSink {
    fn write(&self, _source: &str, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Copies `Value` into `To`
pub struct Assign;

impl Assign {
    /// Write the literal `value` into `to`
    pub fn literal(to: &str, value: impl Into<Value>) -> Activity {
        Activity::code("Assign", Assign)
            .argument(Argument::output("To", ValueKind::Any).bind(to))
            .argument(Argument::input("Value", ValueKind::Any).literal(value))
    }

    /// Copy the location `from` into `to`
    pub fn copy(to: &str, from: &str) -> Activity {
        Activity::code("Assign", Assign)
            .argument(Argument::output("To", ValueKind::Any).bind(to))
            .argument(Argument::input("Value", ValueKind::Any).bind(from))
    }
}

impl CodeActivity for Assign {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        let value = ctx.get_value("Value")?;
        ctx.set_value("To", value)?;
        Ok(())
    }
}

/// Writes `Text` to the trace log and to the `LogSink` extension, if any
pub struct WriteLog;

impl WriteLog {
    /// Log a fixed line
    pub fn literal(text: impl Into<String>) -> Activity {
        Activity::code("WriteLog", WriteLog).argument(Argument::input("Text", ValueKind::Any).literal(text.into()))
    }

    /// Log the current value of location `from`
    pub fn value_of(from: &str) -> Activity {
        Activity::code("WriteLog", WriteLog).argument(Argument::input("Text", ValueKind::Any).bind(from))
    }
}

impl CodeActivity for WriteLog {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        let text = match ctx.get_value("Text")? {
            Value::String(text) => text,
            other => other.to_string(),
        };
        ctx.track(&text)?;
        if let Some(sink) = ctx.get_extension::<dyn LogSink>()? {
            sink.write(&ctx.qualified_id().to_string(), &text);
        }
        Ok(())
    }
}

/// Faults with `Message`
pub struct Throw;

impl Throw {
    /// Fault with `message` when executed
    pub fn message(message: impl Into<String>) -> Activity {
        Activity::code("Throw", Throw).argument(Argument::input("Message", ValueKind::String).literal(message.into()))
    }
}

impl CodeActivity for Throw {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        let message = ctx.get_value("Message")?;
        anyhow::bail!("{}", message.as_str().unwrap_or("activity faulted"))
    }
}
