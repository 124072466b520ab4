use crate::dap::DapOutput;
use crate::runtime::lock;
use log::LevelFilter;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

/// Logger for the stdio mode, records are sent to a client as `console` output events
/// because stdout is occupied by the protocol.
pub struct DapLogger {
    inner: env_logger::Logger,
    output: Arc<Mutex<DapOutput>>,
}

impl DapLogger {
    pub fn new(output: Arc<Mutex<DapOutput>>) -> Self {
        Self {
            inner: env_logger::Logger::from_default_env(),
            output,
        }
    }

    pub fn filter(&self) -> LevelFilter {
        self.inner.filter()
    }
}

impl log::Log for DapLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.inner.matches(record) {
            return;
        }

        let mut output = String::new();
        _ = write!(output, "[{}] ", record.level());
        _ = write!(output, "{} ", record.target());
        _ = writeln!(output, "{}", record.args());

        _ = lock(&self.output).send_output("console", &output);
    }

    fn flush(&self) {}
}
