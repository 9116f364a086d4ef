//! Sandbox worker: runs one plugin invocation per process

use ironclaw_plugin_host::{init_tracing, TelemetryFormat, Worker};
use std::process::ExitCode;

fn main() -> ExitCode {
    init_tracing(TelemetryFormat::Compact);
    Worker::new().run()
}
