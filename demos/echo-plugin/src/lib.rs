//! Echo plugin: returns its arguments, optionally after a delay
//!
//! Build with `cargo build --release --target wasm32-unknown-unknown` and
//! copy the output to `<plugins_dir>/echo/plugin.wasm`.

use ironclaw_plugin_sdk::prelude::*;

struct Echo;

impl Plugin for Echo {
    fn manifest() -> PluginManifest {
        let descriptor = PluginDescriptor::builder("echo", "1.0.0")
            .description("Echoes its arguments back")
            .author("ironclaw")
            .max_execution_time_seconds(10)
            .tag("demo")
            .build();

        match descriptor {
            Ok(descriptor) => PluginManifest::new(descriptor),
            Err(e) => {
                host::log(&format!("invalid descriptor: {e}"));
                std::process::abort()
            }
        }
    }

    fn execute(args: Value) -> PluginReply {
        if let Some(millis) = args.get("delay_ms").and_then(Value::as_u64) {
            host::sleep_ms(u32::try_from(millis).unwrap_or(u32::MAX));
        }
        host::log("echoing");
        PluginReply::success(json!({ "echo": args }))
    }

    fn validate(args: &Value) -> bool {
        args.is_object()
    }
}

export_plugin!(Echo);
