//! Override execution: YAML patches and sandboxed Lua scripts.
//!
//! Scripts run in a whitelist-only environment table. Only safe standard
//! library functions are exposed; `os`, `io`, `debug`, `require`, `load`,
//! `loadfile`, and `dofile` are not present. An instruction-count hook (via
//! `mlua::Lua::set_hook`) bounds execution, and `print()` output is captured
//! into the override's log artifact instead of going to stdout.
//!
//! Failure policy: a script that raises, overruns its instruction budget, or
//! returns something other than a mapping leaves the document unchanged. The
//! failure and any captured output land in `logs/override-<id>.log`; nothing
//! is surfaced synchronously to the caller.

use std::sync::{Arc, Mutex};

use mlua::{HookTriggers, Lua, LuaSerdeExt, Table, Value as LuaValue};
use serde_yaml::{Mapping, Value};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::model::{OverrideItem, OverrideKind};
use crate::paths::VeilDirs;
use crate::{ConfigError, merge::deep_merge};

/// Maximum Lua instructions before aborting a script.
const MAX_INSTRUCTIONS: u32 = 1_000_000;

/// Maximum captured output bytes per script run.
const MAX_OUTPUT_BYTES: usize = 32_768;

/// Entry point a script must define.
const SCRIPT_ENTRY: &str = "main";

/// Applies override items to configuration documents.
#[derive(Debug, Clone)]
pub struct OverrideEngine {
    dirs: VeilDirs,
}

impl OverrideEngine {
    /// Build an engine writing its log artifacts under the given layout.
    #[must_use]
    pub const fn new(dirs: VeilDirs) -> Self {
        Self { dirs }
    }

    /// Apply one override to the document, returning the transformed copy.
    ///
    /// Never fails: a misbehaving override yields the input unchanged, with
    /// the failure recorded in the override's log artifact.
    pub async fn apply(&self, doc: Mapping, item: &OverrideItem) -> Mapping {
        match item.kind {
            OverrideKind::YamlPatch => self.apply_yaml_patch(doc, item).await,
            OverrideKind::Script => self.apply_script(doc, item).await,
        }
    }

    async fn apply_yaml_patch(&self, mut doc: Mapping, item: &OverrideItem) -> Mapping {
        match serde_yaml::from_str::<Value>(&item.source) {
            Ok(Value::Mapping(patch)) => {
                deep_merge(&mut doc, patch);
            }
            Ok(_) => {
                // A non-mapping patch merges as empty.
                self.log(item, &[], Some("patch document is not a mapping"))
                    .await;
            }
            Err(error) => {
                self.log(item, &[], Some(&format!("patch is not valid YAML: {error}")))
                    .await;
            }
        }
        doc
    }

    async fn apply_script(&self, doc: Mapping, item: &OverrideItem) -> Mapping {
        // Lua handles are not Send, so the whole run stays synchronous.
        let (outcome, output) = run_script(&item.source, &doc);
        match outcome {
            Ok(transformed) => {
                self.log(item, &output, None).await;
                transformed
            }
            Err(reason) => {
                warn!(override_id = %item.id, %reason, "override script failed, document unchanged");
                self.log(item, &output, Some(&reason)).await;
                doc
            }
        }
    }

    /// Append one run's captured output and outcome to the log artifact.
    ///
    /// Log IO failures are reported on the tracing stream only; they must
    /// not disturb synthesis.
    async fn log(&self, item: &OverrideItem, output: &[String], failure: Option<&str>) {
        if let Err(error) = self.append_log(item, output, failure).await {
            warn!(override_id = %item.id, %error, "failed to write override log artifact");
        }
    }

    async fn append_log(
        &self,
        item: &OverrideItem,
        output: &[String],
        failure: Option<&str>,
    ) -> Result<(), ConfigError> {
        let logs_dir = self.dirs.logs_dir();
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .map_err(|error| ConfigError::io("create_logs_dir", &logs_dir, error))?;

        let stamp = chrono::Utc::now().to_rfc3339();
        let mut body = String::new();
        for line in output {
            body.push_str(&format!("[{stamp}] {line}\n"));
        }
        match failure {
            Some(reason) => body.push_str(&format!("[{stamp}] ERROR {reason}\n")),
            None => body.push_str(&format!("[{stamp}] applied\n")),
        }

        let path = self.dirs.override_log(&item.id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|error| ConfigError::io("open_override_log", &path, error))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|error| ConfigError::io("write_override_log", &path, error))?;
        Ok(())
    }
}

/// Execute a script's `main(config)` against the document.
///
/// Returns the transformed mapping or a failure reason, plus everything the
/// script printed.
fn run_script(source: &str, doc: &Mapping) -> (Result<Mapping, String>, Vec<String>) {
    let output: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let result = run_script_inner(source, doc, Arc::clone(&output));
    let captured = output
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    (result, captured)
}

fn run_script_inner(
    source: &str,
    doc: &Mapping,
    output: Arc<Mutex<Vec<String>>>,
) -> Result<Mapping, String> {
    let lua = Lua::new();
    let env = build_sandbox_env(&lua, output).map_err(|error| error.to_string())?;

    lua.load(source)
        .set_name("=override")
        .set_environment(env.clone())
        .exec()
        .map_err(|error| format!("script did not load: {}", flatten_error(&error)))?;

    let entry: mlua::Function = env
        .get(SCRIPT_ENTRY)
        .map_err(|_| format!("script does not define {SCRIPT_ENTRY}(config)"))?;

    let doc_value = lua
        .to_value(&Value::Mapping(doc.clone()))
        .map_err(|error| format!("document not representable in the sandbox: {error}"))?;

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(MAX_INSTRUCTIONS),
        |_lua, _debug| {
            Err(mlua::Error::RuntimeError(format!(
                "instruction limit exceeded ({MAX_INSTRUCTIONS})"
            )))
        },
    );
    let call_result: mlua::Result<LuaValue> = entry.call(doc_value);
    lua.remove_hook();

    let returned = call_result.map_err(|error| flatten_error(&error))?;
    match lua.from_value::<Value>(returned) {
        Ok(Value::Mapping(transformed)) => Ok(transformed),
        Ok(_) => Err("script returned a non-mapping value".to_string()),
        Err(error) => Err(format!("script return value not representable: {error}")),
    }
}

/// Build the whitelist-only environment table for one script run.
fn build_sandbox_env(lua: &Lua, output: Arc<Mutex<Vec<String>>>) -> mlua::Result<Table> {
    let env = lua.create_table()?;

    let size = Arc::new(Mutex::new(0usize));
    let print_fn = lua.create_function(move |_, args: mlua::MultiValue| {
        let parts: Vec<String> = args.iter().map(lua_display).collect();
        let line = parts.join("\t");
        if let Ok(mut used) = size.lock() {
            *used += line.len() + 1;
            if *used <= MAX_OUTPUT_BYTES
                && let Ok(mut lines) = output.lock()
            {
                lines.push(line);
            }
        }
        Ok(())
    })?;
    env.set("print", print_fn)?;

    let globals = lua.globals();
    for name in &[
        "tostring", "tonumber", "type", "pairs", "ipairs", "next", "select", "error", "pcall",
        "xpcall", "assert", "rawget", "rawset", "rawlen", "rawequal", "setmetatable",
        "getmetatable", "unpack",
    ] {
        if let Ok(value) = globals.get::<LuaValue>(*name)
            && !matches!(value, LuaValue::Nil)
        {
            env.set(*name, value)?;
        }
    }

    for lib_name in &["math", "string", "table"] {
        if let Ok(value) = globals.get::<LuaValue>(*lib_name)
            && !matches!(value, LuaValue::Nil)
        {
            env.set(*lib_name, value)?;
        }
    }

    Ok(env)
}

fn lua_display(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(flag) => flag.to_string(),
        LuaValue::Integer(number) => number.to_string(),
        LuaValue::Number(number) => number.to_string(),
        LuaValue::String(text) => text
            .to_str()
            .map_or_else(|_| "<invalid utf8>".into(), |text| text.to_string()),
        LuaValue::Table(_) => format!("table: {value:p}"),
        LuaValue::Function(_) => format!("function: {value:p}"),
        other => format!("{other:?}"),
    }
}

fn flatten_error(error: &mlua::Error) -> String {
    match error {
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::CallbackError { cause, .. } => flatten_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {message}"),
        other => other.to_string(),
    }
}
