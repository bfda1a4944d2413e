//! Sandboxed Lua 5.4 code runner for workflow code nodes.
//!
//! [`LuaCodeRunner`] implements [`CodeRunner`]. The script must define a
//! global `main(inputs)` that returns a table; that table becomes the
//! node's output map. The VM runs on a blocking thread (via
//! [`tokio::task::spawn_blocking`]) and a wall-clock deadline is enforced
//! with an instruction-count hook.
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `json` | `parse`, `encode` |
//! | `env` | `get` (request-scoped variables only) |
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `base64` | `encode`, `decode` |
//! | `crypto` | `sha256`, `hmac_sha256` |
//!
//! # Sandboxing
//!
//! Dangerous Lua standard libraries (`os`, `io`, `debug`, `loadfile`, `dofile`)
//! are removed. The script cannot reach the network or the filesystem.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use mlua::prelude::*;
use mlua::{HookTriggers, VmState};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use llmops_core::tool::{CodeRequest, CodeRunner};
use llmops_core::Error;

const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct LuaCodeRunner;

impl LuaCodeRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CodeRunner for LuaCodeRunner {
    async fn run(&self, request: CodeRequest) -> Result<Map<String, Value>> {
        if !request.language.eq_ignore_ascii_case("lua") {
            return Err(Error::validation(format!(
                "unsupported code language: {}",
                request.language
            ))
            .into());
        }
        let timeout = request.timeout;
        let handle = tokio::task::spawn_blocking(move || run_blocking(request));
        // The hook stops the VM at the deadline; the outer timeout covers
        // time spent inside a single host call.
        match tokio::time::timeout(timeout + Duration::from_secs(1), handle).await {
            Ok(joined) => joined?,
            Err(_) => bail!("code execution timed out after {:?}", timeout),
        }
    }
}

fn run_blocking(request: CodeRequest) -> Result<Map<String, Value>> {
    let lua = Lua::new();
    register_all_host_apis(&lua, request.env)?;

    let deadline = Instant::now() + request.timeout;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::external(anyhow::anyhow!(
                    "code execution exceeded its time limit"
                )))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    lua.load(request.code.as_str()).set_name("code_node").exec()?;

    let main: LuaFunction = match lua.globals().get::<LuaValue>("main")? {
        LuaValue::Function(f) => f,
        _ => bail!("code must define a main(inputs) function"),
    };
    let inputs = json_value_to_lua(&lua, &Value::Object(request.inputs))?;
    let returned: LuaValue = main.call::<LuaValue>(inputs)?;

    match returned {
        LuaValue::Nil => Ok(Map::new()),
        LuaValue::Table(_) => match lua_value_to_json(returned)? {
            Value::Object(map) => Ok(map),
            // A non-empty sequence is not an output map.
            _ => bail!("main(inputs) must return a table with string keys"),
        },
        _ => bail!("main(inputs) must return a table"),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing
// ═══════════════════════════════════════════════════════════════════════

fn register_all_host_apis(lua: &Lua, env: HashMap<String, String>) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_json_api(lua)?;
    register_env_api(lua, env)?;
    register_log_api(lua)?;
    register_base64_api(lua)?;
    register_crypto_api(lua)?;
    Ok(())
}

/// Remove dangerous standard library functions from the Lua globals.
fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: env
// ═══════════════════════════════════════════════════════════════════════

fn register_env_api(lua: &Lua, vars: HashMap<String, String>) -> LuaResult<()> {
    let env = lua.create_table()?;
    env.set(
        "get",
        lua.create_function(move |_lua, name: String| Ok(vars.get(&name).cloned()))?,
    )?;
    lua.globals().set("env", env)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua) -> LuaResult<()> {
    let log = lua.create_table()?;
    log.set(
        "info",
        lua.create_function(|_lua, msg: String| {
            tracing::info!(target: "code_node", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "warn",
        lua.create_function(|_lua, msg: String| {
            tracing::warn!(target: "code_node", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "error",
        lua.create_function(|_lua, msg: String| {
            tracing::error!(target: "code_node", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "debug",
        lua.create_function(|_lua, msg: String| {
            tracing::debug!(target: "code_node", "{}", msg);
            Ok(())
        })?,
    )?;
    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: base64
// ═══════════════════════════════════════════════════════════════════════

fn register_base64_api(lua: &Lua) -> LuaResult<()> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let b64 = lua.create_table()?;

    b64.set(
        "encode",
        lua.create_function(|_lua, data: String| Ok(STANDARD.encode(data.as_bytes())))?,
    )?;

    b64.set(
        "decode",
        lua.create_function(|_lua, data: String| {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("base64.decode: {}", e)))?;
            String::from_utf8(bytes)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("base64.decode: {}", e)))
        })?,
    )?;

    lua.globals().set("base64", b64)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: crypto
// ═══════════════════════════════════════════════════════════════════════

fn register_crypto_api(lua: &Lua) -> LuaResult<()> {
    let crypto = lua.create_table()?;

    crypto.set(
        "sha256",
        lua.create_function(|_lua, data: String| {
            let mut hasher = Sha256::new();
            hasher.update(data.as_bytes());
            Ok(format!("{:x}", hasher.finalize()))
        })?,
    )?;

    crypto.set(
        "hmac_sha256",
        lua.create_function(|_lua, (key, data): (String, String)| {
            type HmacSha256 = Hmac<Sha256>;
            let mut mac = HmacSha256::new_from_slice(key.as_bytes())
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("crypto.hmac_sha256: {}", e)))?;
            mac.update(data.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        })?,
    )?;

    lua.globals().set("crypto", crypto)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

fn json_value_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    match value {
        Value::Null => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => lua.create_string(s).map(LuaValue::String),
        Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

fn lua_value_to_json(value: LuaValue) -> LuaResult<Value> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(b)),
        LuaValue::Integer(i) => Ok(Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        LuaValue::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            // Heuristic: if raw_len > 0, treat as array; otherwise as object
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::new();
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(Value::Array(arr))
            } else {
                let mut map = Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(Value::Object(map))
            }
        }
        _ => Ok(Value::Null),
    }
}
