//! 命令 Worker：由配置 [[workers.plugins]] 或插件目录中的 TOML 清单定义，运行「程序 + 参数模板」
//!
//! 参数模板中 {{query}} 替换为子查询，{{context}} 替换为上下文 JSON，{{key}} 取上下文中的同名值；
//! 执行时无 shell，直接 exec program + substituted args。stdout 为 JSON 对象时作为 payload，否则包成 {"output": text}。

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use walkdir::WalkDir;

use crate::config::PluginEntry;
use crate::core::ServiceError;
use crate::workers::{Worker, WorkerResult};

/// 外部程序支撑的 Worker
pub struct CommandWorker {
    name: String,
    description: String,
    program: String,
    args_template: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandWorker {
    pub fn new(entry: &PluginEntry) -> Self {
        Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            program: entry.program.clone(),
            args_template: entry.args.clone(),
            timeout: entry
                .timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }

    fn substitute(&self, query: &str, context: &Map<String, Value>) -> Vec<String> {
        let context_json = Value::Object(context.clone()).to_string();
        self.args_template
            .iter()
            .map(|tpl| render_template(tpl, query, &context_json, context))
            .collect()
    }
}

/// 单遍展开模板：替换进来的文本不再被扫描；未知的 {{key}} 原样保留
fn render_template(
    tpl: &str,
    query: &str,
    context_json: &str,
    context: &Map<String, Value>,
) -> String {
    let mut out = String::with_capacity(tpl.len());
    let mut rest = tpl;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = &after[..close];
        match key {
            "query" => out.push_str(query),
            "context" => out.push_str(context_json),
            _ => match context.get(key) {
                Some(Value::String(text)) => out.push_str(text),
                Some(value) => out.push_str(&value.to_string()),
                None => {
                    out.push_str("{{");
                    out.push_str(key);
                    out.push_str("}}");
                }
            },
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

/// stdout 是 JSON 对象时直接作为 payload，否则包装为 {"output": text}
fn parse_output(stdout: &str) -> Map<String, Value> {
    let trimmed = stdout.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("output".to_string(), Value::String(trimmed.to_string()));
            map
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        query: &str,
        context: &Map<String, Value>,
    ) -> Result<WorkerResult, ServiceError> {
        let args = self.substitute(query, context);
        tracing::info!(worker = %self.name, program = %self.program, "command worker invoke");
        // 截止时间由外层执行器施加；kill_on_drop 保证超时后子进程被回收
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::Permanent(format!("spawn {} failed: {}", self.program, e)))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ServiceError::Transient(format!("wait failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Transient(format!(
                "exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let payload = parse_output(&String::from_utf8_lossy(&output.stdout));
        let confidence = payload
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        Ok(WorkerResult::success(&self.name, payload, confidence))
    }
}

/// 扫描目录下所有 *.toml 清单，返回 Worker 定义；不做注册
///
/// 目录不存在时返回空列表；无法解析的清单记录警告后跳过。
pub fn discover_plugins(dir: &Path) -> Vec<PluginEntry> {
    if !dir.is_dir() {
        tracing::warn!(dir = %dir.display(), "plugin dir not found");
        return Vec::new();
    }
    let mut entries: Vec<PluginEntry> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("toml"))
        .filter_map(|e| {
            let path = e.path();
            let text = match std::fs::read_to_string(path) {
                Ok(t) => t,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "plugin manifest unreadable"
                    );
                    return None;
                }
            };
            match toml::from_str::<PluginEntry>(&text) {
                Ok(entry) if !entry.name.is_empty() && !entry.program.is_empty() => Some(entry),
                Ok(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        "plugin manifest missing name or program"
                    );
                    None
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "plugin manifest invalid");
                    None
                }
            }
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}
