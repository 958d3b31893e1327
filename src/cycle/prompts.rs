//! 阶段提示词构建
//!
//! 系统消息是指令与期望输出的 JSON Schema；
//! 用户消息携带查询、迭代序号、关注点、上下文与可用 Worker 列表。

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

use crate::cycle::{ActResult, NextResult, PlanDraft, ThinkResult};
use crate::llm::ChatMessage;
use crate::workers::WorkerInfo;

const THINK_INSTRUCTIONS: &str = "You analyze a user query against the information gathered so far. \
Identify the core requirements, what is already known, what is still missing, \
how confident you are (0.0 - 1.0) and whether the query can be answered now. \
When it can, put the answer in `answer`.";

const PLAN_INSTRUCTIONS: &str = "You choose which workers to invoke to obtain the missing information. \
Group workers that can run at the same time into `parallel_groups`; groups run in order. \
Give each worker a focused sub-query. Only use worker names from the list provided.";

const NEXT_INSTRUCTIONS: &str = "You review the worker results of this iteration and decide whether \
the query is now sufficiently answered (`should_terminate`), give a revised confidence (0.0 - 1.0) \
and, when continuing, the focus for the next iteration.";

fn schema_text<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}

fn system_message<T: JsonSchema>(instructions: &str) -> ChatMessage {
    ChatMessage::system(format!(
        "{}\n\n## Output JSON Schema (you must output valid JSON matching this)\n```json\n{}\n```",
        instructions,
        schema_text::<T>()
    ))
}

fn context_text(context: &Map<String, Value>) -> String {
    serde_json::to_string_pretty(context).unwrap_or_default()
}

pub fn think_messages(
    query: &str,
    iteration: u32,
    focus: Option<&str>,
    context: &Map<String, Value>,
) -> Vec<ChatMessage> {
    let mut user = format!("Query: {}\nIteration: {}\n", query, iteration);
    if let Some(focus) = focus.filter(|f| !f.is_empty()) {
        user.push_str(&format!("Focus: {}\n", focus));
    }
    user.push_str(&format!("\nKnown context:\n{}", context_text(context)));
    vec![
        system_message::<ThinkResult>(THINK_INSTRUCTIONS),
        ChatMessage::user(user),
    ]
}

pub fn plan_messages(
    query: &str,
    iteration: u32,
    think: &ThinkResult,
    workers: &[WorkerInfo],
) -> Vec<ChatMessage> {
    let catalog: Vec<String> = workers
        .iter()
        .map(|w| {
            if w.description.is_empty() {
                format!("- {}", w.name)
            } else {
                format!("- {}: {}", w.name, w.description)
            }
        })
        .collect();
    let user = format!(
        "Query: {}\nIteration: {}\nMissing information:\n{}\n\nAvailable workers:\n{}",
        query,
        iteration,
        think
            .missing_info
            .iter()
            .map(|m| format!("- {}", m))
            .collect::<Vec<_>>()
            .join("\n"),
        catalog.join("\n")
    );
    vec![
        system_message::<PlanDraft>(PLAN_INSTRUCTIONS),
        ChatMessage::user(user),
    ]
}

pub fn next_messages(query: &str, iteration: u32, act: &ActResult) -> Vec<ChatMessage> {
    let results = serde_json::to_string_pretty(&act.results).unwrap_or_default();
    let user = format!(
        "Query: {}\nIteration: {}\nAct status: {:?}\n\nWorker results:\n{}\n\nContext:\n{}",
        query,
        iteration,
        act.status,
        results,
        context_text(&act.context)
    );
    vec![
        system_message::<NextResult>(NEXT_INSTRUCTIONS),
        ChatMessage::user(user),
    ]
}
