//! 结构化解析：从 Completion Service 文本中提取 JSON 并反序列化
//!
//! 所有阶段共用 parse_structured_or，解析失败时回退到调用方给出的默认值。

use serde::de::DeserializeOwned;

use crate::core::ServiceError;

/// 解析结果；fallback_used 为 true 时 value 是默认值
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub fallback_used: bool,
    pub error: Option<ServiceError>,
}

/// 提取 JSON 片段：优先 ```json 代码块，否则取第一个 '{' 到最后一个 '}'
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, ServiceError> {
    let json = extract_json(text)
        .ok_or_else(|| ServiceError::MalformedResponse("no JSON object in response".to_string()))?;
    serde_json::from_str(json).map_err(|e| ServiceError::MalformedResponse(e.to_string()))
}

pub fn parse_structured_or<T: DeserializeOwned>(
    text: &str,
    default: impl FnOnce() -> T,
) -> Parsed<T> {
    match parse_structured(text) {
        Ok(value) => Parsed {
            value,
            fallback_used: false,
            error: None,
        },
        Err(err) => {
            tracing::warn!(error = %err, "structured parse failed, using default");
            Parsed {
                value: default(),
                fallback_used: true,
                error: Some(err),
            }
        }
    }
}
