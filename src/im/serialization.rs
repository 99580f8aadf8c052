use base64::Engine;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// 时间戳反序列化：数值返回 `Some`，缺失、null 或尚未解析的服务器占位符返回 `None`
pub fn deserialize_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }))
}

/// 字符串字段反序列化，null 视为空串
pub fn deserialize_string_or_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// 将二进制内容编码为内联 data URL（对象存储不可用时的兜底方案）
pub fn encode_data_url(content_type: &str, bytes: &[u8]) -> String {
    let content_type = if content_type.is_empty() {
        "application/octet-stream"
    } else {
        content_type
    };
    format!(
        "data:{};base64,{}",
        content_type,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// 解码 data URL，返回 (content_type, bytes)
pub fn decode_data_url(url: &str) -> Option<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let content_type = meta.strip_suffix(";base64")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()?;
    Some((content_type.to_string(), bytes))
}

/// 生成客户端临时消息 ID（用于乐观 UI 与服务端回执对齐）
pub fn generate_client_temp_id() -> String {
    format!("tmp-{}", uuid::Uuid::new_v4().simple())
}
