use crate::types::Message;
use serde_json::{Map, Value};

/// 数值转换: JSON 数字与可解析的数字字符串
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// 按 `a.b.c` 路径取值
pub fn value_at_path<'v>(map: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    if let Some(value) = map.get(path) {
        return Some(value);
    }

    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// 字符串不带引号,其余按 JSON 输出
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// JS 风格的真值判断
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// 从浮点构造 JSON 数字,整数值保持整数形式
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

/// 替换模板中的 `${...}` 变量
///
/// 支持 `${msg.id}`、`${msg.type}`、`${data.path}`、`${metadata.path}`,
/// 其余 `${path}` 视为 data 路径。
pub fn render_template(template: &str, msg: &Message) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };

        let var_path = &after[..end];
        let replacement = match var_path {
            "msg.id" => msg.id.to_string(),
            "msg.type" => msg.msg_type.clone(),
            "msg.timestamp" => msg.timestamp.to_string(),
            _ => {
                let (map, path) = if let Some(path) = var_path.strip_prefix("metadata.") {
                    (&msg.metadata, path)
                } else if let Some(path) = var_path.strip_prefix("data.") {
                    (&msg.data, path)
                } else {
                    (&msg.data, var_path.strip_prefix("msg.").unwrap_or(var_path))
                };
                value_at_path(map, path).map(value_to_string).unwrap_or_default()
            }
        };
        result.push_str(&replacement);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}
