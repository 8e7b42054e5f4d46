//! 脚本求值能力
//!
//! 脚本节点(script-filter / script-transform / switch)不直接接触引擎,
//! 只通过 [`ScriptEvaluator`] 对单条消息求值。默认实现基于 QuickJS,
//! 每次求值使用独立运行时,并限制内存与执行时长。

use crate::types::{Message, RuleError};
use rquickjs::{Context, Runtime};
use serde_json::Value;
use std::time::{Duration, Instant};

pub trait ScriptEvaluator: Send + Sync {
    /// 执行函数体 `script`,可访问 `msg`(data)、`metadata`、`msgType`,返回其结果
    fn evaluate(&self, script: &str, msg: &Message) -> Result<Value, RuleError>;
}

#[derive(Debug, Clone)]
pub struct JsEvaluator {
    timeout: Duration,
    memory_limit: usize,
}

impl JsEvaluator {
    pub fn new(timeout: Duration, memory_limit: usize) -> Self {
        Self {
            timeout,
            memory_limit,
        }
    }

    fn build_code(script: &str, msg: &Message) -> Result<String, RuleError> {
        let data = serde_json::to_string(&msg.data)?;
        let metadata = serde_json::to_string(&msg.metadata)?;
        let msg_type = serde_json::to_string(&msg.msg_type)?;

        Ok(format!(
            r#"
            const __result = (function (msg, metadata, msgType) {{
                {script}
            }})({data}, {metadata}, {msg_type});
            __result === undefined ? "null" : JSON.stringify(__result);
            "#
        ))
    }
}

impl Default for JsEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 8 * 1024 * 1024)
    }
}

impl ScriptEvaluator for JsEvaluator {
    fn evaluate(&self, script: &str, msg: &Message) -> Result<Value, RuleError> {
        let js_code = Self::build_code(script, msg)?;

        let rt = Runtime::new().map_err(|e| RuleError::ScriptError(format!("运行时创建失败: {}", e)))?;
        rt.set_memory_limit(self.memory_limit);
        let deadline = Instant::now() + self.timeout;
        rt.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

        let ctx =
            Context::full(&rt).map_err(|e| RuleError::ScriptError(format!("上下文创建失败: {}", e)))?;

        let result: String = ctx.with(|ctx| {
            ctx.eval(js_code)
                .map_err(|e: rquickjs::Error| RuleError::ScriptError(format!("JavaScript执行错误: {}", e)))
        })?;

        serde_json::from_str(&result)
            .map_err(|e| RuleError::ScriptError(format!("JSON解析错误: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg() -> Message {
        Message::from_value("telemetry", json!({"temperature": 75, "unit": "C"}))
            .annotate("gatewayId", json!("gw-1"))
    }

    #[test]
    fn test_predicate() {
        let evaluator = JsEvaluator::default();
        let result = evaluator
            .evaluate("return msg.temperature > 50;", &msg())
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[test]
    fn test_access_metadata_and_type() {
        let evaluator = JsEvaluator::default();
        let result = evaluator
            .evaluate("return { gw: metadata.gatewayId, t: msgType };", &msg())
            .unwrap();
        assert_eq!(result, json!({"gw": "gw-1", "t": "telemetry"}));
    }

    #[test]
    fn test_undefined_result_is_null() {
        let evaluator = JsEvaluator::default();
        assert_eq!(evaluator.evaluate("let x = 1;", &msg()).unwrap(), Value::Null);
    }

    #[test]
    fn test_syntax_error() {
        let evaluator = JsEvaluator::default();
        assert!(matches!(
            evaluator.evaluate("return (;", &msg()),
            Err(RuleError::ScriptError(_))
        ));
    }

    #[test]
    fn test_runaway_script_interrupted() {
        let evaluator = JsEvaluator::new(Duration::from_millis(20), 8 * 1024 * 1024);
        assert!(matches!(
            evaluator.evaluate("while (true) {}", &msg()),
            Err(RuleError::ScriptError(_))
        ));
    }
}
