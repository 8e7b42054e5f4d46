//! 引擎配置
//!
//! 加载优先级(从高到低):
//! 1. `RULE_ENGINE_` 前缀的环境变量
//! 2. 配置文件(yaml / toml / json,按扩展名识别)
//! 3. 默认值

use crate::types::RuleError;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "RULE_ENGINE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 规则未配置 timeoutMs 时使用的超时
    pub default_timeout_ms: u64,
    /// delay 节点的最大延迟
    pub max_delay_ms: u64,
    /// 同时运行的执行数上限
    pub max_concurrent_executions: usize,
    pub script_timeout_ms: u64,
    pub script_memory_limit_bytes: usize,
    /// rule-chain 节点允许的最大嵌套深度
    pub max_rule_chain_depth: usize,
    /// 限流滑动窗口
    pub rate_limit_window_ms: u64,
    pub event_buffer: usize,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_delay_ms: 60_000,
            max_concurrent_executions: 256,
            script_timeout_ms: 100,
            script_memory_limit_bytes: 8 * 1024 * 1024,
            max_rule_chain_depth: 8,
            rate_limit_window_ms: 60_000,
            event_buffer: 1024,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// 默认值 + 环境变量
    pub fn load() -> Result<Self, RuleError> {
        Self::extract(Self::base())
    }

    /// 默认值 + 配置文件 + 环境变量
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RuleError::ConfigError("配置文件缺少扩展名".to_string()))?;

        let figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        let figment = match extension {
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "json" => figment.merge(Json::file(path)),
            _ => {
                return Err(RuleError::ConfigError(format!(
                    "不支持的配置文件格式: {}",
                    extension
                )))
            }
        };

        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    fn base() -> Figment {
        Figment::from(Serialized::defaults(EngineConfig::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    fn extract(figment: Figment) -> Result<Self, RuleError> {
        let config: EngineConfig = figment
            .extract()
            .map_err(|e| RuleError::ConfigError(format!("配置加载失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.max_concurrent_executions == 0 {
            return Err(RuleError::ConfigError(
                "max_concurrent_executions 必须大于 0".to_string(),
            ));
        }
        if self.rate_limit_window_ms == 0 {
            return Err(RuleError::ConfigError(
                "rate_limit_window_ms 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_delay_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "max_delay_ms: 5000\nmax_concurrent_executions: 4").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_delay_ms, 5000);
        assert_eq!(config.max_concurrent_executions, 4);
        assert_eq!(config.default_timeout_ms, 30_000);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(RuleError::ConfigError(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = EngineConfig {
            max_concurrent_executions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
