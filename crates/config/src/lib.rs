//! 统一配置中心
//!
//! 同步客户端的全部可调参数：
//! - REST 接口地址与超时
//! - 推送通道地址与重连策略
//! - 输入状态过期时间
//! - 轮询兜底间隔
//! - 排期窗口默认提前量
//!
//! 加载优先级：默认值 → 可选 TOML 文件（`SYNC_CONFIG_FILE`）→ 环境变量（`SYNC_*`，层级用 `__` 分隔）。

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// REST 接口配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ApiConfig {
    #[validate(url)]
    pub base_url: String,
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
}

/// 推送通道配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PushConfig {
    #[validate(url)]
    pub url: String,
    #[validate(range(min = 1))]
    pub max_reconnect_attempts: u32,
    #[validate(range(min = 1))]
    pub reconnect_base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub reconnect_max_delay_ms: u64,
    /// 连接存活多久后视为稳定，重连计数随之清零
    #[validate(range(min = 1))]
    pub stable_after_ms: u64,
}

/// 输入状态配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TypingConfig {
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

/// 轮询兜底配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PollingConfig {
    #[validate(range(min = 1))]
    pub interval_ms: u64,
}

/// 排期窗口配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScheduleConfig {
    #[validate(range(min = 0, max = 1440))]
    pub lead_minutes: i64,
}

/// 全局同步配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SyncConfig {
    #[validate(nested)]
    pub api: ApiConfig,
    #[validate(nested)]
    pub push: PushConfig,
    #[validate(nested)]
    pub typing: TypingConfig,
    #[validate(nested)]
    pub polling: PollingConfig,
    #[validate(nested)]
    pub schedule: ScheduleConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "http://127.0.0.1:8080/api".into(),
                request_timeout_ms: 10_000,
            },
            push: PushConfig {
                url: "ws://127.0.0.1:8080/ws".into(),
                max_reconnect_attempts: 5,
                reconnect_base_delay_ms: 1_000,
                reconnect_max_delay_ms: 5_000,
                stable_after_ms: 10_000,
            },
            typing: TypingConfig { timeout_ms: 3_000 },
            polling: PollingConfig {
                interval_ms: 30_000,
            },
            schedule: ScheduleConfig { lead_minutes: 10 },
        }
    }
}

impl SyncConfig {
    /// 按 默认值 → 文件 → 环境变量 的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Figment::new().merge(Serialized::defaults(SyncConfig::default()));
        if let Ok(path) = std::env::var("SYNC_CONFIG_FILE") {
            fig = fig.merge(Toml::file(path));
        }
        fig = fig.merge(Env::prefixed("SYNC_").split("__"));

        Self::from_figment(fig)
    }

    /// 从 TOML 字符串解析（缺失的键使用默认值）
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let fig = Figment::new()
            .merge(Serialized::defaults(SyncConfig::default()))
            .merge(Toml::string(source));
        Self::from_figment(fig)
    }

    fn from_figment(fig: Figment) -> Result<Self, ConfigError> {
        let cfg: SyncConfig = fig.extract().map_err(Box::new)?;
        cfg.check()?;
        Ok(cfg)
    }

    /// 字段级校验之外的跨字段约束
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.push.reconnect_base_delay_ms > self.push.reconnect_max_delay_ms {
            return Err(ConfigError::InvalidPushConfig(format!(
                "reconnect_base_delay_ms ({}) must not exceed reconnect_max_delay_ms ({})",
                self.push.reconnect_base_delay_ms, self.push.reconnect_max_delay_ms
            )));
        }
        if !(self.push.url.starts_with("ws://") || self.push.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidPushConfig(format!(
                "push url must use ws:// or wss://, got {}",
                self.push.url
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.api.request_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.push.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.push.reconnect_max_delay_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.push.stable_after_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// 用于日志输出
    pub fn sanitize(&self) -> String {
        toml::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("invalid push configuration: {0}")]
    InvalidPushConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.push.max_reconnect_attempts, 5);
        assert_eq!(config.typing_timeout(), Duration::from_millis(3000));
        assert_eq!(config.schedule.lead_minutes, 10);
        assert_eq!(config.stable_after(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_overrides_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            [push]
            max_reconnect_attempts = 3

            [polling]
            interval_ms = 15000
            "#,
        )
        .unwrap();

        assert_eq!(config.push.max_reconnect_attempts, 3);
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.push.url, "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result = SyncConfig::from_toml_str("[push]\nmax_reconnect_attempts = 0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let mut config = SyncConfig::default();
        config.push.reconnect_base_delay_ms = 10_000;
        config.push.reconnect_max_delay_ms = 1_000;
        assert!(matches!(
            config.check(),
            Err(ConfigError::InvalidPushConfig(_))
        ));
    }

    #[test]
    fn test_rejects_http_push_url() {
        let mut config = SyncConfig::default();
        config.push.url = "http://127.0.0.1:8080/ws".into();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SYNC_PUSH__MAX_RECONNECT_ATTEMPTS", "7");
            jail.set_env("SYNC_TYPING__TIMEOUT_MS", "1500");

            let config = SyncConfig::load().expect("config should load");
            assert_eq!(config.push.max_reconnect_attempts, 7);
            assert_eq!(config.typing.timeout_ms, 1500);
            Ok(())
        });
    }
}
