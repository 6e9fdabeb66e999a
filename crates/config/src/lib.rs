//! 统一配置中心
//!
//! 提供中继服务的全局配置管理，包括：
//! - 监听地址与 JWT 认证
//! - 会话登记、序列化与分发参数
//! - Redis 持久化与外部协作服务
//!
//! 加载顺序：默认值 -> 可选配置文件（`RELAY_CONFIG_FILE`）-> 环境变量（`RELAY_*`，层级用 `__` 分隔）。

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// 配置文件路径的环境变量名
pub const CONFIG_FILE_ENV: &str = "RELAY_CONFIG_FILE";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "RELAY_";

const DEV_JWT_SECRET: &str = "dev-secret-key-not-for-production-use-minimum-32-chars";

/// 全局中继配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// JWT认证配置
    pub jwt: JwtConfig,
    /// 中继行为配置
    #[serde(default)]
    pub relay: RelaySettings,
    /// Redis配置；缺省时使用进程内存储
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    /// 配对 / 直播归属查询服务
    #[serde(default)]
    pub directory: Option<DirectoryConfig>,
    /// 离线推送
    #[serde(default)]
    pub push: Option<PushConfig>,
}

/// 服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// JWT配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

/// 中继行为参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// 每个会话出站队列的容量，满时丢弃并记录告警
    pub outbox_capacity: usize,
    /// 直播间每个用户在窗口内允许发送的消息数
    pub live_rate_limit: u32,
    pub live_rate_window_ms: u64,
    /// 去重表保留的最近消息 ID 数量
    pub dedup_capacity: usize,
    /// 重放时每页从存储读取的条数
    pub replay_page_size: usize,
    /// 同一用户同时只能在一个直播间
    pub exclusive_live_presence: bool,
    /// 同一用户同时只能在一个私聊中
    pub exclusive_private_presence: bool,
    /// 私聊历史单页的默认条数
    pub history_page_limit: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            live_rate_limit: 5,
            live_rate_window_ms: 1000,
            dedup_capacity: 4096,
            replay_page_size: 200,
            exclusive_live_presence: true,
            exclusive_private_presence: false,
            history_page_limit: 50,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// 历史记录的过期时间；缺省时永久保留
    #[serde(default)]
    pub history_ttl_secs: Option<u64>,
}

/// 外部目录服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// 推送 webhook 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConfig {
    pub webhook_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    3000
}

impl Default for RelayConfig {
    /// 默认配置仅用于开发环境
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            jwt: JwtConfig {
                secret: DEV_JWT_SECRET.to_string(),
                expiration_hours: 24,
            },
            relay: RelaySettings::default(),
            redis: None,
            directory: None,
            push: None,
        }
    }
}

impl RelayConfig {
    fn base() -> Figment {
        Figment::new().merge(Serialized::defaults(RelayConfig::default()))
    }

    /// 按默认值 -> 配置文件 -> 环境变量的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Self::base();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig = fig.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let cfg: RelayConfig = fig.extract().map_err(Box::new)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 从 TOML/YAML/JSON 文本解析，未给出的字段取默认值
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let trimmed = s.trim_start();
        let fig = if trimmed.starts_with('{') {
            Self::base().merge(Json::string(s))
        } else if s.contains('[') || s.contains('=') {
            Self::base().merge(Toml::string(s))
        } else {
            Self::base().merge(Yaml::string(s))
        };
        let cfg: RelayConfig = fig.extract().map_err(Box::new)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::InvalidServerConfig(
                "host cannot be empty".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidServerPort(
                "port must be greater than 0".to_string(),
            ));
        }

        // 至少256位/32字节
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidJwtSecret(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }
        if self.jwt.secret.contains("dev-secret") || self.jwt.secret.contains("not-for-production")
        {
            return Err(ConfigError::InvalidJwtSecret(
                "Cannot use development JWT secret in production".to_string(),
            ));
        }
        if self.jwt.expiration_hours <= 0 {
            return Err(ConfigError::InvalidJwtSecret(
                "expiration_hours must be positive".to_string(),
            ));
        }

        let relay = &self.relay;
        for (name, value) in [
            ("outbox_capacity", relay.outbox_capacity),
            ("dedup_capacity", relay.dedup_capacity),
            ("replay_page_size", relay.replay_page_size),
            ("history_page_limit", relay.history_page_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidRelayConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if relay.live_rate_limit == 0 || relay.live_rate_window_ms == 0 {
            return Err(ConfigError::InvalidRelayConfig(
                "live rate limit and window must be greater than 0".to_string(),
            ));
        }

        if let Some(redis) = &self.redis {
            if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
                return Err(ConfigError::InvalidRedisUrl(redis.url.clone()));
            }
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 日志中使用的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut copy = self.clone();
        copy.jwt.secret = "[REDACTED]".to_string();
        if let Some(redis) = copy.redis.as_mut() {
            if let Some(at) = redis.url.rfind('@') {
                redis.url = format!("redis://[REDACTED]{}", &redis.url[at..]);
            }
        }
        format!("{copy:?}")
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid server port: {0}")]
    InvalidServerPort(String),
    #[error("Invalid server configuration: {0}")]
    InvalidServerConfig(String),
    #[error("Invalid relay configuration: {0}")]
    InvalidRelayConfig(String),
    #[error("Invalid Redis URL: {0}")]
    InvalidRedisUrl(String),
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}
