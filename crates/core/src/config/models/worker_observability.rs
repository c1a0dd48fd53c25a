use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 停止时等待进行中消息的时长，超时后触发取消
    pub drain_timeout_seconds: u64,
    /// 进程整体关闭超时
    pub shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: 30,
            shutdown_timeout_seconds: 60,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.shutdown_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("关闭超时时间必须大于0"));
        }

        if self.drain_timeout_seconds >= self.shutdown_timeout_seconds {
            return Err(anyhow::anyhow!("排空超时时间必须小于关闭超时时间"));
        }

        Ok(())
    }
}

/// 开发目录配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// 用户记录种子文件（JSON），未配置时目录为空
    pub seed_file: Option<String>,
}

impl DirectoryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.seed_file {
            if path.trim().is_empty() {
                return Err(anyhow::anyhow!("目录种子文件路径不能为空"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("无效的日志格式: {}", self.log_format));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_validation() {
        assert!(WorkerConfig::default().validate().is_ok());

        let config = WorkerConfig {
            drain_timeout_seconds: 60,
            shutdown_timeout_seconds: 30,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_observability_config_validation() {
        assert!(ObservabilityConfig::default().validate().is_ok());

        let config = ObservabilityConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ObservabilityConfig {
            log_format: "xml".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
