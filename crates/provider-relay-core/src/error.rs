use std::path::PathBuf;

/// 配置与启动阶段的错误
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("配置文件不存在: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("读取配置失败 {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("解析配置失败: {0}")]
    Parse(String),

    #[error("配置无效: {0}")]
    Invalid(String),
}

impl AppError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}
