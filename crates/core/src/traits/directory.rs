use async_trait::async_trait;

use crate::{errors::DirectoryError, models::IdentityType};

/// 目录服务中的用户主体句柄
///
/// 句柄是作用域资源，由具体实现在 `Drop` 中释放。
#[async_trait]
pub trait Principal: Send + Sync {
    /// 用于日志的主体名称
    fn display_name(&self) -> &str;

    fn enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// 持久化对主体的修改
    async fn save(&mut self) -> Result<(), DirectoryError>;
}

/// 目录服务身份解析接口
#[async_trait]
pub trait Directory: Send + Sync {
    /// 按标识符类型和值查找唯一主体
    ///
    /// 零匹配、多匹配和格式不符是互不相同的错误形态。
    async fn find_by_identity(
        &self,
        identity_type: IdentityType,
        value: &str,
    ) -> Result<Box<dyn Principal>, DirectoryError>;
}
