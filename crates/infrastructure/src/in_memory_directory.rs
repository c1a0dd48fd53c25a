use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use ad_identity_core::{errors::DirectoryError, Directory, IdentityType, Principal};

const SAM_ACCOUNT_NAME_MAX_LEN: usize = 20;
const SAM_ACCOUNT_NAME_FORBIDDEN: &[char] = &[
    '"', '/', '\\', '[', ']', ':', ';', '|', '=', ',', '+', '*', '?', '<', '>', '@',
];

/// 目录中的用户记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub sid: String,
    pub sam_account_name: String,
    pub guid: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// 内存目录（开发环境绑定）
///
/// 按类型校验标识符格式后做大小写不敏感匹配。
/// 每个返回的主体句柄都计入未释放句柄数，句柄被丢弃时归还。
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    users: Arc<RwLock<Vec<UserRecord>>>,
    outstanding: Arc<AtomicUsize>,
}

impl InMemoryDirectory {
    pub fn new(users: Vec<UserRecord>) -> Self {
        Self {
            users: Arc::new(RwLock::new(users)),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let users: Vec<UserRecord> = serde_json::from_str(json).context("解析目录种子数据失败")?;
        Ok(Self::new(users))
    }

    /// 从JSON种子文件加载用户记录
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("读取目录种子文件失败: {}", path.display()))?;
        let directory = Self::from_json(&json)?;
        info!("从 {} 加载目录用户", path.display());
        Ok(directory)
    }

    pub async fn users(&self) -> Vec<UserRecord> {
        self.users.read().await.clone()
    }

    pub async fn insert(&self, user: UserRecord) {
        self.users.write().await.push(user);
    }

    /// 尚未释放的主体句柄数
    pub fn outstanding_handles(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn find_by_identity(
        &self,
        identity_type: IdentityType,
        value: &str,
    ) -> Result<Box<dyn Principal>, DirectoryError> {
        let matcher = IdentityMatcher::parse(identity_type, value)?;

        let users = self.users.read().await;
        let matches: Vec<usize> = users
            .iter()
            .enumerate()
            .filter(|(_, user)| matcher.matches(user))
            .map(|(index, _)| index)
            .collect();

        match matches.as_slice() {
            [] => Err(DirectoryError::NoMatch),
            [index] => {
                let user = &users[*index];
                debug!("解析到用户 {} ({})", user.sam_account_name, user.sid);
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(InMemoryPrincipal {
                    index: *index,
                    display_name: user.sam_account_name.clone(),
                    enabled: user.enabled,
                    users: self.users.clone(),
                    outstanding: self.outstanding.clone(),
                }))
            }
            many => Err(DirectoryError::MultipleMatches(many.len())),
        }
    }
}

enum IdentityMatcher {
    Sid(String),
    SamAccountName(String),
    Guid(Uuid),
}

impl IdentityMatcher {
    fn parse(identity_type: IdentityType, value: &str) -> Result<Self, DirectoryError> {
        let value = value.trim();
        match identity_type {
            IdentityType::Sid if is_valid_sid(value) => Ok(Self::Sid(value.to_string())),
            IdentityType::SamAccountName if is_valid_sam_account_name(value) => {
                Ok(Self::SamAccountName(value.to_string()))
            }
            IdentityType::Guid => Uuid::parse_str(value)
                .map(Self::Guid)
                .map_err(|_| DirectoryError::FormatMismatch),
            IdentityType::Sid | IdentityType::SamAccountName => Err(DirectoryError::FormatMismatch),
            other => Err(DirectoryError::Unknown(format!(
                "内存目录不支持按 {other} 查找"
            ))),
        }
    }

    fn matches(&self, user: &UserRecord) -> bool {
        match self {
            Self::Sid(sid) => user.sid.eq_ignore_ascii_case(sid),
            Self::SamAccountName(name) => user.sam_account_name.eq_ignore_ascii_case(name),
            Self::Guid(guid) => Uuid::parse_str(&user.guid).is_ok_and(|g| g == *guid),
        }
    }
}

/// `S-1-<authority>-<sub-authority>...`
fn is_valid_sid(value: &str) -> bool {
    let mut parts = value.split('-');
    if !parts.next().is_some_and(|p| p.eq_ignore_ascii_case("S")) || parts.next() != Some("1") {
        return false;
    }

    let rest: Vec<&str> = parts.collect();
    (2..=16).contains(&rest.len())
        && rest
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        && rest[1..].iter().all(|p| p.parse::<u32>().is_ok())
}

fn is_valid_sam_account_name(value: &str) -> bool {
    let len = value.chars().count();
    (1..=SAM_ACCOUNT_NAME_MAX_LEN).contains(&len)
        && !value
            .chars()
            .any(|c| c.is_control() || SAM_ACCOUNT_NAME_FORBIDDEN.contains(&c))
}

struct InMemoryPrincipal {
    index: usize,
    display_name: String,
    enabled: bool,
    users: Arc<RwLock<Vec<UserRecord>>>,
    outstanding: Arc<AtomicUsize>,
}

#[async_trait]
impl Principal for InMemoryPrincipal {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    async fn save(&mut self) -> Result<(), DirectoryError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(self.index)
            .ok_or_else(|| DirectoryError::Unknown(format!("用户 {} 已不存在", self.display_name)))?;
        user.enabled = self.enabled;
        Ok(())
    }
}

impl Drop for InMemoryPrincipal {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::new(vec![
            UserRecord {
                sid: "S-1-5-21-3623811015-3361044348-30300820-1013".to_string(),
                sam_account_name: "jdoe".to_string(),
                guid: "0c7b3f6e-7a4c-4d1e-9b55-3b2e0e1f4a10".to_string(),
                enabled: true,
            },
            UserRecord {
                sid: "S-1-5-21-3623811015-3361044348-30300820-1014".to_string(),
                sam_account_name: "twin".to_string(),
                guid: "6f1f0f0e-8d2b-4c35-a1f3-5d6e7f809a1b".to_string(),
                enabled: false,
            },
            UserRecord {
                sid: "S-1-5-21-3623811015-3361044348-30300820-1015".to_string(),
                sam_account_name: "TWIN".to_string(),
                guid: "9a8b7c6d-5e4f-4a3b-8c2d-1e0f9a8b7c6d".to_string(),
                enabled: false,
            },
        ])
    }

    #[test]
    fn test_sid_format() {
        assert!(is_valid_sid("S-1-5-18"));
        assert!(is_valid_sid("s-1-5-21-3623811015-3361044348-30300820-1013"));
        assert!(!is_valid_sid("S-1-5"));
        assert!(!is_valid_sid("S-2-5-18"));
        assert!(!is_valid_sid("S-1-5-x"));
        assert!(!is_valid_sid("jdoe"));
        assert!(!is_valid_sid("S-1-5-99999999999"));
    }

    #[test]
    fn test_sam_account_name_format() {
        assert!(is_valid_sam_account_name("jdoe"));
        assert!(is_valid_sam_account_name("svc.backup-01"));
        assert!(!is_valid_sam_account_name(""));
        assert!(!is_valid_sam_account_name("a-name-that-is-way-too-long"));
        assert!(!is_valid_sam_account_name("corp\\jdoe"));
        assert!(!is_valid_sam_account_name("jdoe@corp"));
    }

    #[tokio::test]
    async fn test_find_by_sid_is_case_insensitive() {
        let directory = directory();
        let principal = directory
            .find_by_identity(
                IdentityType::Sid,
                "s-1-5-21-3623811015-3361044348-30300820-1013",
            )
            .await
            .unwrap();

        assert_eq!(principal.display_name(), "jdoe");
        assert!(principal.enabled());
        assert_eq!(directory.outstanding_handles(), 1);
        drop(principal);
        assert_eq!(directory.outstanding_handles(), 0);
    }

    #[tokio::test]
    async fn test_find_by_guid_accepts_braced_uppercase() {
        let directory = directory();
        let principal = directory
            .find_by_identity(IdentityType::Guid, "{0C7B3F6E-7A4C-4D1E-9B55-3B2E0E1F4A10}")
            .await
            .unwrap();
        assert_eq!(principal.display_name(), "jdoe");
    }

    #[tokio::test]
    async fn test_lookup_failure_shapes() {
        let directory = directory();

        let multiple = directory
            .find_by_identity(IdentityType::SamAccountName, "twin")
            .await;
        assert!(matches!(multiple, Err(DirectoryError::MultipleMatches(2))));

        let none = directory
            .find_by_identity(IdentityType::SamAccountName, "nobody")
            .await;
        assert!(matches!(none, Err(DirectoryError::NoMatch)));

        let mismatch = directory.find_by_identity(IdentityType::Sid, "jdoe").await;
        assert!(matches!(mismatch, Err(DirectoryError::FormatMismatch)));

        let bad_guid = directory.find_by_identity(IdentityType::Guid, "not-a-guid").await;
        assert!(matches!(bad_guid, Err(DirectoryError::FormatMismatch)));

        let unsupported = directory
            .find_by_identity(IdentityType::DistinguishedName, "CN=jdoe,DC=corp")
            .await;
        assert!(matches!(unsupported, Err(DirectoryError::Unknown(_))));

        let by_upn = directory
            .find_by_identity(IdentityType::UserPrincipalName, "jdoe@corp.example")
            .await;
        assert!(matches!(by_upn, Err(DirectoryError::Unknown(_))));

        assert_eq!(directory.outstanding_handles(), 0);
    }

    #[tokio::test]
    async fn test_save_writes_back() {
        let directory = directory();
        let mut principal = directory
            .find_by_identity(IdentityType::SamAccountName, "JDOE")
            .await
            .unwrap();

        principal.set_enabled(false);
        assert!(directory.users().await[0].enabled);

        principal.save().await.unwrap();
        assert!(!directory.users().await[0].enabled);
    }

    #[test]
    fn test_from_json_defaults() {
        let directory = InMemoryDirectory::from_json(
            r#"[{"sid":"S-1-5-18","sam_account_name":"system","guid":"6f1f0f0e-8d2b-4c35-a1f3-5d6e7f809a1b"}]"#,
        )
        .unwrap();
        assert_eq!(directory.outstanding_handles(), 0);
        assert!(InMemoryDirectory::from_json("{}").is_err());
    }
}
