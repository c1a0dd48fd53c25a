use std::fmt;
use std::str::FromStr;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PayloadError;

/// 对账户执行的动作
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ActionType {
    Enable,
    Disable,
}

/// 标识符类型，序号与目录服务API中的定义保持一致
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum IdentityType {
    SamAccountName,
    Name,
    UserPrincipalName,
    DistinguishedName,
    Sid,
    Guid,
}

/// 线上枚举：声明的成员集合，包含规范名称和序号
trait WireEnum: Sized + Copy + 'static {
    const NAME: &'static str;
    const MEMBERS: &'static [(Self, &'static str, i64)];

    fn name(self) -> &'static str
    where
        Self: PartialEq,
    {
        Self::MEMBERS
            .iter()
            .find(|(member, _, _)| *member == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("Unknown")
    }
}

impl WireEnum for ActionType {
    const NAME: &'static str = "ActionType";
    const MEMBERS: &'static [(Self, &'static str, i64)] = &[
        (ActionType::Enable, "Enable", 0),
        (ActionType::Disable, "Disable", 1),
    ];
}

impl WireEnum for IdentityType {
    const NAME: &'static str = "IdentityType";
    const MEMBERS: &'static [(Self, &'static str, i64)] = &[
        (IdentityType::SamAccountName, "SamAccountName", 0),
        (IdentityType::Name, "Name", 1),
        (IdentityType::UserPrincipalName, "UserPrincipalName", 2),
        (IdentityType::DistinguishedName, "DistinguishedName", 3),
        (IdentityType::Sid, "Sid", 4),
        (IdentityType::Guid, "Guid", 5),
    ];
}

fn enum_from_ordinal<T: WireEnum>(ordinal: i64) -> Option<T> {
    T::MEMBERS
        .iter()
        .find(|(_, _, value)| *value == ordinal)
        .map(|(member, _, _)| *member)
}

/// 名称不区分大小写；十进制序号字符串同样接受，但必须是已声明的成员
fn enum_from_str<T: WireEnum>(raw: &str) -> Result<T, PayloadError> {
    let text = raw.trim();
    let by_name = T::MEMBERS
        .iter()
        .find(|(_, name, _)| name.eq_ignore_ascii_case(text))
        .map(|(member, _, _)| *member);

    by_name
        .or_else(|| text.parse::<i64>().ok().and_then(enum_from_ordinal))
        .ok_or_else(|| PayloadError::InvalidEnumValue {
            enum_name: T::NAME,
            value: format!("\"{raw}\""),
        })
}

fn enum_from_value<T: WireEnum>(field: &'static str, value: &Value) -> Result<T, PayloadError> {
    match value {
        Value::String(text) => enum_from_str(text),
        Value::Number(number) => number
            .as_i64()
            .and_then(enum_from_ordinal)
            .ok_or_else(|| PayloadError::InvalidEnumValue {
                enum_name: T::NAME,
                value: number.to_string(),
            }),
        _ => Err(PayloadError::InvalidType {
            field,
            expected: "string or number",
        }),
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for IdentityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActionType {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        enum_from_str(s)
    }
}

impl FromStr for IdentityType {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        enum_from_str(s)
    }
}

/// 单条入站消息携带的动作请求
///
/// 解码是严格的：未知字段、重复字段、缺失字段和未声明的枚举值都会被拒绝，
/// 字段名匹配不区分大小写。
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: ActionType,
    pub identity_type: IdentityType,
    pub identity: String,
}

impl ActionRequest {
    const FIELD_ACTION: &'static str = "action";
    const FIELD_IDENTITY_TYPE: &'static str = "identityType";
    const FIELD_IDENTITY: &'static str = "identity";

    pub fn new(action: ActionType, identity_type: IdentityType, identity: impl Into<String>) -> Self {
        Self {
            action,
            identity_type,
            identity: identity.into(),
        }
    }

    /// 从消息体解析动作请求
    pub fn from_slice(body: &[u8]) -> Result<Self, PayloadError> {
        let raw: Option<RawObject> =
            serde_json::from_slice(body).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        let raw = raw.ok_or(PayloadError::NotAnObject)?;
        Self::from_raw(raw)
    }

    pub fn from_json(body: &str) -> Result<Self, PayloadError> {
        Self::from_slice(body.as_bytes())
    }

    /// 序列化为规范形式（枚举使用名称）
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn from_raw(raw: RawObject) -> Result<Self, PayloadError> {
        let mut action = None;
        let mut identity_type = None;
        let mut identity = None;

        for (key, value) in raw.0 {
            let slot = if key.eq_ignore_ascii_case(Self::FIELD_ACTION) {
                (Self::FIELD_ACTION, &mut action)
            } else if key.eq_ignore_ascii_case(Self::FIELD_IDENTITY_TYPE) {
                (Self::FIELD_IDENTITY_TYPE, &mut identity_type)
            } else if key.eq_ignore_ascii_case(Self::FIELD_IDENTITY) {
                (Self::FIELD_IDENTITY, &mut identity)
            } else {
                return Err(PayloadError::UnknownField(key));
            };

            let (name, target) = slot;
            if target.is_some() {
                return Err(PayloadError::DuplicateField(name.to_string()));
            }
            *target = Some(value);
        }

        let action = action.ok_or(PayloadError::MissingField(Self::FIELD_ACTION))?;
        let identity_type =
            identity_type.ok_or(PayloadError::MissingField(Self::FIELD_IDENTITY_TYPE))?;
        let identity = identity.ok_or(PayloadError::MissingField(Self::FIELD_IDENTITY))?;

        let action = enum_from_value::<ActionType>(Self::FIELD_ACTION, &action)?;
        let identity_type =
            enum_from_value::<IdentityType>(Self::FIELD_IDENTITY_TYPE, &identity_type)?;
        let identity = match identity {
            Value::String(text) if text.trim().is_empty() => {
                return Err(PayloadError::EmptyField(Self::FIELD_IDENTITY))
            }
            Value::String(text) => text,
            _ => {
                return Err(PayloadError::InvalidType {
                    field: Self::FIELD_IDENTITY,
                    expected: "string",
                })
            }
        };

        Ok(Self {
            action,
            identity_type,
            identity,
        })
    }
}

/// 保留原始顺序与重复键的JSON对象
struct RawObject(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for RawObject {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(RawObjectVisitor)
    }
}

struct RawObjectVisitor;

impl<'de> Visitor<'de> for RawObjectVisitor {
    type Value = RawObject;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(3));
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            entries.push((key, value));
        }
        Ok(RawObject(entries))
    }
}
