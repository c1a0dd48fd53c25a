use thiserror::Error;

/// Worker统一错误类型定义
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("消息载荷错误: {0}")]
    Payload(#[from] PayloadError),

    #[error("目录服务错误: {0}")]
    Directory(#[from] DirectoryError),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("消息处理器已注册")]
    HandlerAlreadyRegistered,

    #[error("消息处理器未注册")]
    HandlerNotRegistered,

    #[error("消息处理已在运行")]
    AlreadyProcessing,

    #[error("操作已取消")]
    Cancelled,

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 动作请求解析错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("duplicate field `{0}`")]
    DuplicateField(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("invalid value {value} for enum {enum_name}")]
    InvalidEnumValue {
        enum_name: &'static str,
        value: String,
    },

    #[error("invalid token type for field `{field}`, expected {expected}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
    },
}

/// 目录服务错误
///
/// 解析阶段的每种失败形态都是独立的变体，调用方据此区分死信原因。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("identity value does not match the declared identity type")]
    FormatMismatch,

    #[error("identity matched {0} principals")]
    MultipleMatches(usize),

    #[error("identity matched no principal")]
    NoMatch,

    #[error("directory rejected changes: {0}")]
    Validation(String),

    #[error("directory fault: {0}")]
    Unknown(String),
}

/// 传输层错误（通过独立的错误通道上报，不与单条消息绑定）
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("连接错误: {0}")]
    Connection(String),

    #[error("消费者错误: {0}")]
    Consumer(String),

    #[error("消息结算失败 (correlation_id={correlation_id}): {message}")]
    Settlement {
        correlation_id: String,
        message: String,
    },

    #[error("消息处理器错误 (correlation_id={correlation_id}): {message}")]
    Handler {
        correlation_id: String,
        message: String,
    },
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, IdentityError>;
