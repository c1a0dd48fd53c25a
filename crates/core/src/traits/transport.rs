use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{errors::TransportError, shutdown::ShutdownToken, Result};

/// 传输层结算接口，由具体适配器为每条投递实现
#[async_trait]
pub trait Settlement: Send {
    /// 确认消息处理完成
    async fn complete(&mut self) -> Result<()>;

    /// 将消息转入死信队列并附带原因
    async fn dead_letter(&mut self, reason: &str) -> Result<()>;

    /// 放弃消息，交还传输层重新投递
    async fn abandon(&mut self) -> Result<()>;
}

/// 传输层投递的入站消息
///
/// 终态操作按值消费消息，保证每条消息最多只被结算一次。
pub struct InboundMessage {
    body: Vec<u8>,
    correlation_id: String,
    delivery_count: u32,
    settlement: Box<dyn Settlement>,
}

impl InboundMessage {
    pub fn new(
        body: impl Into<Vec<u8>>,
        correlation_id: impl Into<String>,
        settlement: Box<dyn Settlement>,
    ) -> Self {
        Self {
            body: body.into(),
            correlation_id: correlation_id.into(),
            delivery_count: 1,
            settlement,
        }
    }

    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// 投递次数，首次投递为1
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub async fn complete(mut self) -> Result<()> {
        self.settlement.complete().await
    }

    pub async fn dead_letter(mut self, reason: &str) -> Result<()> {
        self.settlement.dead_letter(reason).await
    }

    pub async fn abandon(mut self) -> Result<()> {
        self.settlement.abandon().await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("correlation_id", &self.correlation_id)
            .field("delivery_count", &self.delivery_count)
            .field("body", &self.body_lossy())
            .finish()
    }
}

/// 消息处理器，每条入站消息调用一次
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage, shutdown: ShutdownToken) -> Result<()>;
}

/// 消息总线适配器抽象，只暴露接收和处理消息所需的能力
#[async_trait]
pub trait Transport: Send + Sync {
    /// 注册消息处理器，只能注册一次
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// 开始连接并接收消息，必须在注册处理器之后调用
    async fn start_processing(&self) -> Result<()>;

    /// 停止接收新消息，并等待进行中的处理器结束
    async fn stop_processing(&self) -> Result<()>;

    /// 取走传输层错误通道，只能取走一次
    fn take_error_receiver(&self) -> Option<mpsc::Receiver<TransportError>>;

    /// 适配器名称（用于日志）
    fn name(&self) -> &'static str;
}
