use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ad_identity_core::{
    errors::TransportError, IdentityError, InboundMessage, MessageHandler, Result, Settlement,
    ShutdownToken, Transport,
};

use crate::processor::DeliveryProcessor;

/// 内存队列中等待投递的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub correlation_id: String,
    pub delivery_count: u32,
}

/// 已转入死信列表的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetteredMessage {
    pub message: QueuedMessage,
    pub reason: String,
}

#[derive(Default)]
struct QueueState {
    pending: Mutex<VecDeque<QueuedMessage>>,
    completed: Mutex<Vec<QueuedMessage>>,
    dead_letters: Mutex<Vec<DeadLetteredMessage>>,
    available: Notify,
}

impl QueueState {
    async fn enqueue(&self, message: QueuedMessage) {
        self.pending.lock().await.push_back(message);
        self.available.notify_one();
    }
}

struct Intake {
    stop: ShutdownToken,
    handle: JoinHandle<()>,
}

/// 内存传输（开发环境绑定）
///
/// 语义与生产传输一致：至少一次投递、完成、死信和放弃重投，
/// 结算结果保存在内存中供检查。
pub struct InMemoryTransport {
    processor: Arc<DeliveryProcessor>,
    state: Arc<QueueState>,
    intake: Mutex<Option<Intake>>,
}

impl InMemoryTransport {
    pub fn new(max_concurrent_messages: usize, drain_timeout: Duration) -> Self {
        Self {
            processor: Arc::new(DeliveryProcessor::new(
                "in-memory",
                max_concurrent_messages,
                drain_timeout,
            )),
            state: Arc::new(QueueState::default()),
            intake: Mutex::new(None),
        }
    }

    /// 发布一条消息到队列尾部
    pub async fn publish(&self, body: impl Into<Vec<u8>>, correlation_id: impl Into<String>) {
        let message = QueuedMessage {
            body: body.into(),
            correlation_id: correlation_id.into(),
            delivery_count: 1,
        };
        debug!("发布内存消息: {}", message.correlation_id);
        self.state.enqueue(message).await;
    }

    pub async fn pending(&self) -> Vec<QueuedMessage> {
        self.state.pending.lock().await.iter().cloned().collect()
    }

    pub async fn completed(&self) -> Vec<QueuedMessage> {
        self.state.completed.lock().await.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.state.dead_letters.lock().await.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.processor.in_flight()
    }

    async fn run_intake(
        processor: Arc<DeliveryProcessor>,
        state: Arc<QueueState>,
        stop: ShutdownToken,
    ) {
        loop {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = processor.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        processor.report_error(TransportError::Consumer(e.to_string()));
                        break;
                    }
                },
            };

            let next = loop {
                if stop.is_cancelled() {
                    break None;
                }
                if let Some(message) = state.pending.lock().await.pop_front() {
                    break Some(message);
                }
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break None,
                    _ = state.available.notified() => {}
                }
            };

            let Some(queued) = next else {
                break;
            };

            let settlement = InMemorySettlement {
                state: state.clone(),
                message: Some(queued.clone()),
            };
            let message = InboundMessage::new(
                queued.body,
                queued.correlation_id,
                Box::new(settlement),
            )
            .with_delivery_count(queued.delivery_count);

            if let Err(e) = processor.spawn(permit, message) {
                processor.report_error(TransportError::Consumer(e.to_string()));
                break;
            }
        }
        debug!("内存传输停止接收消息");
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.processor.set_handler(handler)
    }

    async fn start_processing(&self) -> Result<()> {
        self.processor.handler()?;

        let mut intake = self.intake.lock().await;
        if intake.is_some() {
            return Err(IdentityError::AlreadyProcessing);
        }

        self.processor.begin();
        let stop = ShutdownToken::new();
        let handle = tokio::spawn(Self::run_intake(
            self.processor.clone(),
            self.state.clone(),
            stop.clone(),
        ));
        *intake = Some(Intake { stop, handle });

        info!("内存传输开始处理消息");
        Ok(())
    }

    async fn stop_processing(&self) -> Result<()> {
        let Some(intake) = self.intake.lock().await.take() else {
            return Ok(());
        };

        intake.stop.cancel();
        if let Err(e) = intake.handle.await {
            warn!("内存传输接收任务异常退出: {e}");
        }

        self.processor.drain().await?;
        info!("内存传输已停止");
        Ok(())
    }

    fn take_error_receiver(&self) -> Option<mpsc::Receiver<TransportError>> {
        self.processor.take_error_receiver()
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

struct InMemorySettlement {
    state: Arc<QueueState>,
    message: Option<QueuedMessage>,
}

impl InMemorySettlement {
    fn take(&mut self) -> Result<QueuedMessage> {
        self.message
            .take()
            .ok_or_else(|| IdentityError::MessageQueue("消息已结算".to_string()))
    }
}

#[async_trait]
impl Settlement for InMemorySettlement {
    async fn complete(&mut self) -> Result<()> {
        let message = self.take()?;
        self.state.completed.lock().await.push(message);
        Ok(())
    }

    async fn dead_letter(&mut self, reason: &str) -> Result<()> {
        let message = self.take()?;
        self.state.dead_letters.lock().await.push(DeadLetteredMessage {
            message,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn abandon(&mut self) -> Result<()> {
        let mut message = self.take()?;
        message.delivery_count += 1;
        self.state.enqueue(message).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CompleteAll;

    #[async_trait]
    impl MessageHandler for CompleteAll {
        async fn handle(&self, message: InboundMessage, _shutdown: ShutdownToken) -> Result<()> {
            message.complete().await
        }
    }

    #[tokio::test]
    async fn test_start_requires_handler() {
        let transport = InMemoryTransport::new(1, Duration::from_secs(1));
        assert!(matches!(
            transport.start_processing().await,
            Err(IdentityError::HandlerNotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let transport = InMemoryTransport::new(1, Duration::from_secs(1));
        transport.set_message_handler(Arc::new(CompleteAll)).unwrap();
        transport.start_processing().await.unwrap();

        assert!(matches!(
            transport.start_processing().await,
            Err(IdentityError::AlreadyProcessing)
        ));
        transport.stop_processing().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let transport = InMemoryTransport::new(1, Duration::from_secs(1));
        assert!(transport.stop_processing().await.is_ok());
    }

    #[tokio::test]
    async fn test_messages_published_before_start_are_kept() {
        let transport = InMemoryTransport::new(1, Duration::from_secs(1));
        transport.publish("{}", "queued").await;

        let pending = transport.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id, "queued");
        assert_eq!(pending[0].delivery_count, 1);
    }
}
