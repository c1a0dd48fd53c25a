use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use ad_identity_core::{
    errors::TransportError, IdentityError, InboundMessage, MessageHandler, Result, ShutdownToken,
};

const ERROR_CHANNEL_CAPACITY: usize = 256;

/// 投递处理器
///
/// 所有传输适配器共用的有界工作池：每条投递占用一个信号量许可，
/// 在独立的tokio任务中调用已注册的处理器。处理器返回错误不会停止工作池，
/// 错误经由错误通道上报。
pub struct DeliveryProcessor {
    transport: &'static str,
    handler: OnceLock<Arc<dyn MessageHandler>>,
    permits: Arc<Semaphore>,
    max_concurrent: u32,
    drain_timeout: Duration,
    shutdown: Mutex<ShutdownToken>,
    error_tx: mpsc::Sender<TransportError>,
    error_rx: Mutex<Option<mpsc::Receiver<TransportError>>>,
}

impl DeliveryProcessor {
    pub fn new(transport: &'static str, max_concurrent: usize, drain_timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.clamp(1, u32::MAX as usize) as u32;
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        Self {
            transport,
            handler: OnceLock::new(),
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
            max_concurrent,
            drain_timeout,
            shutdown: Mutex::new(ShutdownToken::new()),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.handler
            .set(handler)
            .map_err(|_| IdentityError::HandlerAlreadyRegistered)
    }

    pub fn handler(&self) -> Result<Arc<dyn MessageHandler>> {
        self.handler
            .get()
            .cloned()
            .ok_or(IdentityError::HandlerNotRegistered)
    }

    /// 进行中处理器观察的关闭信号
    pub fn shutdown_token(&self) -> ShutdownToken {
        match self.shutdown.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 开始新一轮处理，之后派发的处理器观察新的关闭信号
    ///
    /// 上一轮排空超时时信号已被触发，必须在每次启动时替换。
    pub fn begin(&self) {
        let fresh = ShutdownToken::new();
        match self.shutdown.lock() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent as usize - self.permits.available_permits()
    }

    /// 等待空闲的处理槽位
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IdentityError::Internal("投递处理器已关闭".to_string()))
    }

    /// 在独立任务中处理一条消息，许可随任务结束释放
    pub fn spawn(&self, permit: OwnedSemaphorePermit, message: InboundMessage) -> Result<()> {
        let handler = self.handler()?;
        let shutdown = self.shutdown_token();
        let error_tx = self.error_tx.clone();
        let correlation_id = message.correlation_id().to_string();
        let span = info_span!(
            "delivery",
            transport = self.transport,
            correlation_id = %correlation_id
        );

        tokio::spawn(
            async move {
                let _permit = permit;
                match handler.handle(message, shutdown).await {
                    Ok(()) => debug!("Delivery handled"),
                    Err(IdentityError::Cancelled) => {
                        debug!("Delivery abandoned on shutdown");
                    }
                    Err(IdentityError::MessageQueue(message)) => {
                        error!("Failed to settle delivery: {message}");
                        send_error(
                            &error_tx,
                            TransportError::Settlement {
                                correlation_id,
                                message,
                            },
                        );
                    }
                    Err(e) => {
                        error!("Handler failed: {e}");
                        send_error(
                            &error_tx,
                            TransportError::Handler {
                                correlation_id,
                                message: e.to_string(),
                            },
                        );
                    }
                }
            }
            .instrument(span),
        );

        Ok(())
    }

    /// 上报与单条消息无关的传输层错误
    pub fn report_error(&self, error: TransportError) {
        send_error(&self.error_tx, error);
    }

    pub fn error_sender(&self) -> mpsc::Sender<TransportError> {
        self.error_tx.clone()
    }

    pub fn take_error_receiver(&self) -> Option<mpsc::Receiver<TransportError>> {
        match self.error_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// 排空进行中的处理器
    ///
    /// 先等待 `drain_timeout`，超时后触发关闭信号让进行中的目录调用放弃，
    /// 再等待剩余处理器结算。
    pub async fn drain(&self) -> Result<()> {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!(
                transport = self.transport,
                "Waiting for {} in-flight deliveries", in_flight
            );
        }

        let all = self.permits.acquire_many(self.max_concurrent);
        let permits = match tokio::time::timeout(self.drain_timeout, all).await {
            Ok(permits) => permits,
            Err(_) => {
                warn!(
                    transport = self.transport,
                    "Drain timed out after {:?}, cancelling {} in-flight deliveries",
                    self.drain_timeout,
                    self.in_flight()
                );
                self.shutdown_token().cancel();
                self.permits.acquire_many(self.max_concurrent).await
            }
        }
        .map_err(|_| IdentityError::Internal("投递处理器已关闭".to_string()))?;

        drop(permits);
        info!(transport = self.transport, "All in-flight deliveries settled");
        Ok(())
    }
}

fn send_error(error_tx: &mpsc::Sender<TransportError>, error: TransportError) {
    if let Err(e) = error_tx.try_send(error) {
        warn!("Transport error channel unavailable, dropping error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ad_identity_core::Settlement;

    struct NoopSettlement;

    #[async_trait]
    impl Settlement for NoopSettlement {
        async fn complete(&mut self) -> Result<()> {
            Ok(())
        }

        async fn dead_letter(&mut self, _reason: &str) -> Result<()> {
            Ok(())
        }

        async fn abandon(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct SleepyHandler {
        delay: Duration,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for SleepyHandler {
        async fn handle(&self, message: InboundMessage, shutdown: ShutdownToken) -> Result<()> {
            shutdown
                .run_until_cancelled(tokio::time::sleep(self.delay))
                .await?;
            self.handled.fetch_add(1, Ordering::SeqCst);
            message.complete().await
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: InboundMessage, _shutdown: ShutdownToken) -> Result<()> {
            Err(IdentityError::MessageQueue("ack failed".to_string()))
        }
    }

    fn message(id: &str) -> InboundMessage {
        InboundMessage::new(b"{}".to_vec(), id, Box::new(NoopSettlement))
    }

    #[test]
    fn test_handler_registered_once() {
        let processor = DeliveryProcessor::new("test", 2, Duration::from_secs(1));
        assert!(matches!(
            processor.handler(),
            Err(IdentityError::HandlerNotRegistered)
        ));

        assert!(processor.set_handler(Arc::new(FailingHandler)).is_ok());
        assert!(matches!(
            processor.set_handler(Arc::new(FailingHandler)),
            Err(IdentityError::HandlerAlreadyRegistered)
        ));
    }

    #[test]
    fn test_error_receiver_taken_once() {
        let processor = DeliveryProcessor::new("test", 1, Duration::from_secs(1));
        assert!(processor.take_error_receiver().is_some());
        assert!(processor.take_error_receiver().is_none());
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let processor = DeliveryProcessor::new("test", 2, Duration::from_secs(5));
        let handler = Arc::new(SleepyHandler {
            delay: Duration::from_millis(100),
            handled: AtomicUsize::new(0),
        });
        processor.set_handler(handler.clone()).unwrap();

        for id in ["a", "b"] {
            let permit = processor.acquire().await.unwrap();
            processor.spawn(permit, message(id)).unwrap();
        }
        assert_eq!(processor.in_flight(), 2);

        processor.drain().await.unwrap();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
        assert_eq!(processor.in_flight(), 0);
        assert!(!processor.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_drain_timeout_cancels_in_flight() {
        let processor = DeliveryProcessor::new("test", 1, Duration::from_millis(50));
        let handler = Arc::new(SleepyHandler {
            delay: Duration::from_secs(30),
            handled: AtomicUsize::new(0),
        });
        processor.set_handler(handler.clone()).unwrap();

        let permit = processor.acquire().await.unwrap();
        processor.spawn(permit, message("slow")).unwrap();

        tokio::time::timeout(Duration::from_secs(2), processor.drain())
            .await
            .unwrap()
            .unwrap();
        assert!(processor.shutdown_token().is_cancelled());
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_begin_replaces_cancelled_signal() {
        let processor = DeliveryProcessor::new("test", 1, Duration::from_millis(50));
        let handler = Arc::new(SleepyHandler {
            delay: Duration::from_secs(30),
            handled: AtomicUsize::new(0),
        });
        processor.set_handler(handler.clone()).unwrap();

        let permit = processor.acquire().await.unwrap();
        processor.spawn(permit, message("slow")).unwrap();
        processor.drain().await.unwrap();
        let previous = processor.shutdown_token();
        assert!(previous.is_cancelled());

        processor.begin();
        assert!(!processor.shutdown_token().is_cancelled());
        assert!(previous.is_cancelled());
    }

    #[tokio::test]
    async fn test_handler_errors_are_reported_and_pool_survives() {
        let processor = DeliveryProcessor::new("test", 1, Duration::from_secs(1));
        let mut errors = processor.take_error_receiver().unwrap();
        processor.set_handler(Arc::new(FailingHandler)).unwrap();

        for id in ["first", "second"] {
            let permit = processor.acquire().await.unwrap();
            processor.spawn(permit, message(id)).unwrap();
        }

        for expected in ["first", "second"] {
            let error = tokio::time::timeout(Duration::from_secs(1), errors.recv())
                .await
                .unwrap()
                .unwrap();
            match error {
                TransportError::Settlement { correlation_id, .. } => {
                    assert_eq!(correlation_id, expected)
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
