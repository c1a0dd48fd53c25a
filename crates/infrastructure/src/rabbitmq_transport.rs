use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, Event, Queue,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ad_identity_core::{
    config::TransportConfig, errors::TransportError, IdentityError, InboundMessage,
    MessageHandler, Result, Settlement, ShutdownToken, Transport,
};

use crate::processor::DeliveryProcessor;

/// 死信消息上附带原因的消息头
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const PERSISTENT: u8 = 2;

/// 连接中断后的重连退避，每次失败后间隔翻倍直到上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// 一次成功建立的连接、通道和消费者
struct Link {
    connection: Connection,
    channel: Channel,
    consumer_tag: String,
    events: JoinHandle<()>,
}

impl Link {
    async fn close(self) -> Result<()> {
        self.events.abort();
        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!("关闭通道失败: {e}");
        }
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("关闭连接失败: {e}")))
    }
}

struct Session {
    link: Arc<Mutex<Option<Link>>>,
    stop: ShutdownToken,
    intake: JoinHandle<()>,
}

/// 建立到代理的连接、通道和消费者，启动和重连共用
struct Connector {
    config: TransportConfig,
    url: String,
    error_tx: mpsc::Sender<TransportError>,
}

impl Connector {
    fn dead_letter_queue(&self) -> String {
        self.config.dead_letter_queue_name()
    }

    fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connection_timeout_seconds)
    }

    async fn connect(&self) -> Result<Connection> {
        let timeout = self.connection_timeout();
        let connection =
            tokio::time::timeout(timeout, Connection::connect(&self.url, ConnectionProperties::default()))
                .await
                .map_err(|_| IdentityError::MessageQueue(format!("连接RabbitMQ超时 ({timeout:?})")))?
                .map_err(|e| IdentityError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        info!("成功连接到RabbitMQ, 队列: {}", self.config.queue_name);
        Ok(connection)
    }

    async fn open_channel(&self, connection: &Connection) -> Result<Channel> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("创建通道失败: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("开启发布确认失败: {e}")))?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("设置预取数量失败: {e}")))?;

        declare_queue(&channel, &self.config.queue_name).await?;
        declare_queue(&channel, &self.dead_letter_queue()).await?;

        Ok(channel)
    }

    async fn create_consumer(&self, channel: &Channel, consumer_tag: &str) -> Result<Consumer> {
        let consumer = channel
            .basic_consume(
                &self.config.queue_name,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("创建消费者失败: {e}")))?;

        debug!("为队列 {} 创建消费者: {}", self.config.queue_name, consumer_tag);
        Ok(consumer)
    }

    async fn establish(&self) -> Result<(Link, Consumer)> {
        let connection = self.connect().await?;
        let events = forward_connection_events(&connection, self.error_tx.clone());

        let consumer_tag = consumer_tag();
        let opened = match self.open_channel(&connection).await {
            Ok(channel) => self
                .create_consumer(&channel, &consumer_tag)
                .await
                .map(|consumer| (channel, consumer)),
            Err(e) => Err(e),
        };

        match opened {
            Ok((channel, consumer)) => Ok((
                Link {
                    connection,
                    channel,
                    consumer_tag,
                    events,
                },
                consumer,
            )),
            Err(e) => {
                events.abort();
                if let Err(close_error) = connection.close(200, "Setup failed").await {
                    debug!("关闭未完成的连接失败: {close_error}");
                }
                Err(e)
            }
        }
    }
}

/// 把连接事件中的错误转发到传输层错误通道
fn forward_connection_events(
    connection: &Connection,
    error_tx: mpsc::Sender<TransportError>,
) -> JoinHandle<()> {
    let mut events = Box::pin(connection.events_listener());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Event::Error(e) => {
                    if let Err(send_error) =
                        error_tx.try_send(TransportError::Connection(e.to_string()))
                    {
                        warn!("无法上报RabbitMQ连接错误: {send_error}");
                    }
                }
                Event::ConnectionBlocked(reason) => warn!("RabbitMQ连接被阻塞: {reason}"),
                Event::ConnectionUnblocked => info!("RabbitMQ连接已解除阻塞"),
                other => debug!("RabbitMQ连接事件: {other:?}"),
            }
        }
    })
}

/// 消费循环结束的原因
#[derive(Debug, PartialEq, Eq)]
enum ConsumeEnd {
    Stopped,
    Lost(String),
}

/// 重复执行 `attempt` 直到成功，失败后按退避等待；关闭信号触发时返回 `None`
async fn retry_with_backoff<T, F, Fut>(
    backoff: ReconnectBackoff,
    stop: &ShutdownToken,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => return None,
            result = attempt() => result,
        };

        match result {
            Ok(value) => return Some(value),
            Err(e) => {
                warn!(attempt = attempts, "RabbitMQ重连失败: {e}, {delay:?}后重试");
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = backoff.next(delay);
            }
        }
    }
}

/// RabbitMQ传输实现（生产环境绑定）
///
/// 手动确认模式消费工作队列，死信通过发布到死信队列并等待发布确认后再确认原消息实现。
/// 消费者流中断（连接断开、代理重启）后按退避重新建立连接、通道和消费者，
/// 直到停止处理为止。
pub struct RabbitMqTransport {
    connector: Arc<Connector>,
    processor: Arc<DeliveryProcessor>,
    backoff: ReconnectBackoff,
    session: Mutex<Option<Session>>,
}

impl RabbitMqTransport {
    pub fn new(config: TransportConfig, drain_timeout: Duration) -> Result<Self> {
        let url = config
            .build_url()
            .map_err(|e| IdentityError::Configuration(format!("{e:#}")))?;
        let processor = Arc::new(DeliveryProcessor::new(
            "rabbitmq",
            config.max_concurrent_messages,
            drain_timeout,
        ));

        Ok(Self {
            connector: Arc::new(Connector {
                config,
                url,
                error_tx: processor.error_sender(),
            }),
            processor,
            backoff: ReconnectBackoff::default(),
            session: Mutex::new(None),
        })
    }

    /// 替换默认的重连退避
    pub fn with_reconnect_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.connector.config.queue_name
    }

    pub fn dead_letter_queue(&self) -> String {
        self.connector.dead_letter_queue()
    }

    pub async fn is_connected(&self) -> bool {
        let Some(link) = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.link.clone())
        else {
            return false;
        };
        let connected = link
            .lock()
            .await
            .as_ref()
            .is_some_and(|link| link.connection.status().connected());
        connected
    }

    async fn run_intake(
        processor: Arc<DeliveryProcessor>,
        connector: Arc<Connector>,
        link: Arc<Mutex<Option<Link>>>,
        mut consumer: Consumer,
        backoff: ReconnectBackoff,
        stop: ShutdownToken,
    ) {
        let dead_letter_queue = connector.dead_letter_queue();
        loop {
            let channel = match link.lock().await.as_ref() {
                Some(current) => current.channel.clone(),
                None => break,
            };

            let reason = match consume(&processor, &mut consumer, &channel, &dead_letter_queue, &stop)
                .await
            {
                ConsumeEnd::Stopped => break,
                ConsumeEnd::Lost(reason) => reason,
            };

            warn!("RabbitMQ消费中断: {reason}, 开始重连");
            processor.report_error(TransportError::Consumer(reason));

            let lost = link.lock().await.take();
            if let Some(lost) = lost {
                match tokio::time::timeout(connector.connection_timeout(), lost.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("关闭中断的连接失败: {e}"),
                    Err(_) => debug!("关闭中断的连接超时"),
                }
            }

            let (connector_ref, processor_ref) = (connector.as_ref(), processor.as_ref());
            let reconnected = retry_with_backoff(backoff, &stop, move || async move {
                connector_ref.establish().await.inspect_err(|e| {
                    processor_ref.report_error(TransportError::Connection(e.to_string()))
                })
            })
            .await;

            match reconnected {
                Some((established, next_consumer)) => {
                    info!("RabbitMQ重连成功, 消费者: {}", established.consumer_tag);
                    *link.lock().await = Some(established);
                    consumer = next_consumer;
                }
                None => break,
            }
        }
        debug!("RabbitMQ传输停止接收消息");
    }
}

async fn consume(
    processor: &DeliveryProcessor,
    consumer: &mut Consumer,
    channel: &Channel,
    dead_letter_queue: &str,
    stop: &ShutdownToken,
) -> ConsumeEnd {
    loop {
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => return ConsumeEnd::Stopped,
            permit = processor.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    processor.report_error(TransportError::Consumer(e.to_string()));
                    return ConsumeEnd::Stopped;
                }
            },
        };

        let delivery = tokio::select! {
            biased;
            _ = stop.cancelled() => return ConsumeEnd::Stopped,
            delivery = consumer.next() => delivery,
        };

        match delivery {
            Some(Ok(delivery)) => {
                let message = inbound_message(delivery, channel, dead_letter_queue);
                if let Err(e) = processor.spawn(permit, message) {
                    processor.report_error(TransportError::Consumer(e.to_string()));
                    return ConsumeEnd::Stopped;
                }
            }
            Some(Err(e)) => return ConsumeEnd::Lost(e.to_string()),
            None => return ConsumeEnd::Lost("消费者流已结束".to_string()),
        }
    }
}

#[async_trait]
impl Transport for RabbitMqTransport {
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.processor.set_handler(handler)
    }

    async fn start_processing(&self) -> Result<()> {
        self.processor.handler()?;

        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(IdentityError::AlreadyProcessing);
        }

        let (established, consumer) = self.connector.establish().await?;
        let link = Arc::new(Mutex::new(Some(established)));

        self.processor.begin();
        let stop = ShutdownToken::new();
        let intake = tokio::spawn(Self::run_intake(
            self.processor.clone(),
            self.connector.clone(),
            link.clone(),
            consumer,
            self.backoff,
            stop.clone(),
        ));

        *session = Some(Session { link, stop, intake });

        let config = &self.connector.config;
        info!(
            "开始消费队列 {} (prefetch={}, max_concurrent={})",
            config.queue_name, config.prefetch_count, config.max_concurrent_messages
        );
        Ok(())
    }

    async fn stop_processing(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        session.stop.cancel();
        if let Err(e) = session.intake.await {
            warn!("RabbitMQ接收任务异常退出: {e}");
        }

        let link = session.link.lock().await.take();
        if let Some(link) = &link {
            if let Err(e) = link
                .channel
                .basic_cancel(&link.consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!("取消消费者失败: {e}");
            }
        }

        self.processor.drain().await?;

        if let Some(link) = link {
            link.close().await?;
        }

        info!("RabbitMQ连接已关闭");
        Ok(())
    }

    fn take_error_receiver(&self) -> Option<mpsc::Receiver<TransportError>> {
        self.processor.take_error_receiver()
    }

    fn name(&self) -> &'static str {
        "rabbitmq"
    }
}

async fn declare_queue(channel: &Channel, queue_name: &str) -> Result<Queue> {
    let queue = channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| IdentityError::MessageQueue(format!("声明队列 {queue_name} 失败: {e}")))?;

    debug!("队列 {} 声明成功", queue_name);
    Ok(queue)
}

fn consumer_tag() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("identity-worker-{}-{}", host, &suffix[..8])
}

fn inbound_message(delivery: Delivery, channel: &Channel, dead_letter_queue: &str) -> InboundMessage {
    let correlation_id = correlation_id(&delivery.properties);
    let delivery_count = delivery_count(&delivery);

    let settlement = RabbitMqSettlement {
        channel: channel.clone(),
        delivery_tag: delivery.delivery_tag,
        dead_letter_queue: dead_letter_queue.to_string(),
        body: delivery.data.clone(),
        correlation_id: correlation_id.clone(),
        content_type: delivery.properties.content_type().clone(),
    };

    InboundMessage::new(delivery.data, correlation_id, Box::new(settlement))
        .with_delivery_count(delivery_count)
}

/// 关联ID依次取自 `correlation_id`、`message_id`，都缺失时生成新的UUID
pub fn correlation_id(properties: &BasicProperties) -> String {
    properties
        .correlation_id()
        .as_ref()
        .or(properties.message_id().as_ref())
        .map(|id| id.as_str().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn delivery_count(delivery: &Delivery) -> u32 {
    let from_header = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
                .and_then(|(_, value)| header_count(value))
        });

    match from_header {
        Some(previous) => previous.saturating_add(1),
        None if delivery.redelivered => 2,
        None => 1,
    }
}

fn header_count(value: &AMQPValue) -> Option<u32> {
    let count = match value {
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        _ => return None,
    };
    u32::try_from(count).ok()
}

struct RabbitMqSettlement {
    channel: Channel,
    delivery_tag: u64,
    dead_letter_queue: String,
    body: Vec<u8>,
    correlation_id: String,
    content_type: Option<ShortString>,
}

impl RabbitMqSettlement {
    async fn ack(&self) -> Result<()> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("确认消息失败: {e}")))
    }
}

#[async_trait]
impl Settlement for RabbitMqSettlement {
    async fn complete(&mut self) -> Result<()> {
        self.ack().await
    }

    async fn dead_letter(&mut self, reason: &str) -> Result<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            DEAD_LETTER_REASON_HEADER.into(),
            AMQPValue::LongString(LongString::from(reason)),
        );

        let mut properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_correlation_id(self.correlation_id.as_str().into())
            .with_headers(headers);
        if let Some(content_type) = self.content_type.clone() {
            properties = properties.with_content_type(content_type);
        }

        let confirmation = self
            .channel
            .basic_publish(
                "",
                &self.dead_letter_queue,
                BasicPublishOptions::default(),
                &self.body,
                properties,
            )
            .await
            .map_err(|e| {
                IdentityError::MessageQueue(format!(
                    "发布死信到队列 {} 失败: {e}",
                    self.dead_letter_queue
                ))
            })?
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("死信发布确认失败: {e}")))?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(IdentityError::MessageQueue(format!(
                "死信队列 {} 拒绝了消息",
                self.dead_letter_queue
            )));
        }

        self.ack().await
    }

    async fn abandon(&mut self) -> Result<()> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("放弃消息失败: {e}")))
    }
}

/// 向工作队列发布动作请求的客户端
pub struct RabbitMqPublisher {
    connection: Connection,
    channel: Channel,
}

impl RabbitMqPublisher {
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("创建通道失败: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("开启发布确认失败: {e}")))?;

        Ok(Self {
            connection,
            channel,
        })
    }

    /// 持久化发布一条消息，返回其关联ID
    pub async fn publish(&self, queue: &str, body: &[u8]) -> Result<String> {
        declare_queue(&self.channel, queue).await?;

        let message_id = uuid::Uuid::new_v4().to_string();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into())
            .with_message_id(message_id.as_str().into())
            .with_correlation_id(correlation_id.as_str().into());

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("发布消息到队列 {queue} 失败: {e}")))?
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("消息发布确认失败: {e}")))?;

        debug!("消息已发布到队列: {}", queue);
        Ok(correlation_id)
    }

    pub async fn close(self) -> Result<()> {
        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!("关闭通道失败: {e}");
        }
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| IdentityError::MessageQueue(format!("关闭连接失败: {e}")))
    }
}
