use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ad_identity_core::{
    errors::TransportError, Directory, IdentityError, MessageHandler, Result, Transport,
};
use ad_identity_dispatcher::MessageDispatcher;

/// Worker服务接口
#[async_trait]
pub trait WorkerServiceTrait: Send + Sync {
    /// 启动Worker服务
    async fn start(&self) -> Result<()>;

    /// 停止Worker服务，等待进行中的消息结算
    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> bool;
}

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    transport: Arc<dyn Transport>,
    directory: Arc<dyn Directory>,
    worker_id: String,
}

impl WorkerServiceBuilder {
    pub fn new(transport: Arc<dyn Transport>, directory: Arc<dyn Directory>) -> Self {
        let host = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();

        Self {
            transport,
            directory,
            worker_id: format!("identity-worker@{host}"),
        }
    }

    /// 设置Worker标识（用于日志）
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// 构建WorkerService，并把分发器注册为传输层的消息处理器
    pub fn build(self) -> Result<WorkerService> {
        let dispatcher = Arc::new(MessageDispatcher::new(self.directory));
        let handler: Arc<dyn MessageHandler> = dispatcher;
        self.transport.set_message_handler(handler)?;

        Ok(WorkerService {
            worker_id: self.worker_id,
            transport: self.transport,
            error_monitor: Mutex::new(None),
            is_running: RwLock::new(false),
        })
    }
}

/// Worker服务实现
///
/// 组合传输层与消息分发器，并把传输层错误通道中的错误写入日志。
pub struct WorkerService {
    worker_id: String,
    transport: Arc<dyn Transport>,
    error_monitor: Mutex<Option<JoinHandle<()>>>,
    is_running: RwLock<bool>,
}

impl WorkerService {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    async fn start_error_monitor(&self) {
        let mut monitor = self.error_monitor.lock().await;
        if monitor.is_some() {
            return;
        }

        match self.transport.take_error_receiver() {
            Some(receiver) => {
                let transport = self.transport.name();
                *monitor = Some(tokio::spawn(monitor_transport_errors(transport, receiver)));
            }
            None => warn!("传输层错误通道已被取走，错误将不会被记录"),
        }
    }
}

async fn monitor_transport_errors(
    transport: &'static str,
    mut receiver: mpsc::Receiver<TransportError>,
) {
    while let Some(e) = receiver.recv().await {
        error!(transport, "Transport error: {e}");
    }
}

#[async_trait]
impl WorkerServiceTrait for WorkerService {
    async fn start(&self) -> Result<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(IdentityError::AlreadyProcessing);
        }

        info!("启动Worker服务: {}", self.worker_id);

        self.start_error_monitor().await;
        self.transport.start_processing().await?;

        *is_running = true;
        info!(
            "Worker服务启动成功: {} (transport={})",
            self.worker_id,
            self.transport.name()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }

        info!("停止Worker服务: {}", self.worker_id);

        let result = self.transport.stop_processing().await;
        if let Err(e) = &result {
            error!("停止传输层失败: {e}");
        }

        *is_running = false;
        info!("Worker服务已停止: {}", self.worker_id);
        result
    }

    async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}

impl Drop for WorkerService {
    fn drop(&mut self) {
        if let Some(handle) = self.error_monitor.get_mut().take() {
            handle.abort();
        }
    }
}
