use anyhow::{Context, Result};
use tracing::info;

use ad_identity_core::{config::AppConfig, ShutdownToken};
use ad_identity_infrastructure::{create_directory, TransportFactory};
use ad_identity_worker::{WorkerService, WorkerServiceBuilder, WorkerServiceTrait};

/// 主应用程序
pub struct Application {
    config: AppConfig,
    worker: WorkerService,
}

impl Application {
    /// 创建新的应用实例：按配置装配目录、传输层和Worker服务
    pub fn new(config: AppConfig) -> Result<Self> {
        info!(
            "初始化应用程序，环境: {:?}, 传输: {}",
            config.environment,
            TransportFactory::get_type_string(config.environment)
        );

        let directory = create_directory(&config).context("创建目录服务失败")?;
        let transport = TransportFactory::create(&config).context("创建传输层失败")?;
        let worker = WorkerServiceBuilder::new(transport, directory)
            .build()
            .context("创建Worker服务失败")?;

        Ok(Self { config, worker })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn worker(&self) -> &WorkerService {
        &self.worker
    }

    /// 运行直到关闭信号触发，然后排空进行中的消息
    pub async fn run(&self, shutdown: ShutdownToken) -> Result<()> {
        info!("启动应用程序: {}", self.worker.worker_id());
        self.worker.start().await.context("启动Worker服务失败")?;

        shutdown.cancelled().await;

        info!("应用程序收到关闭信号");
        self.worker.stop().await.context("停止Worker服务失败")?;
        Ok(())
    }
}
