use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use ad_identity_core::{config::TransportConfig, ActionRequest, ActionType, IdentityType};
use ad_identity_infrastructure::RabbitMqPublisher;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化简单的日志系统
    tracing_subscriber::fmt::init();

    let cli = CliApp::parse();
    cli.run().await
}

/// 向工作队列发送启用/禁用动作
#[derive(Parser, Debug)]
#[command(name = "identity-cli")]
#[command(version)]
#[command(about = "身份动作Worker - 消息发送工具")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 通过连接字符串发送
    Conn {
        /// AMQP连接字符串
        connection_string: String,
        #[command(flatten)]
        action: ActionArgs,
    },
    /// 通过主机和凭据发送
    Host {
        /// RabbitMQ主机地址
        host: String,
        #[command(flatten)]
        action: ActionArgs,
        #[arg(long, default_value_t = 5672)]
        port: u16,
        #[arg(long, default_value = "/")]
        vhost: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ActionArgs {
    /// 工作队列名称
    queue: String,
    /// 标识符类型（Sid、SamAccountName、Guid ...）
    #[arg(value_parser = parse_identity_type)]
    identity_type: IdentityType,
    /// 标识符值
    identity: String,
    /// 动作（Enable 或 Disable）
    #[arg(value_parser = parse_action)]
    action: ActionType,
}

fn parse_identity_type(raw: &str) -> Result<IdentityType, String> {
    raw.parse().map_err(|e| format!("{e}"))
}

fn parse_action(raw: &str) -> Result<ActionType, String> {
    raw.parse().map_err(|e| format!("{e}"))
}

impl CliApp {
    async fn run(self) -> Result<()> {
        let (url, action) = match self.command {
            Commands::Conn {
                connection_string,
                action,
            } => (connection_string, action),
            Commands::Host {
                host,
                action,
                port,
                vhost,
                username,
                password,
            } => {
                let config = TransportConfig {
                    host: Some(host),
                    port,
                    vhost,
                    username,
                    password,
                    ..Default::default()
                };
                let url = config
                    .build_url()
                    .context("无法根据主机参数构建连接地址")?;
                (url, action)
            }
        };

        let request = ActionRequest::new(action.action, action.identity_type, action.identity);
        let body = request.to_json().context("序列化动作请求失败")?;

        let publisher = RabbitMqPublisher::connect(&url)
            .await
            .context("连接RabbitMQ失败")?;
        let correlation_id = publisher
            .publish(&action.queue, body.as_bytes())
            .await
            .context("发送消息失败")?;
        publisher.close().await.context("关闭连接失败")?;

        tracing::debug!("correlation_id: {correlation_id}");
        println!("Message sent: {body}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conn_command() {
        let cli = CliApp::try_parse_from([
            "identity-cli",
            "conn",
            "amqp://localhost",
            "identity-actions",
            "sid",
            "S-1-5-21-1001",
            "disable",
        ])
        .unwrap();

        match cli.command {
            Commands::Conn {
                connection_string,
                action,
            } => {
                assert_eq!(connection_string, "amqp://localhost");
                assert_eq!(action.queue, "identity-actions");
                assert_eq!(action.identity_type, IdentityType::Sid);
                assert_eq!(action.action, ActionType::Disable);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_host_command_with_options() {
        let cli = CliApp::try_parse_from([
            "identity-cli",
            "host",
            "rabbit.local",
            "identity-actions",
            "SamAccountName",
            "jdoe",
            "Enable",
            "--username",
            "svc",
            "--password",
            "secret",
        ])
        .unwrap();

        match cli.command {
            Commands::Host {
                host,
                port,
                username,
                ..
            } => {
                assert_eq!(host, "rabbit.local");
                assert_eq!(port, 5672);
                assert_eq!(username.as_deref(), Some("svc"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_action() {
        let result = CliApp::try_parse_from([
            "identity-cli",
            "conn",
            "amqp://localhost",
            "q",
            "Sid",
            "S-1-5-18",
            "Delete",
        ]);
        assert!(result.is_err());
    }
}
