use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info, info_span, warn, Instrument};

use ad_identity_core::{
    ActionRequest, ActionType, DeadLetterReason, Directory, Disposition, IdentityError,
    IdentityResult, IdentityType, InboundMessage, MessageHandler, Principal, ShutdownToken,
};
use ad_identity_core::errors::DirectoryError;

/// 消息分发器
///
/// 对每条入站消息执行单次线性状态机：解析、解析身份、应用动作、持久化、结算。
/// 每条消息恰好得到一个终态（完成或死信）；死信之前不会对目录产生任何写入。
/// 关闭信号打断目录调用时，消息被放弃并交还传输层重新投递。
pub struct MessageDispatcher {
    directory: Arc<dyn Directory>,
}

impl MessageDispatcher {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// 处理并结算一条消息，返回结算的处置结果
    pub async fn dispatch(
        &self,
        message: InboundMessage,
        shutdown: &ShutdownToken,
    ) -> IdentityResult<Disposition> {
        let span = info_span!(
            "message",
            correlation_id = %message.correlation_id(),
            delivery_count = message.delivery_count()
        );

        async move {
            counter!("identity_messages_received_total").increment(1);
            info!("Message received");
            debug!("Message body: {}", message.body_lossy());

            match self.process(message.body(), shutdown).await {
                Ok(Disposition::Completed) => {
                    message.complete().await?;
                    counter!("identity_messages_completed_total").increment(1);
                    info!("Message completed");
                    Ok(Disposition::Completed)
                }
                Ok(Disposition::DeadLettered(reason)) => {
                    message.dead_letter(reason.as_str()).await?;
                    counter!("identity_messages_dead_lettered_total", "reason" => reason.as_str())
                        .increment(1);
                    warn!(reason = %reason, "Message dead-lettered");
                    Ok(Disposition::DeadLettered(reason))
                }
                Err(IdentityError::Cancelled) => {
                    warn!("Shutdown interrupted processing, abandoning message for redelivery");
                    message.abandon().await?;
                    Err(IdentityError::Cancelled)
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span)
        .await
    }

    /// 计算处置结果，不结算消息
    ///
    /// 只有关闭信号会让它返回错误；其余失败都转换为死信处置。
    async fn process(&self, body: &[u8], shutdown: &ShutdownToken) -> IdentityResult<Disposition> {
        let request = match ActionRequest::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Action not parsable, disregarding: {e}");
                return Ok(Disposition::DeadLettered(DeadLetterReason::ParsingFailed));
            }
        };

        let lookup_type = match request.identity_type {
            IdentityType::Sid | IdentityType::SamAccountName | IdentityType::Guid => {
                request.identity_type
            }
            IdentityType::Name | IdentityType::UserPrincipalName | IdentityType::DistinguishedName => {
                warn!(
                    "Identity type {}, not supported, disregarding...",
                    request.identity_type
                );
                return Ok(Disposition::DeadLettered(
                    DeadLetterReason::IdentityTypeNotSupported,
                ));
            }
            _ => {
                warn!(
                    "Identity type {}, not wired for resolution, disregarding...",
                    request.identity_type
                );
                return Ok(Disposition::DeadLettered(
                    DeadLetterReason::IdentityTypeNotSupported,
                ));
            }
        };

        let lookup = self.directory.find_by_identity(lookup_type, &request.identity);
        let mut principal = match shutdown.run_until_cancelled(lookup).await? {
            Ok(principal) => principal,
            Err(e) => {
                let reason = resolution_failure_reason(&e);
                warn!(
                    identity_type = %lookup_type,
                    identity = %request.identity,
                    "Failed to resolve identity: {e}"
                );
                return Ok(Disposition::DeadLettered(reason));
            }
        };

        // principal 在离开作用域时释放，覆盖之后的每一条退出路径
        let enabled = match request.action {
            ActionType::Enable => true,
            ActionType::Disable => false,
            _ => {
                warn!("Action {}, not supported, disregarding...", request.action);
                return Ok(Disposition::DeadLettered(DeadLetterReason::ActionNotSupported));
            }
        };

        apply(principal.as_mut(), enabled);

        match shutdown.run_until_cancelled(principal.save()).await? {
            Ok(()) => {
                info!("Changes to {} saved", principal.display_name());
                Ok(Disposition::Completed)
            }
            Err(DirectoryError::Validation(detail)) => {
                warn!(
                    "Directory rejected changes to {}: {detail}",
                    principal.display_name()
                );
                Ok(Disposition::DeadLettered(DeadLetterReason::SaveFailed))
            }
            Err(e) => {
                warn!(
                    "Unexpected fault saving changes to {}: {e}",
                    principal.display_name()
                );
                Ok(Disposition::DeadLettered(DeadLetterReason::SaveFailed))
            }
        }
    }
}

fn apply(principal: &mut dyn Principal, enabled: bool) {
    if principal.enabled() == enabled {
        info!(
            "Identity {} already {}, saving unchanged state",
            principal.display_name(),
            state_label(enabled)
        );
    }
    principal.set_enabled(enabled);
    info!("Identity {} {}", principal.display_name(), state_label(enabled));
}

fn state_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// 解析失败形态到死信原因的映射，各形态互不合并
pub fn resolution_failure_reason(error: &DirectoryError) -> DeadLetterReason {
    match error {
        DirectoryError::FormatMismatch => DeadLetterReason::IdentityFormatMismatch,
        DirectoryError::MultipleMatches(_) => DeadLetterReason::MultipleMatches,
        DirectoryError::NoMatch => DeadLetterReason::NoMatch,
        DirectoryError::Validation(_) | DirectoryError::Unknown(_) => {
            DeadLetterReason::UnknownResolutionFault
        }
    }
}

#[async_trait]
impl MessageHandler for MessageDispatcher {
    async fn handle(&self, message: InboundMessage, shutdown: ShutdownToken) -> IdentityResult<()> {
        self.dispatch(message, &shutdown).await.map(|_| ())
    }
}
