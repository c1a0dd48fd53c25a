use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::{IdentityError, Result};

/// 关闭信号观察端
///
/// 可廉价克隆，传入每一个阻塞调用，关闭触发后所有持有者都能观察到。
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 触发关闭，重复调用无副作用
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// 等待关闭信号
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // 发送端由自身持有，wait_for不会因通道关闭而返回错误
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// 在关闭信号触发前运行future，信号先到达时返回 `IdentityError::Cancelled`
    pub async fn run_until_cancelled<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(IdentityError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(IdentityError::Cancelled),
            output = future => Ok(output),
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancel_is_observed_by_clones() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        let waiter = tokio::spawn(async move { clone.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = timeout(Duration::from_millis(100), waiter).await;
        assert!(result.is_ok());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_cancel() {
        let token = ShutdownToken::new();
        token.cancel();
        token.cancel();

        let result = timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let token = ShutdownToken::new();
        let value = token.run_until_cancelled(async { 7 }).await.unwrap();
        assert_eq!(value, 7);

        let slow_token = token.clone();
        let slow = tokio::spawn(async move {
            slow_token
                .run_until_cancelled(tokio::time::sleep(Duration::from_secs(10)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = timeout(Duration::from_millis(100), slow).await.unwrap().unwrap();
        assert!(matches!(result, Err(IdentityError::Cancelled)));
    }
}
