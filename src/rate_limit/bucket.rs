//! 令牌桶限流器
//!
//! 惰性补充：tokens += floor(elapsed / window * capacity)，封顶 capacity。
//! 排队者严格 FIFO；同一时刻每个实例只有一个排空任务（processing 标志），桶空时每隔 window / capacity 再补充一次。
//! 取消的获取不会占用令牌：尚未发放则不扣减，已发放则归还。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BucketSection;
use crate::core::AgentError;

/// 对外状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterStatus {
    pub available_tokens: u32,
    pub max_tokens: u32,
    pub queue_length: usize,
    pub window_ms: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
    waiters: VecDeque<oneshot::Sender<()>>,
    processing: bool,
}

#[derive(Debug)]
struct Shared {
    name: String,
    capacity: u32,
    window: Duration,
    state: Mutex<BucketState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let window_nanos = self.window.as_nanos();
        if window_nanos == 0 {
            state.tokens = self.capacity;
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill).as_nanos();
        let to_add = elapsed.saturating_mul(self.capacity as u128) / window_nanos;
        if to_add > 0 {
            let to_add = u32::try_from(to_add).unwrap_or(u32::MAX);
            state.tokens = state.tokens.saturating_add(to_add).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// 桶空时两次补充之间的间隔
    fn refill_interval(&self) -> Duration {
        let interval = self.window / self.capacity;
        interval.max(Duration::from_millis(1))
    }
}

/// 令牌桶；Clone 共享同一个桶，应每个受保护资源构造一次
#[derive(Debug, Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                capacity,
                window,
                state: Mutex::new(BucketState {
                    tokens: capacity,
                    last_refill: Instant::now(),
                    waiters: VecDeque::new(),
                    processing: false,
                }),
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, cfg: &BucketSection) -> Self {
        Self::new(name, cfg.capacity, cfg.window())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 获取一个令牌（必要时排队等待）
    pub async fn acquire(&self) -> Result<(), AgentError> {
        self.acquire_with_cancel(&CancellationToken::new()).await
    }

    /// 可取消的获取；取消时返回 Cancelled 且不占用令牌
    pub async fn acquire_with_cancel(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut rx = {
            let mut state = self.shared.lock();
            self.shared.refill(&mut state);
            if state.waiters.is_empty() && state.tokens > 0 {
                state.tokens -= 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            tracing::debug!(
                limiter = %self.shared.name,
                queue_length = state.waiters.len(),
                "rate limiter exhausted, request queued"
            );
            if !state.processing {
                state.processing = true;
                tokio::spawn(drain(Arc::clone(&self.shared)));
            }
            rx
        };

        tokio::select! {
            granted = &mut rx => granted.map_err(|_| AgentError::Cancelled),
            _ = cancel.cancelled() => {
                rx.close();
                if rx.try_recv().is_ok() {
                    self.release();
                }
                Err(AgentError::Cancelled)
            }
        }
    }

    /// 归还一个已发放但未使用的令牌
    pub(crate) fn release(&self) {
        let mut state = self.shared.lock();
        state.tokens = state.tokens.saturating_add(1).min(self.shared.capacity);
    }

    /// 先获取令牌再执行 f；每次调用恰好消耗一个令牌
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AgentError>,
    {
        self.acquire().await?;
        f().await
    }

    pub fn status(&self) -> RateLimiterStatus {
        let mut state = self.shared.lock();
        self.shared.refill(&mut state);
        RateLimiterStatus {
            available_tokens: state.tokens,
            max_tokens: self.shared.capacity,
            queue_length: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            window_ms: self.shared.window.as_millis() as u64,
        }
    }

    /// 令牌补满并清空排队（排队者收到 Cancelled）
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        state.tokens = self.shared.capacity;
        state.last_refill = Instant::now();
        state.waiters.clear();
    }
}

/// 排空任务：补充、按 FIFO 逐个发放；队列清空后退出并清除 processing
async fn drain(shared: Arc<Shared>) {
    loop {
        {
            let mut state = shared.lock();
            shared.refill(&mut state);
            while state.tokens > 0 {
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                if waiter.send(()).is_ok() {
                    state.tokens -= 1;
                }
            }
            state.waiters.retain(|w| !w.is_closed());
            if state.waiters.is_empty() {
                state.processing = false;
                return;
            }
        }
        tokio::time::sleep(shared.refill_interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use super::*;

    #[tokio::test]
    async fn test_capacity_then_wait() {
        let limiter = RateLimiter::new("test", 2, Duration::from_millis(200));
        let started = StdInstant::now();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.status().available_tokens, 0);

        limiter.acquire().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let limiter = RateLimiter::new("fifo", 1, Duration::from_millis(60));
        limiter.acquire().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = limiter.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await.unwrap();
                tx.send(i).unwrap();
            }));
            // 保证入队顺序
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(tx);
        let mut order = Vec::new();
        while let Some(i) = rx.recv().await {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_does_not_consume() {
        let limiter = RateLimiter::new("cancel", 1, Duration::from_millis(300));
        limiter.acquire().await.unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = limiter.acquire_with_cancel(&token).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(350)).await;
        let status = limiter.status();
        assert_eq!(status.available_tokens, 1);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_execute_and_reset() {
        let limiter = RateLimiter::new("exec", 3, Duration::from_secs(100));
        let value: Result<u32, AgentError> = limiter.execute(|| async { Ok(7) }).await;
        assert_eq!(value.unwrap(), 7);
        assert_eq!(limiter.status().available_tokens, 2);

        limiter.reset();
        let status = limiter.status();
        assert_eq!(status.available_tokens, 3);
        assert_eq!(status.max_tokens, 3);
        assert_eq!(status.window_ms, 100_000);
    }
}
