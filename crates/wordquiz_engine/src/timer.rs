use log::debug;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use wordquiz_core::QuizEvent;

#[derive(Debug, Default)]
struct StopwatchState {
    accumulated: Duration,
    resumed_at: Option<Instant>,
}

/// 可暂停的计时器，暂停期间不计时。克隆出的句柄共享状态。
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    inner: Arc<Mutex<StopwatchState>>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清零并开始计时
    pub fn start(&self) {
        let mut state = self.inner.lock();
        state.accumulated = Duration::ZERO;
        state.resumed_at = Some(Instant::now());
    }

    pub fn pause(&self) {
        let mut state = self.inner.lock();
        if let Some(since) = state.resumed_at.take() {
            state.accumulated += since.elapsed();
        }
    }

    pub fn resume(&self) {
        let mut state = self.inner.lock();
        if state.resumed_at.is_none() {
            state.resumed_at = Some(Instant::now());
        }
    }

    pub fn reset(&self) {
        *self.inner.lock() = StopwatchState::default();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().resumed_at.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        let state = self.inner.lock();
        state.accumulated + state.resumed_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// 已用整秒数
    pub fn elapsed_secs(&self) -> i64 {
        i64::try_from(self.elapsed().as_secs()).unwrap_or(i64::MAX)
    }
}

/// 每秒发送一次 [`QuizEvent::Tick`] 的后台任务
#[derive(Debug, Default)]
pub struct Ticker {
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动（会先停掉已有的任务）。没有 tokio 运行时或没有订阅者时不启动。
    pub fn start(&mut self, stopwatch: Stopwatch, event_tx: Option<mpsc::Sender<QuizEvent>>) {
        self.stop();

        let Some(tx) = event_tx else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("没有 tokio 运行时，跳过计时事件");
            return;
        };

        self.handle = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // 第一次 tick 立即返回
            interval.tick().await;
            loop {
                interval.tick().await;
                let event = QuizEvent::Tick {
                    elapsed_secs: stopwatch.elapsed_secs(),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_time_is_not_counted() {
        let watch = Stopwatch::new();
        watch.start();
        std::thread::sleep(Duration::from_millis(20));
        watch.pause();
        let frozen = watch.elapsed();
        assert!(frozen >= Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(watch.elapsed(), frozen);
        assert!(!watch.is_running());

        watch.resume();
        assert!(watch.is_running());
        assert!(watch.elapsed() >= frozen);

        watch.reset();
        assert_eq!(watch.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_ticker_without_runtime_is_noop() {
        let (tx, _rx) = mpsc::channel();
        let mut ticker = Ticker::new();
        ticker.start(Stopwatch::new(), Some(tx));
        assert!(!ticker.is_running());
    }

    #[tokio::test]
    async fn test_ticker_emits_and_stops() {
        let (tx, rx) = mpsc::channel();
        let watch = Stopwatch::new();
        watch.start();

        let mut ticker = Ticker::new();
        ticker.start(watch, Some(tx));
        assert!(ticker.is_running());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(matches!(rx.try_recv(), Ok(QuizEvent::Tick { .. })));

        ticker.stop();
        assert!(!ticker.is_running());
    }

    #[tokio::test]
    async fn test_restart_cancels_previous_task() {
        let (tx, _rx) = mpsc::channel();
        let mut ticker = Ticker::new();
        ticker.start(Stopwatch::new(), Some(tx.clone()));
        let first = ticker.handle.as_ref().map(|h| h.abort_handle()).unwrap();

        ticker.start(Stopwatch::new(), Some(tx));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(first.is_finished());
        assert!(ticker.is_running());
    }
}
