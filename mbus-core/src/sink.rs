//! 错误上报（ErrorSink）
//!
//! 完整性违规（释放后使用、带未投递消息释放、重复释放等）除了以 `Err` 返回给调用方，
//! 还会交给根总线配置的 `ErrorSink`，保证即便调用方忽略返回值也能被诊断。
//!
use crate::error::BusError;
use parking_lot::Mutex;

/// 完整性违规的上报出口
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &BusError);
}

/// 默认实现：写入 `tracing` 的 error 级别日志
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &BusError) {
        tracing::error!(error = %error, "message bus integrity violation");
    }
}

/// 收集所有上报内容，便于测试与诊断面板读取
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    reports: Mutex<Vec<String>>,
}

impl CollectingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已上报内容的快照
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().clone()
    }

    /// 取出并清空已上报内容
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.reports.lock())
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl ErrorSink for CollectingErrorSink {
    fn report(&self, error: &BusError) {
        tracing::debug!(error = %error, "integrity violation collected");
        self.reports.lock().push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_keeps_reports_in_order() {
        let sink = CollectingErrorSink::new();
        sink.report(&BusError::BusDisposed {
            owner: "app".into(),
        });
        sink.report(&BusError::DisposeInProgress {
            owner: "module".into(),
        });

        assert_eq!(sink.len(), 2);
        let reports = sink.take();
        assert_eq!(reports[0], "message bus is disposed: owner=app");
        assert_eq!(reports[1], "dispose already in progress: owner=module");
        assert!(sink.is_empty());
    }
}
