#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use speedwatch::measurement::{
    CancelToken, MeasurementProvider, ProgressSink, ProviderError, ServerDescriptor,
    SpeedTestEngine,
};
use speedwatch::settings::SpeedTestConfig;

/// Provider whose answers and failures are set up by the test.
pub struct ScriptedProvider {
    reachable: AtomicBool,
    failures: Mutex<VecDeque<ProviderError>>,
    always: Mutex<Option<ProviderError>>,
    download_bps: f64,
    upload_bps: f64,
    ping_ms: f64,
    transfer_time: Duration,
    cancel_on_upload: Mutex<Option<CancelToken>>,
    pub connectivity_calls: AtomicUsize,
    pub select_calls: AtomicUsize,
    pub latency_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
}

impl ScriptedProvider {
    /// 100 Mbps down, 20 Mbps up, 15 ms.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            failures: Mutex::new(VecDeque::new()),
            always: Mutex::new(None),
            download_bps: 100_000_000.0,
            upload_bps: 20_000_000.0,
            ping_ms: 15.0,
            transfer_time: Duration::ZERO,
            cancel_on_upload: Mutex::new(None),
            connectivity_calls: AtomicUsize::new(0),
            select_calls: AtomicUsize::new(0),
            latency_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_speeds(mut self, download_bps: f64, upload_bps: f64, ping_ms: f64) -> Self {
        self.download_bps = download_bps;
        self.upload_bps = upload_bps;
        self.ping_ms = ping_ms;
        self
    }

    /// Make each transfer take `d`, checking for cancellation as it goes.
    pub fn with_transfer_time(mut self, d: Duration) -> Self {
        self.transfer_time = d;
        self
    }

    /// Fail the next `n` attempts at server selection with `error`.
    pub fn failing_times(self, n: usize, error: ProviderError) -> Self {
        self.failures.lock().extend(std::iter::repeat(error).take(n));
        self
    }

    pub fn always_failing(self, error: ProviderError) -> Self {
        *self.always.lock() = Some(error);
        self
    }

    pub fn unreachable(self) -> Self {
        self.reachable.store(false, Ordering::SeqCst);
        self
    }

    /// Raise `token` once, during the next upload, and let that upload succeed.
    pub fn cancel_during_next_upload(&self, token: CancelToken) {
        *self.cancel_on_upload.lock() = Some(token);
    }

    pub fn attempts(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.connectivity_calls.load(Ordering::SeqCst)
            + self.select_calls.load(Ordering::SeqCst)
            + self.latency_calls.load(Ordering::SeqCst)
            + self.download_calls.load(Ordering::SeqCst)
            + self.upload_calls.load(Ordering::SeqCst)
    }

    fn transfer(&self, sink: &ProgressSink, bps: f64) -> Result<f64, ProviderError> {
        let started = Instant::now();
        let steps = 4;
        for step in 1..=steps {
            let until = self.transfer_time * step / steps;
            while started.elapsed() < until {
                if sink.is_cancelled() {
                    return Err(ProviderError::Interrupted);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            if sink.is_cancelled() {
                return Err(ProviderError::Interrupted);
            }
            sink.report(Some(step as f64 / steps as f64));
        }
        Ok(bps)
    }
}

impl MeasurementProvider for ScriptedProvider {
    fn check_connectivity(&self, _timeout: Duration) -> bool {
        self.connectivity_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }

    fn select_server(&self) -> Result<ServerDescriptor, ProviderError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.always.lock().clone() {
            return Err(e);
        }
        if let Some(e) = self.failures.lock().pop_front() {
            return Err(e);
        }
        Ok(ServerDescriptor {
            name: "Test ISP".into(),
            host: "speed.test.local".into(),
            url: "http://speed.test.local".into(),
        })
    }

    fn measure_latency(&self, _server: &ServerDescriptor) -> Result<f64, ProviderError> {
        self.latency_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ping_ms)
    }

    fn measure_download(
        &self,
        _server: &ServerDescriptor,
        sink: &ProgressSink,
    ) -> Result<f64, ProviderError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.transfer(sink, self.download_bps)
    }

    fn measure_upload(
        &self,
        _server: &ServerDescriptor,
        sink: &ProgressSink,
    ) -> Result<f64, ProviderError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_on_upload.lock().take() {
            token.cancel();
            return Ok(self.upload_bps);
        }
        self.transfer(sink, self.upload_bps)
    }
}

/// Defaults with short waits so retries and timeouts finish quickly.
pub fn fast_config() -> SpeedTestConfig {
    SpeedTestConfig {
        connectivity_check_timeout: 1.0,
        speedtest_timeout: 2.0,
        retry_delay: 0.02,
        ..SpeedTestConfig::default()
    }
}

pub fn engine(provider: &Arc<ScriptedProvider>, config: SpeedTestConfig) -> Arc<SpeedTestEngine> {
    let provider: Arc<dyn MeasurementProvider> = provider.clone();
    Arc::new(SpeedTestEngine::new(provider, config))
}
