#[cfg(test)]
mod tests {
    use crate::core::{
        AdmissionState, BoxError, LimitTable, ManualClock, QuotaLimit, ThrottleError,
    };
    use crate::executor::{
        AnyDelegate, MemoryCache, Params, RequestExecutor, SharedCache, SharedExecutor,
    };
    use crate::throttler::Throttler;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    /// Records when each call reached the executor
    #[derive(Default)]
    struct RecordingExecutor {
        calls: AtomicUsize,
        admitted_at: Mutex<Vec<Instant>>,
    }

    impl RecordingExecutor {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RequestExecutor<String> for RecordingExecutor {
        async fn invoke(&self, action: &str, params: &Params) -> Result<String, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.admitted_at.lock().push(Instant::now());
            Ok(format!("{action}:{}", params.len()))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl RequestExecutor<String> for FailingExecutor {
        async fn invoke(&self, _action: &str, _params: &Params) -> Result<String, BoxError> {
            Err("RequestThrottled".into())
        }
    }

    /// Paused timers fire on whole milliseconds, so allow a little slack
    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(50),
            "expected about {expected:?}, got {actual:?}"
        );
    }

    fn limits(action: &str, quota_max: u64, restore_rate: f64) -> LimitTable {
        [(action, QuotaLimit::new(quota_max, restore_rate))]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_burst_then_wait_advisory() {
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000));
        let throttler = Throttler::<String>::builder()
            .limits(limits("ListMatchingProducts", 20, 5.0))
            .clock(clock.clone())
            .build()
            .unwrap();
        let params = Params::new();

        for _ in 0..20 {
            assert_eq!(throttler.wait("ListMatchingProducts", 0), Duration::ZERO);
            throttler
                .admit("ListMatchingProducts", &params, 0)
                .await
                .unwrap();
        }

        assert_eq!(
            throttler.wait("ListMatchingProducts", 0),
            Duration::from_secs(5)
        );
        assert_eq!(
            throttler.status("ListMatchingProducts", 0),
            AdmissionState::Wait
        );

        clock.advance(Duration::from_secs(5));
        assert_eq!(throttler.wait("ListMatchingProducts", 0), Duration::ZERO);
        assert_eq!(
            throttler.status("ListMatchingProducts", 0),
            AdmissionState::Ok
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_quota_and_executor() {
        let executor = Arc::new(RecordingExecutor::default());
        let cache = MemoryCache::new();
        cache.insert("GetServiceStatus", &Params::new(), "GREEN".to_string());

        let throttler = Throttler::<String>::builder()
            .shared_executor(executor.clone())
            .cache(cache)
            .build()
            .unwrap();

        let response = throttler
            .admit("GetServiceStatus", &Params::new(), 0)
            .await
            .unwrap();

        assert_eq!(response.as_deref(), Some("GREEN"));
        assert_eq!(throttler.level("GetServiceStatus"), None);
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_is_filled_from_executor() {
        let executor = Arc::new(RecordingExecutor::default());
        let cache: Arc<MemoryCache<String>> = Arc::new(MemoryCache::new());

        let throttler = Throttler::<String>::builder()
            .shared_executor(executor.clone())
            .shared_cache(cache.clone())
            .build()
            .unwrap();

        let mut params = Params::new();
        params.insert("ASIN".into(), "B00TEST".into());

        let first = throttler
            .admit("GetMyPriceForASIN", &params, 0)
            .await
            .unwrap();
        let second = throttler
            .admit("GetMyPriceForASIN", &params, 0)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(executor.calls(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(throttler.level("GetMyPriceForASIN"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_tiers_blocking() {
        let throttler = Throttler::<String>::builder()
            .limits(limits("ListMatchingProducts", 20, 5.0))
            .reserve("ListMatchingProducts", 0, 5)
            .reserve("ListMatchingProducts", 1, 10)
            .blocking(true)
            .build()
            .unwrap();
        let params = Params::new();
        let start = Instant::now();

        for _ in 0..5 {
            throttler
                .admit("ListMatchingProducts", &params, 0)
                .await
                .unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // 6th low-priority call has to wait for one restore
        throttler
            .admit("ListMatchingProducts", &params, 0)
            .await
            .unwrap();
        assert_close(start.elapsed(), Duration::from_secs(5));

        let resumed = Instant::now();
        for _ in 0..6 {
            throttler
                .admit("ListMatchingProducts", &params, 1)
                .await
                .unwrap();
        }
        assert_eq!(resumed.elapsed(), Duration::ZERO);
        assert_eq!(throttler.level("ListMatchingProducts"), Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_waits_for_restore() {
        let executor = Arc::new(RecordingExecutor::default());
        let throttler = Throttler::<String>::builder()
            .limits(limits("ItemLookup", 2, 1.0))
            .shared_executor(executor.clone())
            .blocking(true)
            .build()
            .unwrap();
        let start = Instant::now();

        for _ in 0..3 {
            let response = throttler
                .admit("ItemLookup", &Params::new(), 0)
                .await
                .unwrap();
            assert_eq!(response.as_deref(), Some("ItemLookup:0"));
        }

        let admitted_at = executor.admitted_at.lock().clone();
        assert_eq!(admitted_at[0] - start, Duration::ZERO);
        assert_eq!(admitted_at[1] - start, Duration::ZERO);
        assert_close(admitted_at[2] - start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_recompute_after_waking() {
        let executor = Arc::new(RecordingExecutor::default());
        let throttler = Arc::new(
            Throttler::<String>::builder()
                .limits(limits("GetOrder", 1, 10.0))
                .shared_executor(executor.clone())
                .blocking(true)
                .build()
                .unwrap(),
        );
        let start = Instant::now();

        throttler.admit("GetOrder", &Params::new(), 0).await.unwrap();

        let mut handles = vec![];
        for _ in 0..2 {
            let throttler = Arc::clone(&throttler);
            handles.push(tokio::spawn(async move {
                throttler.admit("GetOrder", &Params::new(), 0).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Both waiters wake at 10s; only one unit was restored
        let offsets: Vec<Duration> = executor
            .admitted_at
            .lock()
            .iter()
            .map(|at| *at - start)
            .collect();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[0], Duration::ZERO);
        assert_close(offsets[1], Duration::from_secs(10));
        assert_close(offsets[2], Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_consumes_nothing() {
        let executor = Arc::new(RecordingExecutor::default());
        let throttler = Throttler::<String>::builder()
            .limits(limits("ListOrders", 1, 60.0))
            .shared_executor(executor.clone())
            .blocking(true)
            .build()
            .unwrap();
        let params = Params::new();

        throttler.admit("ListOrders", &params, 0).await.unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        let (result, _) = tokio::join!(
            throttler.admit_with_cancel("ListOrders", &params, 0, &token),
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                canceller.cancel();
            }
        );

        assert!(matches!(result, Err(ThrottleError::Cancelled { .. })));
        assert_eq!(executor.calls(), 1);
        assert_eq!(throttler.level("ListOrders"), Some(1));

        // Remaining wait is unaffected by the abandoned request
        let remaining = throttler.wait("ListOrders", 0);
        assert!(remaining <= Duration::from_secs(50));
        assert!(remaining > Duration::from_secs(49));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_token_does_not_block_free_quota() {
        let throttler = Throttler::<String>::builder()
            .limits(limits("ListOrders", 1, 60.0))
            .blocking(true)
            .build()
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();

        // Quota is available, so no wait happens and the token is never consulted
        let result = throttler
            .admit_with_cancel("ListOrders", &Params::new(), 0, &token)
            .await;
        assert!(result.is_ok());
        assert_eq!(throttler.level("ListOrders"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_state_bound_under_load() {
        let executor = Arc::new(RecordingExecutor::default());
        let throttler = Arc::new(
            Throttler::<String>::builder()
                .limits(limits("ListOrderItems", 3, 1.0))
                .shared_executor(executor.clone())
                .blocking(true)
                .build()
                .unwrap(),
        );

        let mut handles = vec![];
        for _ in 0..8 {
            let throttler = Arc::clone(&throttler);
            handles.push(tokio::spawn(async move {
                for _ in 0..3 {
                    throttler
                        .admit("ListOrderItems", &Params::new(), 0)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut admitted_at = executor.admitted_at.lock().clone();
        admitted_at.sort();
        assert_eq!(admitted_at.len(), 24);

        let window = Duration::from_secs(1);
        for (i, start) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[i..]
                .iter()
                .take_while(|at| **at < *start + window)
                .count();
            assert!(in_window <= 3, "{in_window} calls admitted within one second");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_advisory_mode_never_sleeps() {
        let executor = Arc::new(RecordingExecutor::default());
        let throttler = Throttler::<String>::builder()
            .limits(limits("ItemSearch", 1, 1.0))
            .shared_executor(executor.clone())
            .build()
            .unwrap();
        let start = Instant::now();

        for _ in 0..50 {
            throttler
                .admit("ItemSearch", &Params::new(), 0)
                .await
                .unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(executor.calls(), 50);
        assert_eq!(throttler.level("ItemSearch"), Some(50));
        assert_eq!(throttler.wait("ItemSearch", 0), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_blocking_switches_discipline() {
        let throttler = Throttler::<String>::builder()
            .limits(limits("ItemSearch", 1, 1.0))
            .build()
            .unwrap();
        assert!(!throttler.is_blocking());

        throttler.admit("ItemSearch", &Params::new(), 0).await.unwrap();

        throttler.set_blocking(true);
        let start = Instant::now();
        throttler.admit("ItemSearch", &Params::new(), 0).await.unwrap();
        assert_close(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unconfigured_action_passes_through() {
        let executor = Arc::new(RecordingExecutor::default());
        let throttler = Throttler::<String>::builder()
            .limits(LimitTable::new())
            .shared_executor(executor.clone())
            .blocking(true)
            .build()
            .unwrap();

        for _ in 0..100 {
            throttler
                .admit("SubmitFeed", &Params::new(), 0)
                .await
                .unwrap();
        }

        assert_eq!(executor.calls(), 100);
        assert_eq!(throttler.wait("SubmitFeed", 0), Duration::ZERO);
        assert_eq!(throttler.status("SubmitFeed", 0), AdmissionState::Unmetered);
        assert_eq!(throttler.ledger().tracked_actions(), 0);
    }

    #[tokio::test]
    async fn test_without_executor_returns_none() {
        let throttler = Throttler::<String>::builder().build().unwrap();

        let response = throttler
            .admit("ListOrders", &Params::new(), 0)
            .await
            .unwrap();

        assert!(response.is_none());
        assert_eq!(throttler.level("ListOrders"), Some(1));
    }

    #[tokio::test]
    async fn test_executor_error_propagates() {
        let throttler = Throttler::<String>::builder()
            .executor(FailingExecutor)
            .build()
            .unwrap();

        match throttler.admit("ListOrders", &Params::new(), 0).await {
            Err(ThrottleError::Executor { action, source }) => {
                assert_eq!(action, "ListOrders");
                assert_eq!(source.to_string(), "RequestThrottled");
            }
            other => panic!("expected executor error, got {:?}", other.map(|_| ())),
        }

        // The call was admitted before the executor failed
        assert_eq!(throttler.level("ListOrders"), Some(1));
    }

    #[tokio::test]
    async fn test_untyped_delegate_assignment() {
        let executor = Arc::new(RecordingExecutor::default());
        let mut throttler = Throttler::<String>::builder().build().unwrap();

        let delegate: AnyDelegate = Box::new(42u32);
        assert!(matches!(
            throttler.set_executor_any(delegate),
            Err(ThrottleError::TypeMismatch { .. })
        ));

        let shared: SharedExecutor<String> = executor.clone();
        throttler.set_executor_any(Box::new(shared)).unwrap();
        throttler.admit("ListOrders", &Params::new(), 0).await.unwrap();
        assert_eq!(executor.calls(), 1);

        // A failed assignment keeps the current executor
        let delegate: AnyDelegate = Box::new("executor");
        assert!(throttler.set_executor_any(delegate).is_err());
        throttler.admit("ListOrders", &Params::new(), 0).await.unwrap();
        assert_eq!(executor.calls(), 2);

        let cache: SharedCache<String> = Arc::new(MemoryCache::<String>::new());
        assert!(throttler.set_cache_any(Box::new(cache)).is_ok());
        let not_a_cache: AnyDelegate = Box::new(executor.clone());
        assert!(matches!(
            throttler.set_cache_any(not_a_cache),
            Err(ThrottleError::TypeMismatch { .. })
        ));

        let builder_result = Throttler::<String>::builder().executor_any(Box::new(1u8));
        assert!(builder_result.is_err());
    }

    #[tokio::test]
    async fn test_zero_share_tier_is_rejected_when_blocking() {
        let throttler = Throttler::<String>::builder()
            .limits(limits("ListOrders", 6, 60.0))
            .reserve("ListOrders", 1, 4)
            .blocking(true)
            .build()
            .unwrap();

        let result = throttler.admit("ListOrders", &Params::new(), 0).await;
        assert!(matches!(result, Err(ThrottleError::Configuration(_))));
        assert_eq!(throttler.level("ListOrders"), None);

        throttler.admit("ListOrders", &Params::new(), 1).await.unwrap();
        assert_eq!(throttler.level("ListOrders"), Some(1));
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_rejected() {
        let result = Throttler::<String>::builder()
            .limit("ListOrders", QuotaLimit::new(6, 0.0))
            .build();
        assert!(matches!(result, Err(ThrottleError::Configuration(_))));

        let result = Throttler::<String>::builder()
            .unmetered("ListOrders")
            .reserve("ListOrders", 0, 3)
            .build();
        assert!(matches!(result, Err(ThrottleError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_action_handle() {
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH);
        let throttler = Throttler::<String>::builder()
            .limits(limits("ListOrders", 6, 60.0))
            .reserve("ListOrders", 0, 2)
            .reserve("ListOrders", 1, 2)
            .clock(clock)
            .build()
            .unwrap();

        let low = throttler.action("ListOrders");
        let high = throttler.action("ListOrders").priority(1);

        low.admit(&Params::new()).await.unwrap();
        low.admit(&Params::new()).await.unwrap();

        assert_eq!(low.wait(), Duration::from_secs(60));
        assert_eq!(high.wait(), Duration::ZERO);
    }
}
