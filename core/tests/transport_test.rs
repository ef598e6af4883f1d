use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;

use switchboard_core::{
    ConnectivityProbe, DeliveryTransport, HttpTransport, MessageEnvelope, MessageType, Recipient,
    ResilientClient, RetryPolicy, TransportError,
};

mock! {
    pub Probe {}

    #[async_trait]
    impl ConnectivityProbe for Probe {
        async fn is_online(&self) -> bool;
    }
}

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(40),
        jitter_ratio: 0.0,
        timeout: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn test_transient_failures_stop_at_max_retries_plus_one() {
    let client = ResilientClient::new(policy(4));
    let calls = AtomicU32::new(0);

    let outcome = client
        .call(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransportError::Transient("503".into())) }
        })
        .await;

    assert!(matches!(outcome.result, Err(TransportError::Transient(_))));
    assert_eq!(outcome.attempts, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(outcome.attempt_latencies.len(), 5);

    let delays: Vec<u128> = outcome.delays.iter().map(|d| d.as_millis()).collect();
    assert_eq!(delays, vec![5, 10, 20, 40]);
}

#[tokio::test]
async fn test_backoff_is_monotone_with_jitter() {
    let p = RetryPolicy {
        jitter_ratio: 1.0,
        ..policy(8)
    };
    // Below the cap, the largest jittered delay never exceeds the next floor.
    for n in 0..3 {
        assert!(p.delay_for(n, 1.0) <= p.delay_for(n + 1, 0.0), "n = {n}");
    }
    for n in 0..8 {
        assert!(p.delay_for(n, 0.0) <= p.delay_for(n + 1, 0.0));
        assert!(p.delay_for(n, 0.99) <= p.max_delay * 2);
    }
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let client = ResilientClient::new(policy(5));
    let outcome = client
        .call(|_| async { Err::<(), _>(TransportError::Fatal("401".into())) })
        .await;
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.delays.is_empty());
    assert!(matches!(outcome.result, Err(TransportError::Fatal(_))));
}

#[tokio::test]
async fn test_recovers_after_transient_failures() {
    let client = ResilientClient::new(policy(5));
    let outcome = client
        .call(|attempt| async move {
            if attempt < 2 {
                Err(TransportError::Transient("reset".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;
    assert_eq!(outcome.result, Ok(2));
    assert_eq!(outcome.attempts, 3);
}

#[tokio::test]
async fn test_slow_attempt_times_out_as_transient() {
    let client = ResilientClient::new(RetryPolicy {
        timeout: Duration::from_millis(20),
        ..policy(1)
    });
    let outcome = client
        .call(|_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<(), TransportError>(())
        })
        .await;
    assert!(matches!(outcome.result, Err(TransportError::Transient(_))));
    assert_eq!(outcome.attempts, 2);
}

#[tokio::test]
async fn test_budget_cuts_retries_short() {
    let client = ResilientClient::new(RetryPolicy {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(100),
        ..policy(5)
    });
    let outcome = client
        .call_within(Some(Duration::from_millis(50)), |_| async {
            Err::<(), _>(TransportError::Transient("busy".into()))
        })
        .await;
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.elapsed < Duration::from_millis(100));
}

#[tokio::test]
async fn test_offline_probe_short_circuits() {
    let mut probe = MockProbe::new();
    let mut seq = mockall::Sequence::new();
    probe
        .expect_is_online()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| true);
    probe
        .expect_is_online()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| false);

    let client = ResilientClient::new(policy(5)).with_probe(Arc::new(probe));
    let outcome = client
        .call(|_| async { Err::<(), _>(TransportError::Transient("dns".into())) })
        .await;

    assert!(matches!(outcome.result, Err(TransportError::Offline(_))));
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_offline_error_from_operation_is_final() {
    let client = ResilientClient::new(policy(5));
    let outcome = client
        .call(|_| async { Err::<(), _>(TransportError::Offline("no route".into())) })
        .await;
    assert_eq!(outcome.attempts, 1);
    assert!(matches!(outcome.result, Err(TransportError::Offline(_))));
}

#[tokio::test]
async fn test_http_transport_refused_connection_is_transient() {
    // Grab a free port, then close it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
    let env = MessageEnvelope::new("tester", Recipient::agent("a1"), MessageType::Event, 5.0);
    let err = transport
        .deliver(&format!("http://127.0.0.1:{port}/inbox"), &env, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Transient(_)), "got {err:?}");
}
