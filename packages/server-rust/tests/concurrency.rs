//! Load shedder behavior under real contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use envelope_server::observability::{names, InMemorySink};
use envelope_server::{Envelope, EnvelopeConfig, EnvelopeError, LoadShedder, Request};
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tower::{service_fn, ServiceExt};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn peak_never_exceeds_limit_across_ten_thousand_cycles() {
    let shedder = Arc::new(LoadShedder::new(100, Duration::from_secs(1)));
    let admitted = Arc::new(AtomicUsize::new(0));

    let tasks = (0..10_000).map(|_| {
        let shedder = Arc::clone(&shedder);
        let admitted = Arc::clone(&admitted);
        tokio::spawn(async move {
            if let Ok(permit) = shedder.try_admit() {
                assert!(shedder.in_flight() <= shedder.limit());
                admitted.fetch_add(1, Ordering::Relaxed);
                tokio::task::yield_now().await;
                drop(permit);
            }
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert!(shedder.peak() <= 100, "peak {} exceeded limit", shedder.peak());
    assert!(admitted.load(Ordering::Relaxed) > 0);
    assert_eq!(shedder.in_flight(), 0);
}

#[test]
fn os_threads_never_overshoot() {
    let shedder = Arc::new(LoadShedder::new(4, Duration::from_secs(1)));
    std::thread::scope(|scope| {
        for _ in 0..16 {
            let shedder = Arc::clone(&shedder);
            scope.spawn(move || {
                for _ in 0..1_000 {
                    if let Ok(permit) = shedder.try_admit() {
                        assert!(shedder.in_flight() <= 4);
                        drop(permit);
                    }
                }
            });
        }
    });
    assert!(shedder.peak() <= 4);
    assert_eq!(shedder.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_task_releases_its_slot() {
    let shedder = Arc::new(LoadShedder::new(1, Duration::from_secs(1)));
    let task_shedder = Arc::clone(&shedder);
    let joined = tokio::spawn(async move {
        let _permit = task_shedder.try_admit().unwrap();
        panic!("handler bug");
    })
    .await;

    assert!(joined.unwrap_err().is_panic());
    assert_eq!(shedder.in_flight(), 0);
    assert!(shedder.try_admit().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_admits_exactly_the_limit() {
    let config = EnvelopeConfig {
        load_shedding_max_concurrent: 5,
        ..EnvelopeConfig::default()
    };
    let sink = Arc::new(InMemorySink::new());
    let envelope = Envelope::from_config(&config, sink.clone()).unwrap();
    let gate = Arc::new(Semaphore::new(0));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let svc = envelope.pipeline(service_fn(move |_req: Request<()>| {
                let gate = Arc::clone(&gate);
                async move {
                    let _open = gate.acquire().await.map_err(|e| EnvelopeError::Internal(e.into()))?;
                    Ok::<_, EnvelopeError>("done")
                }
            }));
            tokio::spawn(svc.oneshot(Request::new("/orders", ())))
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while envelope.shedder().in_flight() < 5
            || sink.counter_total(names::LOAD_SHED_REJECTIONS_TOTAL) < 15
        {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    gate.add_permits(5);

    let mut served = 0;
    let mut shed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => served += 1,
            Err(failure) => {
                assert!(matches!(failure.error, EnvelopeError::Overloaded { .. }));
                shed += 1;
            }
        }
    }
    assert_eq!((served, shed), (5, 15));
    assert_eq!(envelope.shedder().peak(), 5);
    assert_eq!(envelope.shedder().in_flight(), 0);
}
