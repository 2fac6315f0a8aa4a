use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use locus_services::Lifecycle;

use crate::*;

const PRINTER: &str = "urn:uuid:printer";

/// Concurrent callers with nothing cached share one resolve request.
#[test]
fn test_concurrent_lookups_coalesce_into_one_request() {
    let net = Network::new();
    *net.delay.lock() = Duration::from_millis(50);
    net.answer(PRINTER, &["http://10.0.0.1/printer"]);
    let registry = registry(&net, 8);
    let device = registry.device(&epr(PRINTER), &SecurityKey::default());

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let device = device.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                device.address()
            })
        })
        .collect();

    for h in handles {
        let address = h.join().unwrap().expect("every waiter gets the address");
        assert_eq!(address.transport(), "http://10.0.0.1/printer");
    }
    assert_eq!(net.resolve_count(), 1, "exactly one outbound resolve");
}

/// [A, B]: A first, B after A fails, then exhaustion.
#[test]
fn test_failure_reports_walk_candidates_in_order() {
    let net = Network::new();
    net.answer(PRINTER, &["http://10.0.0.1/a", "http://10.0.0.2/b"]);
    let registry = registry(&net, 8);
    let device = registry.device(&epr(PRINTER), &SecurityKey::default());

    let a = device.address().unwrap();
    assert_eq!(a.transport(), "http://10.0.0.1/a");
    let generation = device.generation();

    let b = device.report_address_failure(&a, generation).unwrap().unwrap();
    assert_eq!(b.transport(), "http://10.0.0.2/b");

    let err = device.report_address_failure(&b, generation).unwrap_err();
    assert!(matches!(err, ResolveError::Exhausted(_)), "got {err:?}");
    assert_eq!(net.resolve_count(), 1);
}

/// A resolve answer for a superseded generation changes nothing.
#[test]
fn test_stale_resolve_reply_is_dropped() {
    let net = Network::new();
    net.hold.store(true, Ordering::SeqCst);
    let registry = registry(&net, 8);
    let device = registry.device(&epr(PRINTER), &SecurityKey::default());

    let waiter = {
        let device = device.clone();
        thread::spawn(move || device.address())
    };
    let (target, reply) = net.take_held();
    assert_eq!(target, PRINTER);

    // Authoritative update while the resolve is in flight.
    device
        .addresses()
        .invalidate(&[epr("http://10.0.0.9/printer")], None);
    let fresh = waiter.join().unwrap().unwrap();
    assert_eq!(fresh.transport(), "http://10.0.0.9/printer");

    reply(Outcome::Match(
        vec![ResolvedAddress::new(epr(PRINTER), "http://10.0.0.1/printer")],
        ConnectionInfo::default(),
    ));

    let candidates = device.addresses().candidates();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].transport(), "http://10.0.0.9/printer");
    assert_eq!(device.addresses().cached(), Some(fresh));
    assert_eq!(device.generation(), 1);
}

#[test]
fn test_stale_failure_report_is_ignored() {
    let net = Network::new();
    net.answer(PRINTER, &["http://10.0.0.1/a", "http://10.0.0.2/b"]);
    let registry = registry(&net, 8);
    let device = registry.device(&epr(PRINTER), &SecurityKey::default());

    let a = device.address().unwrap();
    let old = device.generation();
    device
        .addresses()
        .invalidate(&[epr("http://10.0.0.3/c")], None);

    assert_eq!(device.report_address_failure(&a, old), Ok(None));
    assert_eq!(device.address().unwrap().transport(), "http://10.0.0.3/c");
}

/// Addresses on the responder's subnet are tried first.
#[test]
fn test_same_subnet_address_preferred() {
    let net = Network::new();
    net.answer_from(
        PRINTER,
        &["http://10.1.0.1/far", "http://192.168.5.4/near"],
        "192.168.5.1",
    );
    let registry = registry(&net, 8);
    let device = registry.device(&epr(PRINTER), &SecurityKey::default());

    assert_eq!(device.address().unwrap().transport(), "http://192.168.5.4/near");
}

#[test]
fn test_unanswered_resolve_is_exhausted() {
    let net = Network::new();
    let registry = registry(&net, 8);
    let device = registry.device(&epr(PRINTER), &SecurityKey::default());

    assert!(matches!(device.address(), Err(ResolveError::Exhausted(_))));
}

/// Metadata retries the next address when a fetch fails.
#[test]
fn test_metadata_falls_back_to_next_address() {
    let net = Network::new();
    net.answer("urn:uuid:scan", &["http://10.0.0.1/scan", "http://10.0.0.2/scan"]);
    net.serve("http://10.0.0.2/scan", Metadata {
        capabilities: ["Scan".to_string()].into(),
        version: 4,
        ..Default::default()
    });
    let registry = registry(&net, 8);
    let service = registry.service(&epr("urn:uuid:scan"), &SecurityKey::default());

    let metadata = service.metadata().unwrap();
    assert_eq!(metadata.version, 4);
    assert_eq!(
        *net.fetches.lock(),
        vec!["http://10.0.0.1/scan".to_string(), "http://10.0.0.2/scan".to_string()]
    );
    assert_eq!(service.lifecycle(), Lifecycle::UpToDate);
    assert_eq!(service.address().unwrap().transport(), "http://10.0.0.2/scan");
}

#[test]
fn test_metadata_exhaustion_surfaces_transport_error() {
    let net = Network::new();
    net.answer("urn:uuid:scan", &["http://10.0.0.1/scan"]);
    let registry = registry(&net, 8);
    let service = registry.service(&epr("urn:uuid:scan"), &SecurityKey::default());

    let err = service.metadata().unwrap_err();
    assert!(matches!(err, ResolveError::Transport { .. }), "got {err:?}");
}

/// Denial is surfaced as-is and not retried on other addresses.
#[test]
fn test_blocked_endpoint_is_denied_without_retry() {
    let net = Network::new();
    net.answer("urn:uuid:scan", &["http://10.0.0.1/scan", "http://10.0.0.2/scan"]);
    net.serve("http://10.0.0.1/scan", Metadata::default());
    net.serve("http://10.0.0.2/scan", Metadata::default());

    let trust = TrustRegistry::new();
    trust.block("urn:uuid:scan");
    let registry = Registry::new(net.clone(), Arc::new(trust), &test_config(8));
    let service = registry.service(&epr("urn:uuid:scan"), &SecurityKey::default());

    assert!(matches!(service.metadata(), Err(ResolveError::AuthorizationDenied(_))));
    assert_eq!(net.fetches.lock().len(), 1);
    assert_eq!(service.lifecycle(), Lifecycle::New);
}

/// New authoritative endpoints replace the candidates, keeping the address
/// the metadata arrived over in front.
#[test]
fn test_metadata_endpoint_change_reseeds_addresses() {
    let net = Network::new();
    net.answer("urn:uuid:scan", &["http://10.0.0.1/scan"]);
    net.serve("http://10.0.0.1/scan", Metadata {
        endpoints: vec![epr("urn:uuid:scan"), epr("http://10.0.0.7/scan")],
        ..Default::default()
    });
    let registry = registry(&net, 8);
    let service = registry.service(&epr("urn:uuid:scan"), &SecurityKey::default());

    service.metadata().unwrap();
    assert_eq!(service.generation(), 1);

    let transports: Vec<_> = service
        .addresses()
        .candidates()
        .iter()
        .map(|c| c.transport().to_string())
        .collect();
    assert_eq!(transports, vec!["http://10.0.0.1/scan", "http://10.0.0.7/scan"]);
    assert_eq!(service.address().unwrap().transport(), "http://10.0.0.1/scan");
}

/// A resolve that outlives its wait bound does not wedge the reference: the
/// next call sends a fresh request, and the late reply is ignored.
#[test]
fn test_resolve_recovers_after_timeout() {
    let net = Network::new();
    net.hold.store(true, Ordering::SeqCst);
    let registry = Registry::new(net.clone(), Arc::new(AllowAll), &short_wait_config(3, 20));
    let device = registry.device(&epr(PRINTER), &SecurityKey::default());

    let err = device.address().unwrap_err();
    assert!(matches!(err, ResolveError::Timeout(_)), "got {err:?}");
    let (_, late) = net.take_held();

    net.hold.store(false, Ordering::SeqCst);
    net.answer(PRINTER, &["http://10.0.0.1/printer"]);
    assert_eq!(device.address().unwrap().transport(), "http://10.0.0.1/printer");
    assert_eq!(net.resolve_count(), 2);

    late(Outcome::Match(
        vec![ResolvedAddress::new(epr(PRINTER), "http://10.0.0.66/printer")],
        ConnectionInfo::default(),
    ));
    assert_eq!(device.addresses().candidates().len(), 1);
}

/// Concurrent metadata calls share one resolve and one fetch, and every
/// caller gets the same metadata.
#[test]
fn test_concurrent_metadata_calls_coalesce() {
    let net = Network::new();
    *net.delay.lock() = Duration::from_millis(50);
    net.answer("urn:uuid:scan", &["http://10.0.0.1/scan"]);
    net.serve("http://10.0.0.1/scan", Metadata {
        version: 7,
        ..Default::default()
    });
    let registry = registry(&net, 8);
    let service = registry.service(&epr("urn:uuid:scan"), &SecurityKey::default());

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                service.metadata()
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().expect("every caller gets metadata"))
        .collect();
    assert!(results.iter().all(|m| Arc::ptr_eq(m, &results[0])));
    assert_eq!(results[0].version, 7);
    assert_eq!(net.resolve_count(), 1);
    assert_eq!(net.fetches.lock().len(), 1, "exactly one outbound fetch");
}

/// Waiters stay asleep while the driving caller falls back past an address
/// that never answers, even when that takes longer than one wait bound.
#[test]
fn test_metadata_waiters_outlast_driver_fallback() {
    let net = Network::new();
    *net.delay.lock() = Duration::from_millis(50);
    net.answer("urn:uuid:svc", &["http://10.0.0.1/svc", "http://10.0.0.2/svc"]);
    net.quiet.lock().push("http://10.0.0.1/svc".into());
    net.serve("http://10.0.0.2/svc", Metadata {
        version: 3,
        ..Default::default()
    });
    let registry = Registry::new(net.clone(), Arc::new(AllowAll), &short_wait_config(5, 20));
    let service = registry.service(&epr("urn:uuid:svc"), &SecurityKey::default());

    let driver = {
        let service = service.clone();
        thread::spawn(move || service.metadata())
    };
    // The driver has claimed the fetch once its resolve is out.
    wait_until(|| net.resolve_count() == 1);
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || service.metadata())
        })
        .collect();

    assert_eq!(driver.join().unwrap().unwrap().version, 3);
    for w in waiters {
        let metadata = w.join().unwrap().expect("waiter sees the driver's result");
        assert_eq!(metadata.version, 3);
    }
    assert_eq!(
        *net.fetches.lock(),
        vec!["http://10.0.0.1/svc".to_string(), "http://10.0.0.2/svc".to_string()]
    );
}
