use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use locus_services::{ReferenceId, ReferenceListener};

use crate::*;

#[derive(Default)]
struct DisposedLog {
    ids: Mutex<Vec<ReferenceId>>,
}

impl ReferenceListener for DisposedLog {
    fn on_disposed(&self, reference: &Arc<Reference>) {
        self.ids.lock().push(reference.id());
    }
}

fn svc(n: usize) -> EndpointReference {
    epr(&format!("urn:uuid:svc-{n}"))
}

/// capacity + 1 admissions evict exactly the least recently touched one.
#[test]
fn test_overflow_evicts_least_recently_touched() {
    let net = Network::new();
    let registry = registry(&net, 3);
    let log = Arc::new(DisposedLog::default());
    registry.add_listener(log.clone());
    let scope = SecurityKey::default();

    let s1 = registry.service(&svc(1), &scope);
    let s2 = registry.service(&svc(2), &scope);
    let s3 = registry.service(&svc(3), &scope);

    // Looking s1 up again counts as use, so s2 is now the eldest.
    assert!(Arc::ptr_eq(&registry.service(&svc(1), &scope), &s1));
    registry.service(&svc(4), &scope);

    assert_eq!(*log.ids.lock(), vec![s2.id()]);
    assert!(s2.is_disposed());
    assert!(registry.find_service(&svc(2), &scope).is_none());
    assert!(registry.get(s2.id()).is_none());
    assert!(matches!(s2.address(), Err(ResolveError::Disposed(_))));

    assert!(!s1.is_disposed());
    assert!(!s3.is_disposed());
    assert_eq!(registry.service_count(), 3);
    assert_eq!(registry.evictable_count(), 3);
}

/// Looking an evicted service up again builds a fresh reference.
#[test]
fn test_evicted_service_is_recreated_on_demand() {
    let net = Network::new();
    let registry = registry(&net, 1);
    let scope = SecurityKey::default();

    let first = registry.service(&svc(1), &scope);
    registry.service(&svc(2), &scope);
    assert!(first.is_disposed());

    let again = registry.service(&svc(1), &scope);
    assert!(!Arc::ptr_eq(&first, &again));
    assert_ne!(first.id(), again.id());
    assert!(!again.is_disposed());
}

/// A service with a parent device leaves the cache and survives any
/// number of later admissions. Losing the parent makes it evictable again.
#[test]
fn test_parent_link_protects_from_eviction() {
    let net = Network::new();
    let registry = registry(&net, 2);
    let scope = SecurityKey::default();

    let device = registry.device(&epr("urn:uuid:hub"), &scope);
    let child = registry.service(&svc(0), &scope);
    assert!(registry.is_evictable(child.id()));
    assert!(registry.attach_service(&device, &child));
    assert!(!registry.is_evictable(child.id()));

    for n in 1..10 {
        registry.service(&svc(n), &scope);
    }
    assert!(!child.is_disposed());
    assert_eq!(child.parent(), Some(device.id()));

    registry.remove_device(&epr("urn:uuid:hub"), &scope).unwrap();
    assert_eq!(child.parent(), None);
    assert!(registry.is_evictable(child.id()));

    registry.service(&svc(10), &scope);
    registry.service(&svc(11), &scope);
    assert!(child.is_disposed());
}

/// Services hosted by this process are never admitted.
#[test]
fn test_local_services_are_not_evicted() {
    let net = Network::new();
    let registry = registry(&net, 1);
    let scope = SecurityKey::default();
    registry.register_local(svc(0));

    let local = registry.service(&svc(0), &scope);
    assert_eq!(local.location(), Location::Local);
    for n in 1..4 {
        registry.service(&svc(n), &scope);
    }
    assert!(!local.is_disposed());
    assert_eq!(registry.evictable_count(), 1);
}

/// Explicit removal takes the service out of the cache too.
#[test]
fn test_removed_service_leaves_the_cache() {
    let net = Network::new();
    let registry = registry(&net, 4);
    let scope = SecurityKey::default();

    let s = registry.service(&svc(1), &scope);
    assert_eq!(registry.evictable_count(), 1);
    let removed = registry.remove_service(&svc(1), &scope).unwrap();
    assert!(Arc::ptr_eq(&s, &removed));
    assert_eq!(registry.evictable_count(), 0);
    assert!(registry.remove_service(&svc(1), &scope).is_none());
}

/// Attaching a service while it is still being created never leaves the
/// parented service in the cache.
#[test]
fn test_attach_racing_creation_leaves_cache_clean() {
    let net = Network::new();
    let registry = registry(&net, 64);
    let scope = SecurityKey::default();
    let device = registry.device(&epr("urn:uuid:hub"), &scope);

    for n in 0..200 {
        let endpoint = svc(n);
        let attacher = {
            let registry = registry.clone();
            let device = device.clone();
            let endpoint = endpoint.clone();
            let scope = scope.clone();
            thread::spawn(move || loop {
                if let Some(service) = registry.find_service(&endpoint, &scope) {
                    assert!(registry.attach_service(&device, &service));
                    break service;
                }
                std::hint::spin_loop();
            })
        };
        let created = registry.service(&endpoint, &scope);
        let attached = attacher.join().unwrap();
        assert!(Arc::ptr_eq(&created, &attached));
        assert!(!registry.is_evictable(created.id()), "parented service left in the cache");
    }
    assert_eq!(registry.evictable_count(), 0);
    assert_eq!(device.services().len(), 200);
}
