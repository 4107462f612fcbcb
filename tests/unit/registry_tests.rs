//! Session registry bookkeeping.

use std::net::SocketAddr;
use std::sync::Arc;

use live_harness::host::{SessionHandle, SessionRegistry, SessionState};
use tokio_util::sync::CancellationToken;

fn peer() -> SocketAddr {
    "127.0.0.1:4000".parse().expect("addr")
}

#[test]
fn handles_are_found_until_removed() {
    let registry = SessionRegistry::new();
    assert!(registry.is_empty());

    let parent = CancellationToken::new();
    let first = Arc::new(SessionHandle::new(peer(), &parent));
    let second = Arc::new(SessionHandle::new(peer(), &parent));
    registry.insert(Arc::clone(&first));
    registry.insert(Arc::clone(&second));
    assert_eq!(registry.len(), 2);
    assert!(!registry.is_empty());

    let found = registry.get(first.id()).expect("registered");
    assert!(Arc::ptr_eq(&found, &first));
    assert_eq!(found.state(), SessionState::Connected);
    assert!(registry.verified().is_empty());

    assert!(registry.remove(first.id()).is_some());
    assert!(registry.get(first.id()).is_none());
    assert!(registry.remove(first.id()).is_none());
    assert_eq!(registry.snapshot().len(), 1);

    registry.remove(second.id());
    assert!(registry.is_empty());
}

#[test]
fn parent_cancellation_closes_every_handle() {
    let registry = SessionRegistry::new();
    let parent = CancellationToken::new();
    for _ in 0..3 {
        registry.insert(Arc::new(SessionHandle::new(peer(), &parent)));
    }
    assert!(registry.handles().iter().all(|h| !h.is_closing()));

    parent.cancel();
    assert!(registry.handles().iter().all(|h| h.is_closing()));
}
