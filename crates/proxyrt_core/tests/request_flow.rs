//! End-to-end request flow tests for `proxyrt_core`.
//!
//! These tests drive the execution context the way the surrounding request
//! pipeline would: one context per phase, hooks directing the state machine
//! through the handling slot, per-phase task scopes torn down between
//! phases.

use proxyrt_core::acl::Acl;
use proxyrt_core::collab::{
    BudgetWorkspace, Headers, LogTag, MemoryLog, MockHeaders, Workspace,
};
use proxyrt_core::ctx::{
    ExecCtx, Handling, HashAccumulator, HeaderSelector, MsgBuilder, Phase, PolicyFault,
};
use proxyrt_core::scope::{ModuleIdent, PrivScope, ScopeKind};
use proxyrt_core::strands::Strands;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Routes the runtime's own diagnostics into the test harness output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A cacheable GET walks recv -> hash -> miss, with each phase's handling
/// read back by the pipeline and logged in order.
#[test]
fn cacheable_request_walks_recv_hash_miss() {
    init_tracing();
    let ws = BudgetWorkspace::new(4096);
    let log = MemoryLog::new();
    let req = MockHeaders::new();
    req.set("Host", "example.com");
    req.set("Cookie", "session=1");

    // recv: strip the cookie, go look it up.
    {
        let ctx = ExecCtx::builder(Phase::Recv, &ws, &log).req(&req).build();
        let hdrs = ctx.headers(HeaderSelector::Req).unwrap();
        hdrs.unset("Cookie");
        ctx.set_handling(Handling::Lookup).unwrap();
        assert_eq!(ctx.handling(), Some(Handling::Lookup));
    }
    assert!(req.get("Cookie").is_none());

    // hash: host and path feed the cache key.
    let acc = HashAccumulator::new();
    {
        let ctx = ExecCtx::builder(Phase::Hash, &ws, &log)
            .req(&req)
            .phase_data(&acc)
            .build();
        ctx.hash_data(b"/index.html").unwrap();
        let host = ctx
            .headers(HeaderSelector::Req)
            .and_then(|h| h.get("Host"))
            .unwrap();
        ctx.hash_data(host.as_bytes()).unwrap();
        ctx.set_handling(Handling::Lookup).unwrap();
    }
    assert_eq!(acc.take(), b"/index.htmlexample.com".to_vec());

    // miss: fetch from the backend.
    {
        let ctx = ExecCtx::builder(Phase::Miss, &ws, &log).req(&req).build();
        ctx.set_handling(Handling::Fetch).unwrap();
    }

    let decisions: Vec<String> = log
        .with_tag(LogTag::Handling)
        .into_iter()
        .map(|r| r.msg)
        .collect();
    assert_eq!(decisions, ["lookup", "lookup", "fetch"]);
    assert!(log.with_tag(LogTag::Fault).is_empty());
}

/// The top request view defaults to the request view; a sub-request wired
/// with a distinct parent view sees both.
#[test]
fn sub_request_sees_parent_top_view() {
    init_tracing();
    let ws = BudgetWorkspace::new(256);
    let log = MemoryLog::new();
    let parent_req = MockHeaders::new();
    parent_req.set("X-Original-URL", "/top");
    let sub_req = MockHeaders::new();
    sub_req.set("X-Original-URL", "/esi-fragment");

    let ctx = ExecCtx::builder(Phase::Recv, &ws, &log)
        .req(&sub_req)
        .req_top(&parent_req)
        .build();

    let own = ctx.headers(HeaderSelector::Req).unwrap();
    let top = ctx.headers(HeaderSelector::ReqTop).unwrap();
    assert_eq!(own.get("X-Original-URL").as_deref(), Some("/esi-fragment"));
    assert_eq!(top.get("X-Original-URL").as_deref(), Some("/top"));
}

/// A synth phase builds a body through the phase payload; reading the
/// payload under another phase faults instead.
#[test]
fn synth_body_is_phase_guarded() {
    init_tracing();
    let ws = BudgetWorkspace::new(256);
    let log = MemoryLog::new();
    let body = MsgBuilder::new();

    {
        let ctx = ExecCtx::builder(Phase::Synth, &ws, &log)
            .phase_data(&body)
            .build();
        ctx.synth_body("<html>guru meditation</html>").unwrap();
        ctx.set_handling(Handling::Deliver).unwrap();
    }
    assert_eq!(body.take(), "<html>guru meditation</html>");

    let ctx = ExecCtx::builder(Phase::Recv, &ws, &log).build();
    assert!(matches!(
        ctx.synth_body("nope"),
        Err(PolicyFault::PhasePayload { .. })
    ));
}

/// fail() wins over any handling a hook wrote earlier and is idempotent.
#[test]
fn fail_forces_the_handling_slot() {
    init_tracing();
    let ws = BudgetWorkspace::new(256);
    let log = MemoryLog::new();
    let ctx = ExecCtx::builder(Phase::Recv, &ws, &log).build();

    ctx.set_handling(Handling::Pass).unwrap();
    ctx.fail("policy assertion failed");
    ctx.fail("second report");

    assert!(ctx.failed());
    assert_eq!(ctx.handling(), Some(Handling::Fail));
    assert_eq!(log.with_tag(LogTag::Fault).len(), 2);
}

/// ACL evaluation leaves an audit record for hits and misses alike.
#[test]
fn acl_audit_covers_both_outcomes() {
    init_tracing();
    let ws = BudgetWorkspace::new(256);
    let log = MemoryLog::new();
    let ctx = ExecCtx::builder(Phase::Recv, &ws, &log).build();

    let purgers = Acl::new("purgers", |_, ip| match ip {
        std::net::IpAddr::V4(v4) => v4.octets()[0] == 10,
        std::net::IpAddr::V6(_) => false,
    });

    assert!(purgers.matches(&ctx, "10.0.0.7".parse().unwrap()));
    assert!(!purgers.matches(&ctx, "192.0.2.1".parse().unwrap()));

    let audit = log.with_tag(LogTag::Acl);
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].msg, "MATCH purgers 10.0.0.7");
    assert_eq!(audit[1].msg, "NO_MATCH purgers 192.0.2.1");
}

/// Strand materialization charges the request workspace; an oversized
/// assembly overflows cleanly and a snapshot release reclaims the scratch.
#[test]
fn strands_respect_the_workspace_budget() {
    init_tracing();
    let ws = BudgetWorkspace::new(16);
    let frags = [Some("Hello"), None, Some(", "), Some("world")];
    let s = Strands::bundle(&frags);

    let snap = ws.snapshot();
    assert_eq!(s.materialize_in(&ws).unwrap(), "Hello, world");
    assert_eq!(ws.remaining(), 4);

    // The next assembly does not fit what is left.
    let big = [Some("0123456789abcdef")];
    assert!(Strands::bundle(&big).materialize_in(&ws).is_err());

    ws.release(snap);
    assert_eq!(ws.remaining(), 16);
}

/// Task scopes die at phase end, the top-request scope at request end, and
/// each release callback runs exactly once.
#[test]
fn scope_teardown_ordering_across_phases() {
    init_tracing();
    let released = Arc::new(AtomicUsize::new(0));
    let me = ModuleIdent::fresh();
    let top = PrivScope::new(ScopeKind::TopRequest);

    let counter = Arc::clone(&released);
    top.get_or_create(me)
        .store_with("per-request token".to_string(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    for _ in 0..3 {
        let task = PrivScope::new(ScopeKind::Task);
        let counter = Arc::clone(&released);
        task.get_or_create(me).store_with(0u64, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.finalize_all(); // phase transaction ends

        // The top-request slot survives every phase.
        assert!(top.get_or_create(me).get::<String>().is_some());
    }
    assert_eq!(released.load(Ordering::SeqCst), 3);

    top.finalize_all(); // outermost request completes
    assert_eq!(released.load(Ordering::SeqCst), 4);
}
