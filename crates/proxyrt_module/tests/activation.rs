//! Module activation integration tests.
//!
//! These tests take a module instance through its whole life: validated
//! load, hooks serving traffic against execution contexts, warm/cold
//! cycling, and discard with instance-state release.

use proxyrt_core::collab::{BudgetWorkspace, LogTag, MemoryLog};
use proxyrt_core::ctx::{ExecCtx, Handling, Phase, PolicyFault};
use proxyrt_core::event::LifecycleEvent;
use proxyrt_core::scope::PrivScope;
use proxyrt_module::descriptor::{
    FuncSlot, FunctionTable, ModuleDescriptor, ModuleEvents, ModuleFailure,
};
use proxyrt_module::lifecycle::EventError;
use proxyrt_module::loader::{LoadError, Loader};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Routes the loader's diagnostics into the test harness output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Lifecycle entry of a module that opens a "connection pool" on warm and
/// counts how often it was released.
struct PoolModule {
    releases: Arc<AtomicUsize>,
}

impl ModuleEvents for PoolModule {
    fn event(
        &self,
        _ctx: &ExecCtx<'_>,
        scope: &PrivScope,
        event: LifecycleEvent,
    ) -> Result<(), ModuleFailure> {
        match event {
            LifecycleEvent::Load => {
                // Instance state keyed by whatever ident the runtime gave
                // us; a real module would thread its own ident through.
                let releases = Arc::clone(&self.releases);
                scope
                    .get_or_create(proxyrt_core::scope::ModuleIdent::fresh())
                    .store_with("pool-handle".to_string(), move |_| {
                        releases.fetch_add(1, Ordering::SeqCst);
                    });
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn pass_hook(ctx: &ExecCtx<'_>) -> Result<(), PolicyFault> {
    ctx.set_handling(Handling::Pass)
}

fn descriptor(identity: &str, releases: &Arc<AtomicUsize>) -> ModuleDescriptor {
    ModuleDescriptor {
        abi_major: 3,
        abi_minor: 1,
        build_identity: identity.to_string(),
        name: "pool".to_string(),
        functions: FunctionTable::new(vec![FuncSlot {
            name: "bypass",
            func: pass_hook,
        }]),
        declared_len: 1,
        parameter_signature: "bypass()".to_string(),
        spec_table: vec!["$Function VOID bypass()".to_string()],
        abi_tag: "3.1".to_string(),
        events: Arc::new(PoolModule {
            releases: Arc::clone(releases),
        }),
    }
}

/// Load, serve traffic through a hook, cycle warm/cold, discard; the
/// instance state's release callback fires exactly once, at discard.
#[test]
fn full_instance_life() {
    init_tracing();
    let ws = BudgetWorkspace::new(256);
    let log = MemoryLog::new();
    let init_ctx = ExecCtx::builder(Phase::Init, &ws, &log).build();

    let releases = Arc::new(AtomicUsize::new(0));
    let loader = Loader::new(3, 1);
    loader.record_identity("pool", "abc123");

    let handle = loader
        .load(
            &init_ctx,
            descriptor("abc123", &releases),
            "pool1",
            "/modules/pool.so",
            None,
        )
        .unwrap();
    handle.deliver(&init_ctx, LifecycleEvent::Warm).unwrap();

    // Traffic: the exported hook directs a request.
    {
        let req_ws = BudgetWorkspace::new(4096);
        let req_log = MemoryLog::new();
        let ctx = ExecCtx::builder(Phase::Recv, &req_ws, &req_log).build();
        let hook = handle.hook("bypass").unwrap();
        hook(&ctx).unwrap();
        assert_eq!(ctx.handling(), Some(Handling::Pass));
        assert_eq!(req_log.with_tag(LogTag::Handling).len(), 1);
    }

    handle.deliver(&init_ctx, LifecycleEvent::Cold).unwrap();
    handle.deliver(&init_ctx, LifecycleEvent::Warm).unwrap();
    handle.deliver(&init_ctx, LifecycleEvent::Cold).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 0);

    handle
        .deliver(&init_ctx, LifecycleEvent::Discard)
        .unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    assert!(matches!(
        handle.deliver(&init_ctx, LifecycleEvent::Warm),
        Err(EventError::AlreadyDiscarded { .. })
    ));
    handle.unload().unwrap();
    handle.unload().unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

/// A stale binary rejects, its backup copy rescues the load, and the
/// rejected attempt changes nothing the pipeline can observe.
#[test]
fn stale_binary_falls_back_to_backup() {
    init_tracing();
    let ws = BudgetWorkspace::new(256);
    let log = MemoryLog::new();
    let ctx = ExecCtx::builder(Phase::Init, &ws, &log).build();

    let releases = Arc::new(AtomicUsize::new(0));
    let loader = Loader::new(3, 1);
    loader.record_identity("pool", "abc123");

    // No backup: hard rejection, no instance state ever created.
    let err = loader
        .load(
            &ctx,
            descriptor("xyz999", &releases),
            "pool1",
            "/modules/pool.so",
            None,
        )
        .unwrap_err();
    assert!(matches!(err, LoadError::IdentityMismatch { .. }));
    assert_eq!(releases.load(Ordering::SeqCst), 0);

    // Backup carries the compiled-against identity: load succeeds.
    let handle = loader
        .load(
            &ctx,
            descriptor("xyz999", &releases),
            "pool1",
            "/modules/pool.so",
            Some(descriptor("abc123", &releases)),
        )
        .unwrap();
    assert_eq!(handle.descriptor().build_identity, "abc123");
    assert_eq!(handle.origin(), "/modules/pool.so");
}

/// Two instances of one module keep disjoint private state.
#[test]
fn instances_are_isolated() {
    init_tracing();
    let ws = BudgetWorkspace::new(256);
    let log = MemoryLog::new();
    let ctx = ExecCtx::builder(Phase::Init, &ws, &log).build();

    let releases = Arc::new(AtomicUsize::new(0));
    let loader = Loader::new(3, 1);
    loader.record_identity("pool", "abc123");

    let a = loader
        .load(&ctx, descriptor("abc123", &releases), "a", "/m/pool.so", None)
        .unwrap();
    let b = loader
        .load(&ctx, descriptor("abc123", &releases), "b", "/m/pool.so", None)
        .unwrap();

    assert_ne!(a.ident(), b.ident());

    a.scope().get_or_create(a.ident()).store(1u32);
    b.scope().get_or_create(b.ident()).store(2u32);

    assert_eq!(a.scope().get_or_create(a.ident()).get::<u32>(), Some(&1));
    assert_eq!(b.scope().get_or_create(b.ident()).get::<u32>(), Some(&2));
}
