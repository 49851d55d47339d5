mod helpers;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use helpers::{RecordingDriver, call, code, hypervisor, hypervisor_with, spawn, store};
use hv_kernel::{
    ActorContext, ActorId, Container, ContainerFactory, Driver, ExecutionError, FuncRef,
    Hypervisor, HypervisorConfig, IdentityScheme, Interface, KernelError, MAX_STORAGE_SLOTS,
    Message, ModuleHandle, Op, SCRIPT_TYPE, ScriptFactory, ScriptModule, Target, derive_id,
};
use hv_store::{EntryKind, FsStore, MemStore, RemoteStore, tree::empty_root};
use tempfile::TempDir;

#[tokio::test]
async fn init_is_visible_after_restoring_the_root() {
    let mem = Arc::new(MemStore::new());
    let hv = hypervisor_with(mem.clone(), HypervisorConfig::default(), vec![]).await;
    let module = ScriptModule::new().export("init", vec![Op::Charge(10), store(0, b"ready")]);
    let id = spawn(&hv, module.clone());

    let mut msg = call(id, "init", 1000);
    let rx = msg.subscribe();
    hv.send(msg);
    let receipt = rx.await.expect("receipt");
    assert!(receipt.is_ok(), "{receipt:?}");
    // 10 charged plus 1 for the new storage slot
    assert_eq!(receipt.gas_used, 11);

    let root = hv.create_state_root().await.expect("root");
    assert_ne!(root, empty_root(mem.as_ref()).unwrap());

    hv.set_state_root(root).expect("set root");
    let actor = hv.load_actor(id).await.expect("load");
    assert_eq!(actor.storage(), &[b"ready".to_vec()]);
    assert_eq!(hv.actor_code(id).unwrap(), code(module));
}

#[tokio::test]
async fn receiver_clock_catches_up_to_sender() {
    let observer = RecordingDriver::new("observer");
    let hv = hypervisor_with(
        Arc::new(MemStore::new()),
        HypervisorConfig::default(),
        vec![observer.clone() as Arc<dyn Driver>],
    )
    .await;
    let b = spawn(
        &hv,
        ScriptModule::new().export(
            "ping",
            vec![Op::Send {
                to: Target::Driver("observer".into()),
                func: "pong".into(),
                args: vec![],
                gas: 0,
            }],
        ),
    );
    let a = spawn(
        &hv,
        ScriptModule::new().export(
            "go",
            vec![
                Op::Charge(5),
                Op::Send {
                    to: Target::Actor(b),
                    func: "ping".into(),
                    args: vec![],
                    gas: 10,
                },
            ],
        ),
    );

    hv.send(call(a, "go", 100));
    hv.idle().await.unwrap();

    let seen = observer.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].from_id, Some(b));
    assert!(seen[0].from_ticks >= 5, "b ran at tick {}", seen[0].from_ticks);
}

#[tokio::test]
async fn out_of_gas_leaves_no_storage_behind() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let id = spawn(
        &hv,
        ScriptModule::new().export("write", vec![store(0, b"leak"), Op::Charge(2)]),
    );

    let mut msg = call(id, "write", 1);
    let rx = msg.subscribe();
    hv.send(msg);
    let receipt = rx.await.unwrap();
    assert_eq!(
        receipt.error,
        Some(ExecutionError::OutOfGas {
            requested: 2,
            remaining: 0
        })
    );
    // the slot growth was paid for before the charge failed
    assert_eq!(receipt.ticks, 1);

    hv.create_state_root().await.unwrap();
    assert!(hv.actor_storage(id).unwrap().is_empty());
}

#[tokio::test]
async fn failed_message_reports_once_and_actor_keeps_working() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let id = spawn(
        &hv,
        ScriptModule::new()
            .export("fail", vec![Op::Fail("bad input".into())])
            .export("ok", vec![store(0, b"fine")]),
    );

    let mut bad = call(id, "fail", 10);
    let bad_rx = bad.subscribe();
    let mut good = call(id, "ok", 10);
    let good_rx = good.subscribe();
    hv.send([bad, good]);

    let receipt = bad_rx.await.unwrap();
    assert_eq!(receipt.error, Some(ExecutionError::Container("bad input".into())));
    assert!(good_rx.await.unwrap().is_ok());

    hv.create_state_root().await.unwrap();
    assert_eq!(hv.actor_storage(id).unwrap(), vec![b"fine".to_vec()]);
}

async fn scripted_run() -> (Vec<ActorId>, hv_cbor::Hash) {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let child = code(ScriptModule::new().export("hello", vec![store(0, b"hi")]));
    let parent = spawn(
        &hv,
        ScriptModule::new().export(
            "start",
            vec![
                Op::Charge(3),
                Op::Spawn {
                    type_tag: SCRIPT_TYPE,
                    code: child,
                },
                Op::Send {
                    to: Target::Child(0),
                    func: "hello".into(),
                    args: vec![],
                    gas: 10,
                },
                store(1, b"spawned"),
            ],
        ),
    );
    let other = spawn(
        &hv,
        ScriptModule::new().export("set", vec![Op::StoreArg { slot: 0, arg: 0 }]),
    );
    let mut set = call(other, "set", 5);
    set.args.push(b"value".to_vec());
    hv.send(vec![call(parent, "start", 50), set]);
    let root = hv.create_state_root().await.unwrap();
    (vec![parent, other, derive_id(Some(parent), 0)], root)
}

#[tokio::test]
async fn identical_runs_produce_identical_roots() {
    let (ids_a, root_a) = scripted_run().await;
    let (ids_b, root_b) = scripted_run().await;
    assert_eq!(ids_a, ids_b);
    assert_eq!(root_a, root_b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_roots_on_a_multi_thread_runtime() {
    let (_, expected) = scripted_run().await;
    let runs: Vec<_> = (0..4).map(|_| tokio::spawn(scripted_run())).collect();
    for run in runs {
        let (_, root) = run.await.unwrap();
        assert_eq!(root, expected);
    }
}

#[tokio::test]
async fn children_are_created_with_derived_ids() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let child_code = code(ScriptModule::new().export("hello", vec![store(0, b"hi")]));
    let parent = spawn(
        &hv,
        ScriptModule::new().export(
            "start",
            vec![
                Op::Spawn {
                    type_tag: SCRIPT_TYPE,
                    code: child_code.clone(),
                },
                Op::Send {
                    to: Target::Child(0),
                    func: "hello".into(),
                    args: vec![],
                    gas: 10,
                },
            ],
        ),
    );
    hv.send(call(parent, "start", 10));
    hv.create_state_root().await.unwrap();

    let child = derive_id(Some(parent), 0);
    assert_eq!(hv.actor_record(parent).unwrap().nonce, 1);
    assert_eq!(hv.actor_code(child).unwrap(), child_code);
    assert_eq!(hv.actor_storage(child).unwrap(), vec![b"hi".to_vec()]);
}

#[tokio::test]
async fn state_root_waits_for_message_chains() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let c = spawn(&hv, ScriptModule::new().export("store", vec![store(0, b"end")]));
    let relay = |to: ActorId, func: &str| Op::Send {
        to: Target::Actor(to),
        func: func.into(),
        args: vec![],
        gas: 10,
    };
    let b = spawn(&hv, ScriptModule::new().export("relay", vec![relay(c, "store")]));
    let a = spawn(&hv, ScriptModule::new().export("go", vec![relay(b, "relay")]));

    hv.send(call(a, "go", 10));
    hv.create_state_root().await.unwrap();
    assert!(!hv.scheduler().is_running());
    assert_eq!(hv.actor_storage(c).unwrap(), vec![b"end".to_vec()]);
}

#[tokio::test]
async fn set_state_root_is_fenced_while_running() {
    let slow = RecordingDriver::slow("slow", Duration::from_millis(200));
    let hv = hypervisor_with(
        Arc::new(MemStore::new()),
        HypervisorConfig::default(),
        vec![slow.clone() as Arc<dyn Driver>],
    )
    .await;
    let root = hv.create_state_root().await.unwrap();

    hv.send(Message::new(FuncRef::driver("slow", "wait"), vec![], 0));
    assert!(matches!(hv.set_state_root(root), Err(KernelError::SchedulerRunning)));

    hv.idle().await.unwrap();
    hv.set_state_root(root).unwrap();
    assert_eq!(slow.seen().len(), 1);
}

#[tokio::test]
async fn unknown_actor_goes_to_default_driver_when_configured() {
    let fallback = RecordingDriver::new("fallback");
    let config = HypervisorConfig {
        default_driver: Some("fallback".into()),
        ..HypervisorConfig::default()
    };
    let hv = hypervisor_with(
        Arc::new(MemStore::new()),
        config,
        vec![fallback.clone() as Arc<dyn Driver>],
    )
    .await;

    let mut msg = call(derive_id(None, 99), "anything", 1);
    let rx = msg.subscribe();
    hv.send(msg);
    assert!(rx.await.unwrap().is_ok());
    assert_eq!(fallback.seen()[0].func, "anything");
}

#[tokio::test]
async fn unknown_actor_without_default_driver_fails_the_message() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let missing = derive_id(None, 99);
    let mut msg = call(missing, "anything", 1);
    let rx = msg.subscribe();
    hv.send(msg);
    assert_eq!(
        rx.await.unwrap().error,
        Some(ExecutionError::UnknownActor(missing))
    );
    assert!(matches!(
        hv.load_actor(missing).await,
        Err(KernelError::UnknownActor(_))
    ));
}

#[tokio::test]
async fn metering_off_never_runs_out_of_gas() {
    let config = HypervisorConfig {
        meter: false,
        ..HypervisorConfig::default()
    };
    let hv = hypervisor(config).await;
    let id = spawn(
        &hv,
        ScriptModule::new().export("heavy", vec![Op::Charge(1_000_000), store(0, b"done")]),
    );
    let mut msg = call(id, "heavy", 0);
    let rx = msg.subscribe();
    hv.send(msg);
    let receipt = rx.await.unwrap();
    assert!(receipt.is_ok());
    assert_eq!((receipt.gas_used, receipt.ticks), (0, 0));
}

#[tokio::test]
async fn numeric_identity_continues_after_restore() {
    let mem = Arc::new(MemStore::new());
    let config = HypervisorConfig {
        identity: IdentityScheme::Numeric,
        ..HypervisorConfig::default()
    };
    let hv = hypervisor_with(mem.clone(), config.clone(), vec![]).await;
    assert_eq!(spawn(&hv, ScriptModule::new()), ActorId::from_nonce(0));
    assert_eq!(spawn(&hv, ScriptModule::new()), ActorId::from_nonce(1));
    let root = hv.create_state_root().await.unwrap();

    let restored = Hypervisor::builder(mem)
        .config(config)
        .container(hv_kernel::ScriptFactory)
        .root(root)
        .build()
        .await
        .unwrap();
    assert_eq!(restored.nonce(), 2);
    assert_eq!(spawn(&restored, ScriptModule::new()), ActorId::from_nonce(2));
}

#[tokio::test]
async fn create_actor_rejects_unknown_types_and_duplicate_ids() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    assert!(matches!(
        hv.create_actor(42, b"", None),
        Err(KernelError::UnknownContainerType(42))
    ));
    assert!(matches!(
        hv.create_actor(SCRIPT_TYPE, b"not cbor", None),
        Err(KernelError::Container { .. })
    ));
    assert_eq!(hv.nonce(), 0);

    let id = derive_id(None, 1000);
    let module = code(ScriptModule::new());
    hv.create_actor(SCRIPT_TYPE, &module, Some(id)).unwrap();
    assert!(matches!(
        hv.create_actor(SCRIPT_TYPE, &module, Some(id)),
        Err(KernelError::ActorExists(_))
    ));
}

#[tokio::test]
async fn drivers_get_a_handle_that_does_not_keep_the_hypervisor_alive() {
    let ingress = RecordingDriver::new("ingress");
    let hv = hypervisor_with(
        Arc::new(MemStore::new()),
        HypervisorConfig::default(),
        vec![ingress.clone() as Arc<dyn Driver>],
    )
    .await;
    let id = spawn(&hv, ScriptModule::new().export("poke", vec![store(0, b"poked")]));

    ingress.handle().send(call(id, "poke", 1)).unwrap();
    hv.create_state_root().await.unwrap();
    assert_eq!(hv.actor_storage(id).unwrap(), vec![b"poked".to_vec()]);

    drop(hv);
    assert!(matches!(
        ingress.handle().send(call(id, "poke", 1)),
        Err(KernelError::Shutdown)
    ));
}

#[tokio::test]
async fn duplicate_driver_ids_are_rejected() {
    let result = Hypervisor::builder(Arc::new(MemStore::new()))
        .driver(RecordingDriver::new("egress"))
        .driver(RecordingDriver::new("egress"))
        .build()
        .await;
    assert!(matches!(result, Err(KernelError::DuplicateDriver(id)) if id == "egress"));
}

#[tokio::test]
async fn fs_store_state_survives_rebuild() {
    let dir = TempDir::new().expect("tmp");
    let (id, root) = {
        let fs = Arc::new(FsStore::open(dir.path()).expect("open"));
        let hv = Hypervisor::builder(fs)
            .container(hv_kernel::ScriptFactory)
            .build()
            .await
            .unwrap();
        let id = hv
            .create_actor(
                SCRIPT_TYPE,
                &code(ScriptModule::new().export("init", vec![store(0, b"disk")])),
                None,
            )
            .unwrap()
            .actor;
        hv.send(call(id, "init", 5));
        (id, hv.create_state_root().await.unwrap())
    };

    let fs = Arc::new(FsStore::open(dir.path()).expect("reopen"));
    let hv = Hypervisor::builder(fs)
        .container(hv_kernel::ScriptFactory)
        .root(root)
        .build()
        .await
        .unwrap();
    assert_eq!(hv.actor_storage(id).unwrap(), vec![b"disk".to_vec()]);
    assert_eq!(hv.nonce(), 1);
}

#[tokio::test]
async fn oversized_slot_fails_the_message_not_the_scheduler() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let id = spawn(
        &hv,
        ScriptModule::new()
            .export("huge", vec![store(usize::MAX, b"x")])
            .export("wide", vec![store(MAX_STORAGE_SLOTS, b"x")])
            .export("ok", vec![store(0, b"fine")]),
    );

    let mut huge = call(id, "huge", 10);
    let huge_rx = huge.subscribe();
    let mut wide = call(id, "wide", 10);
    let wide_rx = wide.subscribe();
    hv.send([huge, wide, call(id, "ok", 10)]);

    assert_eq!(
        huge_rx.await.unwrap().error,
        Some(ExecutionError::SlotOutOfRange {
            slot: usize::MAX,
            limit: MAX_STORAGE_SLOTS
        })
    );
    assert!(matches!(
        wide_rx.await.unwrap().error,
        Some(ExecutionError::SlotOutOfRange { .. })
    ));
    hv.create_state_root().await.unwrap();
    assert!(!hv.scheduler().is_running());
    assert_eq!(hv.actor_storage(id).unwrap(), vec![b"fine".to_vec()]);
}

#[tokio::test]
async fn storage_growth_is_paid_for_in_gas() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let id = spawn(&hv, ScriptModule::new().export("far", vec![store(99, b"x")]));
    let mut msg = call(id, "far", 50);
    let rx = msg.subscribe();
    hv.send(msg);
    assert_eq!(
        rx.await.unwrap().error,
        Some(ExecutionError::OutOfGas {
            requested: 100,
            remaining: 50
        })
    );
}

const PANIC_TYPE: u32 = 0xdead;

struct PanicFactory;

impl ContainerFactory for PanicFactory {
    fn type_tag(&self) -> u32 {
        PANIC_TYPE
    }

    fn on_creation(&self, _code: &[u8], id: ActorId) -> anyhow::Result<ModuleHandle> {
        Ok(ModuleHandle {
            actor: id,
            type_tag: PANIC_TYPE,
            exports: vec!["boom".into()],
        })
    }

    fn instantiate(&self, _code: &[u8]) -> anyhow::Result<Box<dyn Container>> {
        Ok(Box::new(PanicContainer))
    }
}

struct PanicContainer;

#[async_trait]
impl Container for PanicContainer {
    async fn on_startup(&mut self, _cx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_message(&mut self, _cx: &mut ActorContext<'_>, message: &Message) -> anyhow::Result<()> {
        panic!("cannot handle {}", message.func.name)
    }

    fn get_interface(&self, name: &str) -> Option<Interface> {
        Some(Interface {
            name: name.into(),
            arity: 0,
        })
    }
}

#[tokio::test]
async fn container_panic_is_reported_and_scheduler_recovers() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    hv.register_container(PanicFactory);
    let bomb = hv.create_actor(PANIC_TYPE, b"", None).unwrap().actor;
    let steady = spawn(&hv, ScriptModule::new().export("ok", vec![store(0, b"fine")]));

    let mut boom = call(bomb, "boom", 10);
    let boom_rx = boom.subscribe();
    let mut ok = call(steady, "ok", 10);
    let ok_rx = ok.subscribe();
    hv.send([boom, ok]);

    let receipt = boom_rx.await.expect("receipt is delivered");
    assert_eq!(
        receipt.error,
        Some(ExecutionError::Panicked("cannot handle boom".into()))
    );
    assert!(ok_rx.await.unwrap().is_ok());
    hv.create_state_root().await.unwrap();
    assert!(!hv.scheduler().is_running());
    assert_eq!(hv.actor_storage(steady).unwrap(), vec![b"fine".to_vec()]);

    // a fresh instance is loaded for the next message
    let mut again = call(bomb, "boom", 10);
    let again_rx = again.subscribe();
    hv.send(again);
    assert!(matches!(
        again_rx.await.unwrap().error,
        Some(ExecutionError::Panicked(_))
    ));
}

#[tokio::test]
async fn spawn_onto_an_existing_id_fails_the_message() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let parent = spawn(
        &hv,
        ScriptModule::new().export(
            "start",
            vec![
                store(0, b"parent"),
                Op::Spawn {
                    type_tag: SCRIPT_TYPE,
                    code: code(ScriptModule::new()),
                },
                Op::Send {
                    to: Target::Child(0),
                    func: "hello".into(),
                    args: vec![],
                    gas: 10,
                },
            ],
        ),
    );
    let taken = derive_id(Some(parent), 0);
    let squatter = code(ScriptModule::new().export("hello", vec![store(0, b"wrong")]));
    hv.create_actor(SCRIPT_TYPE, &squatter, Some(taken)).unwrap();

    let mut msg = call(parent, "start", 10);
    let rx = msg.subscribe();
    hv.send(msg);
    assert_eq!(rx.await.unwrap().error, Some(ExecutionError::ActorExists(taken)));

    hv.create_state_root().await.unwrap();
    assert_eq!(hv.actor_record(parent).unwrap().nonce, 0);
    assert!(hv.actor_storage(parent).unwrap().is_empty());
    assert!(hv.actor_storage(taken).unwrap().is_empty());
    assert_eq!(hv.actor_code(taken).unwrap(), squatter);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn roots_taken_under_load_contain_whole_messages() {
    let mem = Arc::new(MemStore::new());
    let hv = hypervisor_with(mem.clone(), HypervisorConfig::default(), vec![]).await;
    let child = code(ScriptModule::new());
    let parent = spawn(
        &hv,
        ScriptModule::new().export(
            "spawn",
            vec![Op::Spawn {
                type_tag: SCRIPT_TYPE,
                code: child,
            }],
        ),
    );
    hv.create_state_root().await.unwrap();

    let sender = {
        let hv = hv.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                hv.send(call(parent, "spawn", 10));
                tokio::task::yield_now().await;
            }
        })
    };
    let mut roots = Vec::new();
    while !sender.is_finished() {
        roots.push(hv.create_state_root().await.unwrap());
        tokio::task::yield_now().await;
    }
    sender.await.unwrap();
    roots.push(hv.create_state_root().await.unwrap());
    roots.dedup();

    let mut last_nonce = 0;
    for root in roots {
        let replica = Hypervisor::builder(mem.clone())
            .container(ScriptFactory)
            .root(root)
            .build()
            .await
            .unwrap();
        // every child the parent's nonce accounts for exists, and no more
        let nonce = replica.actor_record(parent).unwrap().nonce;
        if nonce > 0 {
            assert!(replica.actor_record(derive_id(Some(parent), nonce - 1)).is_ok());
        }
        assert!(matches!(
            replica.actor_record(derive_id(Some(parent), nonce)),
            Err(KernelError::UnknownActor(_))
        ));
        last_nonce = nonce;
    }
    assert_eq!(last_nonce, 50);
}

#[tokio::test]
async fn failing_startup_fails_the_triggering_message() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let id = spawn(
        &hv,
        ScriptModule::new()
            .on_startup(vec![Op::Fail("no config".into())])
            .export("run", vec![]),
    );
    let mut msg = call(id, "run", 10);
    let rx = msg.subscribe();
    hv.send(msg);
    let receipt = rx.await.unwrap();
    assert_eq!(receipt.actor, Some(id));
    assert!(
        matches!(&receipt.error, Some(ExecutionError::Kernel(reason)) if reason.contains("no config")),
        "{receipt:?}"
    );
    assert!(matches!(hv.load_actor(id).await, Err(KernelError::Startup { .. })));
}

#[tokio::test]
async fn message_to_unregistered_driver_fails() {
    let hv = hypervisor(HypervisorConfig::default()).await;
    let mut msg = Message::new(FuncRef::driver("nowhere", "f"), vec![], 0);
    let rx = msg.subscribe();
    hv.send(msg);
    let receipt = rx.await.unwrap();
    assert_eq!(receipt.actor, None);
    assert_eq!(
        receipt.error,
        Some(ExecutionError::UnknownDriver("nowhere".into()))
    );
}

#[tokio::test]
async fn unregistered_default_driver_fails_unknown_actor_messages() {
    let config = HypervisorConfig {
        default_driver: Some("ghost".into()),
        ..HypervisorConfig::default()
    };
    let hv = hypervisor(config).await;
    let mut msg = call(derive_id(None, 7), "anything", 1);
    let rx = msg.subscribe();
    hv.send(msg);
    assert_eq!(
        rx.await.unwrap().error,
        Some(ExecutionError::UnknownDriver("ghost".into()))
    );
}

#[tokio::test]
async fn replica_loads_actors_held_only_by_its_peer() {
    let peer = MemStore::new();
    let hv = hypervisor_with(Arc::new(peer.clone()), HypervisorConfig::default(), vec![]).await;
    let id = spawn(
        &hv,
        ScriptModule::new()
            .export("init", vec![store(0, b"remote")])
            .export("touch", vec![Op::Charge(1)]),
    );
    hv.send(call(id, "init", 5));
    let root = hv.create_state_root().await.unwrap();

    let local = MemStore::new();
    let replica = Hypervisor::builder(Arc::new(RemoteStore::new(local.clone(), Some(peer))))
        .container(ScriptFactory)
        .root(root)
        .build()
        .await
        .unwrap();
    assert_eq!(replica.actor_storage(id).unwrap(), vec![b"remote".to_vec()]);

    let mut msg = call(id, "touch", 5);
    let rx = msg.subscribe();
    replica.send(msg);
    assert!(rx.await.unwrap().is_ok());
    // the code blob was fetched and cached locally
    assert!(local.len(EntryKind::Blob) > 0);
}
