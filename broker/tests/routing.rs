// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multi-rank routing scenarios over the in-memory overlay.

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use broker::conf::Params;
use broker::handle::Handle;
use broker::modules::{ModuleContext, RegistryLoader};
use broker::overlay::MemOverlay;
use broker::Broker;
use broker_data::error::Errno;
use broker_data::message::{
    flags, Body, Credentials, Message, MessageType, ROLE_USER,
};
use serde_json::json;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Spawns a linked instance; per-rank module registries and broker-side
/// subscriptions come from the closures.
fn spawn_instance(
    size: u32,
    online: bool,
    loader_for: impl Fn(u32) -> RegistryLoader,
    subs_for: impl Fn(u32) -> Vec<&'static str>,
) -> Vec<Arc<Handle>> {
    let mut handles = Vec::new();
    for overlay in MemOverlay::instance(size, 2) {
        let rank = overlay.rank();
        let conf = Params {
            rank,
            size,
            start_online: online,
            ..Default::default()
        };
        let mut broker =
            Broker::new(conf, overlay, Box::new(loader_for(rank)));
        for sub in subs_for(rank) {
            broker.subscribe(sub);
        }
        handles.push(broker.handle());
        tokio::spawn(broker.run());
    }
    handles
}

async fn rpc(handle: &Handle, req: Message) -> Message {
    timeout(WAIT, handle.rpc(req))
        .await
        .expect("rpc timed out")
        .expect("rpc failed")
}

fn insmod_request(path: &str) -> Message {
    Message::new_request(
        "broker.insmod",
        Body::Json(json!({"path": path, "args": []})),
    )
}

/// A module that reports ready and echoes request payloads until unloaded.
fn echo_registry() -> RegistryLoader {
    let mut registry = RegistryLoader::new();
    registry.register("echo", || {
        Box::new(|ctx: &ModuleContext| -> anyhow::Result<()> {
            ctx.ready();
            while let Some(msg) = ctx.recv() {
                if msg.mtype == MessageType::Request {
                    ctx.respond(&msg, msg.body.clone())?;
                }
            }
            Ok(())
        })
    });
    registry
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_to_unknown_service() {
    let handles =
        spawn_instance(2, true, |_| RegistryLoader::new(), |_| vec![]);

    let req = Message::new_request("nope.do", Body::Empty);
    let resp = rpc(&handles[1], req).await;

    assert_eq!(resp.errnum, Errno::NoSys.code());
    assert_eq!(
        resp.errstr(),
        Some("No service matching nope.do is registered")
    );
    // terminal response frees the matchtag
    assert_eq!(handles[1].matchtags_outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_then_list() {
    let handles = spawn_instance(1, true, |_| echo_registry(), |_| vec![]);

    let resp = rpc(&handles[0], insmod_request("./libecho.so")).await;
    assert_eq!(resp.errnum, 0);

    let resp = rpc(
        &handles[0],
        Message::new_request("broker.lsmod", Body::Json(json!({}))),
    )
    .await;
    assert_eq!(resp.errnum, 0);
    let mods = resp.json().expect("json body")["mods"]
        .as_array()
        .expect("mods array")
        .clone();
    assert_eq!(mods.len(), 1);
    assert_eq!(mods[0]["name"], "echo");
    assert_eq!(mods[0]["state"], "running");
    assert_eq!(mods[0]["services"][0], "echo");

    // loading the same name again is refused
    let resp = rpc(&handles[0], insmod_request("./libecho.so")).await;
    assert_eq!(resp.errnum, Errno::Exist.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_round_trip_through_module() {
    let handles = spawn_instance(2, true, |_| echo_registry(), |_| vec![]);

    // load on rank 0, call from rank 1: the request walks up the tree and
    // the response walks back down
    let resp = rpc(&handles[0], insmod_request("./libecho.so")).await;
    assert_eq!(resp.errnum, 0);

    let req = Message::new_request(
        "echo.ping",
        Body::Json(json!({"x": "marks the spot"})),
    );
    let resp = rpc(&handles[1], req).await;
    assert_eq!(resp.errnum, 0);
    assert_eq!(resp.json().expect("json body")["x"], "marks the spot");
}

/// A per-rank echo module whose responses carry the serving rank.
fn rank_echo_registry(rank: u32) -> RegistryLoader {
    let mut registry = RegistryLoader::new();
    registry.register("echo", move || {
        Box::new(move |ctx: &ModuleContext| -> anyhow::Result<()> {
            ctx.ready();
            while let Some(msg) = ctx.recv() {
                if msg.mtype == MessageType::Request {
                    ctx.respond(&msg, Body::Json(json!({"rank": rank})))?;
                }
            }
            Ok(())
        })
    });
    registry
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upstream_flag_skips_local_service() {
    let handles = spawn_instance(2, true, rank_echo_registry, |_| vec![]);
    for handle in &handles {
        let resp = rpc(handle, insmod_request("./libecho.so")).await;
        assert_eq!(resp.errnum, 0);
    }

    // unflagged, the local instance answers
    let resp = rpc(
        &handles[1],
        Message::new_request("echo.where", Body::Empty),
    )
    .await;
    assert_eq!(resp.json().expect("json body")["rank"], 1);

    // flagged upstream and addressed at this rank, an ancestor must answer
    let mut req = Message::new_request("echo.where", Body::Empty);
    req.set_flag(flags::UPSTREAM);
    req.nodeid = 1;
    let resp = rpc(&handles[1], req).await;
    assert_eq!(resp.json().expect("json body")["rank"], 0);

    // addressed at a specific rank, the overlay routes downstream
    let mut req = Message::new_request("echo.where", Body::Empty);
    req.nodeid = 1;
    let resp = rpc(&handles[0], req).await;
    assert_eq!(resp.json().expect("json body")["rank"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_insmod_failure_reports_module_errno() {
    let handles = spawn_instance(
        1,
        true,
        |_| {
            let mut registry = RegistryLoader::new();
            registry.register("broken", || {
                Box::new(|_ctx: &ModuleContext| -> anyhow::Result<()> {
                    Err(anyhow::Error::new(Errno::NoMem))
                })
            });
            registry
        },
        |_| vec![],
    );

    let resp = rpc(&handles[0], insmod_request("./libbroken.so")).await;
    assert_eq!(resp.errnum, Errno::NoMem.code());

    // the exited module left no service entry behind
    let resp = rpc(
        &handles[0],
        Message::new_request("broken.work", Body::Empty),
    )
    .await;
    assert_eq!(resp.errnum, Errno::NoSys.code());

    let resp = rpc(
        &handles[0],
        Message::new_request("broker.lsmod", Body::Json(json!({}))),
    )
    .await;
    let mods = resp.json().expect("json body")["mods"]
        .as_array()
        .expect("mods array")
        .clone();
    assert!(mods.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_event_ordering_across_ranks() {
    let handles = spawn_instance(
        3,
        true,
        |_| RegistryLoader::new(),
        |_| vec!["test"],
    );

    // publish from a leaf; event.pub resolves on rank 0 only
    for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        let req = Message::new_request(
            "event.pub",
            Body::Json(json!({"topic": format!("test.{name}"), "flags": 0})),
        );
        let resp = rpc(&handles[2], req).await;
        assert_eq!(resp.errnum, 0);
        assert_eq!(resp.json().expect("json body")["seq"], i as u64 + 1);
    }

    for handle in &handles {
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let event = timeout(WAIT, handle.next_event())
                .await
                .expect("event timed out")
                .expect("event stream");
            assert_eq!(event.seq, i as u32 + 1);
            assert_eq!(event.topic(), Some(format!("test.{name}").as_str()));
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rmmod_resolves_service_and_request() {
    let handles = spawn_instance(1, true, |_| echo_registry(), |_| vec![]);

    let resp = rpc(&handles[0], insmod_request("./libecho.so")).await;
    assert_eq!(resp.errnum, 0);

    // request served while loaded
    let resp = rpc(
        &handles[0],
        Message::new_request("echo.work", Body::Empty),
    )
    .await;
    assert_eq!(resp.errnum, 0);

    // unload resolves exactly once, with success
    let resp = rpc(
        &handles[0],
        Message::new_request("broker.rmmod", Body::Json(json!({"name": "echo"}))),
    )
    .await;
    assert_eq!(resp.errnum, 0);

    // the prefix no longer resolves
    let resp = rpc(
        &handles[0],
        Message::new_request("echo.work", Body::Empty),
    )
    .await;
    assert_eq!(resp.errnum, Errno::NoSys.code());
    assert_eq!(
        resp.errstr(),
        Some("No service matching echo.work is registered")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rmmod_with_request_in_flight() {
    // The channel pair lets the test hold the module mid-request: the
    // module reports when it has picked the request up, then blocks until
    // the test releases it.
    let (got_tx, got_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let slots = Arc::new(Mutex::new(Some((got_tx, release_rx))));

    let handles = spawn_instance(
        1,
        true,
        move |_| {
            let mut registry = RegistryLoader::new();
            let slots = slots.clone();
            registry.register("slow", move || {
                let (got_tx, release_rx) =
                    slots.lock().unwrap().take().expect("loaded once");
                Box::new(move |ctx: &ModuleContext| -> anyhow::Result<()> {
                    ctx.ready();
                    if let Some(msg) = ctx.recv() {
                        got_tx.send(()).ok();
                        release_rx
                            .recv_timeout(Duration::from_secs(5))
                            .ok();
                        ctx.respond(&msg, Body::Empty)?;
                    }
                    Ok(())
                })
            });
            registry
        },
        |_| vec![],
    );

    let resp = rpc(&handles[0], insmod_request("./libslow.so")).await;
    assert_eq!(resp.errnum, 0);

    // client A's request reaches the module, which holds it unanswered
    let handle = handles[0].clone();
    let client = tokio::spawn(async move {
        handle
            .rpc(Message::new_request("slow.work", Body::Empty))
            .await
    });
    got_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("module picked up the request");

    // unload arrives while the request is still outstanding
    let handle = handles[0].clone();
    let rmmod = tokio::spawn(async move {
        handle
            .rpc(Message::new_request(
                "broker.rmmod",
                Body::Json(json!({"name": "slow"})),
            ))
            .await
    });

    // the unload cannot finish while the module holds the request; a
    // lsmod round trip settles the router queue and must still show it
    tokio::time::sleep(Duration::from_millis(100)).await;
    let resp = rpc(
        &handles[0],
        Message::new_request("broker.lsmod", Body::Json(json!({}))),
    )
    .await;
    let mods = resp.json().expect("json body")["mods"]
        .as_array()
        .expect("mods array")
        .clone();
    assert_eq!(mods.len(), 1);
    assert_eq!(mods[0]["state"], "running");

    // release the module: it completes before EXITED, so client A gets
    // the module's own response rather than an error
    release_tx.send(()).expect("module waiting");
    let resp = timeout(WAIT, client)
        .await
        .expect("client timed out")
        .expect("client task")
        .expect("client rpc");
    assert_eq!(resp.errnum, 0);

    // the unload resolves exactly once, with success
    let resp = timeout(WAIT, rmmod)
        .await
        .expect("rmmod timed out")
        .expect("rmmod task")
        .expect("rmmod rpc");
    assert_eq!(resp.errnum, 0);

    // once the module is gone the same request resolves to the error a
    // never-registered service would produce
    let resp = rpc(
        &handles[0],
        Message::new_request("slow.work", Body::Empty),
    )
    .await;
    assert_eq!(resp.errnum, Errno::NoSys.code());
    assert_eq!(
        resp.errstr(),
        Some("No service matching slow.work is registered")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_module_answers_then_exits() {
    let handles = spawn_instance(
        1,
        true,
        |_| {
            let mut registry = RegistryLoader::new();
            // answers a single request, then unloads itself
            registry.register("oneshot", || {
                Box::new(|ctx: &ModuleContext| -> anyhow::Result<()> {
                    ctx.ready();
                    if let Some(msg) = ctx.recv() {
                        ctx.respond(&msg, Body::Empty)?;
                    }
                    Ok(())
                })
            });
            registry
        },
        |_| vec![],
    );

    let resp = rpc(&handles[0], insmod_request("./liboneshot.so")).await;
    assert_eq!(resp.errnum, 0);

    let resp = rpc(
        &handles[0],
        Message::new_request("oneshot.go", Body::Empty),
    )
    .await;
    assert_eq!(resp.errnum, 0);

    // after the module exits the switch is clean again
    let resp = rpc(
        &handles[0],
        Message::new_request("oneshot.go", Body::Empty),
    )
    .await;
    assert_eq!(resp.errnum, Errno::NoSys.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guest_service_registration() {
    let handles = spawn_instance(
        1,
        true,
        |_| {
            let mut registry = RegistryLoader::new();
            // performs guest-credentialed registrations and reports the
            // outcome through its exit errnum
            registry.register("guest", || {
                Box::new(|ctx: &ModuleContext| -> anyhow::Result<()> {
                    let mut req = Message::new_request(
                        "service.add",
                        Body::Json(json!({"service": "1001-foo"})),
                    );
                    req.cred = Credentials::new(1001, ROLE_USER);
                    let resp = ctx.rpc(req)?;
                    if resp.errnum != 0 {
                        return Err(Errno::Inval.into());
                    }

                    let mut req = Message::new_request(
                        "service.add",
                        Body::Json(json!({"service": "foo"})),
                    );
                    req.cred = Credentials::new(1001, ROLE_USER);
                    let resp = ctx.rpc(req)?;
                    if resp.errnum != Errno::Perm.code() {
                        return Err(Errno::Inval.into());
                    }
                    ctx.ready();
                    Ok(())
                })
            });
            registry
        },
        |_| vec![],
    );

    // success here means both in-module assertions held
    let resp = rpc(&handles[0], insmod_request("./libguest.so")).await;
    assert_eq!(resp.errnum, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pre_online_gate() {
    let handles = spawn_instance(
        1,
        false, // broker stays offline
        |_| {
            let mut registry = RegistryLoader::new();
            // a connector-style module forwarding a client request
            registry.register("conn", || {
                Box::new(|ctx: &ModuleContext| -> anyhow::Result<()> {
                    let mut req =
                        Message::new_request("foo.bar", Body::Empty);
                    req.matchtag = 77;
                    req.route.push("client-xyz");
                    ctx.send(req)?;

                    let resp = ctx.recv().ok_or(Errno::Io)?;
                    if resp.mtype != MessageType::Response
                        || resp.errnum != Errno::Again.code()
                        || resp.errstr()
                            != Some(
                                "Upstream broker is offline. \
                                 Try again later.",
                            )
                    {
                        return Err(Errno::Inval.into());
                    }
                    ctx.ready();
                    Ok(())
                })
            });
            registry
        },
        |_| vec![],
    );

    let resp = rpc(&handles[0], insmod_request("./libconn.so")).await;
    assert_eq!(resp.errnum, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_add_remove_round_trip() {
    let handles = spawn_instance(
        1,
        true,
        |_| {
            let mut registry = RegistryLoader::new();
            registry.register("svc", || {
                Box::new(|ctx: &ModuleContext| -> anyhow::Result<()> {
                    let resp = ctx.rpc(Message::new_request(
                        "service.add",
                        Body::Json(json!({"service": "extra"})),
                    ))?;
                    if resp.errnum != 0 {
                        return Err(Errno::Inval.into());
                    }
                    let resp = ctx.rpc(Message::new_request(
                        "service.remove",
                        Body::Json(json!({"service": "extra"})),
                    ))?;
                    if resp.errnum != 0 {
                        return Err(Errno::Inval.into());
                    }
                    // the switch is back to its prior state
                    let resp = ctx.rpc(Message::new_request(
                        "service.remove",
                        Body::Json(json!({"service": "extra"})),
                    ))?;
                    if resp.errnum != Errno::NoEnt.code() {
                        return Err(Errno::Inval.into());
                    }
                    ctx.ready();
                    Ok(())
                })
            });
            registry
        },
        |_| vec![],
    );

    let resp = rpc(&handles[0], insmod_request("./libsvc.so")).await;
    assert_eq!(resp.errnum, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_module_subscription_delivery() {
    let handles = spawn_instance(
        1,
        true,
        |_| {
            let mut registry = RegistryLoader::new();
            // subscribes to "note", acknowledges the first matching event
            // with an event of its own
            registry.register("lisn", || {
                Box::new(|ctx: &ModuleContext| -> anyhow::Result<()> {
                    let resp = ctx.rpc(Message::new_request(
                        "broker.sub",
                        Body::Json(json!({"topic": "note"})),
                    ))?;
                    if resp.errnum != 0 {
                        return Err(Errno::Inval.into());
                    }
                    ctx.ready();
                    while let Some(msg) = ctx.recv() {
                        if msg.mtype == MessageType::Event {
                            ctx.send(Message::new_event(
                                "seen.it",
                                Body::Empty,
                            ))?;
                            break;
                        }
                    }
                    Ok(())
                })
            });
            registry
        },
        |_| vec![],
    );

    handles[0].subscribe("seen");

    let resp = rpc(&handles[0], insmod_request("./liblisn.so")).await;
    assert_eq!(resp.errnum, 0);

    let resp = rpc(
        &handles[0],
        Message::new_request(
            "event.pub",
            Body::Json(json!({"topic": "note.hello", "flags": 0})),
        ),
    )
    .await;
    assert_eq!(resp.errnum, 0);

    let event = timeout(WAIT, handles[0].next_event())
        .await
        .expect("event timed out")
        .expect("event stream");
    assert_eq!(event.topic(), Some("seen.it"));
    assert_eq!(event.seq, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_drains_modules() {
    let overlays = MemOverlay::instance(1, 2);
    let conf = Params::default();
    let broker = Broker::new(
        conf,
        overlays.into_iter().next().expect("one overlay"),
        Box::new(echo_registry()),
    );
    let handle = broker.handle();
    let task = tokio::spawn(broker.run());

    let resp = rpc(&handle, insmod_request("./libecho.so")).await;
    assert_eq!(resp.errnum, 0);

    handle.shutdown();
    timeout(WAIT, task)
        .await
        .expect("shutdown timed out")
        .expect("broker task")
        .expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_owner_only_endpoints_reject_guests() {
    let handles = spawn_instance(1, true, |_| echo_registry(), |_| vec![]);

    let mut req = Message::new_request(
        "broker.rmmod",
        Body::Json(json!({"name": "echo"})),
    );
    req.cred = Credentials::new(1001, ROLE_USER);
    let resp = rpc(&handles[0], req).await;
    assert_eq!(resp.errnum, Errno::Perm.code());
}
