//! End-to-end fabric scenarios over loopback HTTP: registry, gateway, and
//! services running in-process, talking through the real wire protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use yamf::wire::header;
use yamf::{
    Command, Environment, FabricClient, FabricConfig, Gateway, GatewayHandle, Payload, Registry,
    RegistryHandle, Service, ServiceOptions, SubscriptionService, YamfError, handler,
    subscription_handler,
};

async fn start_registry() -> RegistryHandle {
    Registry::start(
        FabricConfig::default(),
        "127.0.0.1:0",
        CancellationToken::new(),
    )
    .await
    .expect("registry starts")
}

async fn start_gateway(registry: &RegistryHandle) -> GatewayHandle {
    Gateway::start(
        FabricConfig {
            registry_url: registry.url(),
            ..FabricConfig::default()
        },
        "127.0.0.1:0",
        CancellationToken::new(),
    )
    .await
    .expect("gateway starts")
}

fn options(registry: &RegistryHandle) -> ServiceOptions {
    ServiceOptions::new(FabricConfig {
        registry_url: registry.url(),
        retry_delay_ms: 1,
        ..FabricConfig::default()
    })
}

fn client(registry: &RegistryHandle) -> FabricClient {
    FabricClient::new(FabricConfig {
        registry_url: registry.url(),
        ..FabricConfig::default()
    })
    .expect("client builds")
}

async fn call(client: &FabricClient, service: &str, payload: Payload) -> yamf::Result<Payload> {
    client
        .registry_command(
            Command::ServiceCall,
            &[(header::SERVICE_NAME, service)],
            &payload,
        )
        .await
}

fn text_of(payload: &Payload) -> String {
    payload.as_text().unwrap_or_default().to_string()
}

#[tokio::test]
async fn basic_service_call() {
    let registry = start_registry().await;
    let add = Service::start(
        "add",
        handler(|payload: Payload, _ctx| async move {
            let body = payload
                .as_json()
                .cloned()
                .ok_or_else(|| YamfError::Validation("expected JSON".into()))?;
            Ok(json!(body["a"].as_i64().unwrap_or(0) + body["b"].as_i64().unwrap_or(0)))
        }),
        options(&registry),
    )
    .await
    .expect("add starts");

    let result = call(&client(&registry), "add", Payload::Json(json!({"a": 2, "b": 3})))
        .await
        .unwrap();
    assert_eq!(result.as_json().unwrap(), &json!(5));

    add.terminate().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn dependent_call_chain() {
    let registry = start_registry().await;

    let test = Service::start(
        "test",
        handler(|payload: Payload, _ctx| async move {
            Ok(format!("|TEST| {}", payload.as_text().unwrap_or("")))
        }),
        options(&registry),
    )
    .await
    .expect("test starts");

    let test2 = Service::start(
        "test2",
        handler(|payload: Payload, ctx: yamf::Context| async move {
            let upstream = ctx
                .call("test", Payload::Text(format!("t2:{}", payload.as_text().unwrap_or(""))))
                .await?;
            Ok(format!("{} r2", upstream.as_text().unwrap_or("")))
        }),
        options(&registry),
    )
    .await
    .expect("test2 starts");

    let test3 = Service::start(
        "test3",
        handler(|_payload, ctx: yamf::Context| async move {
            let upstream = ctx.call("test2", Payload::Text("t3".to_string())).await?;
            Ok(format!("{} r3", upstream.as_text().unwrap_or("")))
        }),
        options(&registry),
    )
    .await
    .expect("test3 starts");

    let test4 = Service::start(
        "test4",
        handler(|_payload, ctx: yamf::Context| async move {
            let upstream = ctx.call("test3", Payload::Text("t4".to_string())).await?;
            Ok(format!("{} r4", upstream.as_text().unwrap_or("")))
        }),
        options(&registry),
    )
    .await
    .expect("test4 starts");

    let result = call(&client(&registry), "test4", Payload::Empty).await.unwrap();
    let text = text_of(&result);
    for fragment in ["|TEST|", "t2:", " r2", "t3", " r3", " r4"] {
        assert!(text.contains(fragment), "missing '{fragment}' in '{text}'");
    }

    test4.terminate().await;
    test3.terminate().await;
    test2.terminate().await;
    test.terminate().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn round_robin_distributes_exactly() {
    let registry = start_registry().await;
    let mut instances = Vec::new();
    for label in ["A", "B", "C"] {
        let instance = Service::start(
            "svc",
            handler(move |_payload, _ctx| async move { Ok(label.to_string()) }),
            options(&registry),
        )
        .await
        .expect("instance starts");
        instances.push(instance);
    }

    let client = client(&registry);
    let mut counts = std::collections::HashMap::new();
    for _ in 0..15 {
        let result = call(&client, "svc", Payload::Empty).await.unwrap();
        *counts.entry(text_of(&result)).or_insert(0u32) += 1;
    }
    assert_eq!(counts.len(), 3, "every instance served: {counts:?}");
    for (label, count) in counts {
        assert_eq!(count, 5, "uneven round-robin for {label}");
    }

    for instance in instances {
        instance.terminate().await;
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn route_through_gateway() {
    let registry = start_registry().await;
    let gateway = start_gateway(&registry).await;

    let echo = Service::start(
        "echo",
        handler(|payload: Payload, _ctx| async move {
            let body = payload.as_json().cloned().unwrap_or(Value::Null);
            Ok(json!({"echo": body}))
        }),
        options(&registry),
    )
    .await
    .expect("echo starts");

    client(&registry)
        .registry_command(
            Command::RouteRegister,
            &[
                (header::SERVICE_NAME, "echo"),
                (header::ROUTE_PATH, "/api/echo"),
                (header::ROUTE_DATATYPE, "json"),
            ],
            &Payload::Empty,
        )
        .await
        .unwrap();
    // The registry nudges the gateway asynchronously; nudge synchronously
    // so the test never races the background notification.
    client(&registry)
        .command(&gateway.url(), Command::RegistryUpdated, &[], &Payload::Empty)
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/api/echo", gateway.url()))
        .header("content-type", "application/json")
        .body("{\"m\":\"hi\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"echo": {"m": "hi"}}));

    echo.terminate().await;
    gateway.shutdown().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn gateway_appends_forwarded_hop_and_preserves_request() {
    let registry = start_registry().await;
    let gateway = start_gateway(&registry).await;

    // A raw backend (registered by hand) that reports what it received.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let location = format!("http://{}", listener.local_addr().unwrap());
    let app = axum::Router::new().fallback(axum::routing::any(
        |request: axum::extract::Request| async move {
            let method = request.method().to_string();
            let forwarded = request
                .headers()
                .get("forwarded")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let leaked = request.headers().contains_key("x-not-forwardable");
            let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
                .await
                .unwrap_or_default();
            axum::Json(json!({
                "method": method,
                "forwarded": forwarded,
                "leaked": leaked,
                "body": String::from_utf8_lossy(&bytes),
            }))
        },
    ));
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    let fabric = client(&registry);
    fabric
        .registry_command(
            Command::ServiceRegister,
            &[
                (header::SERVICE_NAME, "inspector"),
                (header::SERVICE_LOCATION, &location),
            ],
            &Payload::Empty,
        )
        .await
        .unwrap();
    fabric
        .registry_command(
            Command::RouteRegister,
            &[
                (header::SERVICE_NAME, "inspector"),
                (header::ROUTE_PATH, "/inspect"),
            ],
            &Payload::Empty,
        )
        .await
        .unwrap();
    fabric
        .command(&gateway.url(), Command::RegistryUpdated, &[], &Payload::Empty)
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .put(format!("{}/inspect", gateway.url()))
        .header("content-type", "text/plain")
        .header("x-not-forwardable", "secret")
        .body("original body")
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["method"], "PUT");
    assert_eq!(body["body"], "original body");
    assert_eq!(body["leaked"], false, "unlisted headers are filtered");
    let forwarded = body["forwarded"].as_str().unwrap();
    assert!(forwarded.contains("by="), "forwarded hop appended: {forwarded}");
    assert!(forwarded.contains("proto=http"), "proto recorded: {forwarded}");

    gateway.shutdown().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn pubsub_fan_out_with_partial_failure() {
    let registry = start_registry().await;

    let listener = SubscriptionService::start(
        "listener",
        vec![
            (
                "c".to_string(),
                subscription_handler(|_payload| async move {
                    Err::<String, _>(YamfError::Internal("h1 exploded".to_string()))
                }),
            ),
            (
                "c".to_string(),
                subscription_handler(|_payload| async move { Ok("ok".to_string()) }),
            ),
        ],
        options(&registry),
    )
    .await
    .expect("listener starts");

    let aggregate = client(&registry)
        .registry_command(
            Command::PubsubPublish,
            &[(header::PUBSUB_CHANNEL, "c")],
            &Payload::Json(json!({"x": 1})),
        )
        .await
        .unwrap();
    let body = aggregate.as_json().unwrap();

    assert_eq!(body["results"], json!(["ok"]));
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    assert_eq!(body["errors"][0]["status"], 500);
    assert!(body["errors"][0]["error"].as_str().unwrap().contains("h1 exploded"));
    assert!(body["errors"][0]["subId"].as_str().unwrap().starts_with("c#"));

    listener.terminate().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn publish_delivers_to_every_subscriber_exactly_once() {
    let registry = start_registry().await;

    let first_count = Arc::new(AtomicU32::new(0));
    let second_count = Arc::new(AtomicU32::new(0));

    let counted = |counter: Arc<AtomicU32>| {
        subscription_handler(move |_payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("counted".to_string())
            }
        })
    };

    let first = SubscriptionService::start(
        "first-listener",
        vec![("events".to_string(), counted(first_count.clone()))],
        options(&registry),
    )
    .await
    .expect("first listener starts");
    let second = SubscriptionService::start(
        "second-listener",
        vec![("events".to_string(), counted(second_count.clone()))],
        options(&registry),
    )
    .await
    .expect("second listener starts");

    let aggregate = client(&registry)
        .registry_command(
            Command::PubsubPublish,
            &[(header::PUBSUB_CHANNEL, "events")],
            &Payload::Json(json!({"n": 1})),
        )
        .await
        .unwrap();

    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
    assert_eq!(aggregate.as_json().unwrap()["results"], json!(["counted", "counted"]));

    first.terminate().await;
    second.terminate().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn register_lookup_unregister_round_trip() {
    let registry = start_registry().await;
    let fabric = client(&registry);

    let service = Service::start(
        "flicker",
        handler(|_payload, _ctx| async move { Ok("here".to_string()) }),
        options(&registry),
    )
    .await
    .expect("service starts");

    let found = fabric
        .registry_command(
            Command::ServiceLookup,
            &[(header::SERVICE_NAME, "flicker")],
            &Payload::Empty,
        )
        .await
        .unwrap();
    assert_eq!(text_of(&found), service.location());

    service.terminate().await;

    let result = fabric
        .registry_command(
            Command::ServiceLookup,
            &[(header::SERVICE_NAME, "flicker")],
            &Payload::Empty,
        )
        .await;
    assert!(matches!(result, Err(YamfError::NotFound(_))));
    registry.shutdown().await;
}

#[tokio::test]
async fn production_registry_requires_token() {
    let registry = Registry::start(
        FabricConfig {
            registry_token: Some("secret".to_string()),
            environment: Environment::new("production"),
            ..FabricConfig::default()
        },
        "127.0.0.1:0",
        CancellationToken::new(),
    )
    .await
    .expect("registry starts");

    let response = reqwest::Client::new()
        .post(registry.url())
        .header(header::COMMAND, "service-setup")
        .header(header::SERVICE_NAME, "sneaky")
        .header(header::SERVICE_HOME, "http://127.0.0.1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Registry token required");

    // With the token, the same command succeeds.
    let authorized = FabricClient::new(FabricConfig {
        registry_url: registry.url(),
        registry_token: Some("secret".to_string()),
        ..FabricConfig::default()
    })
    .unwrap();
    let location = authorized
        .registry_command(
            Command::ServiceSetup,
            &[
                (header::SERVICE_NAME, "sneaky"),
                (header::SERVICE_HOME, "http://127.0.0.1"),
            ],
            &Payload::Empty,
        )
        .await
        .unwrap();
    assert!(text_of(&location).starts_with("http://127.0.0.1:"));

    registry.shutdown().await;
}

#[tokio::test]
async fn cache_update_broadcast_reaches_running_services() {
    let registry = start_registry().await;
    let watcher = Service::start(
        "watcher",
        handler(|_payload, _ctx| async move { Ok("watching".to_string()) }),
        options(&registry),
    )
    .await
    .expect("watcher starts");

    let late = Service::start(
        "late-arrival",
        handler(|_payload, _ctx| async move { Ok("late".to_string()) }),
        options(&registry),
    )
    .await
    .expect("late service starts");

    // The broadcast is fire-and-forget; give it a moment to land.
    let mut cached = Vec::new();
    for _ in 0..50 {
        cached = watcher.cache().locations("late-arrival").await;
        if !cached.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(cached, vec![late.location().to_string()]);

    late.terminate().await;
    watcher.terminate().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn gateway_view_matches_registry_after_update() {
    let registry = start_registry().await;
    let gateway = start_gateway(&registry).await;
    let fabric = client(&registry);

    let service = Service::start(
        "mirror",
        handler(|_payload, _ctx| async move { Ok("mirrored".to_string()) }),
        options(&registry),
    )
    .await
    .expect("service starts");
    fabric
        .registry_command(
            Command::RouteRegister,
            &[
                (header::SERVICE_NAME, "mirror"),
                (header::ROUTE_PATH, "/mirror"),
            ],
            &Payload::Empty,
        )
        .await
        .unwrap();

    fabric
        .command(&gateway.url(), Command::RegistryUpdated, &[], &Payload::Empty)
        .await
        .unwrap();

    let registry_snapshot = fabric
        .registry_command(Command::RegistryPull, &[], &Payload::Empty)
        .await
        .unwrap();
    let gateway_view = fabric
        .command(&gateway.url(), Command::GatewayPull, &[], &Payload::Empty)
        .await
        .unwrap();

    assert_eq!(
        gateway_view.as_json().unwrap()["snapshot"],
        registry_snapshot.as_json().unwrap().clone(),
        "the gateway's pulled view equals registry state"
    );

    service.terminate().await;
    gateway.shutdown().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn controller_route_matches_by_prefix_through_gateway() {
    let registry = start_registry().await;
    let gateway = start_gateway(&registry).await;

    let files = Service::start(
        "files",
        handler(|_payload, _ctx| async move { Ok("a file".to_string()) }),
        options(&registry),
    )
    .await
    .expect("files starts");

    client(&registry)
        .registry_command(
            Command::RouteRegister,
            &[
                (header::SERVICE_NAME, "files"),
                (header::ROUTE_PATH, "/files/*"),
            ],
            &Payload::Empty,
        )
        .await
        .unwrap();
    client(&registry)
        .command(&gateway.url(), Command::RegistryUpdated, &[], &Payload::Empty)
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let deep = http
        .get(format!("{}/files/a/b/c.txt", gateway.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(deep.status().as_u16(), 200);
    assert_eq!(deep.text().await.unwrap(), "a file");

    // A sibling path that merely shares the string prefix does not match.
    let miss = http
        .get(format!("{}/filesystem", gateway.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(miss.status().as_u16(), 404);

    files.terminate().await;
    gateway.shutdown().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn auth_guarded_service_rejects_without_token() {
    let registry = start_registry().await;

    // The auth service approves exactly the token "letmein".
    let auth = Service::start(
        "auth",
        handler(|payload: Payload, _ctx| async move {
            let body = payload.as_json().cloned().unwrap_or(Value::Null);
            if body["verifyAccess"] == json!("letmein") {
                Ok(json!({"user": "tester"}))
            } else {
                Ok(json!({"error": "bad token"}))
            }
        }),
        options(&registry),
    )
    .await
    .expect("auth starts");

    let guarded = Service::start(
        "vault",
        handler(|_payload, _ctx| async move { Ok("the goods".to_string()) }),
        options(&registry).with_auth_service("auth"),
    )
    .await
    .expect("vault starts");

    let fabric = client(&registry);

    // No token: 401.
    let result = call(&fabric, "vault", Payload::Empty).await;
    assert!(matches!(result, Err(YamfError::Auth(_))), "missing token is 401");

    // Wrong token: 401.
    let result = fabric
        .registry_command(
            Command::ServiceCall,
            &[(header::SERVICE_NAME, "vault"), (header::AUTH_TOKEN, "nope")],
            &Payload::Empty,
        )
        .await;
    assert!(matches!(result, Err(YamfError::Auth(_))), "invalid token is 401");

    // Correct token: the call goes through.
    let result = fabric
        .registry_command(
            Command::ServiceCall,
            &[(header::SERVICE_NAME, "vault"), (header::AUTH_TOKEN, "letmein")],
            &Payload::Empty,
        )
        .await
        .unwrap();
    assert_eq!(text_of(&result), "the goods");

    guarded.terminate().await;
    auth.terminate().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn auth_service_unreachable_is_unavailable() {
    let registry = start_registry().await;
    let guarded = Service::start(
        "vault",
        handler(|_payload, _ctx| async move { Ok("the goods".to_string()) }),
        options(&registry).with_auth_service("auth-nowhere"),
    )
    .await
    .expect("vault starts");

    let result = client(&registry)
        .registry_command(
            Command::ServiceCall,
            &[(header::SERVICE_NAME, "vault"), (header::AUTH_TOKEN, "any")],
            &Payload::Empty,
        )
        .await;
    assert!(
        matches!(result, Err(YamfError::Unavailable(_))),
        "unregistered auth service is 503"
    );

    guarded.terminate().await;
    registry.shutdown().await;
}
