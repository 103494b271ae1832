//! End-to-end routing scenarios across components, processors, and the
//! route lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchyard_engine::component::feed::{FEED_KEY, FEED_OPERATION};
use switchyard_engine::core::{keys, Exchange, TypeKey, Value};
use switchyard_engine::processor::split::Splitter;
use switchyard_engine::processor::StringConcat;
use switchyard_engine::route::{SplitDef, StrategyRef};
use switchyard_engine::{
    Bean, BeanMethod, ChangeFeed, EngineConfig, EngineError, MapProperties, ParamBinding,
    RedeliveryPolicy, RouteBuilder, RouteStatus, StepsDsl, SwitchyardContext,
};

const WAIT: Duration = Duration::from_secs(5);

fn greeter() -> Bean {
    Bean::new()
        .method(
            "greet",
            BeanMethod::sync(vec![ParamBinding::body(TypeKey::Text)], |args| {
                Ok(Some(Value::from(format!("{} World", args.require::<String>(0)?))))
            }),
        )
        .default_method("greet")
}

#[tokio::test]
async fn bean_route_replies_and_counts_each_exchange() {
    let ctx = SwitchyardContext::new();
    ctx.register_bean("greeter", greeter());
    ctx.add_routes([RouteBuilder::from("direct:hello").route_id("hello").bean("greeter")])
        .await
        .unwrap();
    ctx.start().await.unwrap();

    let template = ctx.producer_template();
    for _ in 0..3 {
        let reply = template.request_body("direct:hello", "Hello").await.unwrap();
        assert_eq!(reply, Value::from("Hello World"));
    }

    let stats = ctx.route_stats("hello").unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.in_flight, 0);
    ctx.stop().await;
}

#[tokio::test]
async fn change_feed_delivers_in_order_and_survives_restart() {
    let ctx = SwitchyardContext::new();
    let feed = Arc::new(ChangeFeed::new());
    ctx.registry().bind("orders", Arc::clone(&feed));
    ctx.add_routes([RouteBuilder::from("feed:orders?pollDelay=20")
        .route_id("orders")
        .to("mock:changes")])
        .await
        .unwrap();

    let mock = ctx.mock("mock:changes").unwrap();
    mock.expect_message_count(3);
    feed.put("K1", "one");
    feed.update("K2", "two");
    feed.delete("K3");

    ctx.start().await.unwrap();
    mock.assert_is_satisfied(WAIT).await.unwrap();

    let received = mock.received_exchanges();
    let seen: Vec<(String, String)> = received
        .iter()
        .map(|ex| {
            (
                ex.header(FEED_KEY).map(ToString::to_string).unwrap_or_default(),
                ex.header(FEED_OPERATION).map(ToString::to_string).unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            ("K1".to_string(), "PUT".to_string()),
            ("K2".to_string(), "UPDATE".to_string()),
            ("K3".to_string(), "DELETE".to_string()),
        ]
    );

    ctx.stop_route("orders").await.unwrap();
    ctx.start_route("orders").await.unwrap();
    mock.reset();
    mock.expect_message_count(1);
    feed.put("K4", "four");
    mock.assert_is_satisfied(WAIT).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.received_bodies(), vec![Value::from("four")]);
    ctx.stop().await;
}

#[tokio::test]
async fn split_and_concat_round_trips_through_a_route() {
    let ctx = SwitchyardContext::new();
    ctx.add_routes([RouteBuilder::from("direct:csv").split(
        SplitDef::new(Splitter::Tokenize(",".into()))
            .steps(|s| s.to("mock:parts"))
            .strategy(StrategyRef::inline(StringConcat::new(","))),
    )])
    .await
    .unwrap();
    ctx.start().await.unwrap();

    let reply = ctx.producer_template().request_body("direct:csv", "a,b,c").await.unwrap();
    assert_eq!(reply, Value::from("a,b,c"));
    assert_eq!(
        ctx.mock("mock:parts").unwrap().received_bodies(),
        vec![Value::from("a"), Value::from("b"), Value::from("c")]
    );
    ctx.stop().await;
}

#[tokio::test]
async fn empty_split_sends_nothing_and_skips_the_strategy() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let counting = move |previous: Option<Exchange>, current: Exchange| {
        counter.fetch_add(1, Ordering::SeqCst);
        previous.unwrap_or(current)
    };

    let ctx = SwitchyardContext::new();
    ctx.add_routes([RouteBuilder::from("direct:empty").split(
        SplitDef::new(Splitter::Tokenize(",".into()))
            .steps(|s| s.to("mock:parts"))
            .strategy(StrategyRef::inline(counting)),
    )])
    .await
    .unwrap();
    ctx.start().await.unwrap();

    ctx.producer_template().send_body("direct:empty", "").await.unwrap();
    assert_eq!(ctx.mock("mock:parts").unwrap().received_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    ctx.stop().await;
}

#[tokio::test]
async fn unknown_destination_scheme_rejects_the_route() {
    let ctx = SwitchyardContext::new();
    let err = ctx
        .add_routes([RouteBuilder::from("direct:in").to("nosuch:thing")])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSuchEndpointComponent { .. }), "got {err}");
    assert!(ctx.route_ids().is_empty());
}

#[tokio::test]
async fn dead_letter_channel_takes_failed_one_way_exchanges() {
    let ctx = SwitchyardContext::new();
    ctx.add_routes([RouteBuilder::from("seda:work")
        .route_id("work")
        .dead_letter_channel("mock:dead")
        .process_named("validate", |ex| {
            if ex.body().to_string().is_empty() {
                anyhow::bail!("empty order");
            }
            Ok(())
        })
        .to("mock:done")])
    .await
    .unwrap();
    ctx.start().await.unwrap();

    let dead = ctx.mock("mock:dead").unwrap();
    dead.expect_message_count(1);
    let template = ctx.producer_template();
    template.send_body("seda:work", "").await.unwrap();
    template.send_body("seda:work", "order-1").await.unwrap();

    dead.assert_is_satisfied(WAIT).await.unwrap();
    let failed = &dead.received_exchanges()[0];
    assert_eq!(failed.property(keys::FAILURE_STEP), Some(&Value::from("validate")));
    assert_eq!(failed.property(keys::FAILURE_ROUTE_ID), Some(&Value::from("work")));

    let done = ctx.mock("mock:done").unwrap();
    done.expect_bodies_received([Value::from("order-1")]);
    done.assert_is_satisfied(WAIT).await.unwrap();
    ctx.stop().await;
}

#[tokio::test]
async fn redelivery_recovers_from_transient_failures() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);

    let ctx = SwitchyardContext::new();
    ctx.add_routes([RouteBuilder::from("direct:flaky")
        .redelivery(RedeliveryPolicy {
            maximum_redeliveries: 3,
            redelivery_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        })
        .process_named("flaky", move |ex| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("not yet");
            }
            ex.set_body("ok");
            Ok(())
        })])
    .await
    .unwrap();
    ctx.start().await.unwrap();

    let reply = ctx.producer_template().request_body("direct:flaky", "x").await.unwrap();
    assert_eq!(reply, Value::from("ok"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    ctx.stop().await;
}

#[tokio::test]
async fn placeholders_resolve_and_excluded_routes_are_skipped() {
    let config = EngineConfig {
        route_exclude_patterns: vec!["debug-*".to_string()],
        ..EngineConfig::default()
    };
    let properties = MapProperties::new().with("target", "mock:resolved");
    let ctx = SwitchyardContext::with_properties(config, Arc::new(properties));

    let ids = ctx
        .add_routes([
            RouteBuilder::from("direct:in").route_id("main").to("{{target}}"),
            RouteBuilder::from("direct:debug").route_id("debug-tap").to("mock:debug"),
        ])
        .await
        .unwrap();
    assert_eq!(ids, vec!["main".to_string()]);
    ctx.start().await.unwrap();

    ctx.producer_template().send_body("direct:in", "payload").await.unwrap();
    assert_eq!(
        ctx.mock("mock:resolved").unwrap().received_bodies(),
        vec![Value::from("payload")]
    );
    assert!(ctx.route_status("debug-tap").is_err());
    ctx.stop().await;
}

#[tokio::test]
async fn concurrent_lifecycle_calls_leave_a_consistent_state() {
    let ctx = Arc::new(SwitchyardContext::new());
    ctx.add_routes([RouteBuilder::from("direct:busy").route_id("busy").to("mock:sink")])
        .await
        .unwrap();
    ctx.start().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let ctx = Arc::clone(&ctx);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                ctx.stop_route("busy").await
            } else {
                ctx.start_route("busy").await
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let status = ctx.route_status("busy").unwrap();
    assert!(matches!(status, RouteStatus::Started | RouteStatus::Stopped), "got {status:?}");

    ctx.start_route("busy").await.unwrap();
    ctx.producer_template().send_body("direct:busy", "still works").await.unwrap();
    assert_eq!(ctx.mock("mock:sink").unwrap().received_count(), 1);
    ctx.stop().await;
}
