//! Timing behavior of the parked long poll: the hard upper bound, the
//! out-of-band interrupt and server-pushed tasks riding back on the poll
//! response.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use tidepool_proto::{Command, PmValue};
use tidepool_server::{BusyPolicy, EmptyControllerFactory, ServerConfig, ServerSession, SessionRegistry};

fn session(max_poll: Duration) -> Arc<ServerSession> {
    let config = ServerConfig {
        max_poll_time: max_poll,
        gc_every_polls: 1,
        busy_policy: BusyPolicy::Wait,
        session_idle_timeout: Duration::from_secs(300),
        recycle_interval: Duration::from_secs(30),
    };
    SessionRegistry::new(config, Arc::new(EmptyControllerFactory)).session(Uuid::new_v4())
}

async fn with_context(session: &ServerSession) {
    session
        .process_batch(vec![Command::CreateContext])
        .await
        .expect("create context");
}

#[tokio::test]
async fn idle_poll_returns_at_the_configured_bound() {
    let session = session(Duration::from_millis(200));
    with_context(&session).await;

    let started = Instant::now();
    let outcome = session
        .process_batch(vec![Command::StartLongPoll])
        .await
        .expect("poll");
    let elapsed = started.elapsed();
    assert!(outcome.commands.is_empty());
    assert!(elapsed >= Duration::from_millis(150), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "overstayed the bound: {elapsed:?}");
}

#[tokio::test]
async fn interrupt_releases_the_parked_poll_early() {
    let session = session(Duration::from_secs(5));
    with_context(&session).await;

    let parked = Arc::clone(&session);
    let started = Instant::now();
    let poll = tokio::spawn(async move { parked.process_batch(vec![Command::StartLongPoll]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.interrupt();

    poll.await.expect("join").expect("poll");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn interrupt_arriving_before_the_park_is_not_lost() {
    let session = session(Duration::from_secs(5));
    with_context(&session).await;

    session.interrupt();
    let started = Instant::now();
    session
        .process_batch(vec![Command::StartLongPoll])
        .await
        .expect("poll");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn self_interrupt_command_releases_immediately() {
    let session = session(Duration::from_secs(5));
    with_context(&session).await;

    let started = Instant::now();
    session
        .process_batch(vec![Command::StartLongPoll, Command::InterruptLongPoll])
        .await
        .expect("poll");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn pushed_task_commands_ride_back_on_the_released_poll() {
    let session = session(Duration::from_secs(5));
    with_context(&session).await;

    let parked = Arc::clone(&session);
    let started = Instant::now();
    let poll = tokio::spawn(async move { parked.process_batch(vec![Command::StartLongPoll]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.push_task(Box::new(|state| {
        let bean = state.store.create_bean();
        if let Err(err) = state
            .store
            .add_property(bean, "status", PmValue::Text("ready".into()))
        {
            panic!("add_property: {err}");
        }
    }));

    let outcome = poll.await.expect("join").expect("poll");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(outcome.commands.iter().any(|command| matches!(
        command,
        Command::ValueChanged { attribute, .. } if attribute == "status"
    )));
}
