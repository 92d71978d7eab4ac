//! Integration tests for the daemon over its Unix socket.
//!
//! Each test runs its own daemon on a unique socket and its own scripted
//! game server on an ephemeral port.

use mudprod::connection::BANNER_GRACE;
use mudprod::protocol::ReplyBody;
use mudprod::testing::{ScriptedServer, Step, TestError, TestHarness};
use mudprod::{ConnectArgs, ConnectionState, Daemon, Reply};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Send one raw line to the daemon and parse the reply.
async fn raw_request(harness: &TestHarness, line: &str) -> Reply {
    let stream = UnixStream::connect(harness.socket_path())
        .await
        .expect("connect to daemon");
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(format!("{line}\n").as_bytes())
        .await
        .expect("write request");
    let mut reply = String::new();
    stream.read_line(&mut reply).await.expect("read reply");
    serde_json::from_str(&reply).expect("reply is JSON")
}

#[tokio::test]
async fn test_connect_send_disconnect() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome to TestMUD\r\n"),
        Step::expect("look"),
        Step::send("A quiet meadow.\r\nExits: west\r\n> "),
    ])
    .await
    .expect("start game server");
    let harness = TestHarness::new().await.expect("start daemon");

    let session = harness
        .connect("default", game.port())
        .await
        .expect("connect");
    let output = session.send("look").await.expect("send");
    assert!(output.contains("A quiet meadow."));

    let reply = harness
        .client()
        .status(Some("default"))
        .await
        .expect("status");
    match reply.body {
        ReplyBody::Status(status) => {
            assert!(status.connected);
            assert_eq!(status.state, ConnectionState::Connected);
            assert_eq!(status.port, game.port());
        }
        other => panic!("expected status, got {other:?}"),
    }

    assert_eq!(
        session.disconnect().await.expect("disconnect"),
        "Session 'default' closed"
    );
    assert!(matches!(
        session.send("look").await,
        Err(TestError::Rejected(msg)) if msg == "session not found: default"
    ));
}

#[tokio::test]
async fn test_batch_returns_results_in_order() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::expect("look"),
        Step::send("Town Square\r\n> "),
        Step::expect("inventory"),
        Step::send("You are carrying nothing.\r\n> "),
    ])
    .await
    .expect("start game server");
    let harness = TestHarness::new().await.expect("start daemon");
    harness.connect("main", game.port()).await.expect("connect");

    let reply = harness
        .client()
        .batch(
            "main",
            vec!["look".to_string(), "inventory".to_string()],
            Duration::from_secs(2),
            true,
        )
        .await
        .expect("batch");
    assert!(reply.success);
    match reply.body {
        ReplyBody::Batch { results, count } => {
            assert_eq!(count, 2);
            assert_eq!(results[0].command, "look");
            assert!(results[0].clean.contains("Town Square"));
            assert_eq!(results[1].command, "inventory");
            assert!(results[1].clean.contains("carrying nothing"));
        }
        other => panic!("expected batch, got {other:?}"),
    }
    assert_eq!(game.received(), "look\ninventory\n");
}

#[tokio::test]
async fn test_trigger_fires_from_watcher() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::expect("ready"),
        Step::send("You have recovered balance.\r\n"),
    ])
    .await
    .expect("start game server");
    let harness = TestHarness::new().await.expect("start daemon");
    let session = harness.connect("default", game.port()).await.expect("connect");

    let message = session.trigger("recovered", "attack").await.expect("trigger");
    assert_eq!(message, "Trigger added: 'recovered' -> 'attack'");

    session.send_line("ready").await.expect("send line");
    let received = game
        .wait_for_received("attack\n", Duration::from_secs(3))
        .await
        .expect("trigger fired");
    assert_eq!(received, "ready\nattack\n");

    // The watcher leaves the text for the next foreground read.
    let output = session
        .wait_for_content("recovered balance", Duration::from_secs(2))
        .await
        .expect("output preserved");
    assert!(output.contains("You have recovered balance."));
}

#[tokio::test]
async fn test_trigger_fires_inline_without_watchers() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::expect("look"),
        Step::send("You have recovered balance.\r\n> "),
    ])
    .await
    .expect("start game server");
    let harness = TestHarness::with_daemon(Daemon::new(false).with_io_log(None))
        .await
        .expect("start daemon");
    let session = harness.connect("default", game.port()).await.expect("connect");

    session.trigger("recovered", "attack").await.expect("trigger");
    let output = session.send("look").await.expect("send");
    assert!(output.contains("recovered balance"));

    let received = game
        .wait_for_received("attack\n", Duration::from_secs(2))
        .await
        .expect("trigger fired after send");
    assert_eq!(received, "look\nattack\n");
}

#[tokio::test]
async fn test_trigger_skips_login_transcript() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::Pause(BANNER_GRACE + Duration::from_millis(300)),
        Step::send("Name: "),
        Step::expect("bob"),
        Step::send("Welcome back, Bob!\r\n> "),
        Step::expect("look"),
        Step::send("Town Square\r\n> "),
    ])
    .await
    .expect("start game server");
    let harness = TestHarness::new().await.expect("start daemon");

    let mut args = ConnectArgs::new("127.0.0.1", game.port());
    args.login_steps = vec![("Name".to_string(), "bob".to_string())];
    let session = harness.connect_with("default", args).await.expect("connect");

    session.trigger("Welcome back", "wave").await.expect("trigger");
    let output = session.send("look").await.expect("send");
    assert!(output.contains("Town Square"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(game.received(), "bob\nlook\n");
}

#[tokio::test]
async fn test_peek_over_socket() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::Pause(BANNER_GRACE + Duration::from_millis(300)),
        Step::send("A bird sings.\r\n"),
    ])
    .await
    .expect("start game server");
    let harness = TestHarness::new().await.expect("start daemon");
    harness.connect("default", game.port()).await.expect("connect");

    let reply = harness
        .client()
        .peek("default", Duration::from_secs(1))
        .await
        .expect("peek");
    match reply.body {
        ReplyBody::Peek { clean, has_data, .. } => {
            assert!(has_data);
            assert!(clean.contains("A bird sings."));
        }
        other => panic!("expected peek, got {other:?}"),
    }

    let start = tokio::time::Instant::now();
    let reply = harness
        .client()
        .peek("default", Duration::from_millis(200))
        .await
        .expect("peek");
    assert!(matches!(reply.body, ReplyBody::Peek { has_data: false, .. }));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_trigger_ignores_unmatched_output() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::expect("ready"),
        Step::send("nothing happening\r\n"),
    ])
    .await
    .expect("start game server");
    let harness = TestHarness::new().await.expect("start daemon");
    let session = harness.connect("default", game.port()).await.expect("connect");

    session.trigger("recovered", "attack").await.expect("trigger");
    session.send_line("ready").await.expect("send line");
    session
        .wait_for_content("nothing happening", Duration::from_secs(2))
        .await
        .expect("output arrives");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(game.received(), "ready\n");
}

#[tokio::test]
async fn test_repeat_on_balance_recovery() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::expect("kick rat"),
        Step::send("You kick the rat.\r\nYou have recovered balance.\r\n"),
    ])
    .await
    .expect("start game server");
    let harness = TestHarness::new().await.expect("start daemon");
    let session = harness.connect("default", game.port()).await.expect("connect");

    let message = session.repeat("kick rat").await.expect("repeat");
    assert_eq!(message, "Will repeat 'kick rat' on balance recovery");

    let reply = harness.client().triggers("default").await.expect("triggers");
    match reply.body {
        ReplyBody::Triggers { triggers, repeat } => {
            assert!(triggers.is_empty());
            assert_eq!(repeat.as_deref(), Some("kick rat"));
        }
        other => panic!("expected triggers, got {other:?}"),
    }

    session.send_line("kick rat").await.expect("send line");
    game.wait_for_received("kick rat\nkick rat\n", Duration::from_secs(3))
        .await
        .expect("repeat fired");

    assert_eq!(
        session.repeat("off").await.expect("repeat off"),
        "Repeat disabled"
    );
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let harness = TestHarness::new().await.expect("start daemon");
    let mut args = ConnectArgs::new("127.0.0.1", port);
    args.timeout = 2.0;
    let result = harness.connect_with("default", args).await;
    assert!(matches!(
        result,
        Err(TestError::Rejected(msg)) if msg.starts_with("could not connect to 127.0.0.1:")
    ));
}

#[tokio::test]
async fn test_malformed_requests() {
    let harness = TestHarness::new().await.expect("start daemon");

    let reply = raw_request(&harness, "{not json").await;
    assert!(!reply.success);
    assert!(
        reply
            .error_message()
            .is_some_and(|e| e.starts_with("invalid JSON"))
    );

    let reply = raw_request(&harness, r#"{"command": "dance"}"#).await;
    assert_eq!(reply.error_message(), Some("unknown command: dance"));

    let reply = raw_request(&harness, r#"{"session": "x"}"#).await;
    assert_eq!(reply.error_message(), Some("missing command"));

    // The daemon keeps serving after bad input.
    let reply = raw_request(&harness, r#"{"command": "status"}"#).await;
    assert!(reply.success);
    assert!(matches!(reply.body, ReplyBody::Sessions { sessions } if sessions.is_empty()));
}

#[tokio::test]
async fn test_shutdown_removes_socket() {
    let harness = TestHarness::with_daemon(Daemon::new(false).with_io_log(None))
        .await
        .expect("start daemon");
    let socket = harness.socket_path().to_path_buf();
    assert!(socket.exists());

    harness.shutdown().await.expect("shutdown");
    assert!(!socket.exists());
}
