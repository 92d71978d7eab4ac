//! Connection engine scenarios against a scripted game server.

use mudprod::connection::BANNER_GRACE;
use mudprod::testing::{ScriptedServer, Step};
use mudprod::{
    Connection, ConnectionState, LoginPlan, Pattern, assert_contains, assert_not_contains,
    assert_prompt, quick_connect,
};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Long enough for a prompt to arrive after `connect` has eaten the banner.
const AFTER_BANNER: Duration = Duration::from_millis(300);

fn pause_past_banner() -> Step {
    Step::Pause(BANNER_GRACE + AFTER_BANNER)
}

fn engine(port: u16) -> Connection {
    Connection::new("127.0.0.1", port).with_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_login_reaches_in_game() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome to TestMUD\r\n"),
        pause_past_banner(),
        Step::send("By what name do you wish to be known? "),
        Step::expect("bob"),
        Step::send("Password: "),
        Step::expect("secret"),
        Step::send("Welcome back, Bob!\r\nExits: north, east\r\n> "),
    ])
    .await
    .expect("start game server");

    let mut conn = engine(game.port());
    assert!(conn.connect().await);
    assert_eq!(conn.state(), ConnectionState::Connected);

    let plan = LoginPlan::new([("name", "bob"), ("password", "secret")]).expect("valid plan");
    assert!(conn.login(&plan).await);
    assert_eq!(conn.state(), ConnectionState::InGame);
    assert!(conn.is_in_game());
    // Triggers never see the login transcript.
    assert!(conn.take_uninspected().is_empty());

    let received = game
        .wait_for_received("secret\n", Duration::from_secs(2))
        .await
        .expect("credentials sent");
    assert!(received.starts_with("bob\n"));
}

#[tokio::test]
async fn test_login_with_explicit_patterns() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        pause_past_banner(),
        Step::send("login: "),
        Step::expect("bob"),
        Step::send("password: "),
        Step::expect("secret"),
        Step::send("Welcome bob >"),
    ])
    .await
    .expect("start game server");

    let mut conn = engine(game.port());
    assert!(conn.connect().await);

    let plan = LoginPlan::new([("login:", "bob"), ("password:", "secret")])
        .and_then(|plan| plan.with_success([r">\s*$"]))
        .and_then(|plan| plan.with_failure(["[Ii]nvalid"]))
        .expect("valid plan");
    assert!(conn.login(&plan).await);
    assert_eq!(conn.state(), ConnectionState::InGame);
    assert_eq!(game.received(), "bob\nsecret\n");
}

#[tokio::test]
async fn test_login_rejected() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        pause_past_banner(),
        Step::send("Name: "),
        Step::expect("bob"),
        Step::send("Invalid password.\r\n"),
    ])
    .await
    .expect("start game server");

    let mut conn = engine(game.port());
    assert!(conn.connect().await);

    let plan = LoginPlan::new([("name", "bob")]).expect("valid plan");
    assert!(!conn.login(&plan).await);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_send_command_stops_at_prompt() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::expect("look"),
        Step::send("\x1b[1;33mTown Square\x1b[0m\r\nA fountain bubbles here.\r\nExits: north\r\n> "),
    ])
    .await
    .expect("start game server");

    let mut conn = engine(game.port());
    assert!(conn.connect().await);

    let response = conn.send_command("look", Some(Duration::from_secs(3))).await;
    assert_prompt(&response).expect("prompt");
    assert_contains(&response, "Town Square").expect("room name");
    assert_contains(&response, Pattern::regex(r"(?m)^Exits: north$")).expect("exits line");
    assert_not_contains(&response, "\x1b[").expect("colour codes stripped");
    assert!(response.raw().contains("\x1b[1;33m"));
    assert_eq!(response.lines().len(), 4);
}

#[tokio::test]
async fn test_send_command_waits_past_buffered_prompt() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        pause_past_banner(),
        Step::send("A rat arrives.\r\n> "),
        Step::expect("look"),
        Step::Pause(Duration::from_millis(900)),
        Step::send("Town Square\r\n> "),
    ])
    .await
    .expect("start game server");

    let mut conn = engine(game.port());
    assert!(conn.connect().await);

    // A watcher moves the unsolicited text, prompt included, into the backlog.
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut buffered = 0;
    while buffered == 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
        buffered = conn.poll_background();
    }
    assert!(buffered > 0);

    let response = conn.send_command("look", Some(Duration::from_secs(3))).await;
    assert_contains(&response, "A rat arrives.").expect("backlog returned");
    assert_contains(&response, "Town Square").expect("reply to the command");
    assert!(response.prompt_detected());
}

#[tokio::test]
async fn test_peek_reports_pending_output() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        pause_past_banner(),
        Step::send("A bird sings.\r\n"),
    ])
    .await
    .expect("start game server");

    let mut conn = engine(game.port());
    assert!(conn.connect().await);

    let response = conn.peek(Duration::from_secs(1)).await;
    assert!(!response.is_empty());
    assert_contains(&response, "A bird sings.").expect("pending line");

    let start = Instant::now();
    let response = conn.peek(Duration::from_millis(200)).await;
    assert!(response.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_peer_close_during_command() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::expect("quit"),
        Step::send("Goodbye.\r\n"),
        Step::Close,
    ])
    .await
    .expect("start game server");

    let mut conn = engine(game.port());
    assert!(conn.connect().await);

    let response = conn.send_command("quit", Some(Duration::from_secs(3))).await;
    assert_contains(&response, "Goodbye").expect("farewell");
    assert!(!response.prompt_detected());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(!conn.is_connected());

    // Without auto-reconnect the engine stays down and returns nothing.
    let response = conn.send_command("look", Some(Duration::from_millis(200))).await;
    assert!(response.is_empty());
}

#[tokio::test]
async fn test_wait_for_pattern_is_case_insensitive() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        pause_past_banner(),
        Step::send("The sun rises over the hills.\r\n"),
    ])
    .await
    .expect("start game server");

    let mut conn = engine(game.port());
    assert!(conn.connect().await);

    let (found, output) = conn
        .wait_for_pattern("SUN RISES", Duration::from_secs(2), false)
        .await;
    assert!(found);
    assert!(output.contains("The sun rises"));

    let (found, output) = conn
        .wait_for_pattern("([unclosed", Duration::from_millis(200), true)
        .await;
    assert!(!found);
    assert!(output.is_empty());
}

#[tokio::test]
async fn test_quick_connect() {
    let game = ScriptedServer::start(vec![
        Step::send("Welcome\r\n"),
        Step::expect("who"),
        Step::send("Players online: 3\r\n> "),
    ])
    .await
    .expect("start game server");

    let output = quick_connect("127.0.0.1", game.port(), "who", None)
        .await
        .expect("quick connect");
    assert!(output.contains("Players online: 3"));
}
