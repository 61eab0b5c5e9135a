mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use auditdesk_client_core::Credentials;
use auditdesk_live::channel::{
    CONNECTION_LOST_MESSAGE, DEST_GET_ONLINE_USERS, DEST_UPDATE_PAGE, TOPIC_LOGS,
    TOPIC_ONLINE_USERS,
};
use auditdesk_live::{ChannelState, Command, LiveChannel, LiveConfig, LiveError, LiveEvent};
use serde_json::{Value, json};
use support::{anonymous_session, eventually, logged_in_session, spawn_broker};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(url: &str) -> LiveConfig {
    let mut config = LiveConfig::new(url);
    config.reconnect_delay = Duration::from_millis(10);
    config.connect_timeout = Duration::from_secs(2);
    config
}

async fn wait_for_state(channel: &LiveChannel, wanted: ChannelState) -> Result<()> {
    let mut states = channel.watch_state();
    timeout(WAIT, states.wait_for(|state| *state == wanted)).await??;
    Ok(())
}

fn body_json(body: &str) -> Value {
    serde_json::from_str(body).expect("json body")
}

#[tokio::test]
async fn connects_subscribes_and_announces_page() -> Result<()> {
    let broker = spawn_broker().await?;
    let session = logged_in_session().await?;
    let token = session.access_token()?.expect("token");

    let channel = LiveChannel::new(session, fast_config(&broker.url));
    channel.start()?;
    wait_for_state(&channel, ChannelState::Connected).await?;
    eventually(WAIT, || broker.broker.received().len() >= 4).await?;

    assert_eq!(broker.broker.query_tokens(), vec![token.clone()]);
    assert_eq!(
        broker.broker.upgrade_auth.lock().expect("auth").clone(),
        vec![format!("Bearer {token}")]
    );

    let frames = broker.broker.received();
    assert_eq!(frames[0].command, Command::Connect);
    assert_eq!(frames[0].get("Authorization"), Some(format!("Bearer {token}").as_str()));
    assert_eq!(frames[1].command, Command::Subscribe);
    assert_eq!(frames[1].get("destination"), Some(TOPIC_ONLINE_USERS));
    assert_eq!(frames[2].command, Command::Subscribe);
    assert_eq!(frames[2].get("destination"), Some(TOPIC_LOGS));
    assert_eq!(frames[3].command, Command::Send);
    assert_eq!(frames[3].get("destination"), Some(DEST_UPDATE_PAGE));
    assert_eq!(body_json(&frames[3].body), json!({"username": "ana", "page": "/"}));

    channel.stop();
    assert_eq!(channel.state(), ChannelState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn pushes_update_online_users_and_log_buffer() -> Result<()> {
    let broker = spawn_broker().await?;
    let session = logged_in_session().await?;
    let channel = LiveChannel::new(session, fast_config(&broker.url));
    let mut events = channel.subscribe();
    channel.start()?;
    wait_for_state(&channel, ChannelState::Connected).await?;

    broker.broker.push(
        TOPIC_ONLINE_USERS,
        &json!([{"username": "ana", "onlineSince": "2024-05-01T09:00:00Z", "currentPage": "/logs"}]),
    );
    let Some(LiveEvent::OnlineUsers(users)) = timeout(WAIT, events.recv()).await?.ok() else {
        anyhow::bail!("expected an online-users event");
    };
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].current_page.as_deref(), Some("/logs"));

    for action in ["LOGIN", "UPDATE_UNIT"] {
        broker.broker.push(
            TOPIC_LOGS,
            &json!({"userId": 3, "username": "ana", "action": action, "outcome": "SUCCESS"}),
        );
        timeout(WAIT, events.recv()).await??;
    }

    let actions = channel
        .logs()
        .into_iter()
        .map(|entry| entry.action)
        .collect::<Vec<_>>();
    assert_eq!(actions, vec!["UPDATE_UNIT", "LOGIN"]);
    assert_eq!(channel.online_users()[0].username, "ana");
    Ok(())
}

#[tokio::test]
async fn navigate_publishes_only_while_connected() -> Result<()> {
    let broker = spawn_broker().await?;
    let session = logged_in_session().await?;
    let channel = LiveChannel::new(session, fast_config(&broker.url));

    assert!(!channel.navigate("/audit-units"));
    assert!(!channel.request_online_users());
    assert_eq!(channel.current_page().as_deref(), Some("/audit-units"));

    channel.start()?;
    wait_for_state(&channel, ChannelState::Connected).await?;
    eventually(WAIT, || broker.broker.sent_to(DEST_UPDATE_PAGE).len() == 1).await?;
    let initial = broker.broker.sent_to(DEST_UPDATE_PAGE);
    assert_eq!(body_json(&initial[0].body)["page"], "/audit-units");

    assert!(channel.navigate("/logs"));
    assert!(channel.request_online_users());
    eventually(WAIT, || broker.broker.sent_to(DEST_UPDATE_PAGE).len() == 2).await?;
    eventually(WAIT, || broker.broker.sent_to(DEST_GET_ONLINE_USERS).len() == 1).await?;
    let pages = broker.broker.sent_to(DEST_UPDATE_PAGE);
    assert_eq!(body_json(&pages[1].body), json!({"username": "ana", "page": "/logs"}));
    Ok(())
}

#[tokio::test]
async fn start_without_token_is_refused() -> Result<()> {
    let broker = spawn_broker().await?;
    let channel = LiveChannel::new(anonymous_session(), fast_config(&broker.url));

    assert!(matches!(channel.start(), Err(LiveError::MissingToken)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.broker.connections.load(Ordering::SeqCst), 0);
    assert_eq!(channel.state(), ChannelState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn token_change_reconnects_with_new_token() -> Result<()> {
    let broker = spawn_broker().await?;
    let session = logged_in_session().await?;
    let channel = LiveChannel::new(session.clone(), fast_config(&broker.url));
    channel.start()?;
    wait_for_state(&channel, ChannelState::Connected).await?;

    session.authenticate(&Credentials::new("ana", "secret")).await?;
    let fresh = session.access_token()?.expect("token");

    eventually(WAIT, || broker.broker.query_tokens().len() == 2).await?;
    wait_for_state(&channel, ChannelState::Connected).await?;
    let tokens = broker.broker.query_tokens();
    assert_ne!(tokens[0], tokens[1]);
    assert_eq!(tokens[1], fresh);
    Ok(())
}

#[tokio::test]
async fn logout_disconnects_channel() -> Result<()> {
    let broker = spawn_broker().await?;
    let session = logged_in_session().await?;
    let channel = LiveChannel::new(session.clone(), fast_config(&broker.url));
    channel.start()?;
    wait_for_state(&channel, ChannelState::Connected).await?;

    session.logout().await;
    wait_for_state(&channel, ChannelState::Disconnected).await?;
    assert!(!channel.navigate("/logs"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.broker.connections.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn broker_errors_exhaust_budget_then_fail() -> Result<()> {
    let broker = spawn_broker().await?;
    broker.broker.reject.store(true, Ordering::SeqCst);
    let session = logged_in_session().await?;
    let channel = LiveChannel::new(session, fast_config(&broker.url));
    channel.start()?;

    wait_for_state(
        &channel,
        ChannelState::Failed {
            message: CONNECTION_LOST_MESSAGE.to_string(),
        },
    )
    .await?;
    // The initial attempt plus five retries.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.broker.connections.load(Ordering::SeqCst), 6);
    Ok(())
}

#[tokio::test]
async fn unreachable_server_reports_failure() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let session = logged_in_session().await?;
    let mut config = fast_config(&format!("ws://{addr}/ws"));
    config.error_budget = 2;
    let channel = LiveChannel::new(session, config);
    let mut states = channel.watch_state();
    channel.start()?;

    let mut attempts = Vec::new();
    timeout(WAIT, async {
        loop {
            if states.changed().await.is_err() {
                break;
            }
            let state = states.borrow_and_update().clone();
            if let ChannelState::Reconnecting { attempt } = state {
                attempts.push(attempt);
            }
            if state.is_terminal() {
                break;
            }
        }
    })
    .await?;

    assert!(channel.state().is_terminal());
    assert!(attempts.iter().all(|attempt| *attempt <= 2));
    Ok(())
}

#[tokio::test]
async fn token_change_restores_error_budget() -> Result<()> {
    let broker = spawn_broker().await?;
    broker.broker.reject.store(true, Ordering::SeqCst);
    let session = logged_in_session().await?;
    let mut config = fast_config(&broker.url);
    config.reconnect_delay = Duration::from_secs(30);
    let channel = LiveChannel::new(session.clone(), config);
    channel.start()?;
    wait_for_state(&channel, ChannelState::Reconnecting { attempt: 1 }).await?;

    broker.broker.reject.store(false, Ordering::SeqCst);
    session.authenticate(&Credentials::new("ana", "secret")).await?;
    wait_for_state(&channel, ChannelState::Connected).await?;
    assert_eq!(broker.broker.connections.load(Ordering::SeqCst), 2);
    Ok(())
}
