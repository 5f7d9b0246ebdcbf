use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use botpanel_protocol::BotStatus;
use botpanel_server::{AppState, ServerConfig, router};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

async fn spawn_server(bots_dir: &Path) -> Result<SocketAddr> {
    let config = ServerConfig {
        bots_dir: bots_dir.to_path_buf(),
        ..ServerConfig::default()
    };
    let app = router(AppState::new(&config), &config.allow_origins)?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

async fn connect(addr: SocketAddr) -> Result<Ws> {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .context("ws connect failed")?;
    Ok(ws)
}

async fn send(ws: &mut Ws, value: Value) -> Result<()> {
    ws.send(Message::text(value.to_string())).await?;
    Ok(())
}

async fn next_event(ws: &mut Ws) -> Result<Value> {
    loop {
        let Some(msg) = timeout(WAIT, ws.next()).await.context("timed out")? else {
            bail!("socket closed");
        };
        let msg = msg?;
        if msg.is_text() {
            return Ok(serde_json::from_str(msg.to_text()?)?);
        }
    }
}

/// Read output events until one whose text contains `needle`; returns the
/// texts seen including the match.
async fn output_until(ws: &mut Ws, needle: &str) -> Result<Vec<String>> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(ws).await?;
        if event["event"] != "output" {
            bail!("unexpected event {event}");
        }
        let text = event["data"]["text"].as_str().unwrap_or_default().to_string();
        let hit = text.contains(needle);
        seen.push(text);
        if hit {
            return Ok(seen);
        }
    }
}

fn write_bot(dir: &Path, bot: &str, file: &str, body: &str) {
    let folder = dir.join(bot);
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join(file), body).unwrap();
}

#[tokio::test]
async fn run_output_and_replay_over_websocket() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_bot(dir.path(), "alpha", "hello.sh", "echo hello\n");
    let addr = spawn_server(dir.path()).await?;

    let mut viewer = connect(addr).await?;
    send(&mut viewer, json!({"event": "join", "data": "alpha"})).await?;
    send(
        &mut viewer,
        json!({"event": "action", "data": {"botId": "alpha", "cmd": "run", "file": "hello.sh"}}),
    )
    .await?;

    let live = output_until(&mut viewer, "Bot process exited").await?;
    assert_eq!(live.iter().filter(|t| t.contains("hello")).count(), 1);

    let mut late = connect(addr).await?;
    send(&mut late, json!({"event": "join", "data": "alpha"})).await?;
    let replay = output_until(&mut late, "Bot process exited").await?;
    assert_eq!(replay, live);
    Ok(())
}

#[tokio::test]
async fn command_and_stop_on_idle_bot_report_status() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir(dir.path().join("idle"))?;
    let addr = spawn_server(dir.path()).await?;

    let mut ws = connect(addr).await?;
    send(&mut ws, json!({"event": "join", "data": "idle"})).await?;
    send(
        &mut ws,
        json!({"event": "command", "data": {"botId": "idle", "command": "help"}}),
    )
    .await?;
    output_until(&mut ws, "not running").await?;

    send(
        &mut ws,
        json!({"event": "action", "data": {"botId": "idle", "cmd": "stop"}}),
    )
    .await?;
    output_until(&mut ws, "No running process to stop").await?;
    Ok(())
}

#[tokio::test]
async fn stdin_round_trip_over_websocket() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_bot(
        dir.path(),
        "echoer",
        "echo.sh",
        "while read line; do echo \"got:$line\"; done\n",
    );
    let addr = spawn_server(dir.path()).await?;

    let mut ws = connect(addr).await?;
    send(&mut ws, json!({"event": "join", "data": "echoer"})).await?;
    send(
        &mut ws,
        json!({"event": "action", "data": {"botId": "echoer", "cmd": "run", "file": "echo.sh"}}),
    )
    .await?;

    let status: BotStatus = wait_running(addr, "echoer").await?;
    assert!(status.running);

    send(
        &mut ws,
        json!({"event": "command", "data": {"botId": "echoer", "command": "ping"}}),
    )
    .await?;
    // The echo and the child's reply race each other; both must arrive.
    let mut seen = output_until(&mut ws, "got:ping").await?;
    if !seen.iter().any(|t| t == "> ping\n") {
        seen = output_until(&mut ws, "> ping").await?;
    }
    assert!(seen.iter().any(|t| t == "> ping\n"));

    send(
        &mut ws,
        json!({"event": "action", "data": {"botId": "echoer", "cmd": "stop"}}),
    )
    .await?;
    output_until(&mut ws, "Process forcefully stopped").await?;

    let status: BotStatus = reqwest::get(format!("http://{addr}/api/bots/echoer"))
        .await?
        .json()
        .await?;
    assert!(!status.running);
    Ok(())
}

async fn wait_running(addr: SocketAddr, bot: &str) -> Result<BotStatus> {
    let url = format!("http://{addr}/api/bots/{bot}");
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status: BotStatus = reqwest::get(&url).await?.json().await?;
        if status.running {
            return Ok(status);
        }
        if tokio::time::Instant::now() > deadline {
            bail!("{bot} never reported running");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn bad_frames_get_error_events() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = spawn_server(dir.path()).await?;
    let mut ws = connect(addr).await?;

    send(&mut ws, json!({"event": "join", "data": "../etc"})).await?;
    let event = next_event(&mut ws).await?;
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["botId"], "../etc");

    ws.send(Message::text("{not json")).await?;
    let event = next_event(&mut ws).await?;
    assert_eq!(event["event"], "error");
    Ok(())
}

#[tokio::test]
async fn status_api_lists_bot_folders() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir(dir.path().join("alpha"))?;
    std::fs::create_dir(dir.path().join("beta"))?;
    std::fs::create_dir(dir.path().join(".hidden"))?;
    std::fs::write(dir.path().join("notes.txt"), "not a bot")?;
    let addr = spawn_server(dir.path()).await?;

    let bots: Vec<BotStatus> = reqwest::get(format!("http://{addr}/api/bots"))
        .await?
        .json()
        .await?;
    let names: Vec<&str> = bots.iter().map(|b| b.bot_id.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert!(bots.iter().all(|b| !b.running && b.pid.is_none()));

    let missing = reqwest::get(format!("http://{addr}/api/bots/gamma")).await?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let health = reqwest::get(format!("http://{addr}/healthz")).await?.text().await?;
    assert_eq!(health, "ok");
    Ok(())
}

#[tokio::test]
async fn status_api_answers_configured_origins_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = spawn_server(dir.path()).await?;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/healthz");

    let allowed = client
        .get(&url)
        .header("origin", "http://localhost:3000")
        .send()
        .await?;
    assert_eq!(
        allowed
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:3000")
    );

    let foreign = client
        .get(&url)
        .header("origin", "http://evil.example")
        .send()
        .await?;
    assert!(foreign.headers().get("access-control-allow-origin").is_none());
    Ok(())
}
