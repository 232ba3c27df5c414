use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use std::{fs, net::TcpListener, process::Command, time::Duration};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Relay {
    child: std::process::Child,
    http_port: u16,
    ws_port: u16,
    env_path: String,
    _dir: TempDir,
}

impl Drop for Relay {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Start `ncc05 serve` with an env file that also points clients at it.
async fn start_relay(extra: &str) -> Relay {
    let dir = TempDir::new().unwrap();
    let http_port = free_port();
    let ws_port = free_port();
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "BIND_HTTP=127.0.0.1:{http_port}\nBIND_WS=127.0.0.1:{ws_port}\nVERIFY_SIG=1\n\
             RELAYS=ws://127.0.0.1:{ws_port}\nBOOTSTRAP_RELAY=ws://127.0.0.1:{ws_port}\n\
             TIMEOUT_SECS=5\n{extra}"
        ),
    )
    .unwrap();
    let env_path = env_path.to_str().unwrap().to_string();
    let child = Command::cargo_bin("ncc05")
        .unwrap()
        .args(["--env", &env_path, "serve"])
        .spawn()
        .unwrap();
    // allow servers to start
    sleep(Duration::from_millis(300)).await;
    Relay {
        child,
        http_port,
        ws_port,
        env_path,
        _dir: dir,
    }
}

fn keygen(env_path: &str) -> (String, String) {
    let output = Command::cargo_bin("ncc05")
        .unwrap()
        .args(["--env", env_path, "keygen"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    let field = |prefix: &str| {
        text.lines()
            .find_map(|l| l.strip_prefix(prefix))
            .unwrap()
            .to_string()
    };
    (field("secret key: "), field("public key: "))
}

fn env_with_key(dir: &TempDir, relay: &Relay, secret: &str) -> String {
    let path = dir.path().join("client.env");
    fs::write(
        &path,
        format!(
            "RELAYS=ws://127.0.0.1:{0}\nBOOTSTRAP_RELAY=ws://127.0.0.1:{0}\nTIMEOUT_SECS=5\nSECRET_KEY={secret}\n",
            relay.ws_port
        ),
    )
    .unwrap();
    path.to_str().unwrap().to_string()
}

#[tokio::test]
async fn serve_cli_runs_http_and_ws() {
    let relay = start_relay("").await;

    let url = format!("http://127.0.0.1:{}/healthz", relay.http_port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let ws_url = format!("ws://127.0.0.1:{}/", relay.ws_port);
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    let req = serde_json::json!(["REQ", "s", {}]);
    ws_stream
        .send(Message::Text(req.to_string()))
        .await
        .unwrap();
    let mut got_eose = false;
    while let Some(msg) = ws_stream.next().await {
        match msg.unwrap() {
            Message::Text(t) if t.contains("EOSE") => {
                got_eose = true;
                break;
            }
            _ => {}
        }
    }
    assert!(got_eose);
}

#[tokio::test]
async fn publish_then_resolve_own_record() {
    let relay = start_relay("").await;
    let dir = TempDir::new().unwrap();
    let (secret, _) = keygen(&relay.env_path);
    let env = env_with_key(&dir, &relay, &secret);

    Command::cargo_bin("ncc05")
        .unwrap()
        .args(["--env", &env, "publish", "--ip", "1.2.3.4", "--notes", ""])
        .assert()
        .success();

    let output = Command::cargo_bin("ncc05")
        .unwrap()
        .args(["--env", &env, "resolve"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let payload: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(payload["v"], 1);
    assert_eq!(payload["ttl"], 600);
    assert_eq!(payload["notes"], "");
    assert_eq!(
        payload["endpoints"],
        serde_json::json!([{"type": "tcp", "uri": "1.2.3.4:8080", "priority": 10, "family": "ipv4"}])
    );

    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/healthz", relay.http_port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["events"], 1);
}

#[tokio::test]
async fn group_wrapped_record_opens_only_for_recipients() {
    let relay = start_relay("").await;
    let dir = TempDir::new().unwrap();
    let (publisher_secret, publisher_pk) = keygen(&relay.env_path);
    let (friend_secret, friend_pk) = keygen(&relay.env_path);
    let (stranger_secret, _) = keygen(&relay.env_path);

    let publisher_env = env_with_key(&dir, &relay, &publisher_secret);
    Command::cargo_bin("ncc05")
        .unwrap()
        .args([
            "--env",
            &publisher_env,
            "publish",
            "--ip",
            "2001:db8::1",
            "--recipients",
            &format!("{publisher_pk},{friend_pk}"),
        ])
        .assert()
        .success();

    let friend_dir = TempDir::new().unwrap();
    let friend_env = env_with_key(&friend_dir, &relay, &friend_secret);
    let output = Command::cargo_bin("ncc05")
        .unwrap()
        .args(["--env", &friend_env, "resolve", "--pubkey", &publisher_pk])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let payload: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(payload["endpoints"][0]["uri"], "[2001:db8::1]:8080");
    assert_eq!(payload["notes"], "NCC-05");

    let stranger_dir = TempDir::new().unwrap();
    let stranger_env = env_with_key(&stranger_dir, &relay, &stranger_secret);
    Command::cargo_bin("ncc05")
        .unwrap()
        .args(["--env", &stranger_env, "resolve", "--pubkey", &publisher_pk])
        .assert()
        .failure();
}

#[tokio::test]
async fn resolve_missing_record_fails() {
    let relay = start_relay("").await;
    let dir = TempDir::new().unwrap();
    let (secret, _) = keygen(&relay.env_path);
    let env = env_with_key(&dir, &relay, &secret);
    Command::cargo_bin("ncc05")
        .unwrap()
        .args(["--env", &env, "resolve", "--gossip"])
        .assert()
        .failure();
}
