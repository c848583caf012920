mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use futures::future::join_all;
use pagewright::cdp::{CdpError, ConnectionManager, DebuggerAddress, EvaluateOptions, SessionState};
use serde_json::{json, Value};

fn echo_handler() -> Handler {
    Arc::new(|method, params| match method {
        // later commands answer first
        "Test.echo" => {
            let n = params["n"].as_u64().unwrap_or(0);
            Reply::Delayed(Duration::from_millis(200 - n * 20), json!({ "n": n }))
        }
        "Test.slow" => Reply::Delayed(Duration::from_millis(300), json!({ "late": true })),
        "Test.hang" => Reply::Silent,
        "Test.drop" => Reply::Close,
        "Test.fail" => Reply::Error(-32000, "No node with given id found".into()),
        _ => default_reply(method, params),
    })
}

#[tokio::test]
async fn test_handshake_enables_domains() {
    let browser = FakeBrowser::start_default().await;
    let session = connect(&browser, fast_options()).await;

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(browser.methods(), vec!["Page.enable", "Runtime.enable"]);
    let endpoint = session.endpoint().unwrap();
    assert_eq!(endpoint.target_id, "FAKE-PAGE");
    assert!(endpoint.websocket_url.ends_with("/devtools/page/FAKE-PAGE"));

    session.close().await;
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_concurrent_commands_are_correlated() {
    let browser = FakeBrowser::start(echo_handler()).await;
    let session = connect(&browser, fast_options()).await;

    let calls = (0..8u64).map(|n| {
        let session = session.clone();
        async move { (n, session.submit("Test.echo", json!({ "n": n })).await) }
    });
    for (n, result) in join_all(calls).await {
        assert_eq!(result.unwrap(), json!({ "n": n }));
    }
    assert_eq!(session.pending_commands(), 0);
}

#[tokio::test]
async fn test_deadline_rejects_and_late_reply_is_discarded() {
    let browser = FakeBrowser::start(echo_handler()).await;
    let session = connect(&browser, fast_options()).await;

    let started = Instant::now();
    let err = session
        .submit_with_timeout("Test.slow", json!({}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, CdpError::Timeout { ref operation, .. } if operation == "Test.slow"));
    assert!(started.elapsed() < Duration::from_millis(290));
    assert_eq!(session.pending_commands(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.discarded_replies(), 1);

    // the session is still usable afterwards
    let value = session.submit("Test.echo", json!({ "n": 9 })).await.unwrap();
    assert_eq!(value, json!({ "n": 9 }));
}

#[tokio::test]
async fn test_unbounded_timeout_still_gets_reply() {
    let browser = FakeBrowser::start(echo_handler()).await;
    let session = connect(&browser, fast_options()).await;

    let value = session
        .submit_with_timeout("Test.echo", json!({ "n": 1 }), Duration::MAX)
        .await
        .unwrap();
    assert_eq!(value, json!({ "n": 1 }));
    assert_eq!(session.pending_commands(), 0);
}

#[tokio::test]
async fn test_protocol_error_reply() {
    let browser = FakeBrowser::start(echo_handler()).await;
    let session = connect(&browser, fast_options()).await;

    let err = session.submit("Test.fail", json!({})).await.unwrap_err();
    match err {
        CdpError::Protocol { code, message } => {
            assert_eq!(code, -32000);
            assert!(message.contains("No node"));
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_transport_loss_rejects_pending_commands() {
    let browser = FakeBrowser::start(echo_handler()).await;
    let session = connect(&browser, fast_options()).await;

    let hanging = {
        let session = session.clone();
        tokio::spawn(async move { session.submit("Test.hang", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.pending_commands(), 1);

    let _ = session.submit("Test.drop", json!({})).await;
    let result = tokio::time::timeout(Duration::from_secs(2), hanging)
        .await
        .expect("pending command was not rejected")
        .unwrap();
    assert!(matches!(result, Err(CdpError::ConnectionLost(_))));

    let mut states = session.state_changes();
    tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == SessionState::Disconnected))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        session.submit("Test.echo", json!({ "n": 1 })).await,
        Err(CdpError::NotConnected)
    ));
}

#[tokio::test]
async fn test_automatic_reconnect_after_loss() {
    let browser = FakeBrowser::start(echo_handler()).await;
    let mut options = fast_options();
    options.auto_reconnect = true;
    let session = connect(&browser, options).await;

    let _ = session.submit("Test.drop", json!({})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut states = session.state_changes();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == SessionState::Ready))
        .await
        .expect("session did not come back")
        .unwrap();

    assert_eq!(browser.connections(), 2);
    let value = session.submit("Test.echo", json!({ "n": 3 })).await.unwrap();
    assert_eq!(value, json!({ "n": 3 }));
    session.close().await;
}

#[tokio::test]
async fn test_loss_during_handshake_does_not_spawn_reconnect() {
    let handler: Handler = Arc::new(|method, params| match method {
        "Page.enable" => Reply::Close,
        _ => default_reply(method, params),
    });
    let browser = FakeBrowser::start(handler).await;
    let mut options = fast_options();
    options.auto_reconnect = true;

    let err = ConnectionManager::new(options)
        .unwrap()
        .connect(&browser.address(), quick_policy(2))
        .await
        .unwrap_err();
    assert!(matches!(err, CdpError::Connection { attempts: 2, .. }), "{:?}", err);
    assert_eq!(browser.connections(), 2);

    // nothing keeps dialing once the initial connect has given up
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(browser.connections(), 2);
}

#[tokio::test]
async fn test_retry_attempts_exhausted_against_closed_port() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let manager = ConnectionManager::new(fast_options()).unwrap();

    let err = manager
        .connect(&DebuggerAddress::new("127.0.0.1", port), quick_policy(3))
        .await
        .unwrap_err();
    match err {
        CdpError::Connection {
            attempts,
            proxy_related,
            ..
        } => {
            assert!(attempts >= 2);
            if !proxy_related {
                assert_eq!(attempts, 3);
            }
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_navigate_and_evaluate() {
    let handler: Handler = Arc::new(|method, params| match method {
        "Runtime.evaluate" => {
            let expression = params["expression"].as_str().unwrap_or_default();
            match expression {
                "document.title" => remote_value(json!("Example Domain")),
                "1 + 1" => remote_value(json!(2)),
                "undefinedThing()" => thrown("ReferenceError: undefinedThing is not defined"),
                _ if expression.starts_with("document.querySelector(") => {
                    remote_value(json!(true))
                }
                _ => default_reply(method, params),
            }
        }
        _ => default_reply(method, params),
    });
    let browser = FakeBrowser::start(handler).await;
    let session = connect(&browser, fast_options()).await;

    let nav = session
        .navigate("https://example.com/", Some("h1"))
        .await
        .unwrap();
    assert_eq!(nav.frame_id, "FRAME-1");
    assert_eq!(session.title().await.unwrap(), "Example Domain");
    assert_eq!(
        session
            .evaluate("1 + 1", EvaluateOptions::default())
            .await
            .unwrap(),
        json!(2)
    );

    let err = session
        .evaluate("undefinedThing()", EvaluateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CdpError::JavaScript(ref m) if m.contains("ReferenceError")));

    let navigate = browser
        .received()
        .into_iter()
        .find(|(m, _)| m == "Page.navigate")
        .unwrap();
    assert_eq!(navigate.1["url"], "https://example.com/");
}

#[tokio::test]
async fn test_navigate_rejects_bad_url_without_sending() {
    let browser = FakeBrowser::start_default().await;
    let session = connect(&browser, fast_options()).await;

    let err = session.navigate("not a url", None).await.unwrap_err();
    assert!(matches!(err, CdpError::InvalidArgument(_)));
    assert!(!browser.methods().iter().any(|m| m == "Page.navigate"));
}

#[tokio::test]
async fn test_screenshot_decodes_png() {
    let handler: Handler = Arc::new(|method, params| match method {
        "Page.captureScreenshot" => Reply::Result(json!({ "data": "iVBORw0KGgo=" })),
        _ => default_reply(method, params),
    });
    let browser = FakeBrowser::start(handler).await;
    let session = connect(&browser, fast_options()).await;

    let png = session.screenshot(None).await.unwrap();
    assert_eq!(&png[..4], b"\x89PNG");
}

#[tokio::test]
async fn test_click_dispatches_press_and_release() {
    let handler: Handler = Arc::new(|method, params| match method {
        "Runtime.evaluate" => remote_value(json!({ "x": 10.0, "y": 20.0, "width": 100.0, "height": 40.0 })),
        _ => default_reply(method, params),
    });
    let browser = FakeBrowser::start(handler).await;
    let session = connect(&browser, fast_options()).await;

    session.click("#submit").await.unwrap();

    let mouse: Vec<Value> = browser
        .received()
        .into_iter()
        .filter(|(m, _)| m == "Input.dispatchMouseEvent")
        .map(|(_, p)| p)
        .collect();
    assert_eq!(mouse.len(), 2);
    assert_eq!(mouse[0]["type"], "mousePressed");
    assert_eq!(mouse[1]["type"], "mouseReleased");
    assert_eq!(mouse[0]["x"], 60.0);
    assert_eq!(mouse[0]["y"], 40.0);
}
