//! Headless Chrome tests against a local board page

#![cfg(feature = "cdp")]

use boardshot::cdp::CdpSource;
use boardshot::error::AttemptFailure;
use boardshot::{Error, GroupConfig, GroupKind, RetryPolicy, SessionManager, SlotConfig, TargetSource, Viewport};
use std::sync::Arc;
use std::time::Duration;
use tiny_http::{Response, Server};

const PNG_MAGIC: &[u8] = b"\x89PNG";

/// Serve a fake departures board on an ephemeral port.
fn start_board_server() -> String {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let response = match request.url() {
                "/" => Response::from_string(
                    r#"<!DOCTYPE html>
<html>
<head><title>Departures</title></head>
<body>
<div class="real-time-departures" style="width:300px;height:200px">
<p>Richmond 4 min</p>
<p>Millbrae 11 min</p>
</div>
</body>
</html>"#,
                )
                .with_header("Content-Type: text/html; charset=utf-8".parse::<tiny_http::Header>().unwrap()),
                "/down" => Response::from_string("Service Unavailable").with_status_code(503),
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    });
    format!("http://{}", addr)
}

fn slot(id: &str, url: String) -> GroupConfig {
    GroupConfig {
        name: id.to_string(),
        kind: GroupKind::Primary,
        refresh_interval: None,
        slots: vec![SlotConfig {
            id: id.to_string(),
            url,
            selector: ".real-time-departures".to_string(),
        }],
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Chrome to be installed
async fn test_navigate_wait_and_capture() {
    let base = start_board_server();
    let source = CdpSource::launch(Viewport::default()).expect("Failed to launch Chrome");
    let page = source.open().await.expect("Failed to open tab");

    assert_eq!(page.navigate(&format!("{}/", base)).await.unwrap(), 200);
    page.wait_for_ready(".real-time-departures", Duration::from_secs(5))
        .await
        .expect("board should become ready");

    let region = page.capture_region(".real-time-departures").await.unwrap();
    assert!(region.starts_with(PNG_MAGIC));
    let full = page.capture_page().await.unwrap();
    assert!(full.starts_with(PNG_MAGIC));

    assert_eq!(page.navigate(&format!("{}/down", base)).await.unwrap(), 503);
    page.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Chrome to be installed
async fn test_missing_selector_times_out() {
    let base = start_board_server();
    let source = CdpSource::launch(Viewport::default()).expect("Failed to launch Chrome");
    let page = source.open().await.unwrap();
    page.navigate(&format!("{}/", base)).await.unwrap();

    let err = page
        .wait_for_ready("#not-on-this-page", Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadinessTimeout { .. }));
    assert!(err.to_string().starts_with("timeout waiting for element"));
    page.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Chrome to be installed
async fn test_manager_startup_against_chrome() {
    let base = start_board_server();
    let source = Arc::new(CdpSource::launch(Viewport::default()).expect("Failed to launch Chrome"));
    let retry = RetryPolicy {
        initial_delay: Duration::from_millis(50),
        max_attempts: 2,
    };

    let manager = SessionManager::builder(source.clone())
        .groups(vec![slot("primary", format!("{}/", base))])
        .retry(retry)
        .start()
        .await
        .expect("board page should load");
    assert_eq!(manager.current_session("primary").unwrap().generation(), 1);
    manager.shutdown().await;

    let result = SessionManager::builder(source)
        .groups(vec![slot("primary", format!("{}/down", base))])
        .retry(retry)
        .start()
        .await;
    assert!(matches!(
        result,
        Err(Error::InitializationFailure {
            last: AttemptFailure::Status(503),
            ..
        })
    ));
}
