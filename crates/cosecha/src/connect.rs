//! Service connector: endpoint rewriting and the probe-and-retry loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

use crate::result::{CollectError, CollectResult};
use crate::retry::retry;
use crate::service::{VmConnector, VmService};

/// Interval between connection attempts, also the liveness probe budget
pub const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Derive the bidirectional-streaming URI from an HTTP(S) endpoint.
///
/// The scheme is rewritten (`http` to `ws`, `https` to `wss`), the path
/// is preserved, and a trailing `ws` segment is appended:
/// `http://127.0.0.1:8181/abc/` becomes `ws://127.0.0.1:8181/abc/ws`.
///
/// # Errors
///
/// Returns [`CollectError::MalformedEndpoint`] if the URI does not parse
/// or carries a scheme with no websocket counterpart.
pub fn ws_uri(endpoint: &str) -> CollectResult<String> {
    let malformed = || CollectError::MalformedEndpoint {
        uri: endpoint.to_string(),
    };
    let mut url = Url::parse(endpoint).map_err(|_| malformed())?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(malformed()),
    };
    url.set_scheme(scheme).map_err(|()| malformed())?;
    url.path_segments_mut()
        .map_err(|()| malformed())?
        .pop_if_empty()
        .push("ws");
    Ok(String::from(url))
}

/// Connect to the introspection service behind `endpoint`.
///
/// Each attempt opens a fresh transport and immediately issues a liveness
/// probe bounded by [`PROBE_INTERVAL`]; a slow or failed probe closes the
/// half-open handle and counts as a retryable failure. The returned handle
/// is owned by the caller, including its closure.
///
/// # Errors
///
/// Returns [`CollectError::MalformedEndpoint`] without any connection
/// attempt, or [`CollectError::Timeout`] once `deadline` elapses.
pub async fn connect(
    connector: &dyn VmConnector,
    endpoint: &str,
    deadline: Option<Duration>,
) -> CollectResult<Arc<dyn VmService>> {
    let uri = ws_uri(endpoint)?;
    tracing::debug!(%uri, "connecting to VM service");

    retry(
        || async {
            let service = connector.connect(&uri).await?;
            match timeout(PROBE_INTERVAL, service.ping()).await {
                Ok(Ok(())) => Ok(service),
                Ok(Err(error)) => {
                    let _ = service.close().await;
                    Err(error)
                }
                Err(_) => {
                    let _ = service.close().await;
                    Err(CollectError::Connection {
                        message: "liveness probe timed out".to_string(),
                    })
                }
            }
        },
        PROBE_INTERVAL,
        deadline,
    )
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::mock::MockVm;

    mod uri_derivation {
        use super::*;

        #[test]
        fn test_http_with_token_path() {
            assert_eq!(
                ws_uri("http://127.0.0.1:8181/Ab1=/").unwrap(),
                "ws://127.0.0.1:8181/Ab1=/ws"
            );
        }

        #[test]
        fn test_http_without_trailing_slash() {
            assert_eq!(
                ws_uri("http://localhost:8181/abc").unwrap(),
                "ws://localhost:8181/abc/ws"
            );
        }

        #[test]
        fn test_https_becomes_wss() {
            assert_eq!(
                ws_uri("https://localhost:8181/").unwrap(),
                "wss://localhost:8181/ws"
            );
        }

        #[test]
        fn test_ws_scheme_kept() {
            assert_eq!(
                ws_uri("ws://localhost:8181/abc/").unwrap(),
                "ws://localhost:8181/abc/ws"
            );
        }

        #[test]
        fn test_garbage_is_malformed() {
            let err = ws_uri("not a uri").unwrap_err();
            assert!(matches!(err, CollectError::MalformedEndpoint { .. }));
        }

        #[test]
        fn test_unknown_scheme_is_malformed() {
            let err = ws_uri("ftp://localhost/").unwrap_err();
            assert!(matches!(err, CollectError::MalformedEndpoint { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_refused_connections() {
        let vm = MockVm::new();
        vm.fail_connects(3);
        let service = connect(&vm, "http://127.0.0.1:8181/", None).await.unwrap();
        service.ping().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_closes_handle_and_retries() {
        let vm = MockVm::new();
        // Probe answers far outside the 200ms budget until the fake
        // service recovers.
        vm.set_ping_delay(Some(Duration::from_secs(5)));
        let recovering = vm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            recovering.set_ping_delay(None);
        });

        let service = connect(&vm, "http://127.0.0.1:8181/", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        service.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_service_times_out() {
        let vm = MockVm::new();
        vm.fail_connects(usize::MAX);
        let err = connect(&vm, "http://127.0.0.1:8181/", Some(Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_malformed_endpoint_fails_without_connecting() {
        let vm = MockVm::new();
        let err = connect(&vm, "definitely not a uri", None).await.unwrap_err();
        assert!(matches!(err, CollectError::MalformedEndpoint { .. }));
        assert_eq!(vm.connect_attempts(), 0);
    }
}
