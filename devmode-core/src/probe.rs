// Socket readiness probing
//
// Repeatedly opens a TCP connection until something is listening, then
// writes a payload and hangs up. Only "connection refused" is retried; any
// other socket error ends the probe immediately.

use crate::config::ProbePolicy;
use crate::error::ProbeError;
use std::io::ErrorKind;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Connected and the payload was written
    Ready,
    /// `cancel_check` asked us to stop; not an error
    Cancelled,
}

/// Probe `host:port` up to `policy.max_attempts` times, `policy.interval`
/// apart. `cancel_check` runs before every attempt.
pub async fn probe<F>(
    host: &str,
    port: u16,
    payload: &[u8],
    policy: &ProbePolicy,
    mut cancel_check: F,
) -> Result<ProbeStatus, ProbeError>
where
    F: FnMut() -> bool,
{
    for attempt in 1..=policy.max_attempts {
        if cancel_check() {
            debug!("Probe of {}:{} cancelled before attempt {}", host, port, attempt);
            return Ok(ProbeStatus::Cancelled);
        }

        match TcpStream::connect((host, port)).await {
            Ok(mut stream) => {
                let written = async {
                    stream.write_all(payload).await?;
                    stream.flush().await
                }
                .await;
                stream.shutdown().await.ok();

                return match written {
                    Ok(()) => {
                        debug!("{}:{} accepted probe on attempt {}", host, port, attempt);
                        Ok(ProbeStatus::Ready)
                    }
                    Err(source) => Err(ProbeError::Transport {
                        host: host.to_string(),
                        port,
                        source,
                    }),
                };
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                trace!("{}:{} refused attempt {}", host, port, attempt);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.interval()).await;
                }
            }
            Err(source) => {
                return Err(ProbeError::Transport {
                    host: host.to_string(),
                    port,
                    source,
                })
            }
        }
    }

    Err(ProbeError::Timeout {
        host: host.to_string(),
        port,
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn delivers_payload_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let policy = ProbePolicy::new(Duration::from_millis(10), 3);
        let status = probe("127.0.0.1", port, b"ping", &policy, || false)
            .await
            .unwrap();

        assert_eq!(status, ProbeStatus::Ready);
        assert_eq!(server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn gives_up_after_exactly_max_attempts() {
        let port = closed_port().await;
        let policy = ProbePolicy::new(Duration::from_millis(20), 4);
        let mut checks = 0;

        let started = Instant::now();
        let err = probe("127.0.0.1", port, b"x", &policy, || {
            checks += 1;
            false
        })
        .await
        .unwrap_err();

        match err {
            ProbeError::Timeout { attempts, port: p, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(p, port);
            }
            other => panic!("unexpected: {:?}", other),
        }
        // one cancel check per connection attempt
        assert_eq!(checks, 4);
        // three waits separate four attempts
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn cancellation_stops_further_attempts() {
        let port = closed_port().await;
        let policy = ProbePolicy::new(Duration::from_millis(5), 100);
        let mut checks = 0;

        let status = probe("127.0.0.1", port, b"x", &policy, || {
            checks += 1;
            checks == 3
        })
        .await
        .unwrap();

        assert_eq!(status, ProbeStatus::Cancelled);
        assert_eq!(checks, 3);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let port = closed_port().await;
        let policy = ProbePolicy::new(Duration::from_millis(5), 10);
        let status = probe("127.0.0.1", port, b"x", &policy, || true)
            .await
            .unwrap();
        assert_eq!(status, ProbeStatus::Cancelled);
    }
}
