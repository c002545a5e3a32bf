//! Bounded TCP readiness polling for rebooting devices.

use super::{DelayRange, PortWaiter};
use crate::{TransportError, TransportResult};
use rand::Rng;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread::sleep;
use std::time::{Duration, Instant};

const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default)]
pub struct TcpPortWaiter;

impl TcpPortWaiter {
    pub fn new() -> Self {
        Self
    }
}

fn jittered(delay: DelayRange) -> Duration {
    if delay.max <= delay.min {
        return delay.min;
    }
    let millis = rand::thread_rng().gen_range(delay.min.as_millis()..=delay.max.as_millis());
    Duration::from_millis(millis as u64)
}

fn port_open(host: &str, port: u16) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        // Name resolution can fail while the device's DHCP lease is being renewed.
        Err(_) => return false,
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, CONNECT_ATTEMPT_TIMEOUT).is_ok())
}

impl PortWaiter for TcpPortWaiter {
    fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        delay: DelayRange,
        timeout: Duration,
    ) -> TransportResult<()> {
        log::info!("Waiting for {}:{} to come back...", host, port);
        let started = Instant::now();
        loop {
            sleep(jittered(delay));
            if port_open(host, port) {
                log::info!(
                    "{}:{} is reachable after {}s",
                    host,
                    port,
                    started.elapsed().as_secs()
                );
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(TransportError::PortTimeout {
                    host: host.to_string(),
                    port,
                    timeout_secs: timeout.as_secs(),
                });
            }
            log::debug!("{}:{} not reachable yet", host, port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn jitter_stays_inside_range() {
        let range = DelayRange {
            min: Duration::from_millis(10),
            max: Duration::from_millis(20),
        };
        for _ in 0..50 {
            let d = jittered(range);
            assert!(d >= range.min && d <= range.max);
        }
    }

    #[test]
    fn returns_once_listener_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let delay = DelayRange {
            min: Duration::from_millis(1),
            max: Duration::from_millis(5),
        };
        TcpPortWaiter::new()
            .wait_for_port("127.0.0.1", port, delay, Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn times_out_when_nothing_listens() {
        // Bind then drop to get a port that is very likely closed.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let delay = DelayRange {
            min: Duration::from_millis(1),
            max: Duration::from_millis(2),
        };
        let err = TcpPortWaiter::new()
            .wait_for_port("127.0.0.1", port, delay, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, TransportError::PortTimeout { .. }));
    }
}
