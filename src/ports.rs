use std::io::ErrorKind;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::WprSettings;
use crate::error::BenchError;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Sequential port range cursor shared by every proxy launched in a run.
///
/// An allocation scans forward from the cursor and then moves the cursor to
/// the next `step` boundary past the last port it handed out, so sequential
/// allocations never overlap. Past `end` the cursor wraps to the configured
/// begin.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: String,
    default_begin: u16,
    cursor: u16,
    end: u16,
    step: u16,
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, begin: u16, end: u16, step: u16) -> Self {
        Self {
            host: host.into(),
            default_begin: begin,
            cursor: begin,
            end,
            step: step.max(1),
        }
    }

    pub fn from_settings(settings: &WprSettings) -> Self {
        Self::new(
            settings.host.clone(),
            settings.port_begin,
            settings.port_end,
            settings.port_step,
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the next allocation starts scanning from.
    pub fn cursor(&self) -> u16 {
        self.cursor
    }

    /// Scan order: `[cursor, end)` first, then once around `[begin, cursor)`.
    fn scan_order(&self) -> impl Iterator<Item = u16> {
        (self.cursor..self.end).chain(self.default_begin..self.cursor)
    }

    /// Move the cursor to the first `step` boundary after `last`.
    fn advance_past(&mut self, last: u16) {
        let offset = u32::from(last - self.default_begin) + 1;
        let step = u32::from(self.step);
        let next = u32::from(self.default_begin) + offset.div_ceil(step) * step;
        self.cursor = if next >= u32::from(self.end) {
            self.default_begin
        } else {
            next as u16
        };
    }

    /// Find `count` ports on `host` that nothing is listening on.
    ///
    /// Busy ports are skipped; the whole range is searched before giving up.
    pub async fn allocate(&mut self, count: usize) -> Result<Vec<u16>, BenchError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut free = Vec::with_capacity(count);
        for port in self.scan_order() {
            if free.len() == count {
                break;
            }
            if port_is_free(&self.host, port).await {
                free.push(port);
            } else {
                debug!(host = %self.host, port, "port in use, skipping");
            }
        }

        let Some(&last) = free.last().filter(|_| free.len() == count) else {
            return Err(BenchError::PortAllocation {
                host: self.host.clone(),
                begin: self.default_begin,
                end: self.end,
                count,
            });
        };
        self.advance_past(last);
        debug!(host = %self.host, ports = ?free, cursor = self.cursor, "allocated ports");
        Ok(free)
    }

    /// Allocate the HTTP/HTTPS pair a proxy instance binds to.
    pub async fn allocate_pair(&mut self) -> Result<(u16, u16), BenchError> {
        let ports = self.allocate(2).await?;
        Ok((ports[0], ports[1]))
    }
}

/// A refused connection means nobody is listening.
async fn port_is_free(host: &str, port: u16) -> bool {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => false,
        Ok(Err(err)) => err.kind() == ErrorKind::ConnectionRefused,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn busy_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    #[test]
    fn cursor_moves_to_next_step_boundary() {
        let mut allocator = PortAllocator::new("127.0.0.1", 9000, 9100, 10);
        allocator.advance_past(9001);
        assert_eq!(allocator.cursor(), 9010);
        allocator.advance_past(9019);
        assert_eq!(allocator.cursor(), 9020);
        allocator.advance_past(9023);
        assert_eq!(allocator.cursor(), 9030);
    }

    #[test]
    fn cursor_wraps_to_default_begin() {
        let mut allocator = PortAllocator::new("127.0.0.1", 9000, 9030, 10);
        allocator.advance_past(9021);
        assert_eq!(allocator.cursor(), 9000);

        let mut clamped = PortAllocator::new("127.0.0.1", 9000, 9015, 10);
        clamped.advance_past(9011);
        assert_eq!(clamped.cursor(), 9000);
    }

    #[test]
    fn scan_wraps_once_through_the_range() {
        let mut allocator = PortAllocator::new("127.0.0.1", 9000, 9006, 2);
        allocator.advance_past(9001);
        let order: Vec<u16> = allocator.scan_order().collect();
        assert_eq!(order, vec![9002, 9003, 9004, 9005, 9000, 9001]);
    }

    #[tokio::test]
    async fn sequential_allocations_do_not_overlap() {
        let (_listener, busy) = busy_port().await;
        let mut allocator = PortAllocator::new("127.0.0.1", busy, busy.saturating_add(40), 10);

        let first = allocator.allocate(2).await.expect("first");
        let second = allocator.allocate(2).await.expect("second");

        assert!(!first.contains(&busy));
        assert!(first.iter().all(|port| !second.contains(port)));
        assert!(second.iter().all(|port| *port >= busy + 10));
    }

    #[tokio::test]
    async fn busy_window_falls_through_to_later_ports() {
        let (_listener, busy) = busy_port().await;
        let mut allocator = PortAllocator::new("127.0.0.1", busy, busy.saturating_add(100), 2);

        let ports = allocator.allocate(2).await.expect("later ports are free");

        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|port| *port > busy));
        let highest = ports.iter().copied().max().expect("ports");
        assert!(allocator.cursor() > highest);
        assert_eq!((allocator.cursor() - busy) % 2, 0);
    }

    #[tokio::test]
    async fn allocate_fails_when_range_is_exhausted() {
        let (_listener, busy) = busy_port().await;
        let mut allocator = PortAllocator::new("127.0.0.1", busy, busy.saturating_add(1), 2);

        let err = allocator.allocate(1).await.expect_err("no free port");
        assert!(matches!(err, BenchError::PortAllocation { count: 1, .. }));
        assert_eq!(allocator.cursor(), busy);
    }
}
