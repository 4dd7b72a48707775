//! Run outcome reporting to a Zabbix server.
//!
//! Best effort: failures are retried a configured number of times, then
//! logged and dropped. A notification never changes the run's outcome.

pub mod zabbix;

pub use zabbix::{SenderItem, SenderResponse, ZabbixSender};

use crate::config::NotifyConfig;
use crate::executor::RunStatistics;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const STATUS_KEY: &str = "backup.status";
pub const DURATION_KEY: &str = "backup.duration";
pub const LAST_SUCCESS_KEY: &str = "backup.lastSuccessfull";
pub const CHANGED_FILE_COUNT_KEY: &str = "backup.changedFileCount";
pub const CHANGED_FILE_SIZE_KEY: &str = "backup.changedFileSize";

pub const STATUS_OK: &str = "OK: Backup finished";
pub const STATUS_ERR: &str = "ERR: See log for details";

const LAST_SUCCESS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Delay between delivery attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Items describing one run. Failed runs report only their status.
pub fn build_items(host: &str, stats: &RunStatistics) -> Vec<SenderItem> {
    if !stats.ok {
        return vec![SenderItem::new(host, STATUS_KEY, STATUS_ERR)];
    }

    vec![
        SenderItem::new(host, STATUS_KEY, STATUS_OK),
        SenderItem::new(host, DURATION_KEY, stats.duration_secs().to_string()),
        SenderItem::new(
            host,
            LAST_SUCCESS_KEY,
            stats.finished().format(LAST_SUCCESS_FORMAT).to_string(),
        ),
        SenderItem::new(host, CHANGED_FILE_COUNT_KEY, stats.changed_file_count.to_string()),
        SenderItem::new(host, CHANGED_FILE_SIZE_KEY, stats.changed_file_size.to_string()),
    ]
}

/// Delivers run statistics with retries
#[derive(Debug, Clone)]
pub struct Notifier {
    retry_delay: Duration,
    timeout: Duration,
}

impl Default for Notifier {
    fn default() -> Self {
        Self {
            retry_delay: RETRY_DELAY,
            timeout: zabbix::DEFAULT_TIMEOUT,
        }
    }
}

impl Notifier {
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Report `stats`; returns the server's answer, or `None` if every attempt failed
    pub async fn notify(
        &self,
        target: &NotifyConfig,
        stats: &RunStatistics,
    ) -> Option<SenderResponse> {
        if target.server.is_empty() || target.host.is_empty() {
            return None;
        }

        debug!("Sending notify via zabbix to {}", target.server);
        let sender = match ZabbixSender::new(&target.server) {
            Ok(sender) => sender.with_timeout(self.timeout),
            Err(e) => {
                warn!("Failed to send notify via zabbix: {}", e);
                return None;
            }
        };

        let items = build_items(&target.host, stats);
        let attempts = target.attempts.max(1);

        for attempt in 1..=attempts {
            match sender.send(&items).await {
                Ok(response) => {
                    info!("Sent notify via zabbix: {}", response);
                    return Some(response);
                }
                Err(e) => {
                    warn!(attempt, attempts, "Failed to send notify via zabbix: {}", e);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn finished_stats(ok: bool) -> RunStatistics {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap();
        let mut stats = RunStatistics::started_at(start);
        stats.end = Some(start + ChronoDuration::seconds(3725));
        stats.changed_file_count = 42;
        stats.changed_file_size = 1_048_576;
        if !ok {
            stats.fail("Errors in rsync for ROOT: exit code 23");
        }
        stats
    }

    fn target(address: String, attempts: u32) -> NotifyConfig {
        NotifyConfig {
            server: address,
            host: "web1.example.org".to_string(),
            attempts,
        }
    }

    async fn read_request(socket: &mut TcpStream) -> std::io::Result<Vec<u8>> {
        let mut prefix = [0u8; 13];
        socket.read_exact(&mut prefix).await?;
        let length = u32::from_le_bytes([prefix[5], prefix[6], prefix[7], prefix[8]]) as usize;
        let mut payload = vec![0u8; length];
        socket.read_exact(&mut payload).await?;
        Ok(payload)
    }

    #[test]
    fn test_items_for_successful_run() {
        let items = build_items("web1.example.org", &finished_stats(true));
        let pairs: Vec<(&str, &str)> = items
            .iter()
            .map(|item| (item.key.as_str(), item.value.as_str()))
            .collect();

        assert_eq!(
            pairs,
            vec![
                (STATUS_KEY, STATUS_OK),
                (DURATION_KEY, "3725"),
                (LAST_SUCCESS_KEY, "2024-06-01 04:02:05"),
                (CHANGED_FILE_COUNT_KEY, "42"),
                (CHANGED_FILE_SIZE_KEY, "1048576"),
            ]
        );
        assert!(items.iter().all(|item| item.host == "web1.example.org"));
    }

    #[test]
    fn test_items_for_failed_run() {
        let items = build_items("web1", &finished_stats(false));
        assert_eq!(items, vec![SenderItem::new("web1", STATUS_KEY, STATUS_ERR)]);
    }

    #[tokio::test]
    async fn test_notify_delivers() -> std::io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let payload = read_request(&mut socket).await?;
            let body = br#"{"response":"success","info":"processed: 5; failed: 0; total: 5"}"#;
            socket.write_all(zabbix::ZABBIX_HEADER).await?;
            socket.write_all(&(body.len() as u64).to_le_bytes()).await?;
            socket.write_all(body).await?;
            Ok::<_, std::io::Error>(payload)
        });

        let response = Notifier::default()
            .notify(&target(address, 1), &finished_stats(true))
            .await;
        assert_eq!(response.map(|r| r.response), Some("success".to_string()));

        let payload = server.await??;
        let request: zabbix::SenderRequest = serde_json::from_slice(&payload)?;
        assert_eq!(request.data.len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_notify_retries_then_gives_up() -> std::io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let connections = Arc::new(AtomicUsize::new(0));

        let seen = connections.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = read_request(&mut socket).await;
                // header only, then close
                let _ = socket.write_all(zabbix::ZABBIX_HEADER).await;
            }
        });

        let stats = finished_stats(true);
        let response = Notifier::default()
            .with_retry_delay(Duration::from_millis(10))
            .notify(&target(address, 3), &stats)
            .await;

        assert!(response.is_none());
        assert_eq!(connections.load(Ordering::SeqCst), 3);
        assert!(stats.ok);
        Ok(())
    }

    #[tokio::test]
    async fn test_notify_skipped_without_target() {
        let mut no_server = target(String::new(), 1);
        assert!(Notifier::default().notify(&no_server, &finished_stats(true)).await.is_none());

        no_server.server = "127.0.0.1:1".to_string();
        no_server.host = String::new();
        assert!(Notifier::default().notify(&no_server, &finished_stats(true)).await.is_none());
    }
}
