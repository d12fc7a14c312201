//! Datafile fetching and the background polling thread that keeps the
//! config store fresh.
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};
use reqwest::StatusCode;
use url::Url;

use crate::config_store::ConfigStore;
use crate::datafile::ProjectConfig;
use crate::notifications::{ConfigUpdateNotification, NotificationCenter};
use crate::{Error, Result};

/// Unauthenticated datafile URL template.
pub const DATAFILE_URL_TEMPLATE: &str = "https://cdn.optimizely.com/datafiles/{sdk_key}.json";
/// Authenticated datafile URL template, used when a datafile access token
/// is configured.
pub const AUTH_DATAFILE_URL_TEMPLATE: &str =
    "https://config.optimizely.com/datafiles/auth/{sdk_key}.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatafileFetcherConfig {
    pub sdk_key: String,
    /// Bearer token for authenticated datafiles. Switches the default URL
    /// template to the authenticated host.
    pub datafile_access_token: Option<String>,
    /// Custom URL template with a `{sdk_key}` placeholder.
    pub url_template: Option<String>,
}

impl DatafileFetcherConfig {
    pub fn new(sdk_key: impl Into<String>) -> DatafileFetcherConfig {
        DatafileFetcherConfig {
            sdk_key: sdk_key.into(),
            datafile_access_token: None,
            url_template: None,
        }
    }
}

/// An HTTP client that fetches datafile text from the CDN.
pub struct DatafileFetcher {
    // Client holds a connection pool internally, so we're reusing the
    // client between requests.
    client: reqwest::Client,
    config: DatafileFetcherConfig,
    /// If we receive a 401/403 during a request, the sdk key (or access
    /// token) is not valid. We cache this error so we don't keep hitting
    /// the server.
    unauthorized: bool,
}

impl DatafileFetcher {
    pub fn new(config: DatafileFetcherConfig) -> DatafileFetcher {
        DatafileFetcher {
            client: reqwest::Client::new(),
            config,
            unauthorized: false,
        }
    }

    pub async fn fetch_datafile(&mut self) -> Result<String> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        let template = match (&self.config.url_template, &self.config.datafile_access_token) {
            (Some(template), _) => template.as_str(),
            (None, Some(_)) => AUTH_DATAFILE_URL_TEMPLATE,
            (None, None) => DATAFILE_URL_TEMPLATE,
        };
        let url = Url::parse(&template.replace("{sdk_key}", &self.config.sdk_key))
            .map_err(Error::InvalidBaseUrl)?;

        log::debug!(target: "splitstream", "fetching datafile from {url}");
        let mut request = self.client.get(url);
        if let Some(token) = &self.config.datafile_access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            log::warn!(target: "splitstream",
                "datafile request is not authorized, check your sdk key and access token");
            self.unauthorized = true;
            return Err(Error::Unauthorized);
        }
        let response = response.error_for_status().map_err(|err| {
            log::warn!(target: "splitstream",
                "received non-200 response while fetching datafile: {err:?}");
            Error::from(err)
        })?;

        Ok(response.text().await?)
    }
}

/// Configuration for [`PollingConfigManager`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollingConfigManagerConfig {
    /// Interval to wait between datafile requests.
    pub poll_interval: Duration,
    /// Jitter applies a randomized duration to wait between requests. This
    /// helps to avoid multiple server instances synchronizing and producing
    /// spiky network load.
    pub jitter: Duration,
}

impl PollingConfigManagerConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(10);

    pub fn new() -> PollingConfigManagerConfig {
        PollingConfigManagerConfig::default()
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> PollingConfigManagerConfig {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollingConfigManagerConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollingConfigManagerConfig {
    fn default() -> PollingConfigManagerConfig {
        PollingConfigManagerConfig {
            poll_interval: PollingConfigManagerConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollingConfigManagerConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A background thread that periodically fetches the datafile and publishes
/// fresh configurations into a [`ConfigStore`].
pub struct PollingConfigManager {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` if configuration hasn't been fetched yet, `Some(Ok(()))`
    /// after the first successful fetch, and `Some(Err(...))` if fetching
    /// failed with an unrecoverable error.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollingConfigManager {
    /// Start the polling thread.
    pub fn start(
        mut fetcher: DatafileFetcher,
        store: Arc<ConfigStore>,
        notifications: Arc<NotificationCenter>,
        config: PollingConfigManagerConfig,
    ) -> std::io::Result<PollingConfigManager> {
        // Using `sync_channel` as it makes `stop_sender` `Sync`. Buffer size
        // of 1 is enough: a second stop command can be dropped safely.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let result = Arc::clone(&result);
            let update_result = move |value: Result<()>| {
                *result.0.lock().expect("poller result lock should not be poisoned") = Some(value);
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("splitstream-poller".to_owned())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            update_result(Err(Error::from(err)));
                            return;
                        }
                    };

                    loop {
                        log::debug!(target: "splitstream", "fetching new datafile");
                        match runtime.block_on(fetcher.fetch_datafile()) {
                            Ok(text) => match ProjectConfig::parse(&text) {
                                Ok(new_config) => {
                                    let previous_revision =
                                        store.get_config().map(|c| c.revision.clone());
                                    if previous_revision.as_deref() != Some(&new_config.revision) {
                                        log::info!(target: "splitstream",
                                            "received new datafile, revision {}", new_config.revision);
                                        let notification = ConfigUpdateNotification {
                                            revision: new_config.revision.clone(),
                                        };
                                        store.set_config(Arc::new(new_config));
                                        notifications.send_config_update(&notification);
                                    }
                                    update_result(Ok(()));
                                }
                                Err(err) => {
                                    // The previously active configuration
                                    // (if any) stays in effect.
                                    log::warn!(target: "splitstream",
                                        "fetched datafile is invalid: {err}");
                                }
                            },
                            Err(err @ (Error::Unauthorized | Error::InvalidBaseUrl(_))) => {
                                // Unrecoverable errors.
                                update_result(Err(err));
                                return;
                            }
                            Err(err) => {
                                // Other errors are retryable.
                                log::warn!(target: "splitstream",
                                    "failed to fetch datafile: {err}");
                            }
                        }

                        let timeout = jitter(config.poll_interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop back to fetch again.
                            }
                            Ok(()) => {
                                log::debug!(target: "splitstream",
                                    "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "splitstream",
                                    "poller thread channel disconnected");
                                return;
                            }
                        }
                    }
                })?
        };

        Ok(PollingConfigManager {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block until the first datafile has been fetched, bounded by
    /// `timeout`.
    ///
    /// Decisions made before this returns resolve to no-decision, so
    /// callers normally wait once at startup.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::ConfigurationTimeout);
                    }
                    let (guard, wait_result) = self
                        .result
                        .1
                        .wait_timeout(lock, remaining)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                    lock = guard;
                    if wait_result.timed_out() && lock.is_none() {
                        return Err(Error::ConfigurationTimeout);
                    }
                }
            }
        }
    }

    /// Stop the poller thread without waiting for it to exit.
    pub fn stop(&self) {
        // Error means the receiver was dropped (thread exited) or the
        // buffer is full (another stop command is already pending). Both
        // can be ignored.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;
        Ok(())
    }
}

/// Apply randomized subtractive `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod jitter_tests {
    use std::time::Duration;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let interval = Duration::ZERO;
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::ZERO);
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::ZERO;

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::from_secs(30));
    }
}
