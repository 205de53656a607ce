//! Browser process supervision
//!
//! One headless Chrome process is owned by a [`BrowserSupervisor`]. The CDP
//! handler stream is polled on a background task; when it terminates
//! unexpectedly the supervisor first tries to reconnect to the saved
//! websocket endpoint, then falls back to relaunching with the same
//! arguments. Observers (the pool) subscribe to state transitions through a
//! watch channel.

use crate::{create_browser_config_with_instance_id, BrowserOptions, ExportError};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::network;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const RECONNECT_ATTEMPTS: usize = 25;
const RECONNECT_INTERVAL: Duration = Duration::from_secs(4);

/// Lifecycle states of the supervised browser process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    Unstarted,
    Starting,
    Running,
    Disconnected,
    Reconnecting,
    Relaunching,
    Closed,
}

struct SupervisorInner {
    browser: Option<Browser>,
    handler_task: Option<tokio::task::JoinHandle<()>>,
    endpoint: Option<String>,
}

/// Owns the single Chrome process and survives transient disconnects
pub struct BrowserSupervisor {
    options: BrowserOptions,
    inner: Mutex<SupervisorInner>,
    state_tx: watch::Sender<BrowserState>,
    closing: Arc<AtomicBool>,
}

impl BrowserSupervisor {
    pub fn new(options: BrowserOptions) -> Self {
        let (state_tx, _) = watch::channel(BrowserState::Unstarted);
        Self {
            options,
            inner: Mutex::new(SupervisorInner {
                browser: None,
                handler_task: None,
                endpoint: None,
            }),
            state_tx,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Launch the browser. Called once; later failures are handled through
    /// the reconnect/relaunch path, not by calling `start` again.
    pub async fn start(&self) -> Result<(), ExportError> {
        let mut inner = self.inner.lock().await;
        if inner.browser.is_some() {
            return Ok(());
        }

        self.state_tx.send_replace(BrowserState::Starting);
        match self.launch_locked(&mut inner).await {
            Ok(()) => {
                self.state_tx.send_replace(BrowserState::Running);
                Ok(())
            }
            Err(e) => {
                self.state_tx.send_replace(BrowserState::Unstarted);
                Err(e)
            }
        }
    }

    async fn launch_locked(&self, inner: &mut SupervisorInner) -> Result<(), ExportError> {
        let config = create_browser_config_with_instance_id(&self.options, Some(0));

        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|e| ExportError::BrowserLaunchFailed(e.to_string()))?;

        inner.endpoint = Some(browser.websocket_address().to_string());
        inner.handler_task = Some(self.spawn_handler(handler));
        inner.browser = Some(browser);

        info!("Browser launched");
        Ok(())
    }

    fn spawn_handler(
        &self,
        mut handler: chromiumoxide::handler::Handler,
    ) -> tokio::task::JoinHandle<()> {
        let state_tx = self.state_tx.clone();
        let closing = self.closing.clone();

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("CDP handler error: {}", e);
                    break;
                }
            }
            if closing.load(Ordering::Relaxed) {
                debug!("CDP handler stream ended during shutdown");
            } else {
                warn!("CDP handler stream ended, browser disconnected");
                state_tx.send_replace(BrowserState::Disconnected);
            }
        })
    }

    pub fn state(&self) -> BrowserState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions. The pool watches for `Disconnected`
    /// to invalidate its resources.
    pub fn subscribe(&self) -> watch::Receiver<BrowserState> {
        self.state_tx.subscribe()
    }

    /// Create a fresh tab with browser-level caching disabled.
    pub async fn new_page(&self) -> Result<Page, ExportError> {
        if self.state() == BrowserState::Disconnected {
            self.recover().await?;
        }

        let page = {
            let inner = self.inner.lock().await;
            let browser = inner
                .browser
                .as_ref()
                .ok_or(ExportError::BrowserUnavailable)?;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| ExportError::CreateFailed(e.to_string()))?
        };

        if let Err(e) = self.disable_page_cache(&page).await {
            let _ = page.close().await;
            return Err(e);
        }

        Ok(page)
    }

    async fn disable_page_cache(&self, page: &Page) -> Result<(), ExportError> {
        page.execute(network::EnableParams::default())
            .await
            .map_err(|e| ExportError::CreateFailed(e.to_string()))?;
        page.execute(network::SetCacheDisabledParams::new(true))
            .await
            .map_err(|e| ExportError::CreateFailed(e.to_string()))?;
        Ok(())
    }

    /// Reconnect to the saved endpoint, or relaunch when reconnection is
    /// exhausted. Serialized behind the inner lock so concurrent page
    /// creators do not race a half-recovered browser.
    pub async fn recover(&self) -> Result<(), ExportError> {
        let mut inner = self.inner.lock().await;

        // Another caller may have recovered while we waited for the lock.
        if self.state() == BrowserState::Running && inner.browser.is_some() {
            return Ok(());
        }

        if let Some(task) = inner.handler_task.take() {
            task.abort();
        }

        if let Some(endpoint) = inner.endpoint.clone() {
            self.state_tx.send_replace(BrowserState::Reconnecting);
            for attempt in 1..=RECONNECT_ATTEMPTS {
                match Browser::connect(endpoint.clone()).await {
                    Ok((browser, handler)) => {
                        info!(attempt, "Reconnected to browser");
                        inner.handler_task = Some(self.spawn_handler(handler));
                        inner.browser = Some(browser);
                        self.state_tx.send_replace(BrowserState::Running);
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(attempt, error = %e, "Reconnect attempt failed");
                        if attempt < RECONNECT_ATTEMPTS {
                            sleep(RECONNECT_INTERVAL).await;
                        }
                    }
                }
            }
            warn!(
                "Reconnection exhausted after {} attempts, relaunching",
                RECONNECT_ATTEMPTS
            );
        }

        // Best-effort close of whatever is left, then a clean relaunch.
        self.state_tx.send_replace(BrowserState::Relaunching);
        if let Some(mut browser) = inner.browser.take() {
            let _ = browser.close().await;
        }

        match self.launch_locked(&mut inner).await {
            Ok(()) => {
                self.state_tx.send_replace(BrowserState::Running);
                Ok(())
            }
            Err(e) => {
                error!("Browser relaunch failed: {}", e);
                self.state_tx.send_replace(BrowserState::Disconnected);
                Err(ExportError::BrowserUnavailable)
            }
        }
    }

    /// Close the browser. Idempotent.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;

        if let Some(mut browser) = inner.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("Browser close failed: {}", e);
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = inner.handler_task.take() {
            task.abort();
        }
        inner.endpoint = None;
        self.state_tx.send_replace(BrowserState::Closed);
        info!("Browser closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let supervisor = BrowserSupervisor::new(BrowserOptions::default());
        assert_eq!(supervisor.state(), BrowserState::Unstarted);
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let supervisor = BrowserSupervisor::new(BrowserOptions::default());
        let rx = supervisor.subscribe();
        assert_eq!(*rx.borrow(), BrowserState::Unstarted);

        supervisor.state_tx.send_replace(BrowserState::Running);
        assert_eq!(*rx.borrow(), BrowserState::Running);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let supervisor = BrowserSupervisor::new(BrowserOptions::default());
        supervisor.close().await;
        supervisor.close().await;
        assert_eq!(supervisor.state(), BrowserState::Closed);
    }

    #[tokio::test]
    async fn test_new_page_without_start_fails() {
        let supervisor = BrowserSupervisor::new(BrowserOptions::default());
        let result = supervisor.new_page().await;
        assert!(matches!(result, Err(ExportError::BrowserUnavailable)));
    }
}
