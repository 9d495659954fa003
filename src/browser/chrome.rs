use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, warn};

use super::{LoadedPage, Session, SessionLauncher};
use crate::config::BrowserConfig;
use crate::error::SessionError;

/// Finds the first element whose text carries a currency amount or whose
/// class looks price-like.
const PRICE_PROBE_SCRIPT: &str = r#"
(() => {
    const amount = /[₦$€£₹N]\s?\d/;
    const priceClass = /price|prc/i;
    for (const el of document.querySelectorAll('span')) {
        const text = (el.innerText || '').trim();
        if (!text) continue;
        const cls = typeof el.className === 'string' ? el.className : '';
        if (amount.test(text) || priceClass.test(cls)) return text;
    }
    return '';
})()
"#;

/// Chrome's usual automation-friendly switches, minus `--enable-automation`,
/// which sets `navigator.webdriver` and shows the automation infobar.
const CHROME_ARGS: [&str; 24] = [
    "--disable-background-networking",
    "--enable-features=NetworkService,NetworkServiceInProcess",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-breakpad",
    "--disable-client-side-phishing-detection",
    "--disable-component-extensions-with-background-pages",
    "--disable-default-apps",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-features=TranslateUI",
    "--disable-hang-monitor",
    "--disable-ipc-flooding-protection",
    "--disable-popup-blocking",
    "--disable-prompt-on-repost",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--force-color-profile=srgb",
    "--metrics-recording-only",
    "--no-first-run",
    "--password-store=basic",
    "--use-mock-keychain",
    "--lang=en_US",
    "--disable-blink-features=AutomationControlled",
];

// ── Launcher ──────────────────────────────────────────────────────────────────

pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Unattended headless profile: incognito, automation flag hidden, and
    /// a throwaway `profile` directory owned by the session.
    fn chrome_config(&self, profile: &Path) -> Result<ChromeConfig, SessionError> {
        let cfg = &self.config;
        let mut builder = ChromeConfig::builder()
            .disable_default_args()
            .args(CHROME_ARGS)
            .arg("--disable-gpu")
            .arg(format!("--user-agent={}", cfg.user_agent))
            .incognito()
            .user_data_dir(profile)
            .window_size(cfg.window_width, cfg.window_height)
            .request_timeout(Duration::from_secs(cfg.request_timeout_secs));

        if !cfg.sandbox {
            builder = builder.no_sandbox();
        }
        if !cfg.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &cfg.chrome_path {
            builder = builder.chrome_executable(path);
        }

        builder.build().map_err(SessionError::Config)
    }

    async fn launch_once(&self) -> Result<ChromeSession, SessionError> {
        let profile = tempfile::Builder::new()
            .prefix("pricewatch-chrome-")
            .tempdir()
            .map_err(|e| SessionError::Launch(format!("could not create profile dir: {}", e)))?;
        let chrome_config = self.chrome_config(profile.path())?;
        let (browser, mut handler) = Browser::launch(chrome_config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        // The CDP handler must be polled for the browser to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        debug!("chrome launched with profile {}", profile.path().display());
        Ok(ChromeSession {
            browser: Some(browser),
            handler: handler_task,
            profile: Some(profile),
            runtime: Handle::current(),
        })
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn acquire(&self) -> Result<Box<dyn Session>, SessionError> {
        let retries = ExponentialBackoff::from_millis(250)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.launch_retries);

        let session = Retry::start(retries, || async {
            self.launch_once().await.inspect_err(|e| {
                warn!("chrome launch attempt failed: {}", e);
            })
        })
        .await?;

        Ok(Box::new(session))
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

struct ChromeSession {
    browser: Option<Browser>,
    handler: JoinHandle<()>,
    /// Deleted once the browser process is gone.
    profile: Option<TempDir>,
    runtime: Handle,
}

#[async_trait]
impl Session for ChromeSession {
    async fn open(&self, url: &str) -> Result<Box<dyn LoadedPage>> {
        let browser = self.browser.as_ref().context("browser already closed")?;
        let page = browser
            .new_page("about:blank")
            .await
            .context("could not open a tab")?;
        page.goto(url)
            .await
            .with_context(|| format!("navigation to {} failed", url))?;

        Ok(Box::new(ChromePage { page }))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let result = match self.browser.take() {
            Some(mut browser) => {
                let closed = browser.close().await;
                if closed.is_err() {
                    // Fall back to killing the process outright.
                    if let Some(Err(e)) = browser.kill().await {
                        warn!("failed to kill chrome: {}", e);
                    }
                }
                let _ = browser.wait().await;
                closed.map(|_| ()).context("chrome did not close cleanly")
            }
            None => Ok(()),
        };
        self.handler.abort();
        remove_profile(self.profile.take());
        result
    }

    fn abandon(&mut self) {
        self.handler.abort();
        let profile = self.profile.take();
        match self.browser.take() {
            Some(mut browser) => {
                self.runtime.spawn(async move {
                    if let Some(Err(e)) = browser.kill().await {
                        warn!("failed to kill abandoned chrome: {}", e);
                    }
                    let _ = browser.wait().await;
                    remove_profile(profile);
                });
            }
            None => remove_profile(profile),
        }
    }
}

fn remove_profile(profile: Option<TempDir>) {
    if let Some(dir) = profile {
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            warn!("could not remove chrome profile {}: {}", path.display(), e);
        }
    }
}

// ── Page ──────────────────────────────────────────────────────────────────────

struct ChromePage {
    page: Page,
}

impl ChromePage {
    /// Scripts return `''` for "nothing found"; CDP reports a bare `null` as a
    /// missing value.
    async fn eval_text(&self, script: String) -> Result<Option<String>> {
        let value: String = self
            .page
            .evaluate(script)
            .await
            .context("script evaluation failed")?
            .into_value()
            .context("script returned a non-string value")?;
        Ok(Some(value).filter(|v| !v.trim().is_empty()))
    }
}

#[async_trait]
impl LoadedPage for ChromePage {
    async fn first_text(&self, selectors: &str) -> Result<Option<String>> {
        let selectors = serde_json::to_string(selectors)?;
        let script = format!(
            "(() => {{ \
                for (const el of document.querySelectorAll({selectors})) {{ \
                    const text = (el.innerText || '').trim(); \
                    if (text) return text; \
                }} \
                return ''; \
            }})()"
        );
        self.eval_text(script).await
    }

    async fn price_like_text(&self) -> Result<Option<String>> {
        self.eval_text(PRICE_PROBE_SCRIPT.to_string()).await
    }

    async fn html(&self) -> Result<String> {
        self.page.content().await.context("could not read page content")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// A stand-in for Chrome that appends its command line to a log and exits.
    fn recording_chrome(dir: &Path) -> (PathBuf, PathBuf) {
        let log = dir.join("argv.log");
        let exe = dir.join("fake-chrome");
        let script = format!("#!/bin/sh\necho \"$@\" >> '{}'\nexit 1\n", log.display());
        std::fs::write(&exe, script).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        (exe, log)
    }

    #[tokio::test]
    async fn test_launch_flags_and_private_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let (exe, log) = recording_chrome(dir.path());
        let launcher = ChromeLauncher::new(&BrowserConfig {
            chrome_path: Some(exe),
            ..BrowserConfig::default()
        });

        assert!(launcher.launch_once().await.is_err());
        assert!(launcher.launch_once().await.is_err());

        let log = std::fs::read_to_string(&log).unwrap();
        let launches: Vec<Vec<&str>> = log
            .lines()
            .map(|line| line.split_whitespace().collect())
            .collect();
        assert_eq!(launches.len(), 2);

        for args in &launches {
            assert!(args.contains(&"--headless"), "{:?}", args);
            assert!(args.contains(&"--incognito"), "{:?}", args);
            assert!(args.contains(&"--disable-blink-features=AutomationControlled"));
            assert!(!args.contains(&"--enable-automation"), "{:?}", args);
        }

        let profiles: Vec<&str> = launches
            .iter()
            .map(|args| {
                args.iter()
                    .find_map(|a| a.strip_prefix("--user-data-dir="))
                    .unwrap()
            })
            .collect();
        assert_ne!(profiles[0], profiles[1]);
        // a failed launch leaves no profile behind
        for profile in profiles {
            assert!(!Path::new(profile).exists(), "{} still exists", profile);
        }
    }

    #[tokio::test]
    async fn test_headed_sandboxed_launch() {
        let dir = tempfile::tempdir().unwrap();
        let (exe, log) = recording_chrome(dir.path());
        let launcher = ChromeLauncher::new(&BrowserConfig {
            chrome_path: Some(exe),
            headless: false,
            sandbox: true,
            ..BrowserConfig::default()
        });

        assert!(launcher.launch_once().await.is_err());

        let log = std::fs::read_to_string(&log).unwrap();
        let args: Vec<&str> = log.split_whitespace().collect();
        assert!(!args.contains(&"--headless"), "{:?}", args);
        assert!(!args.contains(&"--no-sandbox"), "{:?}", args);
        assert!(args.contains(&"--incognito"));
    }
}
