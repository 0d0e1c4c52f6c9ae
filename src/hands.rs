use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use headless_chrome::{Browser as ChromeProcess, LaunchOptions, Tab};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The live page the agent drives. Implementations wrap a real browser
/// driver; tests use an in-memory page.
///
/// Every call is awaited to completion and takes a bound where the driver
/// could otherwise wait forever.
#[async_trait]
pub trait Page: Send + Sync {
    /// Navigate and wait for the DOM to be ready.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Run a script in the page and return its completion value.
    async fn evaluate(&self, script: &str) -> Result<Value>;

    async fn click(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// Replace the content of an editable element.
    async fn fill(&self, selector: &str, text: &str, timeout: Duration) -> Result<()>;

    async fn press(&self, selector: &str, key: &str, timeout: Duration) -> Result<()>;

    /// Resolve once the page has gone quiet, or fail after `timeout`.
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<()>;

    async fn url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;
}

/// Start/stop lifecycle around a single page.
#[async_trait]
pub trait Browser: Send {
    async fn start(&mut self) -> Result<Arc<dyn Page>>;

    /// Must be safe to call when `start` never succeeded.
    async fn stop(&mut self) -> Result<()>;
}

/// Run a script, giving up after `limit`.
pub async fn evaluate_within(page: &dyn Page, script: &str, limit: Duration) -> Result<Value> {
    match tokio::time::timeout(limit, page.evaluate(script)).await {
        Ok(result) => result,
        Err(_) => bail!("script timed out after {}ms", limit.as_millis()),
    }
}

/// Evaluate a script that returns `JSON.stringify(...)` and decode it.
pub async fn evaluate_json<T: DeserializeOwned>(
    page: &dyn Page,
    script: &str,
    limit: Duration,
) -> Result<T> {
    let raw = evaluate_within(page, script, limit).await?;
    let text = raw
        .as_str()
        .ok_or_else(|| anyhow!("script returned a non-string value: {raw}"))?;
    serde_json::from_str(text).context("script returned malformed JSON")
}

/// Options for launching Chrome.
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub headless: bool,
    pub window_size: (u32, u32),
    /// Explicit executable; headless_chrome searches the usual places otherwise.
    pub chrome_path: Option<PathBuf>,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            headless: true,
            window_size: (1280, 720),
            chrome_path: None,
        }
    }
}

/// Chrome launched through headless_chrome. Owns the process for the run.
pub struct ChromeBrowser {
    options: ChromeOptions,
    process: Option<ChromeProcess>,
    tab: Option<Arc<Tab>>,
}

impl ChromeBrowser {
    pub fn new(options: ChromeOptions) -> Self {
        Self {
            options,
            process: None,
            tab: None,
        }
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn start(&mut self) -> Result<Arc<dyn Page>> {
        let options = self.options.clone();
        info!(headless = options.headless, "Starting Chrome...");

        // Launching can take a while; keep it off the async workers.
        let (process, tab) = tokio::task::spawn_blocking(move || launch(&options))
            .await
            .map_err(|e| anyhow!("Browser launch panicked: {e}"))??;

        info!("Chrome ready.");
        self.process = Some(process);
        self.tab = Some(tab.clone());
        Ok(Arc::new(ChromePage { tab }))
    }

    async fn stop(&mut self) -> Result<()> {
        let tab = self.tab.take();
        let Some(process) = self.process.take() else {
            return Ok(());
        };
        info!("Stopping Chrome...");

        tokio::task::spawn_blocking(move || {
            if let Some(tab) = tab {
                if let Err(e) = tab.close(true) {
                    warn!("Failed to close tab: {e}");
                }
            }
            // Dropping the handle kills the child process.
            drop(process);
        })
        .await
        .map_err(|e| anyhow!("Browser shutdown panicked: {e}"))?;

        info!("Chrome stopped.");
        Ok(())
    }
}

fn launch(options: &ChromeOptions) -> Result<(ChromeProcess, Arc<Tab>)> {
    let launch_options = LaunchOptions {
        headless: options.headless,
        window_size: Some(options.window_size),
        path: options.chrome_path.clone(),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-features=VizDisplayCompositor"),
        ],
        idle_browser_timeout: Duration::from_secs(300),
        ..Default::default()
    };

    let process = ChromeProcess::new(launch_options)
        .map_err(|e| anyhow!("Browser launch failed: {e}"))?;

    let tab = process.new_tab()?;
    tab.navigate_to("about:blank")?;
    Ok((process, tab))
}

/// Checks that the element's center is not covered by something else.
const HIT_TEST_JS: &str = r#"
(selector) => {
  const el = document.querySelector(selector);
  if (!el) return 'detached';
  const rect = el.getBoundingClientRect();
  if (rect.width === 0 || rect.height === 0) return 'not visible';
  const top = document.elementFromPoint(rect.left + rect.width / 2, rect.top + rect.height / 2);
  if (!top) return 'not visible';
  if (top === el || el.contains(top) || top.contains(el)) return 'ok';
  return 'obscured';
}
"#;

const EDITABLE_JS: &str = r#"
(selector) => {
  const el = document.querySelector(selector);
  if (!el) return 'detached';
  const tag = el.tagName;
  const editable = el.isContentEditable || tag === 'TEXTAREA' ||
    (tag === 'INPUT' && !['button','submit','reset','checkbox','radio','file','image','hidden'].includes((el.type || '').toLowerCase()));
  if (!editable || el.readOnly || el.disabled) return 'not editable';
  if ('value' in el) el.value = '';
  return 'ok';
}
"#;

const IDLE_PROBE_JS: &str =
    "JSON.stringify([document.readyState, performance.getEntriesByType('resource').length])";

const NETWORK_QUIET: Duration = Duration::from_millis(500);
const IDLE_POLL: Duration = Duration::from_millis(100);

/// A tab of a headless_chrome browser.
pub struct ChromePage {
    tab: Arc<Tab>,
}

impl ChromePage {
    /// headless_chrome is synchronous; run each driver call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| anyhow!("browser task panicked: {e}"))?
    }
}

fn call_with_selector(tab: &Tab, function: &str, selector: &str) -> Result<String> {
    let script = format!("({function})({})", serde_json::to_string(selector)?);
    let result = tab.evaluate(&script, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

fn check_probe(verdict: &str, selector: &str) -> Result<()> {
    match verdict {
        "ok" => Ok(()),
        "detached" => bail!("element {selector} is detached from the DOM"),
        "not visible" => bail!("element {selector} is not visible"),
        "obscured" => bail!("element {selector} click intercepted: obscured by another element"),
        "not editable" => bail!("element {selector} is not editable"),
        other => bail!("unexpected probe result for {selector}: {other}"),
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()
                .with_context(|| format!("navigation timeout: {url}"))?;
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let script = script.to_string();
        self.blocking(move |tab| {
            let result = tab.evaluate(&script, false)?;
            Ok(result.value.unwrap_or(Value::Null))
        })
        .await
    }

    async fn click(&self, selector: &str, timeout: Duration) -> Result<()> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            let element = tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            check_probe(&call_with_selector(tab, HIT_TEST_JS, &selector)?, &selector)?;
            element.click()?;
            Ok(())
        })
        .await
    }

    async fn fill(&self, selector: &str, text: &str, timeout: Duration) -> Result<()> {
        let selector = selector.to_string();
        let text = text.to_string();
        self.blocking(move |tab| {
            let element = tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            check_probe(&call_with_selector(tab, EDITABLE_JS, &selector)?, &selector)?;
            element.click()?;
            element.type_into(&text)?;
            Ok(())
        })
        .await
    }

    async fn press(&self, selector: &str, key: &str, timeout: Duration) -> Result<()> {
        let selector = selector.to_string();
        let key = key.to_string();
        self.blocking(move |tab| {
            let element = tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            element.focus()?;
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<()> {
        self.blocking(move |tab| {
            let deadline = Instant::now() + timeout;
            let mut last_count = None;
            let mut quiet_since = Instant::now();

            while Instant::now() < deadline {
                let probe = tab.evaluate(IDLE_PROBE_JS, false)?;
                let raw = probe
                    .value
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                let (state, count): (String, u64) =
                    serde_json::from_str(&raw).unwrap_or_else(|_| (String::new(), 0));

                if state == "complete" && last_count == Some(count) {
                    if quiet_since.elapsed() >= NETWORK_QUIET {
                        debug!("Network idle ({count} resources)");
                        return Ok(());
                    }
                } else {
                    last_count = Some(count);
                    quiet_since = Instant::now();
                }
                std::thread::sleep(IDLE_POLL);
            }

            bail!("network idle not reached within {timeout:?}")
        })
        .await
    }

    async fn url(&self) -> Result<String> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn title(&self) -> Result<String> {
        self.blocking(|tab| tab.get_title()).await
    }
}
