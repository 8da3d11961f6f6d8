//! Browser process lifecycle: locate a Chromium binary, launch it with a
//! dedicated profile, discover its DevTools endpoints and attach clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use harvester_core::{config::BrowserConfig, Error, Paths, Result};

use crate::cdp::CdpClient;

const BINARY_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

const BINARY_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/opt/google/chrome/chrome",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// Locate a Chromium-family binary. An explicitly configured path wins;
/// otherwise try well-known install locations, then a PATH lookup.
pub fn find_browser_binary(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(Error::Browser(format!(
            "configured browser binary not found: {}",
            path.display()
        )));
    }
    for path in BINARY_PATHS {
        let path = Path::new(path);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
    }
    for name in BINARY_CANDIDATES {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    Err(Error::Browser(
        "no Chrome or Chromium binary found; set browser.binary in the config".into(),
    ))
}

/// A cookie as persisted by an exported browsing session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

/// Map the sameSite spellings found in cookie exports onto the DevTools
/// enum. Unknown or unspecified values are omitted rather than guessed.
pub fn normalize_same_site(raw: &str) -> Option<&'static str> {
    match raw.to_ascii_lowercase().as_str() {
        "strict" => Some("Strict"),
        "lax" => Some("Lax"),
        "none" | "no_restriction" => Some("None"),
        _ => None,
    }
}

/// Build `Network.setCookie` params from a stored cookie. Returns `None`
/// when the cookie carries neither a domain nor a URL to scope it to.
pub fn cookie_params(cookie: &StoredCookie) -> Option<Value> {
    if cookie.domain.is_none() && cookie.url.is_none() {
        return None;
    }
    let mut params = json!({
        "name": cookie.name,
        "value": cookie.value,
        "httpOnly": cookie.http_only,
        "secure": cookie.secure,
    });
    if let Some(domain) = &cookie.domain {
        params["domain"] = json!(domain);
    }
    if let Some(url) = &cookie.url {
        params["url"] = json!(url);
    }
    params["path"] = json!(cookie.path.as_deref().unwrap_or("/"));
    // Session cookies are exported with a non-positive expiry; leave those
    // without an expiration so the browser treats them the same way.
    if let Some(expires) = cookie.expires {
        if expires > 0.0 {
            params["expires"] = json!(expires);
        }
    }
    if let Some(same_site) = cookie.same_site.as_deref().and_then(normalize_same_site) {
        params["sameSite"] = json!(same_site);
    }
    Some(params)
}

/// Accepts either a bare cookie array or a storage-state object with a
/// `cookies` field.
pub fn parse_cookie_file(contents: &str) -> Result<Vec<StoredCookie>> {
    let value: Value = serde_json::from_str(contents)?;
    let array = match value {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => map
            .remove("cookies")
            .ok_or_else(|| Error::Browser("cookie file has no cookies field".into()))?,
        _ => return Err(Error::Browser("cookie file is not a cookie list".into())),
    };
    Ok(serde_json::from_value(array)?)
}

/// A launched browser with DevTools clients attached at both the browser
/// and the initial page target.
pub struct BrowserSession {
    child: Child,
    browser: Arc<CdpClient>,
    page: Arc<CdpClient>,
    user_agent: String,
    devtools_port: u16,
}

impl BrowserSession {
    /// Launch the browser with a dedicated profile and attach to it. The
    /// initial tab stays on about:blank; cookies are imported before any
    /// navigation so the first page load already carries the session.
    pub async fn launch(config: &BrowserConfig, paths: &Paths) -> Result<Self> {
        let binary = find_browser_binary(config.binary.as_deref())?;
        let profile = paths.profile_dir();
        tokio::fs::create_dir_all(&profile).await?;

        // A marker left by a previous run would report a dead port.
        let marker = profile.join("DevToolsActivePort");
        let _ = tokio::fs::remove_file(&marker).await;

        let mut command = Command::new(&binary);
        command
            .kill_on_drop(true)
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", profile.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--disable-renderer-backgrounding")
            .arg("--window-size=1280,900");
        if config.headless {
            command.arg("--headless=new");
        }
        command.arg("about:blank");
        info!(binary = %binary.display(), headless = config.headless, "launching browser");
        let child = command
            .spawn()
            .map_err(|e| Error::Browser(format!("spawn {}: {e}", binary.display())))?;

        let port = wait_for_devtools_port(&marker).await?;
        debug!(port, "devtools endpoint up");

        let browser_ws = fetch_browser_ws_url(port).await?;
        let browser = Arc::new(CdpClient::connect(&browser_ws).await?);
        let user_agent = browser.browser_user_agent().await?;

        let page_ws = find_page_ws_url(port).await?;
        let page = Arc::new(CdpClient::connect(&page_ws).await?);
        page.enable_domain("Page").await?;
        page.enable_domain("Runtime").await?;
        page.enable_domain("Network").await?;

        let session = Self {
            child,
            browser,
            page,
            user_agent,
            devtools_port: port,
        };

        let cookie_file = config
            .cookies_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.cookies_file());
        if cookie_file.is_file() {
            session.import_cookies(&cookie_file).await?;
        } else {
            debug!(path = %cookie_file.display(), "no cookie file, starting cold");
        }

        Ok(session)
    }

    pub fn page(&self) -> Arc<CdpClient> {
        self.page.clone()
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn devtools_port(&self) -> u16 {
        self.devtools_port
    }

    /// Import cookies from an exported session file, one at a time so a
    /// single rejected cookie cannot poison the rest.
    async fn import_cookies(&self, path: &Path) -> Result<()> {
        let contents = tokio::fs::read_to_string(path).await?;
        let cookies = parse_cookie_file(&contents)?;
        let total = cookies.len();
        let mut imported = 0usize;
        for cookie in &cookies {
            let Some(params) = cookie_params(cookie) else {
                debug!(name = %cookie.name, "skipping cookie without domain or url");
                continue;
            };
            match self.page.set_cookie(params).await {
                Ok(true) => imported += 1,
                Ok(false) => debug!(name = %cookie.name, "browser rejected cookie"),
                Err(err) => debug!(name = %cookie.name, "cookie import failed: {err}"),
            }
        }
        info!(imported, total, "session cookies imported");
        Ok(())
    }

    /// Navigate the page and wait for its load event.
    pub async fn navigate_and_wait(&self, url: &str, wait: Duration) -> Result<()> {
        let mut loaded = self.page.subscribe("Page.loadEventFired").await;
        self.page.navigate(url).await?;
        match timeout(wait, loaded.recv()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::Browser("page connection closed during load".into())),
            Err(_) => Err(Error::Timeout(format!(
                "page load exceeded {}s",
                wait.as_secs()
            ))),
        }
    }

    /// Close the browser, escalating to a kill if it ignores the request.
    pub async fn shutdown(mut self) {
        self.browser.close_browser().await;
        match timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "browser exited"),
            Ok(Err(err)) => warn!("browser wait failed: {err}"),
            Err(_) => {
                warn!("browser ignored close, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

async fn wait_for_devtools_port(marker: &Path) -> Result<u16> {
    for _ in 0..100 {
        if let Ok(contents) = tokio::fs::read_to_string(marker).await {
            if let Some(port) = contents
                .lines()
                .next()
                .and_then(|line| line.trim().parse::<u16>().ok())
            {
                return Ok(port);
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    Err(Error::Browser(
        "devtools endpoint never came up; is the profile locked by another instance?".into(),
    ))
}

async fn fetch_browser_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{port}/json/version");
    let mut last_err = String::from("no response");
    for _ in 0..50 {
        match reqwest::get(&url).await {
            Ok(response) => match response.json::<Value>().await {
                Ok(version) => {
                    if let Some(ws) = version
                        .get("webSocketDebuggerUrl")
                        .and_then(Value::as_str)
                    {
                        return Ok(ws.to_string());
                    }
                    last_err = "version endpoint had no webSocketDebuggerUrl".into();
                }
                Err(err) => last_err = err.to_string(),
            },
            Err(err) => last_err = err.to_string(),
        }
        sleep(Duration::from_millis(200)).await;
    }
    Err(Error::Browser(format!("devtools version endpoint: {last_err}")))
}

async fn find_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{port}/json/list");
    for _ in 0..50 {
        if let Ok(response) = reqwest::get(&url).await {
            if let Ok(targets) = response.json::<Vec<Value>>().await {
                for target in &targets {
                    let kind = target.get("type").and_then(Value::as_str);
                    let page_url = target.get("url").and_then(Value::as_str).unwrap_or("");
                    if kind == Some("page") && !page_url.starts_with("devtools://") {
                        if let Some(ws) = target
                            .get("webSocketDebuggerUrl")
                            .and_then(Value::as_str)
                        {
                            return Ok(ws.to_string());
                        }
                    }
                }
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    Err(Error::Browser("no attachable page target found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_site_spellings_normalize() {
        assert_eq!(normalize_same_site("Strict"), Some("Strict"));
        assert_eq!(normalize_same_site("lax"), Some("Lax"));
        assert_eq!(normalize_same_site("None"), Some("None"));
        assert_eq!(normalize_same_site("no_restriction"), Some("None"));
        assert_eq!(normalize_same_site("unspecified"), None);
        assert_eq!(normalize_same_site(""), None);
    }

    #[test]
    fn cookie_without_scope_is_skipped() {
        let cookie = StoredCookie {
            name: "sid".into(),
            value: "abc".into(),
            domain: None,
            path: None,
            url: None,
            expires: None,
            http_only: false,
            secure: false,
            same_site: None,
        };
        assert!(cookie_params(&cookie).is_none());
    }

    #[test]
    fn session_cookie_expiry_is_dropped() {
        let cookie = StoredCookie {
            name: "sid".into(),
            value: "abc".into(),
            domain: Some(".example.com".into()),
            path: Some("/".into()),
            url: None,
            expires: Some(-1.0),
            http_only: true,
            secure: true,
            same_site: Some("no_restriction".into()),
        };
        let params = cookie_params(&cookie).unwrap();
        assert!(params.get("expires").is_none());
        assert_eq!(params["domain"], ".example.com");
        assert_eq!(params["sameSite"], "None");
        assert_eq!(params["httpOnly"], true);
    }

    #[test]
    fn cookie_file_accepts_both_shapes() {
        let bare = r#"[{"name":"a","value":"1","domain":"x.com"}]"#;
        let wrapped = r#"{"cookies":[{"name":"a","value":"1","domain":"x.com"}],"origins":[]}"#;
        assert_eq!(parse_cookie_file(bare).unwrap().len(), 1);
        assert_eq!(parse_cookie_file(wrapped).unwrap().len(), 1);
        assert!(parse_cookie_file("42").is_err());
    }
}
