use std::path::PathBuf;
use std::time::Duration;

use harvester_browser::chrome::parse_cookie_file;
use harvester_browser::find_browser_binary;
use harvester_core::{Config, Paths};
use harvester_storage::FlagStore;

/// Run full environment diagnostics.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!();
    println!("🩺 harvester doctor — Environment Diagnostics");
    println!("================================");
    println!();

    let mut ok_count = 0u32;
    let mut warn_count = 0u32;
    let mut err_count = 0u32;

    // --- 1. Config ---
    println!("📋 Configuration");
    let config_exists = paths.config_file().exists();
    if config_exists {
        print_ok("Config file exists", &paths.config_file().display().to_string());
        ok_count += 1;
    } else {
        print_warn("Config file not found", "Defaults in effect; `harvester config endpoint` writes one");
        warn_count += 1;
    }

    let config = Config::load_or_default(&paths)?;

    match url::Url::parse(&config.channel.endpoint) {
        Ok(parsed) if parsed.scheme() == "ws" || parsed.scheme() == "wss" => {
            print_ok("Channel endpoint", &config.channel.endpoint);
            ok_count += 1;

            match endpoint_reachable(&parsed).await {
                Ok(addr) => {
                    print_ok("Backend reachable", &addr);
                    ok_count += 1;
                }
                Err(e) => {
                    print_warn("Backend not reachable", &e);
                    warn_count += 1;
                }
            }
        }
        Ok(parsed) => {
            print_err(
                &format!("Endpoint scheme must be ws or wss, got '{}'", parsed.scheme()),
                "The channel client refuses to start with this endpoint",
            );
            err_count += 1;
        }
        Err(e) => {
            print_err("Endpoint is not a valid URL", &e.to_string());
            err_count += 1;
        }
    }
    println!();

    // --- 2. State ---
    println!("📁 State");
    let state = paths.state_dir();
    if state.exists() {
        print_ok("State directory exists", &state.display().to_string());
        ok_count += 1;

        // Check writable
        let test_file = state.join(".doctor_test");
        match std::fs::write(&test_file, "test") {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_file);
                print_ok("State directory writable", "");
                ok_count += 1;
            }
            Err(e) => {
                print_err("State directory not writable", &e.to_string());
                err_count += 1;
            }
        }
    } else {
        print_warn("State directory not found", "Created on first run");
        warn_count += 1;
    }

    let flags = FlagStore::new(paths.flags_file());
    if flags.resume_pending() {
        print_warn("Resume marker set", "A refresh fires shortly after the next start");
        warn_count += 1;
    } else {
        print_ok("No resume marker", "");
        ok_count += 1;
    }
    println!();

    // --- 3. Browser ---
    println!("🌐 Browser");
    match find_browser_binary(config.browser.binary.as_deref()) {
        Ok(binary) => {
            print_ok("Browser binary", &binary.display().to_string());
            ok_count += 1;
        }
        Err(e) => {
            print_err("Browser binary not found", &e.to_string());
            err_count += 1;
        }
    }

    let cookie_file = config
        .browser
        .cookies_file
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.cookies_file());
    if cookie_file.exists() {
        match std::fs::read_to_string(&cookie_file) {
            Ok(contents) => match parse_cookie_file(&contents) {
                Ok(cookies) => {
                    print_ok(
                        &format!("{} cookies on file", cookies.len()),
                        &cookie_file.display().to_string(),
                    );
                    ok_count += 1;
                }
                Err(e) => {
                    print_err("Cookie file does not parse", &e.to_string());
                    err_count += 1;
                }
            },
            Err(e) => {
                print_err("Cookie file unreadable", &e.to_string());
                err_count += 1;
            }
        }
    } else {
        print_warn("No cookie file", "The session must be signed in inside the launched browser");
        warn_count += 1;
    }
    println!();

    // --- Summary ---
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "  ✅ {} passed  ⚠️  {} warnings  ❌ {} errors",
        ok_count, warn_count, err_count
    );

    if err_count > 0 {
        println!();
        println!("  {} error(s) must be fixed before normal use.", err_count);
    } else if warn_count > 0 {
        println!();
        println!("  Core features OK. Some optional features not ready.");
    } else {
        println!();
        println!("  🎉 All good!");
    }
    println!();

    Ok(())
}

/// Best-effort TCP probe of the backend host:port.
async fn endpoint_reachable(endpoint: &url::Url) -> Result<String, String> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| "endpoint has no host".to_string())?;
    let port = endpoint
        .port_or_known_default()
        .ok_or_else(|| "endpoint has no port".to_string())?;
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(
        Duration::from_secs(3),
        tokio::net::TcpStream::connect(&addr),
    )
    .await
    {
        Ok(Ok(_)) => Ok(addr),
        Ok(Err(e)) => Err(format!("{addr}: {e}")),
        Err(_) => Err(format!("{addr}: connect timed out")),
    }
}

fn print_ok(label: &str, detail: &str) {
    if detail.is_empty() {
        println!("  ✅ {}", label);
    } else {
        println!("  ✅ {} — {}", label, detail);
    }
}

fn print_warn(label: &str, hint: &str) {
    if hint.is_empty() {
        println!("  ⚠️  {}", label);
    } else {
        println!("  ⚠️  {} — {}", label, hint);
    }
}

fn print_err(label: &str, hint: &str) {
    if hint.is_empty() {
        println!("  ❌ {}", label);
    } else {
        println!("  ❌ {} — {}", label, hint);
    }
}
