use harvester_core::{Config, Paths};
use serde_json::Value;

/// Show the current configuration as pretty-printed JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    println!();
    println!("📋 Current Configuration");
    println!("  File: {}", paths.config_file().display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Print a single config value addressed as `section.field`.
pub async fn get(key: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let (section, field) = split_key(key)?;

    let json = serde_json::to_value(&config)?;
    let Some(value) = json.get(&section).and_then(|s| s.get(&field)) else {
        eprintln!("Key '{key}' not found in config.");
        std::process::exit(1);
    };
    match value.as_str() {
        Some(text) => println!("{text}"),
        None => println!("{value}"),
    }
    Ok(())
}

/// Write a single config value addressed as `section.field`. The value is
/// taken as JSON when it parses, as a bare string otherwise.
pub async fn set(key: &str, value: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let (section, field) = split_key(key)?;

    let parsed: Value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));

    let mut json = serde_json::to_value(&config)?;
    let slot = json
        .get_mut(&section)
        .and_then(|s| s.get_mut(&field))
        .ok_or_else(|| anyhow::anyhow!("unknown config key '{key}'"))?;
    *slot = parsed.clone();

    // Round-trip through the typed config so a bad type fails here
    // instead of at the next start.
    let updated: Config = serde_json::from_value(json)?;
    updated.save(&paths.config_file())?;

    match parsed.as_str() {
        Some(text) => println!("✓ Set {key} = {text}"),
        None => println!("✓ Set {key} = {parsed}"),
    }
    Ok(())
}

/// Set the backend channel endpoint, prompting when no value is given.
pub async fn endpoint(value: Option<&str>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;

    let endpoint = match value {
        Some(v) => v.to_string(),
        None => {
            print!("Channel endpoint [{}]: ", config.channel.endpoint);
            use std::io::Write;
            std::io::stdout().flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;
            let trimmed = input.trim();
            if trimmed.is_empty() {
                println!("Unchanged: {}", config.channel.endpoint);
                return Ok(());
            }
            trimmed.to_string()
        }
    };

    let parsed = url::Url::parse(&endpoint)?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        anyhow::bail!("endpoint scheme must be ws or wss, got '{}'", parsed.scheme());
    }

    config.channel.endpoint = endpoint;
    config.save(&paths.config_file())?;
    println!(
        "✓ Set channel.endpoint = {} (note: a running agent must be restarted to reconnect)",
        config.channel.endpoint
    );
    Ok(())
}

/// Config keys are exactly two levels deep, `section.field`, with fields
/// accepted in either snake_case or camelCase spelling.
fn split_key(key: &str) -> anyhow::Result<(String, String)> {
    match key.split_once('.') {
        Some((section, field))
            if !section.is_empty() && !field.is_empty() && !field.contains('.') =>
        {
            Ok((section.to_string(), camel_case(field)))
        }
        _ => anyhow::bail!("config keys look like section.field, e.g. channel.endpoint"),
    }
}

/// Field names are stored camelCase on disk; fold snake_case spellings in.
fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper_next = false;
    for ch in field.chars() {
        match ch {
            '_' => upper_next = true,
            ch if upper_next => {
                out.push(ch.to_ascii_uppercase());
                upper_next = false;
            }
            ch => out.push(ch),
        }
    }
    out
}
