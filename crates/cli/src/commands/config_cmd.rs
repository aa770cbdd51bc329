//! `turnstile config`: inspect the effective configuration.

use std::path::Path;

use turnstile_config::AppConfig;

pub fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    let config = match AppConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    match config.require_serving() {
        Ok(()) => println!("   ✅ Ready to serve"),
        Err(e) => println!("   ⚠️  {e}"),
    }

    println!();
    println!("   Provider:  {}", config.provider.name);
    println!("   Model:     {}", config.generation.default_model);
    println!("   Gateway:   {}:{}", config.gateway.host, config.gateway.port);
    println!("   Timeout:   {}s", config.generation.timeout_secs);

    Ok(())
}

pub fn show(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config =
        AppConfig::load(config_path).map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", config.redacted_toml());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn validate_accepts_file_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gateway]\nport = 8100").unwrap();
        assert!(validate(Some(file.path())).is_ok());
    }

    #[test]
    fn validate_reports_broken_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gateway\nport = ").unwrap();
        assert!(validate(Some(file.path())).is_err());
    }
}
