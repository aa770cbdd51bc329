//! `turnstile doctor`: diagnose configuration and backend health.

use std::path::Path;

use turnstile_config::{AppConfig, redact_url};

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 Turnstile Doctor: System Diagnostics");
    println!("========================================\n");

    let mut issues = 0;

    let config = match AppConfig::load(config_path) {
        Ok(config) => {
            println!("  ✅ Configuration valid");
            config
        }
        Err(e) => {
            println!("  ❌ Configuration invalid: {e}");
            println!("\n  ⚠️  Fix the configuration before running further checks.");
            return Ok(());
        }
    };

    // Store
    match config.store_url.as_deref() {
        Some(url) => match turnstile_store::connect(url).await {
            Ok(store) => match store.health_check().await {
                Ok(true) => println!("  ✅ Session store reachable ({})", store.name()),
                Ok(false) => {
                    println!("  ❌ Session store unhealthy ({})", redact_url(url));
                    issues += 1;
                }
                Err(e) => {
                    println!("  ❌ Session store check failed: {e}");
                    issues += 1;
                }
            },
            Err(e) => {
                println!("  ❌ Cannot open session store {}: {e}", redact_url(url));
                issues += 1;
            }
        },
        None => {
            println!("  ⚠️  No store URL. Set TURNSTILE_STORE_URL, DATABASE_URL or MONGODB_URL");
            issues += 1;
        }
    }

    // Provider
    match turnstile_providers::build_provider(&config) {
        Ok(provider) => {
            match provider.health_check().await {
                Ok(true) => println!("  ✅ Provider reachable ({})", provider.name()),
                Ok(false) => {
                    println!("  ❌ Provider unreachable ({})", config.provider.base_url);
                    issues += 1;
                }
                Err(e) => {
                    println!("  ❌ Provider check failed: {e}");
                    issues += 1;
                }
            }

            let model = &config.generation.default_model;
            match provider.list_models().await.map(|models| model_listed(&models, model)) {
                Ok(Some(true)) => println!("  ✅ Provider serves {model}"),
                Ok(Some(false)) => {
                    println!("  ❌ Provider does not list {model}");
                    issues += 1;
                }
                Ok(None) => println!("  ⚠️  Provider did not list its models; {model} unchecked"),
                Err(e) => println!("  ⚠️  Could not list provider models: {e}"),
            }
        }
        Err(e) => {
            println!("  ⚠️  {e}. Set OPENAI_API_KEY or TURNSTILE_API_KEY");
            issues += 1;
        }
    }

    if config.generation.is_model_allowed(&config.generation.default_model) {
        println!("  ✅ Default model {} is allowed", config.generation.default_model);
    } else {
        println!(
            "  ❌ Default model {} is not in allowed_models",
            config.generation.default_model
        );
        issues += 1;
    }

    // Summary
    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}

/// Whether a provider's model listing includes `model`.
///
/// `None` when the listing is empty: some compatible servers do not
/// implement it, which says nothing about the model.
fn model_listed(models: &[String], model: &str) -> Option<bool> {
    if models.is_empty() {
        None
    } else {
        Some(models.iter().any(|m| m == model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listed_model_is_confirmed() {
        let models = vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()];
        assert_eq!(model_listed(&models, "gpt-4o-mini"), Some(true));
        assert_eq!(model_listed(&models, "gpt-3.5-turbo"), Some(false));
    }

    #[test]
    fn empty_listing_is_inconclusive() {
        assert_eq!(model_listed(&[], "gpt-4o-mini"), None);
    }
}
