//! URL normalization and fingerprinting.
//!
//! The fingerprint of the normalized URL is the sole deduplication key:
//! two submissions that normalize to the same string are the same task.
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::UrlNormalizeConfig;
use crate::core::error::{OrchestratorError, Result};

/// Normalize a URL for fingerprinting.
///
/// Rules (each toggleable): lowercase scheme and authority, drop the
/// fragment, sort query pairs by key then value, drop empty-valued
/// duplicates of keys that also appear with a value. Percent-encoding is
/// normalized by the `Url` parse/serialize round trip.
pub fn normalize_url(raw: &str, cfg: &UrlNormalizeConfig) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| OrchestratorError::Validation(format!("invalid url {:?}: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(OrchestratorError::Validation(format!(
            "unsupported scheme {:?} in {:?}",
            url.scheme(),
            raw
        )));
    }
    if url.host_str().is_none() {
        return Err(OrchestratorError::Validation(format!(
            "url without host: {:?}",
            raw
        )));
    }

    if cfg.lowercase_host {
        // Url lowercases registered domains on parse; force the rest.
        if let Some(host) = url.host_str() {
            let lower = host.to_ascii_lowercase();
            if lower != host {
                url.set_host(Some(&lower))
                    .map_err(|e| OrchestratorError::Validation(format!("bad host: {}", e)))?;
            }
        }
    }

    if cfg.strip_fragment {
        url.set_fragment(None);
    }

    if cfg.sort_query || cfg.drop_empty_params {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if cfg.drop_empty_params {
            let keys_with_value: std::collections::HashSet<String> = pairs
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, _)| k.clone())
                .collect();
            pairs.retain(|(k, v)| !v.is_empty() || !keys_with_value.contains(k));
        }

        if cfg.sort_query {
            pairs.sort();
        }

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in &pairs {
                serializer.append_pair(k, v);
            }
            let query = serializer.finish();
            url.set_query(Some(&query));
        }
    }

    Ok(url.to_string())
}

/// Fixed-width hex digest of the normalized URL string.
pub fn url_fingerprint(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Normalize then fingerprint in one step.
pub fn normalize_and_fingerprint(raw: &str, cfg: &UrlNormalizeConfig) -> Result<(String, String)> {
    let normalized = normalize_url(raw, cfg)?;
    let fp = url_fingerprint(&normalized);
    Ok((normalized, fp))
}
