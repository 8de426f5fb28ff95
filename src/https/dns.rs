//! DNS-01 challenge providers.
//!
//! A provider is the narrow capability the ACME client needs: publish a
//! TXT record proving domain control, then clean it up. The factory
//! builds one from the configured provider name and credentials map.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::config::DnsChallenge;
use crate::error::{Error, Result};

/// TXT record label prefix mandated by the DNS-01 challenge.
const CHALLENGE_LABEL: &str = "_acme-challenge";

/// Publishes and removes DNS-01 TXT records.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Publishes `value` as a TXT record at `_acme-challenge.<domain>`.
    async fn present(&self, domain: &str, value: &str) -> Result<()>;

    /// Removes the record published by `present`.
    async fn cleanup(&self, domain: &str, value: &str) -> Result<()>;
}

/// Builds the configured provider.
pub fn provider_from_config(cfg: &DnsChallenge) -> Result<Box<dyn DnsProvider>> {
    match cfg.provider.as_str() {
        "cloudflare" => Ok(Box::new(Cloudflare::from_credentials(cfg)?)),
        "dnspod" | "tencentcloud" | "tencent" => Ok(Box::new(Dnspod::from_credentials(cfg)?)),
        other => Err(Error::DnsProviderUnavailable {
            provider: other.to_string(),
            reason: "supported providers: cloudflare, dnspod".to_string(),
        }),
    }
}

/// Picks the first non-empty credential among several accepted key names.
fn credential(cfg: &DnsChallenge, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| cfg.credentials.get(*k).filter(|v| !v.is_empty()).cloned())
}

// =============================================================================
// Cloudflare
// =============================================================================

/// Cloudflare DNS over the v4 REST API, authenticated by API token.
pub struct Cloudflare {
    token: String,
    client: reqwest::Client,
    api_base: String,
}

impl Cloudflare {
    fn from_credentials(cfg: &DnsChallenge) -> Result<Self> {
        let token = credential(cfg, &["api_token", "apitoken"]).ok_or_else(|| {
            Error::DnsProviderUnavailable {
                provider: "cloudflare".to_string(),
                reason: "api_token credential required".to_string(),
            }
        })?;
        Ok(Self {
            token,
            client: reqwest::Client::new(),
            api_base: "https://api.cloudflare.com/client/v4".to_string(),
        })
    }

    /// Finds the zone id by probing domain suffixes, longest first.
    async fn zone_id(&self, domain: &str) -> Result<String> {
        let labels: Vec<&str> = domain.split('.').collect();
        for start in 0..labels.len().saturating_sub(1) {
            let candidate = labels[start..].join(".");
            let resp: serde_json::Value = self
                .client
                .get(format!("{}/zones", self.api_base))
                .query(&[("name", candidate.as_str())])
                .bearer_auth(&self.token)
                .send()
                .await?
                .json()
                .await?;
            if let Some(id) = resp["result"][0]["id"].as_str() {
                debug!(zone = %candidate, id, "resolved cloudflare zone");
                return Ok(id.to_string());
            }
        }
        Err(Error::DnsProviderUnavailable {
            provider: "cloudflare".to_string(),
            reason: format!("no zone found for {domain}"),
        })
    }
}

#[async_trait]
impl DnsProvider for Cloudflare {
    async fn present(&self, domain: &str, value: &str) -> Result<()> {
        let zone = self.zone_id(domain).await?;
        let record_name = format!("{CHALLENGE_LABEL}.{domain}");
        let resp: serde_json::Value = self
            .client
            .post(format!("{}/zones/{zone}/dns_records", self.api_base))
            .bearer_auth(&self.token)
            .json(&json!({
                "type": "TXT",
                "name": record_name,
                "content": value,
                "ttl": 120,
            }))
            .send()
            .await?
            .json()
            .await?;
        if !resp["success"].as_bool().unwrap_or(false) {
            return Err(Error::DnsProviderUnavailable {
                provider: "cloudflare".to_string(),
                reason: format!("record create rejected: {}", resp["errors"]),
            });
        }
        info!(record = %record_name, "published challenge record");
        Ok(())
    }

    async fn cleanup(&self, domain: &str, value: &str) -> Result<()> {
        let zone = self.zone_id(domain).await?;
        let record_name = format!("{CHALLENGE_LABEL}.{domain}");
        let resp: serde_json::Value = self
            .client
            .get(format!("{}/zones/{zone}/dns_records", self.api_base))
            .query(&[("type", "TXT"), ("name", record_name.as_str()), ("content", value)])
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;
        if let Some(records) = resp["result"].as_array() {
            for record in records {
                if let Some(id) = record["id"].as_str() {
                    let _ = self
                        .client
                        .delete(format!("{}/zones/{zone}/dns_records/{id}", self.api_base))
                        .bearer_auth(&self.token)
                        .send()
                        .await;
                }
            }
        }
        debug!(record = %record_name, "cleaned up challenge record");
        Ok(())
    }
}

// =============================================================================
// DNSPod
// =============================================================================

/// DNSPod over the legacy token API (`id,token` login token).
pub struct Dnspod {
    login_token: String,
    client: reqwest::Client,
    api_base: String,
}

impl Dnspod {
    fn from_credentials(cfg: &DnsChallenge) -> Result<Self> {
        let id = credential(cfg, &["secret_id", "secretid", "dnspod_id"]);
        let key = credential(cfg, &["secret_key", "secretkey", "dnspod_token"]);
        let (Some(id), Some(key)) = (id, key) else {
            return Err(Error::DnsProviderUnavailable {
                provider: "dnspod".to_string(),
                reason: "secret_id and secret_key (or dnspod_id and dnspod_token) required"
                    .to_string(),
            });
        };
        Ok(Self {
            login_token: format!("{id},{key}"),
            client: reqwest::Client::new(),
            api_base: "https://dnsapi.cn".to_string(),
        })
    }

    /// Splits an FQDN into the registrable domain and the challenge
    /// sub-domain label. `pots.example.com` → (`example.com`,
    /// `_acme-challenge.pots`).
    fn split(domain: &str) -> (String, String) {
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() <= 2 {
            return (domain.to_string(), CHALLENGE_LABEL.to_string());
        }
        let apex = labels[labels.len() - 2..].join(".");
        let sub = labels[..labels.len() - 2].join(".");
        (apex, format!("{CHALLENGE_LABEL}.{sub}"))
    }

    async fn call(&self, action: &str, form: &[(&str, &str)]) -> Result<serde_json::Value> {
        let mut params = vec![("login_token", self.login_token.as_str()), ("format", "json")];
        params.extend_from_slice(form);
        let resp: serde_json::Value = self
            .client
            .post(format!("{}/{action}", self.api_base))
            .form(&params)
            .send()
            .await?
            .json()
            .await?;
        let code = resp["status"]["code"].as_str().unwrap_or("");
        if code != "1" {
            return Err(Error::DnsProviderUnavailable {
                provider: "dnspod".to_string(),
                reason: format!("{action} rejected: {}", resp["status"]["message"]),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl DnsProvider for Dnspod {
    async fn present(&self, domain: &str, value: &str) -> Result<()> {
        let (apex, sub) = Self::split(domain);
        self.call(
            "Record.Create",
            &[
                ("domain", apex.as_str()),
                ("sub_domain", sub.as_str()),
                ("record_type", "TXT"),
                ("record_line_id", "0"),
                ("value", value),
            ],
        )
        .await?;
        info!(record = %format!("{sub}.{apex}"), "published challenge record");
        Ok(())
    }

    async fn cleanup(&self, domain: &str, value: &str) -> Result<()> {
        let (apex, sub) = Self::split(domain);
        let listing = self
            .call(
                "Record.List",
                &[
                    ("domain", apex.as_str()),
                    ("sub_domain", sub.as_str()),
                    ("record_type", "TXT"),
                ],
            )
            .await?;
        if let Some(records) = listing["records"].as_array() {
            for record in records {
                if record["value"].as_str() == Some(value) {
                    if let Some(id) = record["id"].as_str() {
                        let _ = self
                            .call(
                                "Record.Remove",
                                &[("domain", apex.as_str()), ("record_id", id)],
                            )
                            .await;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn factory_rejects_unknown_provider() {
        let cfg = DnsChallenge {
            provider: "route53".to_string(),
            credentials: HashMap::new(),
        };
        assert!(matches!(
            provider_from_config(&cfg),
            Err(Error::DnsProviderUnavailable { .. })
        ));
    }

    #[test]
    fn factory_requires_credentials() {
        let cfg = DnsChallenge {
            provider: "cloudflare".to_string(),
            credentials: HashMap::new(),
        };
        assert!(provider_from_config(&cfg).is_err());

        let mut creds = HashMap::new();
        creds.insert("api_token".to_string(), "tok".to_string());
        let cfg = DnsChallenge {
            provider: "cloudflare".to_string(),
            credentials: creds,
        };
        assert!(provider_from_config(&cfg).is_ok());
    }

    #[test]
    fn dnspod_accepts_alternate_credential_names() {
        let mut creds = HashMap::new();
        creds.insert("dnspod_id".to_string(), "1".to_string());
        creds.insert("dnspod_token".to_string(), "t".to_string());
        let cfg = DnsChallenge {
            provider: "dnspod".to_string(),
            credentials: creds,
        };
        assert!(provider_from_config(&cfg).is_ok());
    }

    #[test]
    fn dnspod_split_builds_challenge_label() {
        assert_eq!(
            Dnspod::split("pots.example.com"),
            ("example.com".to_string(), "_acme-challenge.pots".to_string())
        );
        assert_eq!(
            Dnspod::split("example.com"),
            ("example.com".to_string(), "_acme-challenge".to_string())
        );
    }
}
