//! ACME order flow.
//!
//! Wraps `instant-acme` with account persistence, bounded retries, and
//! both challenge types. DNS-01 publishes TXT records through the
//! configured provider; HTTP-01 serves key authorisations from an
//! ephemeral listener bound only while an order is in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
};
use rcgen::{Certificate, CertificateParams, DistinguishedName};
use tracing::{debug, info, warn};

use super::config::HttpsConfig;
use super::dns;
use crate::error::{Error, Result};

/// Filename of the persisted ACME account credentials.
const ACCOUNT_FILE: &str = "acme_user.json";

/// How many times the order status is polled before giving up.
const ORDER_POLL_ATTEMPTS: u32 = 10;

/// ACME client bound to one domain and one pair of output files.
pub struct AcmeClient {
    cfg: Arc<HttpsConfig>,
    certs_dir: PathBuf,
    cert_file: PathBuf,
    key_file: PathBuf,
}

impl AcmeClient {
    pub fn new(cfg: Arc<HttpsConfig>, certs_dir: &Path, cert_file: &Path, key_file: &Path) -> Self {
        Self {
            cfg,
            certs_dir: certs_dir.to_path_buf(),
            cert_file: cert_file.to_path_buf(),
            key_file: key_file.to_path_buf(),
        }
    }

    /// Obtains a certificate, retrying per the configured count and delay.
    pub async fn obtain_certificate(&self) -> Result<()> {
        let domain = &self.cfg.acme.domain;
        let retries = self.cfg.acme.retry_count.max(1);
        let delay = Duration::from_secs(self.cfg.acme.retry_delay_seconds.max(1));

        let mut last_err = String::new();
        for attempt in 1..=retries {
            match self.try_obtain().await {
                Ok(()) => {
                    info!(domain = %domain, "certificate obtained");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        domain = %domain,
                        attempt,
                        retries,
                        error = %e,
                        "certificate request failed"
                    );
                    last_err = e.to_string();
                    if attempt < retries {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::AcmeFailed {
            domain: domain.clone(),
            reason: format!("after {retries} attempts: {last_err}"),
        })
    }

    async fn try_obtain(&self) -> Result<()> {
        let domain = self.cfg.acme.domain.clone();
        let account = self.load_or_create_account().await?;

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(domain.clone())],
            })
            .await
            .map_err(|e| acme_err(&domain, format!("new order: {e}")))?;

        // Challenge phase. The HTTP-01 listener, when used, lives exactly
        // as long as this scope.
        let (challenge_server, dns_values) = self.answer_challenges(&domain, &mut order).await?;

        // Poll until the CA has validated (or rejected) the challenges.
        let mut delay = Duration::from_millis(500);
        let mut status = order.state().status;
        for _ in 0..ORDER_POLL_ATTEMPTS {
            if matches!(status, OrderStatus::Ready | OrderStatus::Invalid) {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(8));
            let state = order
                .refresh()
                .await
                .map_err(|e| acme_err(&domain, format!("refresh: {e}")))?;
            status = state.status;
        }

        if let Some(server) = challenge_server {
            server.abort();
        }
        if !dns_values.is_empty() {
            if let Ok(provider) = dns::provider_from_config(&self.cfg.acme.dns) {
                for value in &dns_values {
                    if let Err(e) = provider.cleanup(&domain, value).await {
                        warn!(error = %e, "challenge record cleanup failed");
                    }
                }
            }
        }

        if status == OrderStatus::Invalid {
            return Err(acme_err(&domain, "order became invalid".to_string()));
        }

        // CSR and finalisation.
        let mut params = CertificateParams::new(vec![domain.clone()]);
        params.distinguished_name = DistinguishedName::new();
        let cert = Certificate::from_params(params)
            .map_err(|e| acme_err(&domain, format!("csr generation: {e}")))?;
        let csr = cert
            .serialize_request_der()
            .map_err(|e| acme_err(&domain, format!("csr serialisation: {e}")))?;

        order
            .finalize(&csr)
            .await
            .map_err(|e| acme_err(&domain, format!("finalize: {e}")))?;

        let mut delay = Duration::from_millis(500);
        let chain_pem = loop {
            match order
                .certificate()
                .await
                .map_err(|e| acme_err(&domain, format!("download: {e}")))?
            {
                Some(chain) => break chain,
                None => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(8));
                }
            }
        };

        self.save_certificate(&chain_pem, &cert.serialize_private_key_pem())?;
        Ok(())
    }

    /// Answers every pending authorization using the configured challenge.
    /// Returns the ephemeral HTTP-01 listener handle, when one was needed,
    /// and the published DNS values awaiting cleanup.
    async fn answer_challenges(
        &self,
        domain: &str,
        order: &mut instant_acme::Order,
    ) -> Result<(Option<tokio::task::JoinHandle<()>>, Vec<String>)> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| acme_err(domain, format!("authorizations: {e}")))?;

        let challenge_type = match self.cfg.acme.challenge.as_str() {
            "http-01" => ChallengeType::Http01,
            "dns-01" => ChallengeType::Dns01,
            other => {
                return Err(Error::Config(format!("unknown challenge type: {other}")));
            }
        };

        let mut server = None;
        let mut dns_values = Vec::new();
        let tokens: Arc<RwLock<HashMap<String, String>>> = Arc::new(RwLock::new(HashMap::new()));

        for authz in &authorizations {
            if !matches!(authz.status, instant_acme::AuthorizationStatus::Pending) {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == challenge_type)
                .ok_or_else(|| {
                    acme_err(domain, format!("no {challenge_type:?} challenge offered"))
                })?;
            let key_auth = order.key_authorization(challenge);

            match challenge_type {
                ChallengeType::Dns01 => {
                    let provider = dns::provider_from_config(&self.cfg.acme.dns)?;
                    let value = key_auth.dns_value();
                    provider.present(domain, &value).await?;
                    dns_values.push(value);
                }
                ChallengeType::Http01 => {
                    tokens
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(challenge.token.clone(), key_auth.as_str().to_string());
                    if server.is_none() {
                        server = Some(
                            spawn_challenge_listener(self.cfg.acme.http.port, Arc::clone(&tokens))
                                .await?,
                        );
                    }
                }
                _ => unreachable!("challenge type fixed above"),
            }

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| acme_err(domain, format!("challenge ready: {e}")))?;
            debug!(domain, "challenge submitted");
        }

        Ok((server, dns_values))
    }

    /// Loads persisted account credentials, or registers a new account
    /// and persists them.
    async fn load_or_create_account(&self) -> Result<Account> {
        let path = self.certs_dir.join(ACCOUNT_FILE);
        let directory = self.cfg.directory_url().to_string();

        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(creds) = serde_json::from_slice::<AccountCredentials>(&bytes) {
                if let Ok(account) = Account::from_credentials(creds).await {
                    debug!("loaded existing ACME account");
                    return Ok(account);
                }
            }
            warn!(file = %path.display(), "stored ACME account unusable, recreating");
        }

        let contact = if self.cfg.acme.email.is_empty() {
            Vec::new()
        } else {
            vec![format!("mailto:{}", self.cfg.acme.email)]
        };
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &directory,
            None,
        )
        .await
        .map_err(|e| acme_err(&self.cfg.acme.domain, format!("account creation: {e}")))?;

        std::fs::create_dir_all(&self.certs_dir)?;
        std::fs::write(&path, serde_json::to_vec_pretty(&credentials)?)?;
        restrict_permissions(&path);
        info!("registered new ACME account");
        Ok(account)
    }

    fn save_certificate(&self, chain_pem: &str, key_pem: &str) -> Result<()> {
        std::fs::create_dir_all(&self.certs_dir)?;
        std::fs::write(&self.cert_file, chain_pem)?;
        std::fs::write(&self.key_file, key_pem)?;
        restrict_permissions(&self.key_file);
        info!(cert = %self.cert_file.display(), "certificate saved");
        Ok(())
    }
}

/// Serves `/.well-known/acme-challenge/<token>` for the order's lifetime.
async fn spawn_challenge_listener(
    port: u16,
    tokens: Arc<RwLock<HashMap<String, String>>>,
) -> Result<tokio::task::JoinHandle<()>> {
    use axum::extract::Path as AxumPath;
    use axum::http::StatusCode;
    use axum::routing::get;

    let app = axum::Router::new().route(
        "/.well-known/acme-challenge/:token",
        get(move |AxumPath(token): AxumPath<String>| {
            let tokens = Arc::clone(&tokens);
            async move {
                let answer = tokens
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&token)
                    .cloned();
                match answer {
                    Some(body) => (StatusCode::OK, body),
                    None => (StatusCode::NOT_FOUND, String::new()),
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Config(format!("cannot bind HTTP-01 port {port}: {e}")))?;
    info!(port, "HTTP-01 challenge listener up");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "challenge listener error");
        }
    }))
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn acme_err(domain: &str, reason: String) -> Error {
    Error::AcmeFailed {
        domain: domain.to_string(),
        reason,
    }
}
