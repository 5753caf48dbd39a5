use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::Deserialize;
use url::{Position, Url};

use crate::util::generators::generate_random_string;

/// CA bundle the test hosts carry; callers can override or pass `None` to
/// use the system trust store.
pub const DEFAULT_CA_BUNDLE: &str = "/etc/pki/tls/certs/ca-bundle.crt";

// -----------------------------------------------------------------------------
// Models
// -----------------------------------------------------------------------------

/// Parameters for a scripted OpenID-Connect login.
///
/// `client_secret` is accepted for parity with the keyword signature; the
/// scripted flow stops at the login redirect and never exchanges the code,
/// so the secret is not sent anywhere.
#[derive(Debug, Clone)]
pub struct OpenidLogin {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub username: String,
    pub password: String,
    pub ca_bundle: Option<PathBuf>,
}

impl OpenidLogin {
    /// Login parameters verifying TLS against [`DEFAULT_CA_BUNDLE`]. Set
    /// `ca_bundle` to `None` afterwards to use the system trust store
    /// instead.
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        OpenidLogin {
            issuer: issuer.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            username: username.into(),
            password: password.into(),
            ca_bundle: Some(PathBuf::from(DEFAULT_CA_BUNDLE)),
        }
    }
}

/// The subset of the provider discovery document this flow needs.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub authorization_endpoint: String,
    pub token_endpoint: Option<String>,
    pub issuer: Option<String>,
}

// -----------------------------------------------------------------------------
// Functions
// -----------------------------------------------------------------------------

/// Performs an authorization-code login against a test identity provider by
/// scraping its login page. The flow is purpose-built for one login-page
/// shape and is expected to break if that page changes.
pub async fn authenticate(login: &OpenidLogin) -> Result<bool> {
    let client = http_client(login.ca_bundle.as_deref())?;

    let config = discover_provider_config(&client, &login.issuer).await?;

    let auth_url =
        build_authorization_url(&config.authorization_endpoint, &login.client_id, &login.redirect_uri)?;
    info!("Auth URL: {}", auth_url);

    // Fetch the login page
    let response = client
        .get(auth_url)
        .send()
        .await
        .map_err(|err| anyhow!("Error getting login URL: {}", err))?;
    if response.status() != StatusCode::OK {
        bail!("Error getting login URL: {}", response.status().as_u16());
    }
    let page_url = response.url().clone();
    let page_body = response
        .text()
        .await
        .map_err(|err| anyhow!("Error reading login page: {}", err))?;

    // Locate the login form
    let action = extract_form_action(&page_body)
        .ok_or_else(|| anyhow!("Login form not found at URL: {}", page_url))?;
    let login_url = resolve_form_action(&page_url, &action)?;
    info!("Login URL: {}", login_url);

    // Log the user in
    let form = [
        ("login", login.username.as_str()),
        ("password", login.password.as_str()),
    ];
    let response = client
        .post(login_url)
        .form(&form)
        .send()
        .await
        .map_err(|err| anyhow!("Error posting login: {}", err))?;
    if response.status() != StatusCode::OK {
        bail!("Error posting login: {}", response.status().as_u16());
    }

    if !response.url().as_str().starts_with(&login.redirect_uri) {
        warn!("URL: {}", response.url());
        warn!("{}", response.text().await.unwrap_or_default());
        bail!("Login failed");
    }

    Ok(true)
}

fn http_client(ca_bundle: Option<&Path>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(path) = ca_bundle {
        let pem = std::fs::read(&path)
            .map_err(|err| anyhow!("Error reading CA bundle {}: {}", path.display(), err))?;
        let certificate = reqwest::Certificate::from_pem(&pem)
            .map_err(|err| anyhow!("Invalid CA bundle {}: {}", path.display(), err))?;
        builder = builder.add_root_certificate(certificate);
    }

    builder
        .build()
        .map_err(|err| anyhow!("Error building HTTP client: {}", err))
}

async fn discover_provider_config(
    client: &reqwest::Client,
    issuer: &str,
) -> Result<ProviderConfig> {
    let discovery_url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );

    let response = client
        .get(&discovery_url)
        .send()
        .await
        .map_err(|err| anyhow!("Error fetching provider config: {}", err))?;
    if response.status() != StatusCode::OK {
        bail!(
            "Error fetching provider config: {}",
            response.status().as_u16()
        );
    }

    response
        .json::<ProviderConfig>()
        .await
        .map_err(|err| anyhow!("Invalid provider config: {}", err))
}

fn build_authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
) -> Result<Url> {
    let mut url = Url::parse(authorization_endpoint)
        .map_err(|err| anyhow!("Invalid authorization endpoint: {}", err))?;

    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("response_type", "code")
        .append_pair("scope", "openid")
        .append_pair("nonce", &generate_random_string(24))
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", &generate_random_string(24));

    Ok(url)
}

/// Pulls the `action` attribute from the first form on the page.
fn extract_form_action(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("form").ok()?;

    document
        .select(&selector)
        .next()?
        .value()
        .attr("action")
        .map(str::to_string)
}

/// Resolves a form action path against the scheme and authority of the page
/// it was scraped from.
fn resolve_form_action(page_url: &Url, action: &str) -> Result<Url> {
    let login_url = format!("{}{}", &page_url[..Position::BeforePath], action);

    Url::parse(&login_url).map_err(|err| anyhow!("Invalid login URL {}: {}", login_url, err))
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
