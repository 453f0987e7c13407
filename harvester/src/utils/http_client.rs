use std::{sync::OnceLock, time::Duration};

use tracing::{debug, warn};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate got there first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Route all traffic through `proxy_url` when set, otherwise disable proxies
/// (including env/system ones).
pub fn apply_proxy(
    builder: reqwest::ClientBuilder,
    proxy_url: Option<&str>,
) -> reqwest::ClientBuilder {
    let Some(url) = proxy_url else {
        return builder.no_proxy();
    };
    match reqwest::Proxy::all(url) {
        Ok(proxy) => builder.proxy(proxy),
        Err(error) => {
            warn!(proxy_url = %url, error = %error, "Invalid proxy URL; disabling proxy");
            builder.no_proxy()
        }
    }
}

/// Build the client used against the analytics service.
pub fn build_client(
    user_agent: &str,
    request_timeout: Duration,
    proxy_url: Option<&str>,
) -> crate::Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .gzip(true)
        .deflate(true)
        .pool_max_idle_per_host(8);

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    Ok(apply_proxy(builder, proxy_url).build()?)
}
