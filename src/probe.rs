use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Remote checks of asset hrefs. Errors are human-readable reasons.
#[async_trait]
pub trait AssetProbe: Send + Sync {
    /// The object behind `href` can be fetched.
    async fn check(&self, href: &str) -> Result<(), String>;

    /// The object behind `href` is a valid Cloud-Optimized GeoTIFF.
    async fn check_cog(&self, href: &str) -> Result<(), String>;
}

#[derive(Clone)]
pub struct HttpAssetProbe {
    http: Client,
    raster_url: Option<String>,
}

impl fmt::Debug for HttpAssetProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAssetProbe")
            .field("raster_url", &self.raster_url)
            .finish_non_exhaustive()
    }
}

/// `https` url an href is fetched through. `s3://bucket/key` goes to the
/// bucket's public endpoint.
pub fn fetch_url(href: &str) -> Result<Url, String> {
    if let Some(rest) = href.strip_prefix("s3://") {
        let (bucket, key) = rest
            .split_once('/')
            .filter(|(b, k)| !b.is_empty() && !k.is_empty())
            .ok_or_else(|| format!("{href} is not an s3://bucket/key url"))?;
        return Url::parse(&format!("https://{bucket}.s3.amazonaws.com/{key}"))
            .map_err(|e| format!("{href}: {e}"));
    }
    let url = Url::parse(href).map_err(|e| format!("{href} is not a url: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("{href}: unsupported scheme {other}")),
    }
}

impl HttpAssetProbe {
    pub fn new(timeout: Duration, raster_url: Option<&str>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("stac-ingestor/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build asset probe client")?;
        let raster_url = match raster_url {
            Some(u) => {
                Url::parse(u).context("invalid validation.raster_url")?;
                Some(u.trim_end_matches('/').to_string())
            }
            None => None,
        };
        Ok(Self { http, raster_url })
    }

    async fn head_or_range(&self, url: Url) -> Result<StatusCode, reqwest::Error> {
        let status = self.http.head(url.clone()).send().await?.status();
        if status != StatusCode::METHOD_NOT_ALLOWED && status != StatusCode::NOT_IMPLEMENTED {
            return Ok(status);
        }
        debug!(%url, "HEAD not allowed, retrying with a ranged GET");
        let resp = self
            .http
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;
        Ok(resp.status())
    }
}

#[async_trait]
impl AssetProbe for HttpAssetProbe {
    async fn check(&self, href: &str) -> Result<(), String> {
        let url = fetch_url(href)?;
        match self.head_or_range(url).await {
            Ok(status) if status.is_success() => Ok(()),
            Ok(status) => Err(format!("{href} is not accessible: HTTP {}", status.as_u16())),
            Err(e) => Err(format!("{href} is not accessible: {e}")),
        }
    }

    async fn check_cog(&self, href: &str) -> Result<(), String> {
        let Some(raster) = &self.raster_url else {
            return self.check(href).await;
        };
        let mut endpoint = Url::parse(&format!("{raster}/cog/validate"))
            .map_err(|e| format!("invalid raster url: {e}"))?;
        endpoint.query_pairs_mut().append_pair("url", href);
        let resp = self
            .http
            .get(endpoint)
            .send()
            .await
            .map_err(|e| format!("Sample file {href} is an invalid COG: {e}"))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(format!("Sample file {href} is an invalid COG: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_hrefs_use_public_endpoint() {
        assert_eq!(
            fetch_url("s3://veda-data-store/no2/no2_2021.tif").unwrap().as_str(),
            "https://veda-data-store.s3.amazonaws.com/no2/no2_2021.tif"
        );
        assert!(fetch_url("s3://bucket-only").is_err());
    }

    #[test]
    fn only_http_and_s3_are_probed() {
        assert!(fetch_url("https://example.com/a.tif").is_ok());
        assert!(fetch_url("ftp://example.com/a.tif").unwrap_err().contains("unsupported scheme"));
        assert!(fetch_url("not a url").is_err());
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let probe = HttpAssetProbe::new(Duration::from_millis(500), None).unwrap();
        let err = probe.check("http://127.0.0.1:1/a.tif").await.unwrap_err();
        assert!(err.contains("not accessible"));
    }
}
