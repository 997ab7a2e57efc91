//! Source adapter contract, HTTP page fetching, and the retail-site adapters.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

use dealfeed_core::RawOffer;

pub const CRATE_NAME: &str = "dealfeed-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain HTTP listing-page fetcher. Sites that render offers only through
/// script execution are out of scope; against those this simply returns a
/// page with no matching cards.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Fetches one listing page as text, retrying transient failures with
    /// exponential backoff.
    pub async fn fetch_text(&self, source: &str, url: &str) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return Ok(String::from_utf8_lossy(&body).into_owned());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(
                            source,
                            url,
                            status = status.as_u16(),
                            attempt,
                            "retryable http status, backing off"
                        );
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(source, url, attempt, error = %err, "request error, backing off");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop always records the last request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("fetching listing page: {0}")]
    Fetch(#[from] FetchError),
}

/// One scrapeable retail source. `parse_listing` is pure so it can run
/// against saved fixture pages; `fetch_offers` drives it over live pages.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse_listing(&self, html: &str) -> Result<Vec<RawOffer>, AdapterError>;

    async fn fetch_offers(
        &self,
        fetcher: &PageFetcher,
        listing_urls: &[String],
    ) -> Result<Vec<RawOffer>, AdapterError> {
        let mut offers = Vec::new();
        for url in listing_urls {
            let html = fetcher.fetch_text(self.name(), url).await?;
            offers.extend(self.parse_listing(&html)?);
        }
        Ok(offers)
    }
}

fn text_or_none(value: String) -> Option<String> {
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

#[derive(Debug, Clone, Copy)]
struct MagnumAdapter;

#[async_trait]
impl SourceAdapter for MagnumAdapter {
    fn name(&self) -> &'static str {
        "magnum"
    }

    fn parse_listing(&self, html: &str) -> Result<Vec<RawOffer>, AdapterError> {
        let document = Html::parse_document(html);
        let card_sel =
            Selector::parse(".product-block").map_err(|e| AdapterError::Message(e.to_string()))?;

        let mut offers = Vec::new();
        for card in document.select(&card_sel) {
            let Some(name) = select_first_text(card, ".product-block__descr")? else {
                warn!(source = self.name(), "product card without a name, skipping");
                continue;
            };
            let Some(price) = select_first_text(card, ".product-block__price")? else {
                warn!(source = self.name(), product = %name, "product card without a price, skipping");
                continue;
            };
            let old_price = select_first_text(card, ".product-block__old-price")?;
            let discount = select_first_text(card, ".product-block__stock")?;
            offers.push(RawOffer {
                name,
                price,
                old_price,
                discount,
            });
        }
        Ok(offers)
    }
}

#[derive(Debug, Clone, Copy)]
struct LamodaAdapter;

#[async_trait]
impl SourceAdapter for LamodaAdapter {
    fn name(&self) -> &'static str {
        "lamoda"
    }

    fn parse_listing(&self, html: &str) -> Result<Vec<RawOffer>, AdapterError> {
        let document = Html::parse_document(html);
        let card_sel = Selector::parse(".x-product-card__card")
            .map_err(|e| AdapterError::Message(e.to_string()))?;

        let mut offers = Vec::new();
        for card in document.select(&card_sel) {
            let Some(product) =
                select_first_text(card, ".x-product-card-description__product-name")?
            else {
                warn!(source = self.name(), "product card without a name, skipping");
                continue;
            };
            let Some(price) = select_first_text(card, ".x-product-card-description__price-new")?
            else {
                warn!(source = self.name(), product = %product, "product card without a price, skipping");
                continue;
            };
            // Same-named products from different brands must stay distinct
            // in the catalog, so the brand becomes part of the name.
            let name = match select_first_text(card, ".x-product-card-description__brand-name")? {
                Some(brand) => format!("{brand} {product}"),
                None => product,
            };
            let old_price = select_first_text(card, ".x-product-card-description__price-old")?;
            let discount = select_first_text(card, "._badgeContent_1yjde_7 span")?;
            offers.push(RawOffer {
                name,
                price,
                old_price,
                discount,
            });
        }
        Ok(offers)
    }
}

pub fn magnum_adapter() -> impl SourceAdapter {
    MagnumAdapter
}

pub fn lamoda_adapter() -> impl SourceAdapter {
    LamodaAdapter
}

pub fn adapter_for_source(adapter_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match adapter_id {
        "magnum" => Some(Box::new(MagnumAdapter)),
        "lamoda" => Some(Box::new(LamodaAdapter)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn fixture_path(source: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("fixtures")
            .join(source)
            .join("listing.html")
    }

    fn fixture_html(source: &str) -> String {
        fs::read_to_string(fixture_path(source)).expect("read listing fixture")
    }

    #[test]
    fn magnum_listing_parses_cards_with_optional_fields() {
        let offers = magnum_adapter()
            .parse_listing(&fixture_html("magnum"))
            .expect("parse magnum listing");

        assert_eq!(offers.len(), 3);
        assert_eq!(offers[0].name, "Молоко Отборное 3,2% 900 мл");
        assert_eq!(offers[0].price, "445 ₸");
        assert_eq!(offers[0].old_price.as_deref(), Some("665 ₸"));
        assert_eq!(offers[0].discount.as_deref(), Some("-33%"));

        // A regular-priced card has no old price and no discount badge.
        assert_eq!(offers[1].name, "Хлеб Бородинский 400 г");
        assert_eq!(offers[1].old_price, None);
        assert_eq!(offers[1].discount, None);

        assert_eq!(offers[2].discount.as_deref(), Some("-15%"));
    }

    #[test]
    fn lamoda_listing_joins_brand_into_product_name() {
        let offers = lamoda_adapter()
            .parse_listing(&fixture_html("lamoda"))
            .expect("parse lamoda listing");

        assert_eq!(offers.len(), 3);
        assert_eq!(offers[0].name, "Nike Кроссовки Air Max 90");
        assert_eq!(offers[0].price, "37 990 ₸");
        assert_eq!(offers[0].old_price.as_deref(), Some("75 980 ₸"));
        assert_eq!(offers[0].discount.as_deref(), Some("−50%"));

        assert_eq!(offers[1].name, "Mango Платье миди");
        assert_eq!(offers[1].discount, None);

        // Brand element missing: the bare product name is kept.
        assert_eq!(offers[2].name, "Ремень кожаный");
    }

    #[test]
    fn cards_missing_name_or_price_are_skipped() {
        let html = r#"
            <div class="product-block">
                <div class="product-block__descr">Товар без цены</div>
            </div>
            <div class="product-block">
                <div class="product-block__price">100 ₸</div>
            </div>
        "#;
        let offers = magnum_adapter().parse_listing(html).expect("parse");
        assert!(offers.is_empty());
    }

    #[test]
    fn adapter_registry_resolves_known_sources_only() {
        assert!(adapter_for_source("magnum").is_some());
        assert!(adapter_for_source("lamoda").is_some());
        assert!(adapter_for_source("ozon").is_none());
    }

    #[test]
    fn backoff_delays_double_and_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(700),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(700));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(700));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
