//! Portal session contract + the HTTP-backed portal binding.
//!
//! The pipeline only ever sees [`PortalSession`]; everything specific to the
//! lead pool portal (login form, listing offsets, detail table markup) stays
//! behind [`HttpPortalSession`].

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use leadpool_core::{AttributeTable, LeadFilter, LeadStub, PAGE_SIZE};
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "leadpool-portal";

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("filter apply failed: {0}")]
    FilterApply(String),
    #[error("detail fetch timed out for lead {id}")]
    FetchTimeout { id: String },
    #[error("detail fetch failed for lead {id}: {reason}")]
    Fetch { id: String, reason: String },
    #[error("pagination failed: {0}")]
    Navigation(String),
    #[error("unexpected page structure: {0}")]
    Parse(String),
}

/// Authenticated handle on the lead portal. One current listing page of
/// state; detail fetches are independent of it and safe to run concurrently.
#[async_trait]
pub trait PortalSession: Send + Sync {
    /// Establish the authenticated session. Fatal on failure.
    async fn login(&self) -> Result<(), PortalError>;

    /// Apply filter criteria (or none) and report the portal's
    /// self-declared total matching record count.
    async fn apply_filters(&self, filter: &LeadFilter) -> Result<u64, PortalError>;

    /// Stubs visible on the currently loaded listing page, same-page
    /// duplicates collapsed.
    async fn list_page_stubs(&self) -> Result<Vec<LeadStub>, PortalError>;

    /// Move to the next listing page. `false` when no further page exists.
    async fn advance_page(&self) -> Result<bool, PortalError>;

    /// Raw attribute table from a lead's detail view.
    async fn fetch_detail(&self, id: &str) -> Result<AttributeTable, PortalError>;
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub http_timeout: Duration,
}

#[derive(Debug, Default)]
struct ListingState {
    page_index: u64,
    filter: LeadFilter,
    html: Option<String>,
}

/// Cookie-session HTTP binding for the portal.
pub struct HttpPortalSession {
    config: PortalConfig,
    client: reqwest::Client,
    state: Mutex<ListingState>,
}

impl HttpPortalSession {
    pub fn new(config: PortalConfig) -> Result<Self, PortalError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| PortalError::Auth(format!("building http client: {e}")))?;
        Ok(Self {
            config,
            client,
            state: Mutex::new(ListingState::default()),
        })
    }

    fn listing_url(&self, page_index: u64, filter: &LeadFilter) -> String {
        // The portal paginates by 1-based row offset, 25 rows per page.
        let offset = page_index * PAGE_SIZE + 1;
        let mut url = format!(
            "{}/pool_view.php?id=16&sp=1&fltr=0&pg={offset}",
            self.config.base_url
        );
        if let Some(zip) = &filter.zip_code {
            url.push_str(&format!("&zip={zip}"));
        }
        if let Some(status) = &filter.status {
            url.push_str(&format!("&mls_status={}", urlencoding::encode(status)));
        }
        url
    }

    async fn get_listing_page(&self, url: &str) -> Result<String, PortalError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PortalError::Navigation(format!("requesting {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(PortalError::Navigation(format!(
                "listing page returned {} for {url}",
                resp.status()
            )));
        }
        resp.text()
            .await
            .map_err(|e| PortalError::Navigation(format!("reading {url}: {e}")))
    }
}

#[async_trait]
impl PortalSession for HttpPortalSession {
    async fn login(&self) -> Result<(), PortalError> {
        let url = format!("{}/login", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .form(&[
                ("email", self.config.email.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PortalError::Auth(format!("portal unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(PortalError::Auth(format!(
                "login returned {}",
                resp.status()
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| PortalError::Auth(format!("reading login response: {e}")))?;
        // The portal re-renders the login form on bad credentials.
        if body.contains("type=\"password\"") {
            return Err(PortalError::Auth("credentials rejected".to_string()));
        }
        info!("portal session authenticated");
        Ok(())
    }

    async fn apply_filters(&self, filter: &LeadFilter) -> Result<u64, PortalError> {
        let url = self.listing_url(0, filter);
        let html = self
            .get_listing_page(&url)
            .await
            .map_err(|e| PortalError::FilterApply(e.to_string()))?;

        let total = parse_total_prospects(&html);

        // Keep the fetched page either way: even without a readable summary
        // heading the listing itself is loaded, and the run can still scrape
        // whatever it shows.
        let mut state = self.state.lock().await;
        state.page_index = 0;
        state.filter = filter.clone();
        state.html = Some(html);
        drop(state);

        let total = total
            .ok_or_else(|| PortalError::FilterApply("no prospect count on page".to_string()))?;
        info!(total, "filters applied");
        Ok(total)
    }

    async fn list_page_stubs(&self) -> Result<Vec<LeadStub>, PortalError> {
        let state = self.state.lock().await;
        let html = state
            .html
            .as_deref()
            .ok_or_else(|| PortalError::Navigation("no listing page loaded".to_string()))?;
        parse_listing_stubs(html)
    }

    async fn advance_page(&self) -> Result<bool, PortalError> {
        let mut state = self.state.lock().await;
        let next_index = state.page_index + 1;
        let url = self.listing_url(next_index, &state.filter);
        let html = self.get_listing_page(&url).await?;
        if parse_listing_stubs(&html)?.is_empty() {
            debug!(page = next_index, "listing exhausted");
            return Ok(false);
        }

        state.page_index = next_index;
        state.html = Some(html);
        Ok(true)
    }

    async fn fetch_detail(&self, id: &str) -> Result<AttributeTable, PortalError> {
        let url = format!("{}/view_lead/{id}", self.config.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                PortalError::FetchTimeout { id: id.to_string() }
            } else {
                PortalError::Fetch {
                    id: id.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        if !resp.status().is_success() {
            return Err(PortalError::Fetch {
                id: id.to_string(),
                reason: format!("detail page returned {}", resp.status()),
            });
        }
        let html = resp.text().await.map_err(|e| PortalError::Fetch {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        let attrs = parse_detail_table(&html)?;
        if attrs.is_empty() {
            return Err(PortalError::Fetch {
                id: id.to_string(),
                reason: "no attribute table on detail page".to_string(),
            });
        }
        Ok(attrs)
    }
}

fn selector(src: &str) -> Result<Selector, PortalError> {
    Selector::parse(src).map_err(|e| PortalError::Parse(format!("selector {src}: {e}")))
}

/// Reads the portal's "NNN Total Prospects" heading.
pub fn parse_total_prospects(html: &str) -> Option<u64> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("h5").ok()?;
    for node in document.select(&sel) {
        let text = node.text().collect::<String>();
        if text.contains("Total Prospects") {
            let first = text.split_whitespace().next()?;
            return first.replace(',', "").parse().ok();
        }
    }
    None
}

/// Extracts lead stubs from a listing page: each data row carries a
/// `.leads` action button with the contact id, and the lead name sits in
/// the row's first cell. Duplicate ids on the same page are collapsed.
pub fn parse_listing_stubs(html: &str) -> Result<Vec<LeadStub>, PortalError> {
    let document = Html::parse_document(html);
    let row_sel = selector("tr")?;
    let leads_sel = selector(".leads")?;
    let cell_sel = selector("td")?;

    let mut seen = HashSet::new();
    let mut stubs = Vec::new();
    for row in document.select(&row_sel) {
        let Some(button) = row.select(&leads_sel).next() else {
            continue;
        };
        let Some(id) = button.value().attr("data-contact-id") else {
            continue;
        };
        let name = row
            .select(&cell_sel)
            .next()
            .map(|c| c.text().collect::<String>().trim().to_string())
            .unwrap_or_default();
        if name.is_empty() || name == "," {
            continue;
        }
        if seen.insert(id.to_string()) {
            stubs.push(LeadStub {
                id: id.to_string(),
                name,
            });
        }
    }
    Ok(stubs)
}

/// Collects the two-column key/value rows of a detail page into an
/// [`AttributeTable`].
pub fn parse_detail_table(html: &str) -> Result<AttributeTable, PortalError> {
    let document = Html::parse_document(html);
    let row_sel = selector("table tr")?;
    let cell_sel = selector("td")?;

    let mut attrs = AttributeTable::new();
    for row in document.select(&row_sel) {
        let cells: Vec<_> = row.select(&cell_sel).collect();
        if cells.len() >= 2 {
            let key = cells[0].text().collect::<String>();
            let value = cells[1].text().collect::<String>();
            attrs.insert_raw(&key, &value);
        }
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <table>
          <tr><th>Name</th><th>Actions</th></tr>
          <tr><td>Jane Seller</td><td><button class="leads" data-contact-id="101">View</button></td></tr>
          <tr><td>Bob Owner</td><td><button class="leads" data-contact-id="102">View</button></td></tr>
          <tr><td>Bob Owner</td><td><button class="leads" data-contact-id="102">View</button></td></tr>
          <tr><td>,</td><td><button class="leads" data-contact-id="103">View</button></td></tr>
          <tr><td>No Button Here</td></tr>
        </table>
    "#;

    #[test]
    fn listing_stubs_parse_and_collapse_same_page_duplicates() {
        let stubs = parse_listing_stubs(LISTING).expect("parse");
        assert_eq!(
            stubs,
            vec![
                LeadStub {
                    id: "101".into(),
                    name: "Jane Seller".into()
                },
                LeadStub {
                    id: "102".into(),
                    name: "Bob Owner".into()
                },
            ]
        );
    }

    #[test]
    fn empty_listing_yields_no_stubs() {
        let stubs = parse_listing_stubs("<table><tr><td>nothing</td></tr></table>").expect("parse");
        assert!(stubs.is_empty());
    }

    #[test]
    fn total_prospects_heading_parses_with_thousands_separator() {
        let html = r#"<div><h5>1,287 Total Prospects</h5></div>"#;
        assert_eq!(parse_total_prospects(html), Some(1287));
        assert_eq!(parse_total_prospects("<h5>Something Else</h5>"), None);
    }

    #[test]
    fn detail_table_normalizes_keys_and_skips_short_rows() {
        let html = r#"
            <table class="table-striped">
              <tr><td>Phone/s:</td><td> 555-1111 </td></tr>
              <tr><td>Date Added</td><td>2026-08-01</td></tr>
              <tr><td>only one cell</td></tr>
              <tr><td>Empty:</td><td>   </td></tr>
            </table>
        "#;
        let attrs = parse_detail_table(html).expect("parse");
        assert_eq!(attrs.get("phone/s"), Some("555-1111"));
        assert_eq!(attrs.get("date_added"), Some("2026-08-01"));
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn listing_url_encodes_offset_and_filters() {
        let session = HttpPortalSession::new(PortalConfig {
            base_url: "https://portal.example".to_string(),
            email: "a@b.c".to_string(),
            password: "secret".to_string(),
            http_timeout: Duration::from_secs(5),
        })
        .expect("session");

        let filter = LeadFilter {
            zip_code: Some("98072".to_string()),
            status: Some("Expired".to_string()),
        };
        assert_eq!(
            session.listing_url(0, &filter),
            "https://portal.example/pool_view.php?id=16&sp=1&fltr=0&pg=1&zip=98072&mls_status=Expired"
        );
        assert_eq!(
            session.listing_url(3, &LeadFilter::default()),
            "https://portal.example/pool_view.php?id=16&sp=1&fltr=0&pg=76"
        );
    }
}
