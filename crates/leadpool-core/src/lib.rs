//! Core domain model and record normalization for leadpool.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "leadpool-core";

/// Listing page size the portal uses. Not configurable server-side.
pub const PAGE_SIZE: u64 = 25;

/// Placeholder written for fields the detail page did not provide.
pub const PLACEHOLDER: &str = "N/A";

/// Fallback key precedence per output field; first matching key wins.
pub const PHONE_KEYS: &[&str] = &["phone/s", "phone"];
pub const EMAIL_KEYS: &[&str] = &["email/s", "email"];
pub const ADDRESS_KEYS: &[&str] = &["address1", "address"];
pub const CITY_KEYS: &[&str] = &["city"];
pub const ZIP_KEYS: &[&str] = &["zip", "zip_code"];
pub const DATE_ADDED_KEYS: &[&str] = &["date_added"];
pub const STATUS_KEYS: &[&str] = &["lead_source"];

/// One row of the listing view: the natural key plus the display name.
/// Two stubs with equal `id` refer to the same lead regardless of name text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadStub {
    pub id: String,
    pub name: String,
}

/// Key/value attributes scraped from a lead detail page.
///
/// Keys are normalized on insert: lowercased, spaces become underscores,
/// trailing colons stripped. Detail pages are not guaranteed complete and
/// key spellings vary across lead sources (`phone` vs `phone/s`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeTable {
    entries: HashMap<String, String>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize_key(raw: &str) -> String {
        raw.trim()
            .trim_end_matches(':')
            .to_ascii_lowercase()
            .replace(' ', "_")
    }

    /// Insert a raw label/value cell pair, normalizing the key and
    /// trimming the value. Empty values are kept out of the table so
    /// fallback lookups can skip them.
    pub fn insert_raw(&mut self, raw_key: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        self.entries
            .insert(Self::normalize_key(raw_key), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// First non-empty value among `keys`, in order.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for AttributeTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (k, v) in iter {
            table.insert_raw(&k, &v);
        }
        table
    }
}

/// Filter criteria handed to the portal session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadFilter {
    pub zip_code: Option<String>,
    pub status: Option<String>,
}

/// What one run is asked to produce. `max_limit` of `None` or 0 means
/// "every record the portal reports".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTarget {
    pub zip_code: Option<String>,
    pub status: Option<String>,
    pub max_limit: Option<u64>,
}

impl RunTarget {
    pub fn filter(&self) -> LeadFilter {
        LeadFilter {
            zip_code: self.zip_code.clone(),
            status: self.status.clone(),
        }
    }

    /// The effective cap, with 0 collapsed to unbounded.
    pub fn effective_limit(&self) -> Option<u64> {
        match self.max_limit {
            Some(0) | None => None,
            Some(n) => Some(n),
        }
    }
}

/// Where the Status column comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusSource {
    /// Per-lead `lead_source` attribute, falling back to the run's status.
    #[default]
    ScrapedWithFallback,
    /// Always the run's status, ignoring the scraped attribute.
    Context,
}

/// Inputs to normalization that are constant across a batch.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub status: &'a str,
    pub status_source: StatusSource,
}

/// Spreadsheet formula links for one address, built together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchLinks {
    pub zillow: String,
    pub redfin: String,
    pub google_maps: String,
}

impl SearchLinks {
    /// Builds the three search links iff the address is usable: present,
    /// non-empty after trimming, not the placeholder, and not the literal
    /// string "null" some lead sources store.
    pub fn build(address: &str, city: &str) -> Option<Self> {
        let address = address.trim();
        if address.is_empty()
            || address == PLACEHOLDER
            || address.eq_ignore_ascii_case("null")
        {
            return None;
        }
        let query = urlencoding::encode(&format!("{address} {city} WA")).into_owned();
        Some(Self {
            zillow: format!(
                "=HYPERLINK(\"https://www.zillow.com/homes/{query}_rb/\", \"Zillow\")"
            ),
            redfin: format!(
                "=HYPERLINK(\"https://www.redfin.com/search?q={query}\", \"Redfin\")"
            ),
            google_maps: format!(
                "=HYPERLINK(\"https://www.google.com/maps/search/{query}\", \"Google Maps\")"
            ),
        })
    }
}

/// Canonical output row. Field order matches [`LeadRecord::HEADER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub name: String,
    pub status: String,
    pub phone: String,
    pub email: String,
    pub address: String,
    pub city: String,
    pub zip: String,
    pub date_added: String,
    pub zillow_link: String,
    pub redfin_link: String,
    pub google_maps_link: String,
    pub internal_id: String,
}

impl LeadRecord {
    pub const HEADER: [&'static str; 12] = [
        "Name",
        "Status",
        "Phone",
        "Email",
        "Address",
        "City",
        "Zip",
        "Date Added",
        "Zillow",
        "Redfin",
        "Google Maps",
        "Internal ID",
    ];

    pub fn as_row(&self) -> [&str; 12] {
        [
            &self.name,
            &self.status,
            &self.phone,
            &self.email,
            &self.address,
            &self.city,
            &self.zip,
            &self.date_added,
            &self.zillow_link,
            &self.redfin_link,
            &self.google_maps_link,
            &self.internal_id,
        ]
    }

    /// Row emitted when the detail fetch failed. Known fields survive,
    /// everything scraped degrades to the placeholder, links stay empty,
    /// so every submitted stub still yields exactly one output row.
    pub fn fallback(stub: &LeadStub, status: &str) -> Self {
        Self {
            name: stub.name.clone(),
            status: status.to_string(),
            phone: PLACEHOLDER.to_string(),
            email: PLACEHOLDER.to_string(),
            address: PLACEHOLDER.to_string(),
            city: PLACEHOLDER.to_string(),
            zip: PLACEHOLDER.to_string(),
            date_added: PLACEHOLDER.to_string(),
            zillow_link: String::new(),
            redfin_link: String::new(),
            google_maps_link: String::new(),
            internal_id: stub.id.clone(),
        }
    }

    pub fn has_links(&self) -> bool {
        !self.zillow_link.is_empty()
    }
}

fn field_or_placeholder(attrs: &AttributeTable, keys: &[&str]) -> String {
    attrs
        .first_of(keys)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| PLACEHOLDER.to_string())
}

/// Maps a scraped attribute table into the canonical row shape. Pure; the
/// caller decides between this and [`LeadRecord::fallback`] based on the
/// fetch outcome.
pub fn normalize(stub: &LeadStub, attrs: &AttributeTable, ctx: NormalizeContext<'_>) -> LeadRecord {
    let status = match ctx.status_source {
        StatusSource::ScrapedWithFallback => attrs
            .first_of(STATUS_KEYS)
            .map(str::to_string)
            .unwrap_or_else(|| ctx.status.to_string()),
        StatusSource::Context => ctx.status.to_string(),
    };

    let address = field_or_placeholder(attrs, ADDRESS_KEYS);
    let city = field_or_placeholder(attrs, CITY_KEYS);

    let (zillow_link, redfin_link, google_maps_link) = match SearchLinks::build(&address, &city) {
        Some(links) => (links.zillow, links.redfin, links.google_maps),
        None => (String::new(), String::new(), String::new()),
    };

    LeadRecord {
        name: stub.name.clone(),
        status,
        phone: field_or_placeholder(attrs, PHONE_KEYS),
        email: field_or_placeholder(attrs, EMAIL_KEYS),
        address,
        city,
        zip: field_or_placeholder(attrs, ZIP_KEYS),
        date_added: field_or_placeholder(attrs, DATE_ADDED_KEYS),
        zillow_link,
        redfin_link,
        google_maps_link,
        internal_id: stub.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub() -> LeadStub {
        LeadStub {
            id: "4412".to_string(),
            name: "Jane Seller".to_string(),
        }
    }

    fn ctx() -> NormalizeContext<'static> {
        NormalizeContext {
            status: "Expired",
            status_source: StatusSource::ScrapedWithFallback,
        }
    }

    fn table(pairs: &[(&str, &str)]) -> AttributeTable {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn keys_are_normalized_on_insert() {
        let attrs = table(&[("Date Added:", "2026-08-01"), ("Phone/s", "555-1111")]);
        assert_eq!(attrs.get("date_added"), Some("2026-08-01"));
        assert_eq!(attrs.get("phone/s"), Some("555-1111"));
    }

    #[test]
    fn first_listed_fallback_key_wins() {
        let attrs = table(&[("phone/s", "555-1111"), ("phone", "555-2222")]);
        let record = normalize(&stub(), &attrs, ctx());
        assert_eq!(record.phone, "555-1111");
    }

    #[test]
    fn missing_fields_default_to_placeholder() {
        let record = normalize(&stub(), &AttributeTable::new(), ctx());
        assert_eq!(record.phone, PLACEHOLDER);
        assert_eq!(record.email, PLACEHOLDER);
        assert_eq!(record.address, PLACEHOLDER);
        assert_eq!(record.city, PLACEHOLDER);
        assert_eq!(record.zip, PLACEHOLDER);
        assert_eq!(record.date_added, PLACEHOLDER);
        assert_eq!(record.internal_id, "4412");
    }

    #[test]
    fn links_are_all_or_nothing() {
        let with_addr = normalize(
            &stub(),
            &table(&[("address1", "123 Main St"), ("city", "Seattle")]),
            ctx(),
        );
        assert!(with_addr.zillow_link.contains("123%20Main%20St%20Seattle%20WA"));
        assert!(with_addr.redfin_link.contains("123%20Main%20St%20Seattle%20WA"));
        assert!(with_addr
            .google_maps_link
            .contains("123%20Main%20St%20Seattle%20WA"));

        let without_addr = normalize(&stub(), &AttributeTable::new(), ctx());
        assert!(without_addr.zillow_link.is_empty());
        assert!(without_addr.redfin_link.is_empty());
        assert!(without_addr.google_maps_link.is_empty());
    }

    #[test]
    fn null_and_blank_addresses_produce_no_links() {
        for bad in ["null", "NULL", "  ", ""] {
            assert!(SearchLinks::build(bad, "Seattle").is_none(), "addr={bad:?}");
        }
        assert!(SearchLinks::build("N/A", "Seattle").is_none());
    }

    #[test]
    fn links_are_hyperlink_formulas() {
        let links = SearchLinks::build("9 Pine Ct", "Woodinville").expect("linkable");
        assert!(links.zillow.starts_with("=HYPERLINK(\"https://www.zillow.com/homes/"));
        assert!(links.zillow.ends_with("_rb/\", \"Zillow\")"));
        assert!(links.redfin.starts_with("=HYPERLINK(\"https://www.redfin.com/search?q="));
        assert!(links
            .google_maps
            .starts_with("=HYPERLINK(\"https://www.google.com/maps/search/"));
    }

    #[test]
    fn status_prefers_scraped_lead_source() {
        let attrs = table(&[("lead_source", "FSBO")]);
        let scraped = normalize(&stub(), &attrs, ctx());
        assert_eq!(scraped.status, "FSBO");

        let forced = normalize(
            &stub(),
            &attrs,
            NormalizeContext {
                status: "Expired",
                status_source: StatusSource::Context,
            },
        );
        assert_eq!(forced.status, "Expired");
    }

    #[test]
    fn fallback_record_preserves_identity_only() {
        let record = LeadRecord::fallback(&stub(), "Expired");
        assert_eq!(record.name, "Jane Seller");
        assert_eq!(record.internal_id, "4412");
        assert_eq!(record.status, "Expired");
        assert_eq!(record.phone, PLACEHOLDER);
        assert!(!record.has_links());
    }

    #[test]
    fn effective_limit_collapses_zero() {
        let mut target = RunTarget::default();
        assert_eq!(target.effective_limit(), None);
        target.max_limit = Some(0);
        assert_eq!(target.effective_limit(), None);
        target.max_limit = Some(30);
        assert_eq!(target.effective_limit(), Some(30));
    }
}
