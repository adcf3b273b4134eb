//! Conditional freshness evaluation for validator-based revalidation.
//!
//! A client revalidating a cached response sends `If-None-Match` and/or
//! `If-Modified-Since`; the resource exposes a current [`Etag`] and
//! last-modified instant. [`evaluate`] decides whether the client's copy is
//! still [`Freshness::Fresh`] (short-circuit to a not-modified response) or
//! [`Freshness::Stale`] (produce the full response and set outgoing
//! validators from [`ResourceValidators`]).
//!
//! Every validator the client supplied must match; a missing one falls back
//! to the other, and a client that supplied neither is always stale. This
//! module speaks header values only and has no dependency on any HTTP
//! framework.

use sha2::{Digest, Sha256};
use std::fmt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Wire format for `Last-Modified` and `If-Modified-Since` values, e.g.
/// `Tue, 15 Nov 1994 08:12:31 GMT`. One-second resolution.
const HTTP_DATE_FORMAT: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Hex characters kept from a SHA-256 content digest when minting an etag.
const ETAG_HEX_CHARS: usize = 32;

// ==== Etag ====

/// An entity tag, strong or weak. Weak tags render with a `W/` prefix and
/// compare equal to their strong counterpart under the weak comparison used
/// for `If-None-Match`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Etag {
    opaque: String,
    weak: bool,
}

impl Etag {
    pub fn strong(opaque: impl Into<String>) -> Self {
        Self {
            opaque: opaque.into(),
            weak: false,
        }
    }

    pub fn weak(opaque: impl Into<String>) -> Self {
        Self {
            opaque: opaque.into(),
            weak: true,
        }
    }

    /// Mint a weak etag from response content. Weak because semantically
    /// equal responses can differ byte-for-byte across renders.
    pub fn from_digest(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self::weak(&hex::encode(digest)[..ETAG_HEX_CHARS])
    }

    /// Parse a single rendered tag: `"opaque"` or `W/"opaque"`. Returns
    /// `None` for anything unquoted or otherwise malformed.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let (weak, quoted) = match trimmed.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let opaque = quoted.strip_prefix('"')?.strip_suffix('"')?;
        if opaque.contains('"') {
            return None;
        }
        Some(Self {
            opaque: opaque.to_owned(),
            weak,
        })
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Weak comparison: weakness indicators are ignored, only the opaque
    /// octets must agree.
    pub fn matches_weakly(&self, other: &Etag) -> bool {
        self.opaque == other.opaque
    }

    /// The rendered header value, quotes and `W/` prefix included.
    pub fn render(&self) -> String {
        if self.weak {
            format!("W/\"{}\"", self.opaque)
        } else {
            format!("\"{}\"", self.opaque)
        }
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ==== Wire dates ====

/// Render an instant as an HTTP date. Sub-second precision is dropped by
/// the wire format.
pub fn http_date(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(HTTP_DATE_FORMAT)
        .expect("valid http date")
}

/// Parse an HTTP date. Obsolete formats and malformed values yield `None`,
/// which callers treat as an absent validator.
pub fn parse_http_date(raw: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(raw.trim(), HTTP_DATE_FORMAT)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

// ==== Client and resource sides ====

/// The client's revalidation headers, parsed leniently: unparseable etags
/// are dropped, an unparseable date counts as no date at all.
#[derive(Debug, Clone, Default)]
pub struct RequestConditionals {
    etags: Vec<Etag>,
    wildcard: bool,
    modified_since: Option<OffsetDateTime>,
}

impl RequestConditionals {
    /// Parse raw `If-None-Match` and `If-Modified-Since` header values.
    pub fn parse(if_none_match: Option<&str>, if_modified_since: Option<&str>) -> Self {
        let mut etags = Vec::new();
        let mut wildcard = false;
        if let Some(raw) = if_none_match {
            for candidate in raw.split(',') {
                let candidate = candidate.trim();
                if candidate == "*" {
                    wildcard = true;
                } else if let Some(etag) = Etag::parse(candidate) {
                    etags.push(etag);
                }
            }
        }
        Self {
            etags,
            wildcard,
            modified_since: if_modified_since.and_then(parse_http_date),
        }
    }

    pub fn has_validators(&self) -> bool {
        self.wildcard || !self.etags.is_empty() || self.modified_since.is_some()
    }

    fn sent_etags(&self) -> bool {
        self.wildcard || !self.etags.is_empty()
    }

    fn etag_matches(&self, current: Option<&Etag>) -> bool {
        let Some(current) = current else {
            return false;
        };
        self.wildcard || self.etags.iter().any(|etag| etag.matches_weakly(current))
    }

    fn unmodified_since(&self, current: Option<OffsetDateTime>) -> bool {
        match (self.modified_since, current) {
            // Wire dates carry whole seconds, so compare at that resolution.
            (Some(since), Some(current)) => since.unix_timestamp() >= current.unix_timestamp(),
            _ => false,
        }
    }
}

/// The resource's current validators, handed out as outgoing `ETag` and
/// `Last-Modified` values on the stale path.
#[derive(Debug, Clone, Default)]
pub struct ResourceValidators {
    pub etag: Option<Etag>,
    pub last_modified: Option<OffsetDateTime>,
}

impl ResourceValidators {
    pub fn new(etag: Option<Etag>, last_modified: Option<OffsetDateTime>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }

    /// Validators for a rendered body: digest etag, no last-modified.
    pub fn from_content(content: &[u8]) -> Self {
        Self::new(Some(Etag::from_digest(content)), None)
    }

    pub fn etag_header(&self) -> Option<String> {
        self.etag.as_ref().map(Etag::render)
    }

    pub fn last_modified_header(&self) -> Option<String> {
        self.last_modified.map(http_date)
    }
}

// ==== Evaluation ====

/// Outcome of conditional evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The client's copy is current; respond not-modified with no body.
    Fresh,
    /// The client's copy is out of date (or it sent no validators);
    /// produce the full response.
    Stale,
}

impl Freshness {
    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Decide whether the client's cached copy is still current. Every
/// validator the client sent must match the resource's current state;
/// a client that sent none is always stale.
pub fn evaluate(client: &RequestConditionals, current: &ResourceValidators) -> Freshness {
    if !client.has_validators() {
        return Freshness::Stale;
    }

    let mut fresh = true;
    if client.sent_etags() {
        fresh &= client.etag_matches(current.etag.as_ref());
    }
    if client.modified_since.is_some() {
        fresh &= client.unmodified_since(current.last_modified);
    }

    if fresh { Freshness::Fresh } else { Freshness::Stale }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn modified_at() -> OffsetDateTime {
        datetime!(1994-11-15 08:12:31 UTC)
    }

    fn resource() -> ResourceValidators {
        ResourceValidators::new(Some(Etag::strong("abc")), Some(modified_at()))
    }

    #[test]
    fn etag_render_and_parse() {
        assert_eq!(Etag::strong("abc").render(), "\"abc\"");
        assert_eq!(Etag::weak("abc").render(), "W/\"abc\"");
        assert_eq!(Etag::parse("\"abc\""), Some(Etag::strong("abc")));
        assert_eq!(Etag::parse(" W/\"abc\" "), Some(Etag::weak("abc")));
        assert_eq!(Etag::parse("abc"), None);
        assert_eq!(Etag::parse("\"ab\"c\""), None);
    }

    #[test]
    fn weak_comparison_ignores_weakness() {
        assert!(Etag::weak("abc").matches_weakly(&Etag::strong("abc")));
        assert!(!Etag::weak("abc").matches_weakly(&Etag::weak("xyz")));
    }

    #[test]
    fn digest_etags_are_stable_and_weak() {
        let a = Etag::from_digest(b"hello world");
        let b = Etag::from_digest(b"hello world");
        assert_eq!(a, b);
        assert!(a.is_weak());
        assert_ne!(a, Etag::from_digest(b"hello there"));
        assert_eq!(a.render().len(), "W/\"\"".len() + ETAG_HEX_CHARS);
    }

    #[test]
    fn http_date_round_trip() {
        let rendered = http_date(modified_at());
        assert_eq!(rendered, "Tue, 15 Nov 1994 08:12:31 GMT");
        assert_eq!(parse_http_date(&rendered), Some(modified_at()));
    }

    #[test]
    fn http_date_drops_subseconds_and_normalizes_offset() {
        let offset = datetime!(1994-11-15 10:12:31.5 +02:00);
        assert_eq!(http_date(offset), "Tue, 15 Nov 1994 08:12:31 GMT");
    }

    #[test]
    fn malformed_dates_are_absent() {
        assert_eq!(parse_http_date("yesterday-ish"), None);
        assert_eq!(parse_http_date(""), None);

        let client = RequestConditionals::parse(None, Some("yesterday-ish"));
        assert!(!client.has_validators());
        assert_eq!(evaluate(&client, &resource()), Freshness::Stale);
    }

    #[test]
    fn matching_etag_is_fresh() {
        let client = RequestConditionals::parse(Some("\"abc\""), None);
        assert_eq!(evaluate(&client, &resource()), Freshness::Fresh);
    }

    #[test]
    fn mismatched_etag_is_stale() {
        let client = RequestConditionals::parse(Some("\"xyz\""), None);
        assert_eq!(evaluate(&client, &resource()), Freshness::Stale);
    }

    #[test]
    fn etag_list_matches_any_member() {
        let client = RequestConditionals::parse(Some("\"xyz\", W/\"abc\", \"other\""), None);
        assert_eq!(evaluate(&client, &resource()), Freshness::Fresh);
    }

    #[test]
    fn wildcard_matches_only_when_an_etag_exists() {
        let client = RequestConditionals::parse(Some("*"), None);
        assert_eq!(evaluate(&client, &resource()), Freshness::Fresh);

        let bare = ResourceValidators::new(None, Some(modified_at()));
        assert_eq!(evaluate(&client, &bare), Freshness::Stale);
    }

    #[test]
    fn modified_since_equal_is_fresh() {
        let client =
            RequestConditionals::parse(None, Some("Tue, 15 Nov 1994 08:12:31 GMT"));
        assert_eq!(evaluate(&client, &resource()), Freshness::Fresh);
    }

    #[test]
    fn modified_since_older_is_stale() {
        let client =
            RequestConditionals::parse(None, Some("Tue, 15 Nov 1994 08:12:30 GMT"));
        assert_eq!(evaluate(&client, &resource()), Freshness::Stale);
    }

    #[test]
    fn modified_since_ignores_subsecond_drift() {
        // Resource modified half a second after the client's copy was
        // served; at wire resolution the copy is still current.
        let current = ResourceValidators::new(None, Some(datetime!(1994-11-15 08:12:31.5 UTC)));
        let client =
            RequestConditionals::parse(None, Some("Tue, 15 Nov 1994 08:12:31 GMT"));
        assert_eq!(evaluate(&client, &current), Freshness::Fresh);
    }

    #[test]
    fn both_validators_must_match() {
        // Etag matches, date is older: stale.
        let client = RequestConditionals::parse(
            Some("\"abc\""),
            Some("Tue, 15 Nov 1994 08:12:30 GMT"),
        );
        assert_eq!(evaluate(&client, &resource()), Freshness::Stale);

        // Date matches, etag does not: stale.
        let client = RequestConditionals::parse(
            Some("\"xyz\""),
            Some("Tue, 15 Nov 1994 08:12:31 GMT"),
        );
        assert_eq!(evaluate(&client, &resource()), Freshness::Stale);

        // Both match: fresh.
        let client = RequestConditionals::parse(
            Some("\"abc\""),
            Some("Tue, 15 Nov 1994 08:12:31 GMT"),
        );
        assert_eq!(evaluate(&client, &resource()), Freshness::Fresh);
    }

    #[test]
    fn no_validators_is_always_stale() {
        let client = RequestConditionals::parse(None, None);
        assert_eq!(evaluate(&client, &resource()), Freshness::Stale);
    }

    #[test]
    fn sent_validator_against_bare_resource_is_stale() {
        let bare = ResourceValidators::default();
        let client = RequestConditionals::parse(Some("\"abc\""), None);
        assert_eq!(evaluate(&client, &bare), Freshness::Stale);

        let client = RequestConditionals::parse(None, Some("Tue, 15 Nov 1994 08:12:31 GMT"));
        assert_eq!(evaluate(&client, &bare), Freshness::Stale);
    }

    #[test]
    fn outgoing_headers_render_current_state() {
        let current = resource();
        assert_eq!(current.etag_header().as_deref(), Some("\"abc\""));
        assert_eq!(
            current.last_modified_header().as_deref(),
            Some("Tue, 15 Nov 1994 08:12:31 GMT")
        );
        assert_eq!(ResourceValidators::default().etag_header(), None);
    }
}
