//! Google News results parser.
//!
//! Result links on Google are often wrapped in a `/url?q=<target>` redirect;
//! those are unwrapped to the target so dataset urls point at the article.

use super::{
    ParseContext, ResultParser, SearchKind, SearchRequest, SearchRequestBuilder, SelectorProfile,
    contains_marker,
};
use crate::models::{Backend, ResultRecord, Topic};
use once_cell::sync::Lazy;
use tracing::info;
use url::Url;

const BASE_URL: &str = "https://www.google.com";
const SEARCH_URL: &str = "https://www.google.com/search";

const TITLE: &[&str] = &["div.n0jPhd", "h3", "a.JtKRv", "div.mCBkyc"];
const SOURCE: &[&str] = &["div.MgUUmf", "div.CEMjEf", "span.vr1PYe"];
const SNIPPET: &[&str] = &["div.GI74Re", "span.Y3v8qd"];
const LINK: &[&str] = &["a.WlydOe[href]", "a[href]"];

const CHALLENGE_MARKERS: &[&str] = &["unusual traffic", "/sorry/", "captcha"];

static DESKTOP: Lazy<SelectorProfile> = Lazy::new(|| {
    SelectorProfile::new(
        &["article", "div.xrnccd", "div.SoaBEf"],
        TITLE,
        SOURCE,
        SNIPPET,
        LINK,
    )
});

static MOBILE: Lazy<SelectorProfile> =
    Lazy::new(|| SelectorProfile::new(&["article", "div.xrnccd"], TITLE, SOURCE, SNIPPET, LINK));

#[derive(Debug, Clone)]
pub struct GoogleNewsParser {
    kind: SearchKind,
    base: Url,
}

impl GoogleNewsParser {
    pub fn new(kind: SearchKind) -> Self {
        Self {
            kind,
            // constant, always parses
            base: Url::parse(BASE_URL).unwrap(),
        }
    }

    /// Absolute target of a result link, unwrapping `/url?q=` redirects.
    pub fn resolve_link(&self, href: &str) -> Option<String> {
        let resolved = self.base.join(href).ok()?;
        if resolved.path() == "/url" {
            if let Some((_, target)) = resolved
                .query_pairs()
                .find(|(k, v)| (k == "q" || k == "url") && !v.is_empty())
            {
                return Some(target.into_owned());
            }
        }
        Some(resolved.to_string())
    }
}

impl ResultParser for GoogleNewsParser {
    fn backend(&self) -> Backend {
        Backend::GoogleNews
    }

    fn build_request(&self, topic: &Topic, page_index: u32, items_per_page: u32) -> SearchRequest {
        let mode: &[(&str, &str)] = match self.kind {
            SearchKind::News => &[("tbm", "nws")],
            SearchKind::SearchHistory => &[("hl", "en"), ("gl", "us")],
        };
        SearchRequestBuilder::new(SEARCH_URL)
            .query(topic)
            .mode(mode)
            .paginate("start", page_index, items_per_page)
            .build()
    }

    fn parse_results(&self, body: &str, ctx: &ParseContext<'_>) -> Vec<ResultRecord> {
        let profile: &SelectorProfile = if ctx.mobile { &MOBILE } else { &DESKTOP };
        let records = profile.extract(body, ctx, |href| self.resolve_link(href));
        info!(
            backend = "google_news",
            topic = %ctx.topic,
            context = %ctx.context,
            page = ctx.page_index,
            mobile = ctx.mobile,
            count = records.len(),
            "Parsed results page"
        );
        records
    }

    fn is_challenge(&self, body: &str) -> bool {
        contains_marker(body, CHALLENGE_MARKERS)
    }
}
