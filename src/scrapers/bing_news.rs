//! Bing News results parser.
//!
//! Mobile result cards carry neither a source nor a snippet, so the mobile
//! profile only reads titles and links.

use super::{
    ParseContext, ResultParser, SearchKind, SearchRequest, SearchRequestBuilder, SelectorProfile,
    contains_marker,
};
use crate::models::{Backend, ResultRecord, Topic};
use once_cell::sync::Lazy;
use tracing::info;
use url::Url;

const BASE_URL: &str = "https://www.bing.com";

const CHALLENGE_MARKERS: &[&str] = &["b_captcha", "captcha"];

static DESKTOP: Lazy<SelectorProfile> = Lazy::new(|| {
    SelectorProfile::new(
        &[
            "div.newsitem",
            "div.news-card",
            "article",
            "div[data-tag=news]",
            "li.b_algo",
            "div.b_algo",
        ],
        &["a.title", "a", "h2.title", "h3"],
        &["span.source", "div.source", "cite", "a.source"],
        &["p", "div.snippet", "span.snippet"],
        &["a.title[href]", "a[href]"],
    )
});

static MOBILE: Lazy<SelectorProfile> = Lazy::new(|| {
    SelectorProfile::new(
        &["div.newsitem", "div.news-card", "div[data-tag=news]"],
        &["a", "h2", "h3"],
        &[],
        &[],
        &["a[href]"],
    )
});

#[derive(Debug, Clone)]
pub struct BingNewsParser {
    kind: SearchKind,
    base: Url,
}

impl BingNewsParser {
    pub fn new(kind: SearchKind) -> Self {
        Self {
            kind,
            base: Url::parse(BASE_URL).unwrap(),
        }
    }
}

impl ResultParser for BingNewsParser {
    fn backend(&self) -> Backend {
        Backend::BingNews
    }

    fn build_request(&self, topic: &Topic, page_index: u32, items_per_page: u32) -> SearchRequest {
        let (url, form) = match self.kind {
            SearchKind::News => ("https://www.bing.com/news/search", "HDRSC1"),
            SearchKind::SearchHistory => ("https://www.bing.com/search", "QBLH"),
        };
        SearchRequestBuilder::new(url)
            .query(topic)
            .mode(&[("setmkt", "en-US"), ("form", form)])
            .paginate("first", page_index, items_per_page)
            .build()
    }

    fn parse_results(&self, body: &str, ctx: &ParseContext<'_>) -> Vec<ResultRecord> {
        let profile: &SelectorProfile = if ctx.mobile { &MOBILE } else { &DESKTOP };
        let records = profile.extract(body, ctx, |href| {
            self.base.join(href).ok().map(|u| u.to_string())
        });
        info!(
            backend = "bing_news",
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
