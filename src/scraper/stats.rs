use std::collections::HashSet;

use ::scraper::{ElementRef, Selector};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::model::StatisticEntry;
use crate::scraper::{self, select_text, Html};

const SUMMARY_LINK_SELECTOR: &str = ".stats-summary a";
const SUMMARY_NAME_SELECTOR: &str = ".h5";
const SUMMARY_VALUE_SELECTOR: &str = ".h2";
const VEHICLE_SECTION_SELECTOR: &str = "#byVehicle";

/// `title:` key in an inline chart script; `subtitle:` does not match.
static TITLE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\btitle\s*:\s*").expect("title key pattern is valid"));
static TEXT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\btext\s*:\s*").expect("text key pattern is valid"));
static QUOTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:'([^']*)'|"([^"]*)")"#).expect("quoted string pattern is valid")
});

/// Fetches a player's stats page and turns it into typed statistic entries.
#[derive(Debug, Clone)]
pub struct PageScraper {
    http: reqwest::Client,
    config: SyncConfig,
}

impl PageScraper {
    pub fn new(http: reqwest::Client, config: SyncConfig) -> Self {
        Self { http, config }
    }

    /// Summary metrics first, then vehicle charts, each in page order.
    #[instrument(skip(self))]
    pub async fn extract(&self, account_id: u64) -> Result<Vec<StatisticEntry>> {
        let url = self.config.stats_page_url(account_id);
        let document = scraper::get_document(&self.http, &url, self.config.http_timeout).await?;
        let entries = parse_stats(&document)?;
        debug!(count = entries.len(), account_id, "parsed stats page");
        Ok(entries)
    }
}

/// Why a candidate entry was left out of the scrape result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Skip {
    MissingAnchor,
    MissingName,
    MissingCanvas,
    MissingTitle,
    DuplicateAnchor(String),
}

pub(crate) fn parse_stats(document: &Html) -> Result<Vec<StatisticEntry>> {
    let mut seen = HashSet::new();
    let mut entries = parse_summary(document, &mut seen)?;
    entries.extend(parse_vehicle_charts(document, &mut seen)?);
    Ok(entries)
}

fn parse_summary(document: &Html, seen: &mut HashSet<String>) -> Result<Vec<StatisticEntry>> {
    let link_selector = Selector::parse(SUMMARY_LINK_SELECTOR)?;
    let name_selector = Selector::parse(SUMMARY_NAME_SELECTOR)?;
    let value_selector = Selector::parse(SUMMARY_VALUE_SELECTOR)?;

    let mut entries = Vec::new();
    let mut links = document.select(&link_selector).peekable();
    if links.peek().is_none() {
        debug!("summary section absent");
        return Ok(entries);
    }

    for link in links {
        let parsed = parse_summary_link(&link, &name_selector, &value_selector)
            .and_then(|entry| claim_anchor(seen, entry));
        match parsed {
            Ok(entry) => entries.push(entry),
            Err(skip) => debug!(?skip, "skipping summary entry"),
        }
    }
    Ok(entries)
}

fn parse_summary_link(
    link: &ElementRef,
    name_selector: &Selector,
    value_selector: &Selector,
) -> std::result::Result<StatisticEntry, Skip> {
    let anchor_id = link
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|href| href.len() > 1 && href.starts_with('#'))
        .ok_or(Skip::MissingAnchor)?;

    let name = select_text(link, name_selector);
    if name.is_empty() {
        return Err(Skip::MissingName);
    }
    let value = select_text(link, value_selector);

    Ok(StatisticEntry::metric(name, value, anchor_id))
}

fn parse_vehicle_charts(
    document: &Html,
    seen: &mut HashSet<String>,
) -> Result<Vec<StatisticEntry>> {
    let section_selector = Selector::parse(VEHICLE_SECTION_SELECTOR)?;
    let canvas_selector = Selector::parse("canvas")?;
    let script_selector = Selector::parse("script")?;

    let Some(section) = document.select(&section_selector).next() else {
        debug!("vehicle section absent");
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for block in section.children().filter_map(ElementRef::wrap) {
        let parsed = parse_chart_block(&block, &canvas_selector, &script_selector)
            .and_then(|entry| claim_anchor(seen, entry));
        match parsed {
            Ok(entry) => entries.push(entry),
            Err(skip) => debug!(?skip, "skipping vehicle chart"),
        }
    }
    Ok(entries)
}

fn parse_chart_block(
    block: &ElementRef,
    canvas_selector: &Selector,
    script_selector: &Selector,
) -> std::result::Result<StatisticEntry, Skip> {
    let canvas_id = block
        .select(canvas_selector)
        .next()
        .and_then(|canvas| canvas.value().id())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(Skip::MissingCanvas)?;

    let script: String = block
        .select(script_selector)
        .flat_map(|s| s.text())
        .collect();
    let title = chart_title(&script).ok_or(Skip::MissingTitle)?;

    Ok(StatisticEntry::vehicle_chart(title, format!("#{canvas_id}")))
}

/// Title of the first chart config in `script`, either `title: 'Damage'` or
/// Chart.js style `title: { display: true, font: { .. }, text: "Damage" }`.
fn chart_title(script: &str) -> Option<String> {
    TITLE_KEY.find_iter(script).find_map(|key| {
        let rest = &script[key.end()..];
        let title = match rest.strip_prefix('{') {
            Some(object) => object_text(object)?,
            None => quoted(rest)?,
        };
        let title = title.trim();
        (!title.is_empty()).then(|| title.to_string())
    })
}

/// The `text:` value at the top level of an object body, stopping at its
/// closing brace.
fn object_text(body: &str) -> Option<&str> {
    let end = closing_brace(body)?;
    let body = &body[..end];
    TEXT_KEY
        .find_iter(body)
        .filter(|key| depth_at(body, key.start()) == 0)
        .find_map(|key| quoted(&body[key.end()..]))
}

fn quoted(input: &str) -> Option<&str> {
    let caps = QUOTED.captures(input)?;
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str())
}

/// Offset of the brace closing an object whose opening brace was already consumed.
fn closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn depth_at(body: &str, offset: usize) -> usize {
    body[..offset].chars().fold(0usize, |depth, c| match c {
        '{' => depth + 1,
        '}' => depth.saturating_sub(1),
        _ => depth,
    })
}

fn claim_anchor(
    seen: &mut HashSet<String>,
    entry: StatisticEntry,
) -> std::result::Result<StatisticEntry, Skip> {
    if seen.insert(entry.anchor_id.clone()) {
        Ok(entry)
    } else {
        Err(Skip::DuplicateAnchor(entry.anchor_id))
    }
}
