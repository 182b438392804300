use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;

use crate::normalize::{DetailFields, RawListingRow};
use crate::AdapterError;

const LISTING_ROW: &str = r#"tr[id^="ctl20_ctl00_GamesRepeater"]"#;
const PAGER_CELL: &str = r#"td[align="left"]"#;
const END_CELL: &str = r#"td[height="18"]"#;
const END_LABEL: &str = "Время окончания";
const COVER_MARKER: &str = "обложка";

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Game rows of one calendar page. Rows with too few cells are logged and
/// dropped.
pub fn parse_listing_rows(html: &str) -> Result<Vec<RawListingRow>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector(LISTING_ROW)?;
    let cell_sel = selector("td")?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row.select(&cell_sel).map(element_text).collect();
        if cells.len() < 8 {
            warn!(
                row_id = row.value().id().unwrap_or_default(),
                cells = cells.len(),
                "skipping malformed listing row"
            );
            continue;
        }
        rows.push(RawListingRow {
            id_cell: cells[1].clone(),
            domain: cells[3].clone(),
            start_text: cells[4].clone(),
            name: cells[5].clone(),
            author: cells[6].clone(),
            price: cells[7].clone(),
        });
    }
    Ok(rows)
}

/// Absolute urls of further calendar pages, in document order, without
/// duplicates and without `page_url` itself.
pub fn pagination_links(html: &str, page_url: &str) -> Result<Vec<String>, AdapterError> {
    let base = Url::parse(page_url)
        .map_err(|e| AdapterError::Message(format!("invalid page url {page_url}: {e}")))?;
    let document = Html::parse_document(html);
    let cell_sel = selector(PAGER_CELL)?;
    let link_sel = selector("a[href]")?;

    // The pager is the first left-aligned cell; later ones are site navigation.
    let Some(pager) = document.select(&cell_sel).next() else {
        return Ok(Vec::new());
    };
    let mut links: Vec<String> = Vec::new();
    for href in pager
        .select(&link_sel)
        .filter_map(|a| a.value().attr("href"))
    {
        let Ok(resolved) = base.join(href.trim()) else {
            warn!(href, "skipping unresolvable pagination link");
            continue;
        };
        let resolved = resolved.to_string();
        if resolved != base.as_str() && !links.contains(&resolved) {
            links.push(resolved);
        }
    }
    Ok(links)
}

/// Optional fields of a game's detail page. Missing elements stay `None`.
pub fn parse_detail_page(html: &str, page_url: &str) -> Result<DetailFields, AdapterError> {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let img_sel = selector("img")?;
    let image_url = document
        .select(&img_sel)
        .find(|img| {
            ["title", "alt"].iter().any(|attr| {
                img.value()
                    .attr(attr)
                    .is_some_and(|v| v.to_lowercase().contains(COVER_MARKER))
            })
        })
        .and_then(|img| img.value().attr("src"))
        .and_then(|src| match &base {
            Some(base) => base.join(src.trim()).ok().map(|u| u.to_string()),
            None => text_or_none(src.to_string()),
        });

    let cell_sel = selector(END_CELL)?;
    let span_sel = selector("span.white")?;
    let end_text = document
        .select(&cell_sel)
        .find(|td| element_text(*td).contains(END_LABEL))
        .and_then(|td| td.select(&span_sel).next())
        .and_then(|span| text_or_none(element_text(span)));

    let capacity_sel = selector("span#spanMaxTeamPlayers")?;
    let capacity_text = document
        .select(&capacity_sel)
        .next()
        .and_then(|span| text_or_none(element_text(span)));

    Ok(DetailFields {
        end_text,
        capacity_text,
        image_url,
    })
}
