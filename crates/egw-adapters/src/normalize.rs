//! Raw scraped fields -> canonical `GameRecord`. Pure; no I/O.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use egw_core::{detail_link, Category, GameId, GameRecord};
use thiserror::Error;

const MONTHS_GENITIVE: [(&str, &str); 12] = [
    ("января", "January"),
    ("февраля", "February"),
    ("марта", "March"),
    ("апреля", "April"),
    ("мая", "May"),
    ("июня", "June"),
    ("июля", "July"),
    ("августа", "August"),
    ("сентября", "September"),
    ("октября", "October"),
    ("ноября", "November"),
    ("декабря", "December"),
];

const LISTING_FORMAT: &str = "%d %B %Y %H:%M:%S";
const DETAIL_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unparseable date {input:?}")]
    InvalidDate { input: String },
    #[error("no game id in cell {cell:?}")]
    InvalidGameId { cell: String },
}

/// Cells of one listing row, as scraped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawListingRow {
    pub id_cell: String,
    pub domain: String,
    pub start_text: String,
    pub name: String,
    pub author: String,
    pub price: String,
}

/// Optional fields recovered from a detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub end_text: Option<String>,
    pub capacity_text: Option<String>,
    pub image_url: Option<String>,
}

pub fn translate_months(input: &str) -> String {
    MONTHS_GENITIVE
        .iter()
        .fold(input.to_string(), |acc, (ru, en)| acc.replace(ru, en))
}

fn to_utc(naive: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

/// Listing start time, e.g. `15 марта 2025 г. 19:00:00`, in source-local time.
pub fn parse_listing_datetime(input: &str, offset: FixedOffset) -> Result<DateTime<Utc>, NormalizeError> {
    let cleaned = translate_months(input)
        .replace("г.", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    NaiveDateTime::parse_from_str(&cleaned, LISTING_FORMAT)
        .ok()
        .and_then(|naive| to_utc(naive, offset))
        .ok_or_else(|| NormalizeError::InvalidDate {
            input: input.to_string(),
        })
}

/// Detail-page end time: `dd.mm.yyyy HH:MM:SS` followed by anything.
pub fn parse_detail_datetime(input: &str, offset: FixedOffset) -> Result<DateTime<Utc>, NormalizeError> {
    let head = input.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&head, DETAIL_FORMAT)
        .ok()
        .and_then(|naive| to_utc(naive, offset))
        .ok_or_else(|| NormalizeError::InvalidDate {
            input: input.to_string(),
        })
}

/// First run of ASCII digits in `text`; 0 when there is none.
pub fn extract_capacity(text: &str) -> i64 {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|chunk| !chunk.is_empty())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

/// The id cell reads like `Игра/78123`; the id follows the first slash.
pub fn parse_game_id(cell: &str) -> Result<GameId, NormalizeError> {
    cell.split('/')
        .nth(1)
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| NormalizeError::InvalidGameId {
            cell: cell.to_string(),
        })
}

pub fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_row(
    raw: &RawListingRow,
    category: Category,
    offset: FixedOffset,
) -> Result<GameRecord, NormalizeError> {
    let id = parse_game_id(&raw.id_cell)?;
    let start_time = parse_listing_datetime(&raw.start_text, offset)?;
    let domain = raw.domain.trim().to_string();
    Ok(GameRecord {
        id,
        link: detail_link(&domain, id),
        domain,
        name: collapse_whitespace(&raw.name),
        author: strip_whitespace(&raw.author),
        price: collapse_whitespace(&raw.price),
        category,
        capacity: None,
        start_time,
        end_time: None,
        image_source_url: None,
    })
}

/// Merge detail-page fields into a record. A page that loaded but lacks the
/// capacity span yields `Some(0)`; an unparseable end time stays absent.
pub fn apply_detail(record: &mut GameRecord, detail: DetailFields, offset: FixedOffset) {
    record.end_time = detail
        .end_text
        .as_deref()
        .and_then(|text| parse_detail_datetime(text, offset).ok());
    record.capacity = Some(detail.capacity_text.as_deref().map(extract_capacity).unwrap_or(0));
    record.image_source_url = detail.image_url;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msk() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn listing_dates_use_genitive_months_and_source_offset() {
        assert_eq!(
            parse_listing_datetime("15 марта 2025 г. 19:00:00", msk()).unwrap(),
            utc(2025, 3, 15, 16, 0)
        );
        assert_eq!(
            parse_listing_datetime("2 апреля 2025 г. 09:30:00", msk()).unwrap(),
            utc(2025, 4, 2, 6, 30)
        );
    }

    #[test]
    fn garbage_dates_are_rejected() {
        assert_eq!(
            parse_listing_datetime("скоро", msk()),
            Err(NormalizeError::InvalidDate {
                input: "скоро".to_string()
            })
        );
        assert!(parse_detail_datetime("не определено", msk()).is_err());
    }

    #[test]
    fn detail_dates_ignore_trailing_tokens() {
        assert_eq!(
            parse_detail_datetime("16.03.2025 07:00:00 (UTC +3)", msk()).unwrap(),
            utc(2025, 3, 16, 4, 0)
        );
    }

    #[test]
    fn capacity_takes_first_integer_or_zero() {
        assert_eq!(extract_capacity("не более 6 игроков"), 6);
        assert_eq!(extract_capacity("от 12 до 20"), 12);
        assert_eq!(extract_capacity("Нет информации"), 0);
        assert_eq!(extract_capacity(""), 0);
    }

    #[test]
    fn game_id_follows_the_slash() {
        assert_eq!(parse_game_id("Игра/78123"), Ok(78123));
        assert!(parse_game_id("78123").is_err());
        assert!(parse_game_id("Игра/abc").is_err());
    }

    #[test]
    fn normalize_row_builds_canonical_record() {
        let raw = RawListingRow {
            id_cell: "Игра/78123".into(),
            domain: " kovrov.en.cx ".into(),
            start_text: "15 марта 2025 г. 19:00:00".into(),
            name: "Весенний  марафон".into(),
            author: "Иван , Пётр".into(),
            price: "300 руб.".into(),
        };
        let record = normalize_row(&raw, Category::Team, msk()).unwrap();
        assert_eq!(record.id, 78123);
        assert_eq!(record.domain, "kovrov.en.cx");
        assert_eq!(record.link, "https://kovrov.en.cx/GameDetails.aspx?gid=78123&lang=ru");
        assert_eq!(record.name, "Весенний марафон");
        assert_eq!(record.author, "Иван,Пётр");
        assert_eq!(record.capacity, None);
        assert_eq!(record.end_time, None);
    }

    #[test]
    fn detail_fields_fill_optional_values() {
        let raw = RawListingRow {
            id_cell: "Игра/1".into(),
            domain: "kovrov.en.cx".into(),
            start_text: "15 марта 2025 г. 19:00:00".into(),
            name: "x".into(),
            author: "y".into(),
            price: "0".into(),
        };
        let mut record = normalize_row(&raw, Category::Single, msk()).unwrap();
        apply_detail(
            &mut record,
            DetailFields {
                end_text: Some("не определено".into()),
                capacity_text: None,
                image_url: Some("https://kovrov.en.cx/c.jpg".into()),
            },
            msk(),
        );
        assert_eq!(record.end_time, None);
        assert_eq!(record.capacity, Some(0));
        assert_eq!(record.image_source_url.as_deref(), Some("https://kovrov.en.cx/c.jpg"));
    }
}
